//! Event-driven portfolio simulator.
//!
//! [`step`] is a pure function of `(prior state, bar, config)`; [`run_simulation`]
//! folds it over a bar series. Every bar runs the same fixed sequence:
//!
//! 1. mark perps to the close, realising variation margin into cash
//! 2. settle the previous funding window if a new one started, accrue this bar
//! 3. features → regime → guidance → risk governor → control cycle
//! 4. apply fills (fees and slippage come out of cash)
//! 5. NAV = cash + spot value
//! 6. post-trade enforcement: reduce-only de-lever, flatten as last resort
//! 7. record the post-trade book in the risk state, update lifecycles

use std::collections::BTreeMap;

use risk_core::{
    evaluate, observe_post_trade, ExposureTarget, RiskObservation, RiskReason, RiskState,
    RiskVerdict,
};
use serde::Serialize;

use crate::accounting::{funding_slot, quantize, SlippageModel};
use crate::candle::{Bar, BarFault};
use crate::config::{ConfigError, ExecutionConfig, SimConfig};
use crate::control::{enforce_post_trade, run_cycle, CycleInput, Residuals};
use crate::features::FeatureEngine;
use crate::guidance::guidance_for_bar;
use crate::position::{
    is_flat_qty, BarMark, LegGroup, LegSplit, Lifecycle, LifecycleBook, PortfolioState,
};
use crate::reason_codes::{classify_exit, ReasonCode};
use crate::regime::{classify, Regime, RegimeMemory, RegimeReason};
use crate::venue::{
    Fill, Instrument, Order, PortfolioSnapshot, Quote, Refusal, RefusalReason, SimulatedVenue,
    Venue,
};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Everything carried from one bar to the next.
#[derive(Debug, Clone)]
pub struct SimState {
    /// Bars consumed, faulted ones included.
    pub bars_seen: u64,
    /// Timestamp of the last accepted bar.
    pub last_t: Option<i64>,
    pub portfolio: PortfolioState,
    pub features: FeatureEngine,
    pub regime_memory: RegimeMemory,
    pub regime: Regime,
    pub risk: RiskState,
    pub residuals: Residuals,
    pub lifecycles: LifecycleBook,
    pub funding_slot: Option<i64>,
    pub data_faults: u32,
}

impl SimState {
    pub fn new(cfg: &SimConfig) -> Self {
        Self {
            bars_seen: 0,
            last_t: None,
            portfolio: PortfolioState::new(cfg.initial_nav),
            features: FeatureEngine::new(&cfg.regime, &cfg.compression),
            regime_memory: RegimeMemory::default(),
            regime: Regime::Neutral,
            risk: RiskState::new(cfg.initial_nav, cfg.risk.kill_switch_mode),
            residuals: Residuals::default(),
            lifecycles: LifecycleBook::default(),
            funding_slot: None,
            data_faults: 0,
        }
    }

    /// NAV at the last accepted close (initial cash before any bar).
    pub fn nav(&self) -> f64 {
        match self.portfolio.last_price {
            Some(p) => self.portfolio.nav(p),
            None => self.portfolio.cash,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger record
// ---------------------------------------------------------------------------

/// One row of the bar ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarRecord {
    pub bar_index: u64,
    pub t: i64,
    pub close: f64,
    pub regime: Regime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Regime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime_reason: Option<RegimeReason>,
    pub vol_pct: Option<f64>,
    pub trend: i8,
    pub expansion: bool,
    pub nav: f64,
    pub cash: f64,
    pub leverage: f64,
    pub venue_fractions: BTreeMap<String, f64>,
    pub drawdown: f64,
    pub kill_switch_active: bool,
    pub proposed: ExposureTarget,
    pub approved: ExposureTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<RiskVerdict>,
    /// Realised exposure after the bar, as fractions of NAV.
    pub carry_frac: f64,
    pub directional_frac: f64,
    pub spot_pnl: f64,
    pub perp_pnl: LegSplit,
    pub funding_accrued: LegSplit,
    pub funding_settled: f64,
    pub fees: f64,
    pub slippage: f64,
    pub fills: Vec<Fill>,
    pub refusals: Vec<Refusal>,
    pub reasons: Vec<ReasonCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<BarFault>,
}

impl BarRecord {
    /// Row describing the book as it stands in `state`, with no activity.
    fn idle(state: &SimState, bar_index: u64, t: i64, close: f64) -> Self {
        let price = state.portfolio.last_price.unwrap_or(close);
        let nav = state.nav();
        let (carry_frac, directional_frac) = realised_fractions(&state.portfolio, price, nav);
        Self {
            bar_index,
            t,
            close,
            regime: state.regime,
            candidate: None,
            regime_reason: None,
            vol_pct: None,
            trend: 0,
            expansion: false,
            nav,
            cash: state.portfolio.cash,
            leverage: state.risk.leverage,
            venue_fractions: state.risk.venue_fractions.clone(),
            drawdown: state.risk.drawdown,
            kill_switch_active: state.risk.kill_switch_active,
            proposed: ExposureTarget::FLAT,
            approved: ExposureTarget::FLAT,
            verdict: None,
            carry_frac,
            directional_frac,
            spot_pnl: 0.0,
            perp_pnl: LegSplit::default(),
            funding_accrued: LegSplit::default(),
            funding_settled: 0.0,
            fees: 0.0,
            slippage: 0.0,
            fills: Vec::new(),
            refusals: Vec::new(),
            reasons: Vec::new(),
            fault: None,
        }
    }

    pub fn has_reason(&self, code: ReasonCode) -> bool {
        self.reasons.contains(&code)
    }
}

fn realised_fractions(p: &PortfolioState, price: f64, nav: f64) -> (f64, f64) {
    if !nav.is_finite() || nav <= 0.0 {
        return (0.0, 0.0);
    }
    (p.spot_qty.abs() * price / nav, p.dir_perp_qty * price / nav)
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub state: SimState,
    pub record: BarRecord,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

fn push_reason(reasons: &mut Vec<ReasonCode>, code: ReasonCode) {
    if !reasons.contains(&code) {
        reasons.push(code);
    }
}

/// Single-bar venue whose fills land straight in the simulator's book. Each
/// order fills against the NAV the book has at submission.
struct BookingVenue<'a> {
    book: &'a mut PortfolioState,
    t: i64,
    price: f64,
    exec: &'a ExecutionConfig,
}

impl BookingVenue<'_> {
    fn bar_venue(&self) -> SimulatedVenue {
        SimulatedVenue::new(self.t, self.book.snapshot(self.price), self.exec)
    }
}

impl Venue for BookingVenue<'_> {
    fn quote(&self, instrument: Instrument) -> Quote {
        self.bar_venue().quote(instrument)
    }

    fn submit(&mut self, order: &Order) -> Result<Fill, Refusal> {
        let fill = self.bar_venue().submit(order)?;
        self.book.apply_fill(&fill);
        Ok(fill)
    }

    fn position(&self) -> PortfolioSnapshot {
        self.book.snapshot(self.price)
    }
}

/// Advance the simulation by one bar.
pub fn step(prior: &SimState, bar: &Bar, cfg: &SimConfig) -> StepResult {
    let bar_index = prior.bars_seen;
    let mut state = prior.clone();
    state.bars_seen += 1;

    if let Some(fault) = bar.fault(prior.last_t) {
        state.data_faults += 1;
        tracing::warn!(bar = bar_index, t = bar.t, %fault, "skipping faulted bar");
        let mut record = BarRecord::idle(&state, bar_index, bar.t, bar.c);
        record.fault = Some(fault);
        record.reasons.push(ReasonCode::DataFault);
        return StepResult { state, record };
    }

    state.last_t = Some(bar.t);
    let price = bar.c;
    let mut reasons: Vec<ReasonCode> = Vec::new();

    // 1. Mark to market.
    let prev_price = state.portfolio.last_price;
    let perp_pnl = state.portfolio.mark_perps(price);
    let spot_pnl = prev_price.map_or(0.0, |p| quantize(state.portfolio.spot_qty * (price - p)));
    state.portfolio.last_price = Some(price);

    // 2. Funding.
    let slot = funding_slot(bar.t, cfg.execution.funding_interval_hours);
    let mut funding_settled = 0.0;
    if matches!(state.funding_slot, Some(prev) if prev != slot) {
        funding_settled = state.portfolio.settle_funding();
        if funding_settled != 0.0 {
            push_reason(&mut reasons, ReasonCode::FundingSettlement);
        }
    }
    state.funding_slot = Some(slot);
    let funding = state.portfolio.accrue_funding(bar.funding_rate(), price);

    state
        .lifecycles
        .attribute(LegGroup::Carry, spot_pnl + perp_pnl.carry, funding.carry);
    state
        .lifecycles
        .attribute(LegGroup::Directional, perp_pnl.directional, funding.directional);

    // 3. Features → regime → guidance → governor.
    let features = state.features.update(bar);
    let decision = classify(&features, &state.regime_memory, &cfg.regime);
    let prev_regime = state.regime;
    state.regime_memory = decision.memory;
    state.regime = decision.regime;
    if prev_regime != decision.regime {
        tracing::debug!(bar = bar_index, from = %prev_regime, to = %decision.regime, "regime change");
    }

    let proposed = guidance_for_bar(
        decision.regime,
        features.expansion,
        features.realized_vol,
        &cfg.guidance,
    );
    let obs = RiskObservation {
        timestamp_ms: bar.t,
        nav: state.portfolio.nav(price),
        vol_pct: features.vol_pct,
        directional_permitted: decision.regime == Regime::RiskOn,
        data_fault: false,
    };
    let eval = evaluate(&proposed, &state.risk, &obs, &cfg.risk);
    state.risk = eval.state.clone();
    for &r in &eval.reasons {
        push_reason(&mut reasons, ReasonCode::from(r));
    }
    if eval.reasons.contains(&RiskReason::KillSwitchLatched) {
        tracing::info!(
            bar = bar_index,
            t = bar.t,
            drawdown = state.risk.drawdown,
            mode = %state.risk.kill_switch_mode,
            "kill switch latched"
        );
    }

    // 4. Control cycle.
    let slippage = SlippageModel::from(&cfg.execution);
    let mut venue = SimulatedVenue::new(bar.t, state.portfolio.snapshot(price), &cfg.execution);
    let cycle = run_cycle(
        &mut venue,
        &CycleInput {
            bar_index: features.bar_index,
            target: &eval.approved,
            verdict: eval.verdict,
            residuals: &state.residuals,
            cfg: &cfg.control,
            slippage,
        },
    );
    let mut fills = cycle.execution.fills;
    for fill in &fills {
        state.portfolio.apply_fill(fill);
    }
    state.residuals = cycle.execution.residuals;
    let mut refusals: Vec<Refusal> = cycle.refused.into_iter().collect();
    refusals.extend(cycle.execution.refusals);
    for refusal in &refusals {
        if refusal.leg.is_none() && refusal.reason != RefusalReason::RebalanceWait {
            tracing::info!(bar = bar_index, %refusal, "bar refused");
        }
        push_reason(&mut reasons, ReasonCode::from(refusal.reason));
    }
    if cycle.execution.partial_fill {
        push_reason(&mut reasons, ReasonCode::PartialFill);
    }

    // 6. Post-trade enforcement.
    let mut booking = BookingVenue {
        book: &mut state.portfolio,
        t: bar.t,
        price,
        exec: &cfg.execution,
    };
    let enforced = enforce_post_trade(
        &mut booking,
        |v| v.book.post_trade_exposure(bar.t, price, &cfg.risk),
        features.bar_index,
        &cfg.risk,
    );
    if !enforced.fills.is_empty() {
        state.residuals = Residuals::default();
    }
    fills.extend(enforced.fills);
    for refusal in &enforced.refusals {
        push_reason(&mut reasons, ReasonCode::from(refusal.reason));
    }
    refusals.extend(enforced.refusals);
    for code in enforced.reasons {
        push_reason(&mut reasons, code);
    }

    // 7. Post-trade risk state.
    let exposure = state.portfolio.post_trade_exposure(bar.t, price, &cfg.risk);
    let (risk, post_reasons) = observe_post_trade(&state.risk, &exposure, &cfg.risk);
    state.risk = risk;
    for r in post_reasons {
        if r == RiskReason::KillSwitchLatched {
            tracing::info!(bar = bar_index, t = bar.t, drawdown = state.risk.drawdown, "kill switch latched post-trade");
        }
        push_reason(&mut reasons, ReasonCode::from(r));
    }

    // Lifecycles.
    let at = BarMark {
        t: bar.t,
        bar_index,
        price,
    };
    let left_risk_on = prev_regime == Regime::RiskOn && decision.regime != Regime::RiskOn;
    for group in [LegGroup::Carry, LegGroup::Directional] {
        let (fees, slip) = fills
            .iter()
            .filter(|f| LegGroup::of(f.leg) == group)
            .fold((0.0, 0.0), |(fe, sl), f| (fe + f.fee, sl + f.slippage_cost));
        let notional_after = match group {
            LegGroup::Carry => {
                state.portfolio.spot_qty.abs().max(state.portfolio.carry_perp_qty.abs()) * price
            }
            LegGroup::Directional => state.portfolio.dir_perp_qty.abs() * price,
        };
        let exit = classify_exit(&reasons, left_risk_on && group == LegGroup::Directional);
        state
            .lifecycles
            .record_fills(group, at, fees, slip, notional_after, exit);
    }

    let fees: f64 = fills.iter().map(|f| f.fee).sum();
    let slip: f64 = fills.iter().map(|f| f.slippage_cost).sum();
    let nav = state.portfolio.nav(price);
    let (carry_frac, directional_frac) = realised_fractions(&state.portfolio, price, nav);

    let record = BarRecord {
        bar_index,
        t: bar.t,
        close: price,
        regime: decision.regime,
        candidate: Some(decision.candidate),
        regime_reason: Some(decision.reason),
        vol_pct: features.vol_pct,
        trend: features.trend,
        expansion: features.expansion,
        nav,
        cash: state.portfolio.cash,
        leverage: state.risk.leverage,
        venue_fractions: state.risk.venue_fractions.clone(),
        drawdown: state.risk.drawdown,
        kill_switch_active: state.risk.kill_switch_active,
        proposed,
        approved: eval.approved,
        verdict: Some(eval.verdict),
        carry_frac,
        directional_frac,
        spot_pnl,
        perp_pnl,
        funding_accrued: funding,
        funding_settled,
        fees: quantize(fees),
        slippage: quantize(slip),
        fills,
        refusals,
        reasons,
        fault: None,
    };
    StepResult { state, record }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimOutput {
    pub records: Vec<BarRecord>,
    pub lifecycles: Vec<Lifecycle>,
    pub final_state: SimState,
    /// Funding accrued in the last window that never settled.
    pub unsettled_funding: f64,
}

impl SimOutput {
    pub fn regimes(&self) -> Vec<Regime> {
        self.records.iter().map(|r| r.regime).collect()
    }

    pub fn final_nav(&self) -> f64 {
        self.final_state.nav()
    }
}

/// Run a full simulation over `bars`. The config is validated first.
pub fn run_simulation(bars: &[Bar], cfg: &SimConfig) -> Result<SimOutput, ConfigError> {
    cfg.validate()?;
    let mut state = SimState::new(cfg);
    let mut records = Vec::with_capacity(bars.len());
    for bar in bars {
        let StepResult { state: next, record } = step(&state, bar, cfg);
        state = next;
        records.push(record);
    }

    if let (Some(t), Some(price)) = (state.last_t, state.portfolio.last_price) {
        let at = BarMark {
            t,
            bar_index: state.bars_seen.saturating_sub(1),
            price,
        };
        state.lifecycles.close_all(at, ReasonCode::ExitEndOfRun);
    }
    if !is_flat_qty(state.portfolio.accrued_funding) {
        tracing::debug!(amount = state.portfolio.accrued_funding, "unsettled funding at end of run");
    }
    tracing::info!(
        bars = records.len(),
        faults = state.data_faults,
        nav = state.nav(),
        "simulation finished"
    );

    Ok(SimOutput {
        lifecycles: state.lifecycles.all(),
        unsettled_funding: state.portfolio.accrued_funding,
        records,
        final_state: state,
    })
}
