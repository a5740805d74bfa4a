//! Shadow runner: the live decision loop against a paper venue.
//!
//! Bars are replayed one at a time through the same feature, regime, guidance,
//! governor and control code as the backtest, but orders go to a stateful
//! [`PaperVenue`] that keeps its own book. Nothing is signed or sent anywhere.

use risk_core::{evaluate, observe_post_trade, RiskObservation, RiskState};
use serde::Serialize;

use crate::accounting::SlippageModel;
use crate::candle::Bar;
use crate::config::{ConfigError, SimConfig};
use crate::control::{enforce_post_trade, run_cycle, CycleInput, Residuals};
use crate::features::FeatureEngine;
use crate::guidance::guidance_for_bar;
use crate::reason_codes::ReasonCode;
use crate::regime::{classify, Regime, RegimeMemory};
use crate::venue::{Fill, Order, PaperVenue, PortfolioSnapshot, Refusal, Venue};

/// One row of the shadow log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowLogEntry {
    pub bar_index: u64,
    pub t: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub regime: Regime,
    pub intended_orders: Vec<Order>,
    pub fills: Vec<Fill>,
    /// Largest pre-trade slippage estimate among the intended orders.
    pub slippage_estimate_bps: f64,
    /// No order reached the venue this bar.
    pub skipped: bool,
    pub refusals: Vec<Refusal>,
    pub reasons: Vec<ReasonCode>,
    pub nav: f64,
}

#[derive(Debug, Clone)]
pub struct ShadowRun {
    pub entries: Vec<ShadowLogEntry>,
    pub final_position: PortfolioSnapshot,
}

/// Replay `bars` through the control loop against a [`PaperVenue`].
pub fn run_shadow(bars: &[Bar], cfg: &SimConfig) -> Result<ShadowRun, ConfigError> {
    cfg.validate()?;
    let mut venue = PaperVenue::new(cfg.initial_nav, &cfg.execution, cfg.shadow.max_fill_ratio);
    let mut features = FeatureEngine::new(&cfg.regime, &cfg.compression);
    let mut memory = RegimeMemory::default();
    let mut risk = RiskState::new(cfg.initial_nav, cfg.risk.kill_switch_mode);
    let mut residuals = Residuals::default();
    let mut last_t: Option<i64> = None;
    let slippage = SlippageModel::from(&cfg.execution);
    let premium = 1.0 + cfg.shadow.mark_premium_bps / 10_000.0;

    let mut entries = Vec::with_capacity(bars.len());
    for (i, bar) in bars.iter().enumerate() {
        let mut entry = ShadowLogEntry {
            bar_index: i as u64,
            t: bar.t,
            timestamp: chrono::DateTime::<chrono::Utc>::from_timestamp_millis(bar.t)
                .map(|d| d.to_rfc3339()),
            regime: memory.regime,
            intended_orders: Vec::new(),
            fills: Vec::new(),
            slippage_estimate_bps: 0.0,
            skipped: true,
            refusals: Vec::new(),
            reasons: Vec::new(),
            nav: venue.position().nav,
        };

        if let Some(fault) = bar.fault(last_t) {
            tracing::warn!(bar = i, t = bar.t, %fault, "shadow: skipping faulted bar");
            entry.reasons.push(ReasonCode::DataFault);
            entries.push(entry);
            continue;
        }
        last_t = Some(bar.t);

        if let Err(refusal) = venue.set_market(bar.t, bar.c, bar.c * premium, bar.funding_rate()) {
            tracing::info!(bar = i, %refusal, "shadow: market refused");
            entry.reasons.push(ReasonCode::from(refusal.reason));
            entry.refusals.push(refusal);
            entries.push(entry);
            continue;
        }

        let snap = features.update(bar);
        let decision = classify(&snap, &memory, &cfg.regime);
        memory = decision.memory;
        entry.regime = decision.regime;

        let proposed = guidance_for_bar(
            decision.regime,
            snap.expansion,
            snap.realized_vol,
            &cfg.guidance,
        );
        let eval = evaluate(
            &proposed,
            &risk,
            &RiskObservation {
                timestamp_ms: bar.t,
                nav: venue.position().nav,
                vol_pct: snap.vol_pct,
                directional_permitted: decision.regime == Regime::RiskOn,
                data_fault: false,
            },
            &cfg.risk,
        );
        risk = eval.state.clone();
        entry.reasons.extend(eval.reasons.iter().map(|&r| ReasonCode::from(r)));

        let cycle = run_cycle(
            &mut venue,
            &CycleInput {
                bar_index: snap.bar_index,
                target: &eval.approved,
                verdict: eval.verdict,
                residuals: &residuals,
                cfg: &cfg.control,
                slippage,
            },
        );
        residuals = cycle.execution.residuals;
        if let Some(set) = &cycle.order_set {
            entry.intended_orders = set.orders.clone();
            entry.slippage_estimate_bps = set
                .slippage_estimate_bps
                .iter()
                .copied()
                .fold(0.0, f64::max);
        }
        if cycle.execution.partial_fill {
            entry.reasons.push(ReasonCode::PartialFill);
        }
        entry.refusals.extend(cycle.refused);
        entry.refusals.extend(cycle.execution.refusals);
        for r in &entry.refusals {
            let code = ReasonCode::from(r.reason);
            if !entry.reasons.contains(&code) {
                entry.reasons.push(code);
            }
        }
        entry.fills = cycle.execution.fills;

        let mark = bar.c * premium;
        let enforced = enforce_post_trade(
            &mut venue,
            |v| v.book().post_trade_exposure(bar.t, mark, &cfg.risk),
            snap.bar_index,
            &cfg.risk,
        );
        if !enforced.fills.is_empty() {
            residuals = Residuals::default();
        }
        entry.fills.extend(enforced.fills);
        entry.refusals.extend(enforced.refusals);
        entry.reasons.extend(enforced.reasons);
        entry.skipped = entry.fills.is_empty();

        let exposure = venue.book().post_trade_exposure(bar.t, mark, &cfg.risk);
        let (next_risk, post) = observe_post_trade(&risk, &exposure, &cfg.risk);
        risk = next_risk;
        entry.reasons.extend(post.into_iter().map(ReasonCode::from));
        entry.nav = venue.position().nav;
        entries.push(entry);
    }

    Ok(ShadowRun {
        entries,
        final_position: venue.position(),
    })
}
