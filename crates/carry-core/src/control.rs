//! Control / order-sizing layer.
//!
//! Turns an approved [`ExposureTarget`] into per-leg orders against a quote,
//! submits them through a [`Venue`] and remembers partially filled legs so the
//! next cycle completes them even when the remainder is below the trade band.
//! The same code path drives the backtest's `SimulatedVenue` and the shadow
//! runner's `PaperVenue`.

use risk_core::{post_trade_scale, ExposureTarget, PostTradeExposure, RiskConfig, RiskVerdict};
use serde::Serialize;

use crate::accounting::SlippageModel;
use crate::config::ControlConfig;
use crate::position::is_flat_qty;
use crate::reason_codes::ReasonCode;
use crate::venue::{
    Fill, Instrument, Leg, Order, PortfolioSnapshot, Quote, Refusal, RefusalReason, Side, Venue,
};

/// Reduce-only passes before the book is flattened.
pub const MAX_DELEVER_PASSES: usize = 3;
/// De-lever slightly below the cap so the trade's own costs do not re-breach it.
pub const DELEVER_HEADROOM: f64 = 1e-3;

// ---------------------------------------------------------------------------
// Residuals
// ---------------------------------------------------------------------------

/// Signed quantity left unfilled per leg by the previous cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Residuals {
    pub carry_spot: f64,
    pub carry_perp: f64,
    pub directional: f64,
}

impl Residuals {
    pub fn get(&self, leg: Leg) -> f64 {
        match leg {
            Leg::CarrySpot => self.carry_spot,
            Leg::CarryPerp => self.carry_perp,
            Leg::Directional => self.directional,
        }
    }

    pub fn set(&mut self, leg: Leg, qty: f64) {
        let qty = if is_flat_qty(qty) { 0.0 } else { qty };
        match leg {
            Leg::CarrySpot => self.carry_spot = qty,
            Leg::CarryPerp => self.carry_perp = qty,
            Leg::Directional => self.directional = qty,
        }
    }

    pub fn is_empty(&self) -> bool {
        Leg::ALL.iter().all(|&leg| is_flat_qty(self.get(leg)))
    }
}

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// Target base quantity per leg.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LegTargets {
    pub carry_spot: f64,
    pub carry_perp: f64,
    pub directional: f64,
}

impl LegTargets {
    pub fn get(&self, leg: Leg) -> f64 {
        match leg {
            Leg::CarrySpot => self.carry_spot,
            Leg::CarryPerp => self.carry_perp,
            Leg::Directional => self.directional,
        }
    }
}

pub struct SizingInput<'a> {
    pub position: &'a PortfolioSnapshot,
    pub target: &'a ExposureTarget,
    pub nav: f64,
    pub verdict: RiskVerdict,
    pub spot_quote: &'a Quote,
    pub perp_quote: &'a Quote,
    pub residuals: &'a Residuals,
    pub cfg: &'a ControlConfig,
    pub slippage: SlippageModel,
    /// First client id to assign; ids increase per order.
    pub client_id_base: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct OrderSet {
    pub targets: LegTargets,
    /// Reduce-only orders first, then opening orders, each in leg order.
    pub orders: Vec<Order>,
    pub skipped: Vec<Refusal>,
    pub legs_at_target: Vec<Leg>,
    /// Estimated slippage per order, aligned with `orders`.
    pub slippage_estimate_bps: Vec<f64>,
}

fn validate_quote(q: &Quote) -> Result<(), Refusal> {
    if q.is_valid() {
        Ok(())
    } else {
        Err(Refusal::bar(
            RefusalReason::InvalidQuote,
            format!("{:?} mark={} oracle={}", q.instrument, q.mark, q.oracle),
        ))
    }
}

/// `target` is closer to zero than `current` without crossing it.
fn is_reduction(current: f64, target: f64) -> bool {
    if is_flat_qty(current) {
        return false;
    }
    is_flat_qty(target) || (target.signum() == current.signum() && target.abs() < current.abs())
}

/// Size the orders that move `position` to `target`.
///
/// Bar-level refusals (veto, bad quote, oracle divergence) return `Err`; leg
/// level skips land in [`OrderSet::skipped`].
pub fn size_orders(input: &SizingInput<'_>) -> Result<OrderSet, Refusal> {
    if input.verdict == RiskVerdict::Vetoed {
        return Err(Refusal::bar(RefusalReason::RiskVeto, "governor vetoed the bar"));
    }
    validate_quote(input.spot_quote)?;
    validate_quote(input.perp_quote)?;
    for q in [input.spot_quote, input.perp_quote] {
        let div = q.divergence_bps();
        if div > input.cfg.oracle_divergence_bps {
            return Err(Refusal::bar(
                RefusalReason::OracleDivergence,
                format!("{:?} mark/oracle divergence {div:.2} bps", q.instrument),
            ));
        }
    }
    if !input.nav.is_finite() || input.nav <= 0.0 {
        return Err(Refusal::bar(
            RefusalReason::RiskVeto,
            format!("non-positive nav {}", input.nav),
        ));
    }

    let spot_qty = input.target.carry_frac * input.nav / input.spot_quote.mark;
    let targets = LegTargets {
        carry_spot: spot_qty,
        carry_perp: -spot_qty,
        directional: input.target.directional_frac * input.nav / input.perp_quote.mark,
    };

    let mut set = OrderSet {
        targets,
        ..OrderSet::default()
    };
    let mut opening = Vec::new();
    let mut client_id = input.client_id_base;

    for leg in Leg::ALL {
        let mark = match leg.instrument() {
            Instrument::Spot => input.spot_quote.mark,
            Instrument::Perp => input.perp_quote.mark,
        };
        let current = input.position.qty(leg);
        let target = targets.get(leg);
        let delta = target - current;
        if is_flat_qty(delta) {
            set.legs_at_target.push(leg);
            continue;
        }

        let notional = delta.abs() * mark;
        let closes_leg = is_flat_qty(target) && !is_flat_qty(current);
        let has_residual = !is_flat_qty(input.residuals.get(leg));
        if notional < input.cfg.rebalance_band_frac * input.nav && !closes_leg && !has_residual {
            set.skipped.push(Refusal::leg(
                RefusalReason::BelowMinTrade,
                leg,
                format!("delta notional {notional:.4} below band"),
            ));
            continue;
        }

        let reduce_only = is_reduction(current, target);
        let est_bps = input.slippage.estimate_bps(notional, input.nav);
        if est_bps > input.cfg.max_slippage_bps && !reduce_only {
            set.skipped.push(Refusal::leg(
                RefusalReason::SlippageGuard,
                leg,
                format!("estimated slippage {est_bps:.2} bps"),
            ));
            continue;
        }

        let order = Order {
            client_id,
            leg,
            side: Side::for_delta(delta),
            qty: delta.abs(),
            requested_price: mark,
            reduce_only,
        };
        client_id += 1;
        if reduce_only {
            set.orders.push(order);
            set.slippage_estimate_bps.push(est_bps);
        } else {
            opening.push((order, est_bps));
        }
    }
    for (order, est) in opening {
        set.orders.push(order);
        set.slippage_estimate_bps.push(est);
    }
    Ok(set)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Execution {
    pub fills: Vec<Fill>,
    pub refusals: Vec<Refusal>,
    pub residuals: Residuals,
    pub partial_fill: bool,
}

/// Submit an [`OrderSet`] and carry partial-fill remainders forward.
pub fn execute<V: Venue>(venue: &mut V, set: &OrderSet, prior: &Residuals) -> Execution {
    let mut out = Execution {
        residuals: *prior,
        ..Execution::default()
    };
    for &leg in &set.legs_at_target {
        out.residuals.set(leg, 0.0);
    }
    for order in &set.orders {
        match venue.submit(order) {
            Ok(fill) => {
                if fill.is_partial() {
                    out.partial_fill = true;
                    out.residuals.set(fill.leg, fill.side.sign() * fill.unfilled_qty());
                } else {
                    out.residuals.set(fill.leg, 0.0);
                }
                out.fills.push(fill);
            }
            Err(refusal) => {
                tracing::debug!(%refusal, "venue refused order");
                out.refusals.push(refusal);
            }
        }
    }
    out.refusals.extend(set.skipped.iter().cloned());
    out
}

/// Rebalance only every `rebalance_interval_bars` bars.
pub fn rebalance_due(bar_index: u64, cfg: &ControlConfig) -> bool {
    bar_index % u64::from(cfg.rebalance_interval_bars.max(1)) == 0
}

pub struct CycleInput<'a> {
    pub bar_index: u64,
    pub target: &'a ExposureTarget,
    pub verdict: RiskVerdict,
    pub residuals: &'a Residuals,
    pub cfg: &'a ControlConfig,
    pub slippage: SlippageModel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub order_set: Option<OrderSet>,
    pub execution: Execution,
    /// Bar-level refusal, if the whole cycle was refused.
    pub refused: Option<Refusal>,
}

/// One control cycle: quote, size, submit. A refused cycle leaves the venue
/// and the residuals untouched.
///
/// Between rebalance bars only forced reductions go out; the rest of the
/// cycle waits.
pub fn run_cycle<V: Venue>(venue: &mut V, input: &CycleInput<'_>) -> CycleOutcome {
    let refused = |refusal: Refusal, residuals: Residuals| {
        tracing::debug!(bar = input.bar_index, %refusal, "control cycle refused");
        CycleOutcome {
            order_set: None,
            execution: Execution {
                residuals,
                ..Execution::default()
            },
            refused: Some(refusal),
        }
    };

    let due = rebalance_due(input.bar_index, input.cfg);
    let spot_quote = venue.quote(Instrument::Spot);
    let perp_quote = venue.quote(Instrument::Perp);
    let position = venue.position();
    let sizing = SizingInput {
        position: &position,
        target: input.target,
        nav: position.nav,
        verdict: input.verdict,
        spot_quote: &spot_quote,
        perp_quote: &perp_quote,
        residuals: input.residuals,
        cfg: input.cfg,
        slippage: input.slippage,
        client_id_base: input.bar_index * 16,
    };
    match size_orders(&sizing) {
        Ok(set) if !due => {
            let forced = forced_reductions(set, input.verdict);
            if forced.orders.is_empty() {
                return refused(
                    Refusal::bar(RefusalReason::RebalanceWait, "between rebalance bars"),
                    *input.residuals,
                );
            }
            tracing::debug!(bar = input.bar_index, orders = forced.orders.len(), "off-cadence reduction");
            let execution = execute(venue, &forced, input.residuals);
            CycleOutcome {
                order_set: Some(forced),
                execution,
                refused: None,
            }
        }
        Ok(set) => {
            let execution = execute(venue, &set, input.residuals);
            CycleOutcome {
                order_set: Some(set),
                execution,
                refused: None,
            }
        }
        Err(refusal) => refused(refusal, *input.residuals),
    }
}

/// The part of `set` that cannot wait for the next rebalance bar: reduce-only
/// orders on legs the governor cut (a `Scaled` verdict) or whose target is flat.
fn forced_reductions(set: OrderSet, verdict: RiskVerdict) -> OrderSet {
    let mut forced = OrderSet {
        targets: set.targets,
        ..OrderSet::default()
    };
    for (order, est) in set.orders.into_iter().zip(set.slippage_estimate_bps) {
        let closes = is_flat_qty(set.targets.get(order.leg));
        if order.reduce_only && (closes || verdict == RiskVerdict::Scaled) {
            forced.orders.push(order);
            forced.slippage_estimate_bps.push(est);
        }
    }
    forced
}

/// Reduce-only orders scaling every open leg by `scale` (0 flattens).
pub fn delever_orders(position: &PortfolioSnapshot, scale: f64, client_id_base: u64) -> Vec<Order> {
    let scale = scale.clamp(0.0, 1.0);
    let mut orders = Vec::new();
    for leg in Leg::ALL {
        let current = position.qty(leg);
        if is_flat_qty(current) {
            continue;
        }
        let qty = if scale == 0.0 {
            current.abs()
        } else {
            current.abs() * (1.0 - scale)
        };
        if is_flat_qty(qty) {
            continue;
        }
        orders.push(Order {
            client_id: client_id_base + orders.len() as u64,
            leg,
            side: Side::for_delta(-current),
            qty,
            requested_price: position.mark,
            reduce_only: true,
        });
    }
    orders
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Enforcement {
    pub fills: Vec<Fill>,
    pub refusals: Vec<Refusal>,
    pub reasons: Vec<ReasonCode>,
}

/// Hard post-trade enforcement: up to [`MAX_DELEVER_PASSES`] reduce-only
/// passes toward the caps, then a full flatten if the book still breaches.
///
/// `exposure` reads the book the venue's fills land in.
pub fn enforce_post_trade<V: Venue>(
    venue: &mut V,
    exposure: impl Fn(&V) -> PostTradeExposure,
    bar_index: u64,
    cfg: &RiskConfig,
) -> Enforcement {
    let mut out = Enforcement::default();
    let client_base = bar_index * 16 + 8;
    let submit = |venue: &mut V, out: &mut Enforcement, scale: f64, id: u64| {
        for order in delever_orders(&venue.position(), scale, id) {
            match venue.submit(&order) {
                Ok(fill) => out.fills.push(fill),
                Err(refusal) => {
                    tracing::warn!(%refusal, "reduce-only order refused");
                    out.refusals.push(refusal);
                }
            }
        }
    };

    for pass in 0..MAX_DELEVER_PASSES {
        let Some(scale) = post_trade_scale(&exposure(venue), cfg) else {
            return out;
        };
        let target_scale = (scale * (1.0 - DELEVER_HEADROOM)).max(0.0);
        tracing::info!(bar = bar_index, pass, scale = target_scale, "forced de-lever");
        submit(venue, &mut out, target_scale, client_base + pass as u64 * 3);
        if !out.reasons.contains(&ReasonCode::ForcedDelever) {
            out.reasons.push(ReasonCode::ForcedDelever);
        }
    }
    if post_trade_scale(&exposure(venue), cfg).is_some() {
        tracing::warn!(bar = bar_index, "de-lever did not converge, flattening");
        submit(venue, &mut out, 0.0, client_base + 7);
        out.reasons.push(ReasonCode::ForcedFlatten);
    }
    out
}
