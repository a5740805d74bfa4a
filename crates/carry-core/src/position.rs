//! Portfolio book and trade lifecycles for the carry simulator.
//!
//! [`PortfolioState`] holds cash and the three legs (carry spot, carry perp
//! hedge, directional perp). Perp PnL is realised into cash on every mark, so
//! NAV is always `cash + spot_qty * price`. Funding accrues per leg and only
//! reaches cash when a funding window settles.
//!
//! [`LifecycleBook`] tracks open/close lifecycles for the carry pair and the
//! directional overlay with trade-level PnL attribution.

use std::collections::BTreeMap;

use risk_core::{PostTradeExposure, RiskConfig};
use serde::{Deserialize, Serialize};

use crate::accounting::{funding_delta, perp_mark_pnl, quantize};
use crate::reason_codes::ReasonCode;
use crate::venue::{Fill, Leg, PortfolioSnapshot};

/// Quantities below this are treated as flat.
pub const QTY_EPS: f64 = 1e-12;

#[inline]
pub fn is_flat_qty(qty: f64) -> bool {
    qty.abs() <= QTY_EPS
}

/// Per-leg split of a perp mark or funding amount.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LegSplit {
    pub carry: f64,
    pub directional: f64,
}

impl LegSplit {
    pub fn total(&self) -> f64 {
        self.carry + self.directional
    }
}

// ---------------------------------------------------------------------------
// PortfolioState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash: f64,
    pub spot_qty: f64,
    /// Average entry price of the spot units held.
    pub spot_cost_basis: f64,
    pub carry_perp_qty: f64,
    pub dir_perp_qty: f64,
    /// Price the perp legs were last marked at.
    pub perp_mark: Option<f64>,
    pub last_price: Option<f64>,
    /// Funding accrued in the current window, not yet in cash.
    pub accrued_funding: f64,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub slippage_paid: f64,
    pub funding_settled: f64,
}

impl PortfolioState {
    pub fn new(initial_nav: f64) -> Self {
        Self {
            cash: initial_nav,
            spot_qty: 0.0,
            spot_cost_basis: 0.0,
            carry_perp_qty: 0.0,
            dir_perp_qty: 0.0,
            perp_mark: None,
            last_price: None,
            accrued_funding: 0.0,
            realized_pnl: 0.0,
            fees_paid: 0.0,
            slippage_paid: 0.0,
            funding_settled: 0.0,
        }
    }

    pub fn qty(&self, leg: Leg) -> f64 {
        match leg {
            Leg::CarrySpot => self.spot_qty,
            Leg::CarryPerp => self.carry_perp_qty,
            Leg::Directional => self.dir_perp_qty,
        }
    }

    /// Perp PnL is already in cash, so only the spot leg is marked here.
    #[inline]
    pub fn nav(&self, price: f64) -> f64 {
        quantize(self.cash + self.spot_qty * price)
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        if is_flat_qty(self.spot_qty) {
            return 0.0;
        }
        quantize(self.spot_qty * (price - self.spot_cost_basis))
    }

    pub fn gross_notional(&self, price: f64) -> f64 {
        (self.spot_qty.abs() + self.carry_perp_qty.abs() + self.dir_perp_qty.abs()) * price
    }

    /// Notional per venue: spot leg on the spot venue, both perp legs on the
    /// perp venue.
    pub fn venue_notional(&self, price: f64, cfg: &RiskConfig) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        *out.entry(cfg.spot_venue.clone()).or_insert(0.0) += self.spot_qty.abs() * price;
        *out.entry(cfg.perp_venue.clone()).or_insert(0.0) +=
            (self.carry_perp_qty.abs() + self.dir_perp_qty.abs()) * price;
        out
    }

    pub fn post_trade_exposure(&self, t: i64, price: f64, cfg: &RiskConfig) -> PostTradeExposure {
        PostTradeExposure {
            timestamp_ms: t,
            nav: self.nav(price),
            gross_notional: self.gross_notional(price),
            venue_notional: self.venue_notional(price, cfg),
        }
    }

    pub fn snapshot(&self, price: f64) -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash: self.cash,
            spot_qty: self.spot_qty,
            carry_perp_qty: self.carry_perp_qty,
            dir_perp_qty: self.dir_perp_qty,
            mark: price,
            nav: self.nav(price),
        }
    }

    pub fn is_flat(&self) -> bool {
        is_flat_qty(self.spot_qty) && is_flat_qty(self.carry_perp_qty) && is_flat_qty(self.dir_perp_qty)
    }

    /// Realise perp variation margin from the previous mark into cash.
    pub fn mark_perps(&mut self, mark: f64) -> LegSplit {
        let pnl = match self.perp_mark {
            Some(prev) => LegSplit {
                carry: perp_mark_pnl(self.carry_perp_qty, prev, mark),
                directional: perp_mark_pnl(self.dir_perp_qty, prev, mark),
            },
            None => LegSplit::default(),
        };
        self.cash = quantize(self.cash + pnl.total());
        self.realized_pnl = quantize(self.realized_pnl + pnl.total());
        self.perp_mark = Some(mark);
        pnl
    }

    /// Accrue one bar of funding on both perp legs.
    pub fn accrue_funding(&mut self, rate: f64, mark: f64) -> LegSplit {
        let accrual = LegSplit {
            carry: funding_delta(self.carry_perp_qty, mark, rate),
            directional: funding_delta(self.dir_perp_qty, mark, rate),
        };
        self.accrued_funding = quantize(self.accrued_funding + accrual.total());
        accrual
    }

    /// Move accrued funding into cash. Returns the amount settled.
    pub fn settle_funding(&mut self) -> f64 {
        let amount = self.accrued_funding;
        self.cash = quantize(self.cash + amount);
        self.funding_settled = quantize(self.funding_settled + amount);
        self.accrued_funding = 0.0;
        amount
    }

    /// Book a fill. Spot trades move cash by the executed notional; perp trades
    /// only pay slippage and fee since the perp is marked at the requested price.
    pub fn apply_fill(&mut self, fill: &Fill) {
        let signed = fill.signed_qty();
        match fill.leg {
            Leg::CarrySpot => {
                self.book_spot(signed, fill.requested_price);
                self.cash = quantize(self.cash - quantize(signed * fill.requested_price));
            }
            Leg::CarryPerp => {
                self.carry_perp_qty += signed;
                self.perp_mark.get_or_insert(fill.requested_price);
            }
            Leg::Directional => {
                self.dir_perp_qty += signed;
                self.perp_mark.get_or_insert(fill.requested_price);
            }
        }
        self.cash = quantize(self.cash - fill.slippage_cost - fill.fee);
        self.fees_paid = quantize(self.fees_paid + fill.fee);
        self.slippage_paid = quantize(self.slippage_paid + fill.slippage_cost);
        if is_flat_qty(self.spot_qty) {
            self.spot_qty = 0.0;
            self.spot_cost_basis = 0.0;
        }
        if is_flat_qty(self.carry_perp_qty) {
            self.carry_perp_qty = 0.0;
        }
        if is_flat_qty(self.dir_perp_qty) {
            self.dir_perp_qty = 0.0;
        }
    }

    fn book_spot(&mut self, signed: f64, price: f64) {
        let held = self.spot_qty;
        let reducing = !is_flat_qty(held) && signed.signum() != held.signum();
        if reducing {
            let closed = signed.abs().min(held.abs());
            self.realized_pnl =
                quantize(self.realized_pnl + closed * (price - self.spot_cost_basis) * held.signum());
            if signed.abs() > held.abs() {
                self.spot_cost_basis = price;
            }
        } else {
            let total = held + signed;
            if !is_flat_qty(total) {
                self.spot_cost_basis = (self.spot_cost_basis * held + price * signed) / total;
            }
        }
        self.spot_qty = held + signed;
    }
}

// ---------------------------------------------------------------------------
// Lifecycles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegGroup {
    Carry,
    Directional,
}

impl LegGroup {
    pub fn of(leg: Leg) -> Self {
        match leg {
            Leg::CarrySpot | Leg::CarryPerp => LegGroup::Carry,
            Leg::Directional => LegGroup::Directional,
        }
    }
}

/// One open→close episode of the carry pair or the directional overlay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lifecycle {
    pub id: u32,
    pub group: LegGroup,
    pub opened_t: i64,
    pub opened_bar: u64,
    pub entry_price: f64,
    pub entry_reason: ReasonCode,
    pub closed_t: Option<i64>,
    pub closed_bar: Option<u64>,
    pub exit_price: Option<f64>,
    pub exit_reason: Option<ReasonCode>,
    pub peak_notional: f64,
    pub price_pnl: f64,
    pub funding_pnl: f64,
    pub fees: f64,
    pub slippage: f64,
}

impl Lifecycle {
    pub fn is_open(&self) -> bool {
        self.closed_t.is_none()
    }

    pub fn net_pnl(&self) -> f64 {
        quantize(self.price_pnl + self.funding_pnl - self.fees - self.slippage)
    }
}

/// Where and when a lifecycle event happens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarMark {
    pub t: i64,
    pub bar_index: u64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct LifecycleBook {
    carry: Option<Lifecycle>,
    directional: Option<Lifecycle>,
    closed: Vec<Lifecycle>,
    next_id: u32,
}

impl LifecycleBook {
    pub fn open(&self, group: LegGroup) -> Option<&Lifecycle> {
        match group {
            LegGroup::Carry => self.carry.as_ref(),
            LegGroup::Directional => self.directional.as_ref(),
        }
    }

    fn slot_mut(&mut self, group: LegGroup) -> &mut Option<Lifecycle> {
        match group {
            LegGroup::Carry => &mut self.carry,
            LegGroup::Directional => &mut self.directional,
        }
    }

    pub fn closed(&self) -> &[Lifecycle] {
        &self.closed
    }

    /// Closed lifecycles followed by any still open, ordered by id.
    pub fn all(&self) -> Vec<Lifecycle> {
        let mut out: Vec<Lifecycle> = self.closed.clone();
        out.extend(self.carry.iter().cloned());
        out.extend(self.directional.iter().cloned());
        out.sort_by_key(|l| l.id);
        out
    }

    /// Attribute mark-to-market and funding to an open lifecycle.
    pub fn attribute(&mut self, group: LegGroup, price_pnl: f64, funding: f64) {
        if let Some(lc) = self.slot_mut(group) {
            lc.price_pnl = quantize(lc.price_pnl + price_pnl);
            lc.funding_pnl = quantize(lc.funding_pnl + funding);
        }
    }

    /// Book the fills of one bar for `group`. Opens a lifecycle when the group
    /// goes from flat to held and closes it when it goes flat.
    pub fn record_fills(
        &mut self,
        group: LegGroup,
        at: BarMark,
        fees: f64,
        slippage: f64,
        notional_after: f64,
        exit_reason: ReasonCode,
    ) {
        let held_after = notional_after.abs() > QTY_EPS;
        if self.open(group).is_none() {
            if !held_after {
                return;
            }
            let id = self.next_id;
            self.next_id += 1;
            *self.slot_mut(group) = Some(Lifecycle {
                id,
                group,
                opened_t: at.t,
                opened_bar: at.bar_index,
                entry_price: at.price,
                entry_reason: ReasonCode::EntrySignal,
                closed_t: None,
                closed_bar: None,
                exit_price: None,
                exit_reason: None,
                peak_notional: 0.0,
                price_pnl: 0.0,
                funding_pnl: 0.0,
                fees: 0.0,
                slippage: 0.0,
            });
        }
        let slot = self.slot_mut(group);
        if let Some(lc) = slot.as_mut() {
            lc.fees = quantize(lc.fees + fees);
            lc.slippage = quantize(lc.slippage + slippage);
            lc.peak_notional = lc.peak_notional.max(notional_after.abs());
        }
        if !held_after {
            if let Some(mut lc) = slot.take() {
                lc.closed_t = Some(at.t);
                lc.closed_bar = Some(at.bar_index);
                lc.exit_price = Some(at.price);
                lc.exit_reason = Some(exit_reason);
                self.closed.push(lc);
            }
        }
    }

    /// Close whatever is still open at the final mark. Book-only: no trades.
    pub fn close_all(&mut self, at: BarMark, reason: ReasonCode) {
        for group in [LegGroup::Carry, LegGroup::Directional] {
            if let Some(mut lc) = self.slot_mut(group).take() {
                lc.closed_t = Some(at.t);
                lc.closed_bar = Some(at.bar_index);
                lc.exit_price = Some(at.price);
                lc.exit_reason = Some(reason);
                self.closed.push(lc);
            }
        }
        self.closed.sort_by_key(|l| l.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::Side;

    fn fill(leg: Leg, side: Side, qty: f64, price: f64, fee: f64, slip: f64) -> Fill {
        Fill {
            client_id: 0,
            leg,
            side,
            requested_qty: qty,
            filled_qty: qty,
            requested_price: price,
            executed_price: price,
            fee,
            slippage_cost: slip,
            slippage_bps: 0.0,
            reduce_only: false,
        }
    }

    #[test]
    fn hedged_carry_is_nav_neutral_to_price() {
        let mut p = PortfolioState::new(10_000.0);
        p.apply_fill(&fill(Leg::CarrySpot, Side::Buy, 10.0, 100.0, 0.5, 0.1));
        p.apply_fill(&fill(Leg::CarryPerp, Side::Sell, 10.0, 100.0, 0.5, 0.1));
        let nav0 = p.nav(100.0);
        assert!((nav0 - (10_000.0 - 1.2)).abs() < 1e-9);
        p.mark_perps(120.0);
        assert!((p.nav(120.0) - nav0).abs() < 1e-9);
        p.mark_perps(80.0);
        assert!((p.nav(80.0) - nav0).abs() < 1e-9);
    }

    #[test]
    fn funding_reaches_cash_only_on_settlement() {
        let mut p = PortfolioState::new(10_000.0);
        p.apply_fill(&fill(Leg::CarryPerp, Side::Sell, 10.0, 100.0, 0.0, 0.0));
        let accrued = p.accrue_funding(0.0001, 100.0);
        assert!((accrued.carry - 0.1).abs() < 1e-12);
        assert!((p.cash - 10_000.0).abs() < 1e-12);
        let settled = p.settle_funding();
        assert!((settled - 0.1).abs() < 1e-12);
        assert!((p.cash - 10_000.1).abs() < 1e-9);
        assert_eq!(p.accrued_funding, 0.0);
    }

    #[test]
    fn spot_round_trip_realizes_pnl() {
        let mut p = PortfolioState::new(10_000.0);
        p.apply_fill(&fill(Leg::CarrySpot, Side::Buy, 2.0, 100.0, 0.0, 0.0));
        p.apply_fill(&fill(Leg::CarrySpot, Side::Buy, 2.0, 110.0, 0.0, 0.0));
        assert!((p.spot_cost_basis - 105.0).abs() < 1e-12);
        assert!((p.unrealized_pnl(115.0) - 40.0).abs() < 1e-9);
        p.apply_fill(&fill(Leg::CarrySpot, Side::Sell, 4.0, 115.0, 0.0, 0.0));
        assert!((p.realized_pnl - 40.0).abs() < 1e-9);
        assert_eq!(p.spot_qty, 0.0);
        assert!((p.nav(115.0) - 10_040.0).abs() < 1e-9);
    }

    #[test]
    fn venue_notional_splits_spot_and_perp() {
        let mut p = PortfolioState::new(10_000.0);
        p.spot_qty = 1.0;
        p.carry_perp_qty = -1.0;
        p.dir_perp_qty = 0.5;
        let cfg = RiskConfig::default();
        let v = p.venue_notional(100.0, &cfg);
        assert!((v["spot"] - 100.0).abs() < 1e-12);
        assert!((v["perp"] - 150.0).abs() < 1e-12);
        assert!((p.gross_notional(100.0) - 250.0).abs() < 1e-12);
    }

    #[test]
    fn lifecycle_opens_attributes_and_closes() {
        let mut book = LifecycleBook::default();
        let at = |bar: u64| BarMark {
            t: bar as i64 * 1000,
            bar_index: bar,
            price: 100.0,
        };
        book.record_fills(LegGroup::Directional, at(1), 1.0, 0.5, 500.0, ReasonCode::ExitSignal);
        assert!(book.open(LegGroup::Directional).is_some());
        book.attribute(LegGroup::Directional, 20.0, -2.0);
        book.record_fills(LegGroup::Directional, at(3), 1.0, 0.5, 0.0, ReasonCode::ExitRegime);
        assert!(book.open(LegGroup::Directional).is_none());
        let lc = &book.closed()[0];
        assert_eq!(lc.exit_reason, Some(ReasonCode::ExitRegime));
        assert_eq!(lc.closed_bar, Some(3));
        assert!((lc.net_pnl() - 15.0).abs() < 1e-12);
    }

    #[test]
    fn close_all_marks_end_of_run() {
        let mut book = LifecycleBook::default();
        let at = BarMark {
            t: 0,
            bar_index: 0,
            price: 100.0,
        };
        book.record_fills(LegGroup::Carry, at, 0.0, 0.0, 100.0, ReasonCode::ExitSignal);
        book.record_fills(LegGroup::Directional, at, 0.0, 0.0, 100.0, ReasonCode::ExitSignal);
        book.close_all(at, ReasonCode::ExitEndOfRun);
        assert_eq!(book.closed().len(), 2);
        assert!(book
            .closed()
            .iter()
            .all(|l| l.exit_reason == Some(ReasonCode::ExitEndOfRun)));
    }
}
