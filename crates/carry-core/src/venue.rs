//! Venue abstraction shared by the backtest and the shadow runner.
//!
//! The control layer only ever talks to a [`Venue`]: it asks for a quote,
//! submits orders and reads the position back. [`SimulatedVenue`] is rebuilt
//! for every bar inside the pure simulator step; [`PaperVenue`] keeps its own
//! book across bars and is driven by the shadow loop.

use serde::{Deserialize, Serialize};

use crate::accounting::{executed_price, quantize, FeeModel, SlippageModel};
use crate::config::ExecutionConfig;
use crate::position::PortfolioState;

// ---------------------------------------------------------------------------
// Order / fill vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    Spot,
    Perp,
}

/// Book leg an order belongs to. The carry legs always move together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    CarrySpot,
    CarryPerp,
    Directional,
}

impl Leg {
    pub const ALL: [Leg; 3] = [Leg::CarrySpot, Leg::CarryPerp, Leg::Directional];

    pub fn instrument(self) -> Instrument {
        match self {
            Leg::CarrySpot => Instrument::Spot,
            Leg::CarryPerp | Leg::Directional => Instrument::Perp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn for_delta(qty_delta: f64) -> Self {
        if qty_delta >= 0.0 {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_id: u64,
    pub leg: Leg,
    pub side: Side,
    /// Unsigned base quantity.
    pub qty: f64,
    pub requested_price: f64,
    pub reduce_only: bool,
}

impl Order {
    pub fn notional(&self) -> f64 {
        self.qty * self.requested_price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub instrument: Instrument,
    pub t: i64,
    pub mark: f64,
    pub oracle: f64,
}

impl Quote {
    pub fn is_valid(&self) -> bool {
        self.mark.is_finite() && self.mark > 0.0 && self.oracle.is_finite() && self.oracle > 0.0
    }

    /// |mark - oracle| / oracle, in bps.
    pub fn divergence_bps(&self) -> f64 {
        (self.mark - self.oracle).abs() / self.oracle * 10_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub client_id: u64,
    pub leg: Leg,
    pub side: Side,
    pub requested_qty: f64,
    pub filled_qty: f64,
    pub requested_price: f64,
    pub executed_price: f64,
    pub fee: f64,
    /// Cost of executing away from the requested price (always >= 0).
    pub slippage_cost: f64,
    pub slippage_bps: f64,
    pub reduce_only: bool,
}

impl Fill {
    #[inline]
    pub fn signed_qty(&self) -> f64 {
        self.side.sign() * self.filled_qty
    }

    pub fn unfilled_qty(&self) -> f64 {
        (self.requested_qty - self.filled_qty).max(0.0)
    }

    pub fn is_partial(&self) -> bool {
        self.unfilled_qty() > 0.0
    }
}

/// Position as a venue reports it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub spot_qty: f64,
    pub carry_perp_qty: f64,
    pub dir_perp_qty: f64,
    pub mark: f64,
    pub nav: f64,
}

impl PortfolioSnapshot {
    pub fn qty(&self, leg: Leg) -> f64 {
        match leg {
            Leg::CarrySpot => self.spot_qty,
            Leg::CarryPerp => self.carry_perp_qty,
            Leg::Directional => self.dir_perp_qty,
        }
    }

    fn add_qty(&mut self, leg: Leg, delta: f64) {
        match leg {
            Leg::CarrySpot => self.spot_qty += delta,
            Leg::CarryPerp => self.carry_perp_qty += delta,
            Leg::Directional => self.dir_perp_qty += delta,
        }
    }
}

// ---------------------------------------------------------------------------
// Refusals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    RebalanceWait,
    OracleDivergence,
    RiskVeto,
    InvalidQuote,
    BelowMinTrade,
    SlippageGuard,
    VenueRejected,
}

/// A refused bar (leg `None`) or a refused leg. Refusals never mutate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refusal {
    pub reason: RefusalReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leg: Option<Leg>,
    pub detail: String,
}

impl Refusal {
    pub fn bar(reason: RefusalReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            leg: None,
            detail: detail.into(),
        }
    }

    pub fn leg(reason: RefusalReason, leg: Leg, detail: impl Into<String>) -> Self {
        Self {
            reason,
            leg: Some(leg),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.leg {
            Some(leg) => write!(f, "{:?} refused on {:?}: {}", self.reason, leg, self.detail),
            None => write!(f, "{:?}: {}", self.reason, self.detail),
        }
    }
}

impl std::error::Error for Refusal {}

// ---------------------------------------------------------------------------
// Venue trait
// ---------------------------------------------------------------------------

pub trait Venue {
    fn quote(&self, instrument: Instrument) -> Quote;
    fn submit(&mut self, order: &Order) -> Result<Fill, Refusal>;
    fn position(&self) -> PortfolioSnapshot;
}

/// Shared fill model: partial fills for opening orders, full fills for
/// reduce-only orders, slippage from the NAV-relative model, taker fee on the
/// executed notional.
pub fn fill_order(
    order: &Order,
    nav: f64,
    fees: FeeModel,
    slippage: SlippageModel,
    fill_ratio: f64,
) -> Result<Fill, Refusal> {
    if !order.qty.is_finite() || order.qty <= 0.0 {
        return Err(Refusal::leg(
            RefusalReason::VenueRejected,
            order.leg,
            format!("invalid quantity {}", order.qty),
        ));
    }
    if !order.requested_price.is_finite() || order.requested_price <= 0.0 {
        return Err(Refusal::leg(
            RefusalReason::VenueRejected,
            order.leg,
            format!("invalid price {}", order.requested_price),
        ));
    }
    let filled_qty = if order.reduce_only {
        order.qty
    } else {
        order.qty * fill_ratio.clamp(0.0, 1.0)
    };
    let notional = filled_qty * order.requested_price;
    let slip_frac = slippage.fraction(notional, nav);
    let px = executed_price(order.requested_price, order.side == Side::Buy, slip_frac);
    Ok(Fill {
        client_id: order.client_id,
        leg: order.leg,
        side: order.side,
        requested_qty: order.qty,
        filled_qty,
        requested_price: order.requested_price,
        executed_price: px,
        fee: fees.fee(filled_qty * px),
        slippage_cost: quantize(filled_qty * (px - order.requested_price).abs()),
        slippage_bps: slip_frac * 10_000.0,
        reduce_only: order.reduce_only,
    })
}

// ---------------------------------------------------------------------------
// Simulated venue (backtest)
// ---------------------------------------------------------------------------

/// Single-bar venue for the backtest. Quotes the bar close for both
/// instruments and fills against a NAV fixed at construction.
#[derive(Debug, Clone)]
pub struct SimulatedVenue {
    t: i64,
    price: f64,
    nav: f64,
    book: PortfolioSnapshot,
    fees: FeeModel,
    slippage: SlippageModel,
    fill_ratio: f64,
}

impl SimulatedVenue {
    pub fn new(t: i64, book: PortfolioSnapshot, exec: &ExecutionConfig) -> Self {
        Self {
            t,
            price: book.mark,
            nav: book.nav,
            book,
            fees: FeeModel::from(exec),
            slippage: SlippageModel::from(exec),
            fill_ratio: exec.fill_ratio,
        }
    }
}

impl Venue for SimulatedVenue {
    fn quote(&self, instrument: Instrument) -> Quote {
        Quote {
            instrument,
            t: self.t,
            mark: self.price,
            oracle: self.price,
        }
    }

    fn submit(&mut self, order: &Order) -> Result<Fill, Refusal> {
        let fill = fill_order(order, self.nav, self.fees, self.slippage, self.fill_ratio)?;
        self.book.add_qty(fill.leg, fill.signed_qty());
        Ok(fill)
    }

    fn position(&self) -> PortfolioSnapshot {
        self.book
    }
}

// ---------------------------------------------------------------------------
// Paper venue (shadow)
// ---------------------------------------------------------------------------

/// Stateful paper venue: keeps its own book, marks perps and charges the bar's
/// funding rate on every `set_market`, and fills at most `max_fill_ratio` of
/// each opening order.
#[derive(Debug, Clone)]
pub struct PaperVenue {
    book: PortfolioState,
    t: i64,
    mark: f64,
    oracle: f64,
    fees: FeeModel,
    slippage: SlippageModel,
    max_fill_ratio: f64,
}

impl PaperVenue {
    pub fn new(initial_equity: f64, exec: &ExecutionConfig, max_fill_ratio: f64) -> Self {
        Self {
            book: PortfolioState::new(initial_equity),
            t: 0,
            mark: f64::NAN,
            oracle: f64::NAN,
            fees: FeeModel::from(exec),
            slippage: SlippageModel::from(exec),
            max_fill_ratio,
        }
    }

    /// Move the market. Invalid prices are refused and leave the venue untouched.
    pub fn set_market(
        &mut self,
        t: i64,
        oracle: f64,
        mark: f64,
        funding_rate: f64,
    ) -> Result<(), Refusal> {
        let candidate = Quote {
            instrument: Instrument::Perp,
            t,
            mark,
            oracle,
        };
        if !candidate.is_valid() || !funding_rate.is_finite() {
            return Err(Refusal::bar(
                RefusalReason::InvalidQuote,
                format!("mark={mark} oracle={oracle} funding={funding_rate}"),
            ));
        }
        self.book.mark_perps(mark);
        self.book.accrue_funding(funding_rate, mark);
        self.book.settle_funding();
        self.book.last_price = Some(mark);
        self.t = t;
        self.mark = mark;
        self.oracle = oracle;
        Ok(())
    }

    pub fn book(&self) -> &PortfolioState {
        &self.book
    }
}

impl Venue for PaperVenue {
    fn quote(&self, instrument: Instrument) -> Quote {
        Quote {
            instrument,
            t: self.t,
            mark: self.mark,
            oracle: self.oracle,
        }
    }

    fn submit(&mut self, order: &Order) -> Result<Fill, Refusal> {
        if !self.mark.is_finite() {
            return Err(Refusal::leg(
                RefusalReason::VenueRejected,
                order.leg,
                "no market set",
            ));
        }
        let nav = self.book.nav(self.mark);
        let fill = fill_order(order, nav, self.fees, self.slippage, self.max_fill_ratio)?;
        self.book.apply_fill(&fill);
        Ok(fill)
    }

    fn position(&self) -> PortfolioSnapshot {
        self.book.snapshot(self.mark)
    }
}
