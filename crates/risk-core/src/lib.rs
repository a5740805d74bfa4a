//! Shared, pure risk primitives used by the simulator and the shadow runner.
//!
//! The governor never holds ambient state: every call takes the prior
//! [`RiskState`] by reference and returns the next one alongside the approved
//! exposure and the reason codes explaining every scale-down or veto.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tolerance used when comparing ratios against configured caps.
const CAP_EPS: f64 = 1e-12;

// ---------------------------------------------------------------------------
// Exposure target
// ---------------------------------------------------------------------------

/// Target exposures expressed as fractions of NAV.
///
/// `carry_frac` is the hedged notional (spot long and perp short of equal size),
/// `directional_frac` is the signed overlay held on the perp.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExposureTarget {
    pub carry_frac: f64,
    pub directional_frac: f64,
}

impl ExposureTarget {
    pub const FLAT: ExposureTarget = ExposureTarget {
        carry_frac: 0.0,
        directional_frac: 0.0,
    };

    pub fn new(carry_frac: f64, directional_frac: f64) -> Self {
        Self {
            carry_frac,
            directional_frac,
        }
    }

    /// Gross leverage implied by the target: both carry legs plus the overlay.
    #[inline]
    pub fn gross_leverage(&self) -> f64 {
        2.0 * self.carry_frac.abs() + self.directional_frac.abs()
    }

    pub fn is_flat(&self) -> bool {
        self.carry_frac == 0.0 && self.directional_frac == 0.0
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// What the drawdown kill switch removes once latched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchMode {
    /// Zero the directional overlay, keep the hedged carry.
    CarryOnly,
    /// Zero everything.
    HaltAll,
}

impl std::fmt::Display for KillSwitchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillSwitchMode::CarryOnly => write!(f, "carry_only"),
            KillSwitchMode::HaltAll => write!(f, "halt_all"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Hard cap on gross notional / NAV.
    pub leverage_cap: f64,
    /// Fraction of the hard cap held back as liquidation buffer.
    pub liquidation_buffer: f64,
    /// Max notional held on any single venue as a fraction of NAV.
    pub venue_cap_frac: f64,
    pub max_drawdown: f64,
    pub kill_switch_mode: KillSwitchMode,
    /// Drawdown at or below which a latched kill switch releases.
    /// `None` keeps the switch latched for the rest of the run.
    pub recovery_drawdown: Option<f64>,
    /// Volatility percentile at or above which directional is zeroed for the bar.
    pub vol_spike_vol_pct: f64,
    pub spot_venue: String,
    pub perp_venue: String,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            leverage_cap: 1.5,
            liquidation_buffer: 0.10,
            venue_cap_frac: 0.30,
            max_drawdown: 0.20,
            kill_switch_mode: KillSwitchMode::CarryOnly,
            recovery_drawdown: None,
            vol_spike_vol_pct: 0.90,
            spot_venue: "spot".to_string(),
            perp_venue: "perp".to_string(),
        }
    }
}

/// Invalid risk parameter detected at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfigError {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for RiskConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "risk.{}: {}", self.field, self.message)
    }
}

impl std::error::Error for RiskConfigError {}

fn invalid(field: &'static str, message: &str) -> RiskConfigError {
    RiskConfigError {
        field,
        message: message.to_string(),
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), RiskConfigError> {
        if !self.leverage_cap.is_finite() || self.leverage_cap <= 0.0 {
            return Err(invalid("leverage_cap", "must be finite and positive"));
        }
        if !self.liquidation_buffer.is_finite() || !(0.0..1.0).contains(&self.liquidation_buffer) {
            return Err(invalid("liquidation_buffer", "must be finite and in [0, 1)"));
        }
        if !self.venue_cap_frac.is_finite() || self.venue_cap_frac <= 0.0 || self.venue_cap_frac > 1.0
        {
            return Err(invalid("venue_cap_frac", "must be finite and in (0, 1]"));
        }
        if !self.max_drawdown.is_finite() || self.max_drawdown <= 0.0 || self.max_drawdown >= 1.0 {
            return Err(invalid("max_drawdown", "must be finite and in (0, 1)"));
        }
        if let Some(rec) = self.recovery_drawdown {
            if !rec.is_finite() || rec < 0.0 || rec >= self.max_drawdown {
                return Err(invalid(
                    "recovery_drawdown",
                    "must be finite, >= 0 and below max_drawdown",
                ));
            }
        }
        if !self.vol_spike_vol_pct.is_finite()
            || self.vol_spike_vol_pct <= 0.0
            || self.vol_spike_vol_pct > 1.0
        {
            return Err(invalid("vol_spike_vol_pct", "must be finite and in (0, 1]"));
        }
        if self.spot_venue.trim().is_empty() || self.perp_venue.trim().is_empty() {
            return Err(invalid("spot_venue", "venue names must be non-empty"));
        }
        Ok(())
    }

    /// Leverage cap after the liquidation buffer is taken off.
    #[inline]
    pub fn effective_leverage_cap(&self) -> f64 {
        self.leverage_cap * (1.0 - self.liquidation_buffer)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Path-dependent risk memory threaded through every governor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub leverage: f64,
    pub venue_fractions: BTreeMap<String, f64>,
    pub peak_nav: f64,
    pub drawdown: f64,
    pub kill_switch_active: bool,
    pub kill_switch_mode: KillSwitchMode,
    /// Timestamp (ms) of the bar that latched the current kill switch.
    pub kill_switch_since_ms: Option<i64>,
}

impl RiskState {
    pub fn new(initial_nav: f64, mode: KillSwitchMode) -> Self {
        Self {
            leverage: 0.0,
            venue_fractions: BTreeMap::new(),
            peak_nav: initial_nav,
            drawdown: 0.0,
            kill_switch_active: false,
            kill_switch_mode: mode,
            kill_switch_since_ms: None,
        }
    }

    /// Update peak, drawdown and the kill-switch latch for a new NAV observation.
    fn observe_nav(
        &mut self,
        nav: f64,
        timestamp_ms: i64,
        cfg: &RiskConfig,
        reasons: &mut Vec<RiskReason>,
    ) {
        if nav > self.peak_nav {
            self.peak_nav = nav;
        }
        self.drawdown = if self.peak_nav > 0.0 {
            ((self.peak_nav - nav) / self.peak_nav).max(0.0)
        } else {
            0.0
        };

        if self.kill_switch_active {
            if let Some(rec) = cfg.recovery_drawdown {
                if self.drawdown <= rec {
                    self.kill_switch_active = false;
                    self.kill_switch_since_ms = None;
                    reasons.push(RiskReason::KillSwitchReleased);
                }
            }
        } else if self.drawdown >= cfg.max_drawdown - CAP_EPS {
            self.kill_switch_active = true;
            self.kill_switch_mode = cfg.kill_switch_mode;
            self.kill_switch_since_ms = Some(timestamp_ms);
            reasons.push(RiskReason::KillSwitchLatched);
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Machine-readable explanation for every governor intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    KillSwitchLatched,
    KillSwitchReleased,
    KillSwitchCarryOnly,
    KillSwitchHaltAll,
    DirectionalNotAllowed,
    LeverageCapScaled,
    VenueCapScaled,
    VolSpikeDerisk,
    NonPositiveNav,
    DataFault,
}

impl RiskReason {
    /// Whether the reason reduced (or zeroed) the proposed exposure.
    pub fn is_reduction(self) -> bool {
        !matches!(self, RiskReason::KillSwitchLatched | RiskReason::KillSwitchReleased)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskVerdict {
    Approved,
    Scaled,
    /// Nothing may be executed this bar; the approved target is meaningless.
    Vetoed,
}

/// Per-bar inputs the governor needs besides the proposal and prior state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskObservation {
    pub timestamp_ms: i64,
    pub nav: f64,
    pub vol_pct: Option<f64>,
    /// Regime permits a directional overlay (RISK_ON only).
    pub directional_permitted: bool,
    /// The bar failed ingestion checks.
    pub data_fault: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvaluation {
    pub approved: ExposureTarget,
    pub state: RiskState,
    pub verdict: RiskVerdict,
    pub reasons: Vec<RiskReason>,
}

/// Per-venue notional fractions implied by a target.
///
/// The spot leg of the carry sits on `spot_venue`; the carry hedge and the
/// directional overlay both sit on `perp_venue`.
pub fn target_venue_fractions(target: &ExposureTarget, cfg: &RiskConfig) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    *out.entry(cfg.spot_venue.clone()).or_insert(0.0) += target.carry_frac.abs();
    *out.entry(cfg.perp_venue.clone()).or_insert(0.0) +=
        target.carry_frac.abs() + target.directional_frac.abs();
    out
}

/// Evaluate a proposed exposure against the prior risk state.
///
/// Checks run in a fixed order (drawdown kill switch, leverage cap, venue cap,
/// volatility spike). The function never fails: a breach always resolves to a
/// compliant, possibly zeroed target plus the reasons.
pub fn evaluate(
    proposed: &ExposureTarget,
    prior: &RiskState,
    obs: &RiskObservation,
    cfg: &RiskConfig,
) -> RiskEvaluation {
    let mut state = prior.clone();
    let mut reasons = Vec::new();

    if obs.data_fault {
        return RiskEvaluation {
            approved: ExposureTarget::FLAT,
            state,
            verdict: RiskVerdict::Vetoed,
            reasons: vec![RiskReason::DataFault],
        };
    }
    if !obs.nav.is_finite() || obs.nav <= 0.0 {
        return RiskEvaluation {
            approved: ExposureTarget::FLAT,
            state,
            verdict: RiskVerdict::Vetoed,
            reasons: vec![RiskReason::NonPositiveNav],
        };
    }

    let mut carry = proposed.carry_frac.max(0.0);
    let mut directional = proposed.directional_frac;

    // 1. Drawdown kill switch.
    state.observe_nav(obs.nav, obs.timestamp_ms, cfg, &mut reasons);
    if state.kill_switch_active {
        match state.kill_switch_mode {
            KillSwitchMode::CarryOnly => {
                if directional != 0.0 {
                    reasons.push(RiskReason::KillSwitchCarryOnly);
                }
                directional = 0.0;
            }
            KillSwitchMode::HaltAll => {
                if carry != 0.0 || directional != 0.0 {
                    reasons.push(RiskReason::KillSwitchHaltAll);
                }
                carry = 0.0;
                directional = 0.0;
            }
        }
    }

    if directional != 0.0 && !obs.directional_permitted {
        directional = 0.0;
        reasons.push(RiskReason::DirectionalNotAllowed);
    }

    // 2. Leverage cap.
    let cap = cfg.effective_leverage_cap();
    let lev = ExposureTarget::new(carry, directional).gross_leverage();
    if lev > cap + CAP_EPS {
        let s = cap / lev;
        carry *= s;
        directional *= s;
        reasons.push(RiskReason::LeverageCapScaled);
    }

    // 3. Venue concentration cap. Scaling only shrinks, so venues already
    // visited stay compliant while later ones are processed.
    let venues: Vec<String> = target_venue_fractions(&ExposureTarget::FLAT, cfg)
        .into_keys()
        .collect();
    let mut venue_scaled = false;
    for venue in &venues {
        let fracs = target_venue_fractions(&ExposureTarget::new(carry, directional), cfg);
        let frac = fracs.get(venue).copied().unwrap_or(0.0);
        if frac > cfg.venue_cap_frac + CAP_EPS {
            let s = cfg.venue_cap_frac / frac;
            // Carry is always scaled on both legs so the hedge stays neutral.
            carry *= s;
            if *venue == cfg.perp_venue {
                directional *= s;
            }
            venue_scaled = true;
        }
    }
    if venue_scaled {
        reasons.push(RiskReason::VenueCapScaled);
    }

    // 4. Volatility-spike de-risk.
    if let Some(v) = obs.vol_pct {
        if v >= cfg.vol_spike_vol_pct && directional != 0.0 {
            directional = 0.0;
            reasons.push(RiskReason::VolSpikeDerisk);
        }
    }

    let verdict = if reasons.iter().any(|r| r.is_reduction()) {
        RiskVerdict::Scaled
    } else {
        RiskVerdict::Approved
    };

    RiskEvaluation {
        approved: ExposureTarget::new(carry, directional),
        state,
        verdict,
        reasons,
    }
}

// ---------------------------------------------------------------------------
// Post-trade enforcement
// ---------------------------------------------------------------------------

/// Realised exposure after fills, in quote currency.
#[derive(Debug, Clone, PartialEq)]
pub struct PostTradeExposure {
    pub timestamp_ms: i64,
    pub nav: f64,
    pub gross_notional: f64,
    pub venue_notional: BTreeMap<String, f64>,
}

/// Factor in `[0, 1]` that all legs must be multiplied by to satisfy the
/// leverage and venue caps, or `None` when the book is already compliant.
///
/// A non-positive NAV yields `Some(0.0)`: the only compliant book is flat.
pub fn post_trade_scale(exposure: &PostTradeExposure, cfg: &RiskConfig) -> Option<f64> {
    if !exposure.nav.is_finite() || exposure.nav <= 0.0 {
        return if exposure.gross_notional > 0.0 { Some(0.0) } else { None };
    }
    let mut scale: f64 = 1.0;

    let cap = cfg.effective_leverage_cap();
    let lev = exposure.gross_notional / exposure.nav;
    if lev > cap + CAP_EPS {
        scale = scale.min(cap / lev);
    }
    for notional in exposure.venue_notional.values() {
        let frac = notional.abs() / exposure.nav;
        if frac > cfg.venue_cap_frac + CAP_EPS {
            scale = scale.min(cfg.venue_cap_frac / frac);
        }
    }

    if scale < 1.0 {
        Some(scale.max(0.0))
    } else {
        None
    }
}

/// Record the post-trade book into the risk state (step 7 of a bar).
pub fn observe_post_trade(
    prior: &RiskState,
    exposure: &PostTradeExposure,
    cfg: &RiskConfig,
) -> (RiskState, Vec<RiskReason>) {
    let mut state = prior.clone();
    let mut reasons = Vec::new();
    let nav = exposure.nav;
    if nav.is_finite() && nav > 0.0 {
        state.observe_nav(nav, exposure.timestamp_ms, cfg, &mut reasons);
        state.leverage = exposure.gross_notional / nav;
        state.venue_fractions = exposure
            .venue_notional
            .iter()
            .map(|(k, v)| (k.clone(), v.abs() / nav))
            .collect();
    } else {
        state.leverage = if exposure.gross_notional > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        state.venue_fractions.clear();
    }
    (state, reasons)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(nav: f64) -> RiskObservation {
        RiskObservation {
            timestamp_ms: 0,
            nav,
            vol_pct: Some(0.5),
            directional_permitted: true,
            data_fault: false,
        }
    }

    fn roomy_cfg() -> RiskConfig {
        RiskConfig {
            venue_cap_frac: 1.0,
            liquidation_buffer: 0.0,
            ..RiskConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn negative_leverage_cap_fails_fast() {
        let cfg = RiskConfig {
            leverage_cap: -1.0,
            ..RiskConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.field, "leverage_cap");
    }

    #[test]
    fn recovery_must_sit_below_max_drawdown() {
        let cfg = RiskConfig {
            recovery_drawdown: Some(0.25),
            ..RiskConfig::default()
        };
        assert_eq!(cfg.validate().unwrap_err().field, "recovery_drawdown");
    }

    #[test]
    fn venue_cap_is_a_fraction_of_nav() {
        let full = RiskConfig {
            venue_cap_frac: 1.0,
            ..RiskConfig::default()
        };
        assert!(full.validate().is_ok());
        let over = RiskConfig {
            venue_cap_frac: 1.5,
            ..RiskConfig::default()
        };
        assert_eq!(over.validate().unwrap_err().field, "venue_cap_frac");
    }

    #[test]
    fn compliant_proposal_is_approved_unchanged() {
        let cfg = RiskConfig::default();
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let proposed = ExposureTarget::new(0.2, 0.05);
        let out = evaluate(&proposed, &state, &obs(100.0), &cfg);
        assert_eq!(out.verdict, RiskVerdict::Approved);
        assert_eq!(out.approved, proposed);
        assert!(out.reasons.is_empty());
    }

    #[test]
    fn carry_only_kill_switch_keeps_carry() {
        let cfg = RiskConfig {
            max_drawdown: 0.10,
            ..roomy_cfg()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let out = evaluate(&ExposureTarget::new(0.3, 0.2), &state, &obs(90.0), &cfg);
        assert!(out.state.kill_switch_active);
        assert_eq!(out.approved.directional_frac, 0.0);
        assert!((out.approved.carry_frac - 0.3).abs() < 1e-12);
        assert!(out.reasons.contains(&RiskReason::KillSwitchLatched));
        assert!(out.reasons.contains(&RiskReason::KillSwitchCarryOnly));
    }

    #[test]
    fn halt_all_kill_switch_zeroes_everything() {
        let cfg = RiskConfig {
            max_drawdown: 0.10,
            kill_switch_mode: KillSwitchMode::HaltAll,
            ..roomy_cfg()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let out = evaluate(&ExposureTarget::new(0.3, 0.2), &state, &obs(89.0), &cfg);
        assert!(out.approved.is_flat());
        assert_eq!(out.verdict, RiskVerdict::Scaled);
        assert!(out.reasons.contains(&RiskReason::KillSwitchHaltAll));
    }

    #[test]
    fn latched_switch_stays_latched_without_recovery() {
        let cfg = RiskConfig {
            max_drawdown: 0.10,
            ..roomy_cfg()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let first = evaluate(&ExposureTarget::new(0.3, 0.2), &state, &obs(85.0), &cfg);
        let again = evaluate(&ExposureTarget::new(0.3, 0.2), &first.state, &obs(99.0), &cfg);
        assert!(again.state.kill_switch_active);
        assert_eq!(again.approved.directional_frac, 0.0);
    }

    #[test]
    fn latched_switch_releases_on_recovery() {
        let cfg = RiskConfig {
            max_drawdown: 0.10,
            recovery_drawdown: Some(0.02),
            ..roomy_cfg()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let first = evaluate(&ExposureTarget::new(0.3, 0.2), &state, &obs(85.0), &cfg);
        let mid = evaluate(&ExposureTarget::new(0.3, 0.2), &first.state, &obs(95.0), &cfg);
        assert!(mid.state.kill_switch_active);
        let recovered = evaluate(&ExposureTarget::new(0.3, 0.2), &mid.state, &obs(99.0), &cfg);
        assert!(!recovered.state.kill_switch_active);
        assert!(recovered.reasons.contains(&RiskReason::KillSwitchReleased));
        assert!((recovered.approved.directional_frac - 0.2).abs() < 1e-12);
    }

    #[test]
    fn leverage_cap_scales_both_components_proportionally() {
        let cfg = RiskConfig {
            leverage_cap: 1.0,
            ..roomy_cfg()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        // gross = 2 * 0.5 + 0.5 = 1.5 -> scale 2/3
        let out = evaluate(&ExposureTarget::new(0.5, 0.5), &state, &obs(100.0), &cfg);
        assert!((out.approved.gross_leverage() - 1.0).abs() < 1e-12);
        assert!((out.approved.carry_frac / out.approved.directional_frac - 1.0).abs() < 1e-12);
        assert_eq!(out.reasons, vec![RiskReason::LeverageCapScaled]);
    }

    #[test]
    fn liquidation_buffer_tightens_leverage_cap() {
        let cfg = RiskConfig {
            leverage_cap: 1.0,
            liquidation_buffer: 0.2,
            venue_cap_frac: 1.0,
            ..RiskConfig::default()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let out = evaluate(&ExposureTarget::new(0.5, 0.0), &state, &obs(100.0), &cfg);
        assert!((out.approved.gross_leverage() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn perp_venue_cap_scales_carry_and_directional() {
        let cfg = RiskConfig {
            leverage_cap: 10.0,
            ..RiskConfig::default()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let out = evaluate(&ExposureTarget::new(0.3, 0.3), &state, &obs(100.0), &cfg);
        let fracs = target_venue_fractions(&out.approved, &cfg);
        assert!((fracs["perp"] - 0.30).abs() < 1e-12);
        assert!(fracs["spot"] <= 0.30 + 1e-12);
        assert!(out.reasons.contains(&RiskReason::VenueCapScaled));
    }

    #[test]
    fn shared_venue_counts_both_carry_legs() {
        let cfg = RiskConfig {
            leverage_cap: 10.0,
            venue_cap_frac: 0.4,
            spot_venue: "hl".to_string(),
            perp_venue: "hl".to_string(),
            ..RiskConfig::default()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let out = evaluate(&ExposureTarget::new(0.3, 0.0), &state, &obs(100.0), &cfg);
        assert!((out.approved.carry_frac - 0.2).abs() < 1e-12);
    }

    #[test]
    fn vol_spike_zeroes_directional_only() {
        let cfg = roomy_cfg();
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let mut o = obs(100.0);
        o.vol_pct = Some(0.95);
        let out = evaluate(&ExposureTarget::new(0.2, 0.1), &state, &o, &cfg);
        assert_eq!(out.approved.directional_frac, 0.0);
        assert!((out.approved.carry_frac - 0.2).abs() < 1e-12);
        assert!(!out.state.kill_switch_active);
        assert!(out.reasons.contains(&RiskReason::VolSpikeDerisk));
    }

    #[test]
    fn directional_outside_risk_on_is_zeroed() {
        let cfg = roomy_cfg();
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let mut o = obs(100.0);
        o.directional_permitted = false;
        let out = evaluate(&ExposureTarget::new(0.2, 0.1), &state, &o, &cfg);
        assert_eq!(out.approved.directional_frac, 0.0);
        assert_eq!(out.reasons, vec![RiskReason::DirectionalNotAllowed]);
    }

    #[test]
    fn non_positive_nav_vetoes_instead_of_panicking() {
        let cfg = RiskConfig::default();
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        for nav in [0.0, -5.0, f64::NAN] {
            let out = evaluate(&ExposureTarget::new(0.2, 0.1), &state, &obs(nav), &cfg);
            assert_eq!(out.verdict, RiskVerdict::Vetoed);
            assert_eq!(out.reasons, vec![RiskReason::NonPositiveNav]);
            assert_eq!(out.state, state);
        }
    }

    #[test]
    fn evaluation_is_idempotent() {
        let cfg = RiskConfig {
            max_drawdown: 0.05,
            ..RiskConfig::default()
        };
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let a = evaluate(&ExposureTarget::new(0.9, 0.4), &state, &obs(94.0), &cfg);
        let b = evaluate(&ExposureTarget::new(0.9, 0.4), &state, &obs(94.0), &cfg);
        assert_eq!(a, b);
    }

    #[test]
    fn post_trade_scale_reports_tightest_cap() {
        let cfg = RiskConfig {
            leverage_cap: 1.0,
            liquidation_buffer: 0.0,
            venue_cap_frac: 0.5,
            ..RiskConfig::default()
        };
        let mut venue_notional = BTreeMap::new();
        venue_notional.insert("spot".to_string(), 40.0);
        venue_notional.insert("perp".to_string(), 60.0);
        let exposure = PostTradeExposure {
            timestamp_ms: 0,
            nav: 100.0,
            gross_notional: 100.0,
            venue_notional,
        };
        let s = post_trade_scale(&exposure, &cfg).expect("perp venue is over cap");
        assert!((s - 0.5 / 0.6).abs() < 1e-12);
    }

    #[test]
    fn post_trade_observation_updates_leverage_and_latch() {
        let cfg = RiskConfig::default();
        let state = RiskState::new(100.0, cfg.kill_switch_mode);
        let mut venue_notional = BTreeMap::new();
        venue_notional.insert("perp".to_string(), 20.0);
        let (next, reasons) = observe_post_trade(
            &state,
            &PostTradeExposure {
                timestamp_ms: 7,
                nav: 79.0,
                gross_notional: 40.0,
                venue_notional,
            },
            &cfg,
        );
        assert!(next.kill_switch_active);
        assert_eq!(next.kill_switch_since_ms, Some(7));
        assert_eq!(reasons, vec![RiskReason::KillSwitchLatched]);
        assert!((next.leverage - 40.0 / 79.0).abs() < 1e-12);
        assert!((next.venue_fractions["perp"] - 20.0 / 79.0).abs() < 1e-12);
    }

    #[test]
    fn reasons_serialize_snake_case() {
        let json = serde_json::to_string(&RiskReason::VenueCapScaled).unwrap();
        assert_eq!(json, "\"venue_cap_scaled\"");
    }
}
