//! Rule-based regime classifier with explicit hysteresis memory.
//!
//! `classify` is pure: the prior [`RegimeMemory`] goes in, the next one comes
//! back inside the [`RegimeDecision`]. Entering a regime is harder than staying
//! in it (separate entry/exit vol bands), and every non-emergency switch must
//! be confirmed by `confirm_bars` consecutive identical candidates.

use serde::{Deserialize, Serialize};

use crate::candle::Bar;
use crate::config::{CompressionConfig, FundingMode, RegimeConfig};
use crate::features::{FeatureEngine, FeatureSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    RiskOff,
    Neutral,
    RiskOn,
}

impl Regime {
    pub const ALL: [Regime; 3] = [Regime::RiskOff, Regime::Neutral, Regime::RiskOn];

    pub fn as_str(self) -> &'static str {
        match self {
            Regime::RiskOff => "RISK_OFF",
            Regime::Neutral => "NEUTRAL",
            Regime::RiskOn => "RISK_ON",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeReason {
    FeaturesNotWarm,
    ExtremeVolOverride,
    /// Candidate equals the current regime.
    Sustained,
    /// Candidate differs but has not persisted long enough.
    PendingConfirmation,
    Confirmed,
}

/// Hysteresis memory threaded through successive `classify` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeMemory {
    pub regime: Regime,
    pub pending: Option<Regime>,
    pub pending_count: u32,
}

impl Default for RegimeMemory {
    fn default() -> Self {
        Self::settled(Regime::Neutral)
    }
}

impl RegimeMemory {
    pub fn settled(regime: Regime) -> Self {
        Self {
            regime,
            pending: None,
            pending_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimeDecision {
    pub bar_index: u64,
    pub t: i64,
    pub regime: Regime,
    pub candidate: Regime,
    pub reason: RegimeReason,
    pub trend: i8,
    pub vol_pct: Option<f64>,
    pub funding: Option<f64>,
    pub memory: RegimeMemory,
}

fn funding_sign(funding: Option<f64>) -> i8 {
    match funding {
        Some(f) if f > 0.0 => 1,
        Some(f) if f < 0.0 => -1,
        _ => 0,
    }
}

/// Raw candidate for one bar given the regime currently held.
pub fn candidate_regime(
    prior: Regime,
    trend: i8,
    vol_pct: f64,
    funding: Option<f64>,
    cfg: &RegimeConfig,
) -> Regime {
    // Exit bands: staying is easier than entering.
    match prior {
        Regime::RiskOn if trend >= 0 && vol_pct <= cfg.risk_on_exit_vol_pct => {
            return Regime::RiskOn
        }
        Regime::RiskOff if vol_pct >= cfg.risk_off_exit_vol_pct || trend < 0 => {
            return Regime::RiskOff
        }
        _ => {}
    }

    let mut cand = if vol_pct >= cfg.risk_off_vol_pct_min || trend < 0 {
        Regime::RiskOff
    } else if trend > 0 && vol_pct <= cfg.risk_on_vol_pct_max {
        Regime::RiskOn
    } else {
        Regime::Neutral
    };

    if cfg.funding_mode == FundingMode::Sign {
        let sign = funding_sign(funding);
        if cand == Regime::RiskOn && sign > 0 {
            cand = Regime::Neutral;
        } else if cand == Regime::Neutral
            && sign < 0
            && trend > 0
            && vol_pct <= cfg.risk_on_exit_vol_pct
        {
            cand = Regime::RiskOn;
        }
    }
    cand
}

/// Classify one bar.
pub fn classify(
    features: &FeatureSnapshot,
    prior: &RegimeMemory,
    cfg: &RegimeConfig,
) -> RegimeDecision {
    let decision = |regime, candidate, reason, memory| RegimeDecision {
        bar_index: features.bar_index,
        t: features.t,
        regime,
        candidate,
        reason,
        trend: features.trend,
        vol_pct: features.vol_pct,
        funding: features.funding,
        memory,
    };

    let vol_pct = match features.vol_pct {
        Some(v) if features.warm => v,
        _ => {
            return decision(
                Regime::Neutral,
                Regime::Neutral,
                RegimeReason::FeaturesNotWarm,
                RegimeMemory::settled(Regime::Neutral),
            )
        }
    };

    if vol_pct >= cfg.extreme_vol_pct {
        return decision(
            Regime::RiskOff,
            Regime::RiskOff,
            RegimeReason::ExtremeVolOverride,
            RegimeMemory::settled(Regime::RiskOff),
        );
    }

    let cand = candidate_regime(prior.regime, features.trend, vol_pct, features.funding, cfg);
    if cand == prior.regime {
        return decision(
            prior.regime,
            cand,
            RegimeReason::Sustained,
            RegimeMemory::settled(prior.regime),
        );
    }

    let count = if prior.pending == Some(cand) {
        prior.pending_count + 1
    } else {
        1
    };
    if count >= cfg.confirm_bars {
        return decision(
            cand,
            cand,
            RegimeReason::Confirmed,
            RegimeMemory::settled(cand),
        );
    }
    decision(
        prior.regime,
        cand,
        RegimeReason::PendingConfirmation,
        RegimeMemory {
            regime: prior.regime,
            pending: Some(cand),
            pending_count: count,
        },
    )
}

/// Features and regime decision for every accepted bar. Faulted bars are
/// dropped, the same way the simulator skips them.
pub fn replay(
    bars: &[Bar],
    regime_cfg: &RegimeConfig,
    compression_cfg: &CompressionConfig,
) -> Vec<(FeatureSnapshot, RegimeDecision)> {
    let mut engine = FeatureEngine::new(regime_cfg, compression_cfg);
    let mut memory = RegimeMemory::default();
    let mut last_t = None;
    let mut out = Vec::with_capacity(bars.len());
    for bar in bars {
        if bar.fault(last_t).is_some() {
            continue;
        }
        last_t = Some(bar.t);
        let snap = engine.update(bar);
        let decision = classify(&snap, &memory, regime_cfg);
        memory = decision.memory;
        out.push((snap, decision));
    }
    out
}
