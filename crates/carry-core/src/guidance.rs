//! Regime → target exposure mapping.

use risk_core::ExposureTarget;

use crate::config::GuidanceConfig;
use crate::regime::Regime;

/// Table-driven target exposure before risk governance.
///
/// Directional is non-zero only in RISK_ON and only on bars where the
/// expansion trigger fired.
pub fn target_exposure(
    regime: Regime,
    aggressiveness: f64,
    expansion: bool,
    cfg: &GuidanceConfig,
) -> ExposureTarget {
    let (carry, directional) = match regime {
        Regime::RiskOff => (cfg.risk_off_carry.pick(aggressiveness), 0.0),
        Regime::Neutral => (cfg.neutral_carry.pick(aggressiveness), 0.0),
        Regime::RiskOn => {
            let dir = if expansion {
                cfg.risk_on_directional.pick(aggressiveness)
            } else {
                0.0
            };
            (cfg.risk_on_carry.pick(aggressiveness), dir)
        }
    };
    ExposureTarget::new(carry.clamp(0.0, 1.0), directional.clamp(0.0, 1.0))
}

/// Scale the directional fraction towards `target_dir_vol`.
///
/// Without a realized vol reading the overlay is dropped.
pub fn apply_vol_target(
    target: ExposureTarget,
    realized_vol: Option<f64>,
    cfg: &GuidanceConfig,
) -> ExposureTarget {
    let directional = match realized_vol {
        Some(v) if v.is_finite() => {
            let scale = (cfg.target_dir_vol / v.max(cfg.min_dir_vol)).min(1.0);
            target.directional_frac * scale
        }
        _ => 0.0,
    };
    ExposureTarget::new(target.carry_frac, directional)
}

/// Guidance for one bar: band lookup followed by directional vol targeting.
pub fn guidance_for_bar(
    regime: Regime,
    expansion: bool,
    realized_vol: Option<f64>,
    cfg: &GuidanceConfig,
) -> ExposureTarget {
    let raw = target_exposure(regime, cfg.aggressiveness, expansion, cfg);
    apply_vol_target(raw, realized_vol, cfg)
}
