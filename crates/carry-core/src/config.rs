//! Typed simulator configuration with YAML loading and fail-fast validation.
//!
//! Every struct is `#[serde(default)]`, so a YAML file only needs the keys that
//! differ from the defaults. Validation runs once, at load time; the step loop
//! assumes a validated config.

use risk_core::{RiskConfig, RiskConfigError};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    Invalid {
        field: String,
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "failed to read {path}: {source}"),
            ConfigError::Parse { path, source } => write!(f, "failed to parse {path}: {source}"),
            ConfigError::Invalid { field, message } => write!(f, "invalid {field}: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl From<RiskConfigError> for ConfigError {
    fn from(e: RiskConfigError) -> Self {
        ConfigError::Invalid {
            field: format!("risk.{}", e.field),
            message: e.message,
        }
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn check_positive(field: &str, v: f64) -> Result<(), ConfigError> {
    if !v.is_finite() || v <= 0.0 {
        return Err(invalid(field, "must be finite and positive"));
    }
    Ok(())
}

fn check_non_negative(field: &str, v: f64) -> Result<(), ConfigError> {
    if !v.is_finite() || v < 0.0 {
        return Err(invalid(field, "must be finite and non-negative"));
    }
    Ok(())
}

fn check_unit(field: &str, v: f64) -> Result<(), ConfigError> {
    if !v.is_finite() || v <= 0.0 || v > 1.0 {
        return Err(invalid(field, "must be finite and in (0, 1]"));
    }
    Ok(())
}

fn check_window(field: &str, v: usize) -> Result<(), ConfigError> {
    if v == 0 {
        return Err(invalid(field, "must be positive"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMethod {
    Sma,
    Ema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundingMode {
    /// Funding has no effect on regime classification.
    Ignore,
    /// Funding sign nudges the entry candidate (positive demotes RISK_ON, negative can promote NEUTRAL).
    Sign,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub trend_method: TrendMethod,
    pub long_ma_window: usize,
    /// Relative band around the moving average inside which trend reads as flat.
    pub trend_band: f64,
    pub rv_window: usize,
    pub vol_percentile_window: usize,
    pub annualization_factor: f64,
    pub demean_returns: bool,
    pub risk_on_vol_pct_max: f64,
    pub risk_off_vol_pct_min: f64,
    pub risk_on_exit_vol_pct: f64,
    pub risk_off_exit_vol_pct: f64,
    /// Vol percentile that forces RISK_OFF immediately, skipping confirmation.
    pub extreme_vol_pct: f64,
    pub confirm_bars: u32,
    pub funding_mode: FundingMode,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_method: TrendMethod::Sma,
            long_ma_window: 200,
            trend_band: 0.001,
            rv_window: 20,
            vol_percentile_window: 252,
            annualization_factor: 1.0,
            demean_returns: false,
            risk_on_vol_pct_max: 0.70,
            risk_off_vol_pct_min: 0.90,
            risk_on_exit_vol_pct: 0.80,
            risk_off_exit_vol_pct: 0.80,
            extreme_vol_pct: 0.97,
            confirm_bars: 3,
            funding_mode: FundingMode::Sign,
        }
    }
}

impl RegimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_window("regime.long_ma_window", self.long_ma_window)?;
        check_window("regime.rv_window", self.rv_window)?;
        check_window("regime.vol_percentile_window", self.vol_percentile_window)?;
        check_non_negative("regime.trend_band", self.trend_band)?;
        check_positive("regime.annualization_factor", self.annualization_factor)?;
        check_unit("regime.risk_on_vol_pct_max", self.risk_on_vol_pct_max)?;
        check_unit("regime.risk_off_vol_pct_min", self.risk_off_vol_pct_min)?;
        check_unit("regime.risk_on_exit_vol_pct", self.risk_on_exit_vol_pct)?;
        check_unit("regime.risk_off_exit_vol_pct", self.risk_off_exit_vol_pct)?;
        check_unit("regime.extreme_vol_pct", self.extreme_vol_pct)?;
        if self.confirm_bars == 0 {
            return Err(invalid("regime.confirm_bars", "must be positive"));
        }
        if self.risk_on_vol_pct_max >= self.risk_off_vol_pct_min {
            return Err(invalid(
                "regime.risk_on_vol_pct_max",
                "must be below risk_off_vol_pct_min",
            ));
        }
        if self.risk_on_exit_vol_pct < self.risk_on_vol_pct_max {
            return Err(invalid(
                "regime.risk_on_exit_vol_pct",
                "must be >= risk_on_vol_pct_max (exit band wider than entry)",
            ));
        }
        if self.risk_off_exit_vol_pct > self.risk_off_vol_pct_min {
            return Err(invalid(
                "regime.risk_off_exit_vol_pct",
                "must be <= risk_off_vol_pct_min (exit band wider than entry)",
            ));
        }
        if self.extreme_vol_pct < self.risk_off_vol_pct_min {
            return Err(invalid(
                "regime.extreme_vol_pct",
                "must be >= risk_off_vol_pct_min",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub atr_window: usize,
    pub contraction_lookback: usize,
    pub vol_pct_window: usize,
    pub vol_pct_low_threshold: f64,
    pub weight_atr: f64,
    pub weight_range: f64,
    pub weight_vol: f64,
    pub range_window: usize,
    pub breakout_confirm: u32,
    pub vol_expand_threshold: f64,
    pub score_trigger: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            atr_window: 14,
            contraction_lookback: 50,
            vol_pct_window: 252,
            vol_pct_low_threshold: 0.4,
            weight_atr: 0.4,
            weight_range: 0.4,
            weight_vol: 0.2,
            range_window: 50,
            breakout_confirm: 1,
            vol_expand_threshold: 0.7,
            score_trigger: 0.6,
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_window("compression.atr_window", self.atr_window)?;
        check_window("compression.contraction_lookback", self.contraction_lookback)?;
        check_window("compression.vol_pct_window", self.vol_pct_window)?;
        check_window("compression.range_window", self.range_window)?;
        if self.breakout_confirm == 0 {
            return Err(invalid("compression.breakout_confirm", "must be positive"));
        }
        check_unit("compression.vol_pct_low_threshold", self.vol_pct_low_threshold)?;
        check_unit("compression.vol_expand_threshold", self.vol_expand_threshold)?;
        check_unit("compression.score_trigger", self.score_trigger)?;
        check_non_negative("compression.weight_atr", self.weight_atr)?;
        check_non_negative("compression.weight_range", self.weight_range)?;
        check_non_negative("compression.weight_vol", self.weight_vol)?;
        Ok(())
    }
}

/// Inclusive allocation band expressed as a fraction of NAV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationBand {
    pub min: f64,
    pub max: f64,
}

impl AllocationBand {
    pub const ZERO: AllocationBand = AllocationBand { min: 0.0, max: 0.0 };

    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Point inside the band: aggressiveness 0 → min, 1 → max.
    #[inline]
    pub fn pick(&self, aggressiveness: f64) -> f64 {
        self.min + aggressiveness.clamp(0.0, 1.0) * (self.max - self.min)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        for v in [self.min, self.max] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(invalid(field, "bounds must be finite and in [0, 1]"));
            }
        }
        if self.min > self.max {
            return Err(invalid(field, "min must be <= max"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    pub risk_off_carry: AllocationBand,
    pub neutral_carry: AllocationBand,
    pub risk_on_carry: AllocationBand,
    pub risk_on_directional: AllocationBand,
    pub aggressiveness: f64,
    /// Annualised vol the directional overlay is scaled towards.
    pub target_dir_vol: f64,
    /// Floor on realized vol when computing the vol-target scale.
    pub min_dir_vol: f64,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            risk_off_carry: AllocationBand::new(0.05, 0.15),
            neutral_carry: AllocationBand::new(0.10, 0.20),
            risk_on_carry: AllocationBand::new(0.15, 0.25),
            risk_on_directional: AllocationBand::new(0.0, 0.10),
            aggressiveness: 0.5,
            target_dir_vol: 0.20,
            min_dir_vol: 1e-6,
        }
    }
}

impl GuidanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.risk_off_carry.validate("guidance.risk_off_carry")?;
        self.neutral_carry.validate("guidance.neutral_carry")?;
        self.risk_on_carry.validate("guidance.risk_on_carry")?;
        self.risk_on_directional
            .validate("guidance.risk_on_directional")?;
        if !self.aggressiveness.is_finite() || !(0.0..=1.0).contains(&self.aggressiveness) {
            return Err(invalid("guidance.aggressiveness", "must be finite and in [0, 1]"));
        }
        check_positive("guidance.target_dir_vol", self.target_dir_vol)?;
        check_positive("guidance.min_dir_vol", self.min_dir_vol)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub taker_fee_bps: f64,
    /// Slippage floor applied to every fill.
    pub slippage_fixed_bps: f64,
    /// Size-dependent slippage: a trade of 1x NAV costs this many bps.
    pub slippage_bps_at_1x_nav: f64,
    /// Fraction of each opening order the simulated venue fills.
    pub fill_ratio: f64,
    pub funding_interval_hours: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            taker_fee_bps: 5.0,
            slippage_fixed_bps: 1.0,
            slippage_bps_at_1x_nav: 10.0,
            fill_ratio: 1.0,
            funding_interval_hours: 8,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("execution.taker_fee_bps", self.taker_fee_bps)?;
        check_non_negative("execution.slippage_fixed_bps", self.slippage_fixed_bps)?;
        check_non_negative("execution.slippage_bps_at_1x_nav", self.slippage_bps_at_1x_nav)?;
        check_unit("execution.fill_ratio", self.fill_ratio)?;
        if self.funding_interval_hours == 0 {
            return Err(invalid("execution.funding_interval_hours", "must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub rebalance_interval_bars: u32,
    /// Leg deltas smaller than this fraction of NAV are skipped.
    pub rebalance_band_frac: f64,
    pub max_slippage_bps: f64,
    pub oracle_divergence_bps: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            rebalance_interval_bars: 1,
            rebalance_band_frac: 0.005,
            max_slippage_bps: 30.0,
            oracle_divergence_bps: 50.0,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rebalance_interval_bars == 0 {
            return Err(invalid("control.rebalance_interval_bars", "must be positive"));
        }
        check_non_negative("control.rebalance_band_frac", self.rebalance_band_frac)?;
        check_non_negative("control.max_slippage_bps", self.max_slippage_bps)?;
        check_non_negative("control.oracle_divergence_bps", self.oracle_divergence_bps)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Fraction of each opening order the paper venue fills.
    pub max_fill_ratio: f64,
    /// Offset applied to the paper venue mark relative to the bar close (oracle).
    pub mark_premium_bps: f64,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            max_fill_ratio: 1.0,
            mark_premium_bps: 0.0,
        }
    }
}

impl ShadowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("shadow.max_fill_ratio", self.max_fill_ratio)?;
        if !self.mark_premium_bps.is_finite() || self.mark_premium_bps.abs() >= 10_000.0 {
            return Err(invalid("shadow.mark_premium_bps", "must be finite and within ±10000"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub symbol: String,
    pub initial_nav: f64,
    pub regime: RegimeConfig,
    pub compression: CompressionConfig,
    pub guidance: GuidanceConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub control: ControlConfig,
    pub shadow: ShadowConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC".to_string(),
            initial_nav: 1_000_000.0,
            regime: RegimeConfig::default(),
            compression: CompressionConfig::default(),
            guidance: GuidanceConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            control: ControlConfig::default(),
            shadow: ShadowConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol", "must be non-empty"));
        }
        check_positive("initial_nav", self.initial_nav)?;
        self.regime.validate()?;
        self.compression.validate()?;
        self.guidance.validate()?;
        self.risk.validate()?;
        self.execution.validate()?;
        self.control.validate()?;
        self.shadow.validate()?;
        Ok(())
    }

    /// Bars needed before the regime classifier leaves warmup.
    pub fn warmup_bars(&self) -> usize {
        let vol = self.regime.rv_window + self.regime.vol_percentile_window;
        vol.max(self.regime.long_ma_window)
    }
}

// ---------------------------------------------------------------------------
// YAML loading
// ---------------------------------------------------------------------------
//
// YAML layout:
//
// ```yaml
// global:
//   risk: { max_drawdown: 0.15 }
// symbols:
//   ETH:
//     guidance: { aggressiveness: 0.8 }
// shadow:
//   control: { max_slippage_bps: 10 }
// ```
//
// Merge order: defaults <- global <- symbols.<SYMBOL> <- shadow (shadow runs only).
// Merging happens on `serde_yaml::Value` so a layer can set a single nested key.

#[derive(Debug, Deserialize)]
struct YamlRoot {
    #[serde(default)]
    global: serde_yaml::Value,
    #[serde(default)]
    symbols: serde_yaml::Value,
    #[serde(default)]
    shadow: serde_yaml::Value,
}

/// Recursively merge `overlay` into `base`.
///
/// Mappings merge key by key; anything else is replaced. A null overlay keeps the base.
fn deep_merge(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(ref mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map.iter() {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}

/// Merge a YAML document (already read) into the defaults and validate.
pub fn config_from_yaml_str(
    raw: &str,
    origin: &str,
    symbol: Option<&str>,
    is_shadow: bool,
) -> Result<SimConfig, ConfigError> {
    let parse_err = |source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    };
    let root: YamlRoot = serde_yaml::from_str(raw).map_err(parse_err)?;
    let mut merged = serde_yaml::to_value(SimConfig::default()).map_err(parse_err)?;

    if !root.global.is_null() {
        deep_merge(&mut merged, &root.global);
    }
    if let Some(sym) = symbol {
        if let serde_yaml::Value::Mapping(ref symbols_map) = root.symbols {
            let exact = serde_yaml::Value::String(sym.to_string());
            let upper = serde_yaml::Value::String(sym.to_uppercase());
            if let Some(overrides) = symbols_map.get(&exact).or_else(|| symbols_map.get(&upper)) {
                deep_merge(&mut merged, overrides);
            }
        }
    }
    if is_shadow && !root.shadow.is_null() {
        deep_merge(&mut merged, &root.shadow);
    }

    let mut cfg: SimConfig = serde_yaml::from_value(merged).map_err(parse_err)?;
    if let Some(sym) = symbol {
        cfg.symbol = sym.to_string();
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Load and validate a config file.
///
/// A missing file yields the (validated) defaults with a warning; unreadable,
/// malformed or invalid files are errors.
pub fn load_config(
    yaml_path: &Path,
    symbol: Option<&str>,
    is_shadow: bool,
) -> Result<SimConfig, ConfigError> {
    let path_str = yaml_path.display().to_string();
    let raw = match std::fs::read_to_string(yaml_path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path_str, "config file does not exist, using defaults");
            let mut cfg = SimConfig::default();
            if let Some(sym) = symbol {
                cfg.symbol = sym.to_string();
            }
            cfg.validate()?;
            return Ok(cfg);
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path_str,
                source,
            })
        }
    };
    let cfg = config_from_yaml_str(&raw, &path_str, symbol, is_shadow)?;
    tracing::info!(path = %path_str, symbol = %cfg.symbol, shadow = is_shadow, "config loaded");
    Ok(cfg)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use risk_core::KillSwitchMode;

    #[test]
    fn defaults_are_valid() {
        SimConfig::default().validate().unwrap();
    }

    #[test]
    fn deep_merge_keeps_untouched_keys() {
        let mut base = serde_yaml::from_str::<serde_yaml::Value>("a:\n  x: 1\n  y: 2").unwrap();
        let overlay = serde_yaml::from_str::<serde_yaml::Value>("a:\n  y: 9\nb: 3").unwrap();
        deep_merge(&mut base, &overlay);
        let expected =
            serde_yaml::from_str::<serde_yaml::Value>("a:\n  x: 1\n  y: 9\nb: 3").unwrap();
        assert_eq!(base, expected);
    }

    #[test]
    fn global_then_symbol_then_shadow() {
        let yaml = r#"
global:
  risk:
    max_drawdown: 0.15
    kill_switch_mode: halt_all
  guidance:
    aggressiveness: 0.2
symbols:
  ETH:
    guidance:
      aggressiveness: 0.9
shadow:
  control:
    max_slippage_bps: 10.0
"#;
        let cfg = config_from_yaml_str(yaml, "test", Some("eth"), false).unwrap();
        assert!((cfg.risk.max_drawdown - 0.15).abs() < f64::EPSILON);
        assert_eq!(cfg.risk.kill_switch_mode, KillSwitchMode::HaltAll);
        assert!((cfg.guidance.aggressiveness - 0.9).abs() < f64::EPSILON);
        assert!((cfg.control.max_slippage_bps - 30.0).abs() < f64::EPSILON);
        assert_eq!(cfg.symbol, "eth");
        // untouched keys keep defaults
        assert!((cfg.risk.leverage_cap - 1.5).abs() < f64::EPSILON);

        let shadow = config_from_yaml_str(yaml, "test", None, true).unwrap();
        assert!((shadow.guidance.aggressiveness - 0.2).abs() < f64::EPSILON);
        assert!((shadow.control.max_slippage_bps - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn negative_leverage_cap_fails_fast() {
        let yaml = "global:\n  risk:\n    leverage_cap: -1.0\n";
        let err = config_from_yaml_str(yaml, "test", None, false).unwrap_err();
        assert!(err.to_string().contains("risk.leverage_cap"), "{err}");
    }

    #[test]
    fn inverted_hysteresis_band_is_rejected() {
        let yaml = "global:\n  regime:\n    risk_on_exit_vol_pct: 0.5\n";
        let err = config_from_yaml_str(yaml, "test", None, false).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "regime.risk_on_exit_vol_pct"));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = config_from_yaml_str("global: [unclosed", "bad.yaml", None, false).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.yaml"), Some("SOL"), false).unwrap();
        assert_eq!(cfg.symbol, "SOL");
        assert_eq!(cfg.regime, RegimeConfig::default());
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carry.yaml");
        std::fs::write(&path, "global:\n  initial_nav: 5000.0\n").unwrap();
        let cfg = load_config(&path, None, false).unwrap();
        assert!((cfg.initial_nav - 5000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn band_pick_interpolates() {
        let band = AllocationBand::new(0.1, 0.3);
        assert!((band.pick(0.0) - 0.1).abs() < 1e-12);
        assert!((band.pick(0.5) - 0.2).abs() < 1e-12);
        assert!((band.pick(1.0) - 0.3).abs() < 1e-12);
    }
}
