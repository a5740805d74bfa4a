//! Summary metrics and JSON reporting for simulation results.
//!
//! Return statistics (CAGR, Sharpe, Sortino, win rate) come from the bar NAV
//! series; attribution (funding, directional, carry) comes from the per-bar
//! PnL split in the ledger. The ledger is fingerprinted with SHA-256 so two
//! runs can be compared byte for byte.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::SimConfig;
use crate::engine::{BarRecord, SimOutput};
use crate::position::{LegGroup, Lifecycle};
use crate::reason_codes::ReasonCode;
use crate::regime::Regime;

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 3_600_000.0;

// ---------------------------------------------------------------------------
// Report types (all Serialize for JSON output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub symbol: String,
    pub config_fingerprint: String,
    pub ledger_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    pub bars: u32,
    pub data_faults: u32,

    // Summary
    pub initial_nav: f64,
    pub final_nav: f64,
    pub total_pnl: f64,
    pub cagr: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown_usd: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    /// Mean gross leverage (gross notional / NAV).
    pub exposure_utilization: f64,
    /// Mean gross leverage relative to the effective leverage cap.
    pub cap_utilization: f64,

    // Attribution
    pub funding_contribution: f64,
    pub directional_contribution: f64,
    pub carry_contribution: f64,
    pub total_fees: f64,
    pub total_slippage: f64,
    pub total_funding_settled: f64,
    pub unsettled_funding: f64,

    // Breakdowns
    pub regime_returns: BTreeMap<Regime, f64>,
    pub regime_bars: BTreeMap<Regime, u32>,
    /// Number of bars on which each reason code appeared.
    pub reason_counts: BTreeMap<ReasonCode, u32>,
    pub lifecycles: LifecycleSummary,

    // Optional (large payloads, gated by flags)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<Vec<BarRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_list: Option<Vec<Lifecycle>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifecycleSummary {
    pub carry: u32,
    pub directional: u32,
    pub directional_wins: u32,
    pub directional_win_rate: f64,
    pub carry_net_pnl: f64,
    pub directional_net_pnl: f64,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Inputs for [`build_report`].
///
/// * `records`           : Bar ledger in order, faulted bars included.
/// * `lifecycles`        : Every lifecycle of the run, closed ones only.
/// * `include_ledger`    : Embed the full bar ledger in the report.
/// * `include_lifecycles`: Embed per-lifecycle detail in the report.
pub struct BuildReportInput<'a> {
    pub records: &'a [BarRecord],
    pub lifecycles: &'a [Lifecycle],
    pub cfg: &'a SimConfig,
    pub data_faults: u32,
    pub unsettled_funding: f64,
    pub include_ledger: bool,
    pub include_lifecycles: bool,
}

impl<'a> BuildReportInput<'a> {
    pub fn from_output(output: &'a SimOutput, cfg: &'a SimConfig) -> Self {
        Self {
            records: &output.records,
            lifecycles: &output.lifecycles,
            cfg,
            data_faults: output.final_state.data_faults,
            unsettled_funding: output.unsettled_funding,
            include_ledger: false,
            include_lifecycles: false,
        }
    }
}

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of the JSON-serialised ledger.
pub fn ledger_fingerprint(records: &[BarRecord]) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&serde_json::to_string(records)?))
}

fn iso_ms(t: i64) -> Option<String> {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(t).map(|d| d.to_rfc3339())
}

pub fn build_report(input: BuildReportInput<'_>) -> Result<SimReport, serde_json::Error> {
    let BuildReportInput {
        records,
        lifecycles,
        cfg,
        data_faults,
        unsettled_funding,
        include_ledger,
        include_lifecycles,
    } = input;

    let ledger_fingerprint = ledger_fingerprint(records)?;
    let config_fingerprint = sha256_hex(&serde_json::to_string(cfg)?);

    // ── Equity curve over accepted bars, anchored at the initial NAV ─────
    let accepted: Vec<&BarRecord> = records.iter().filter(|r| r.fault.is_none()).collect();
    let initial_nav = cfg.initial_nav;
    let mut curve: Vec<(i64, f64)> = Vec::with_capacity(accepted.len() + 1);
    if let Some(first) = accepted.first() {
        curve.push((first.t, initial_nav));
    }
    curve.extend(accepted.iter().map(|r| (r.t, r.nav)));
    let final_nav = accepted.last().map_or(initial_nav, |r| r.nav);
    let total_pnl = final_nav - initial_nav;

    let returns: Vec<f64> = curve
        .windows(2)
        .map(|w| if w[0].1.abs() > 1e-12 { w[1].1 / w[0].1 - 1.0 } else { 0.0 })
        .collect();
    let timestamps: Vec<i64> = accepted.iter().map(|r| r.t).collect();
    let ppy = periods_per_year(&timestamps);

    let cagr = match (accepted.first(), accepted.last()) {
        (Some(a), Some(b)) if b.t > a.t && initial_nav > 0.0 && final_nav > 0.0 => {
            let years = (b.t - a.t) as f64 / MS_PER_YEAR;
            (final_nav / initial_nav).powf(1.0 / years) - 1.0
        }
        _ => 0.0,
    };
    let (sharpe, sortino) = compute_sharpe_sortino(&returns, ppy);
    let (max_drawdown_usd, max_drawdown_pct) = compute_max_drawdown(&curve);
    let win_rate = if returns.is_empty() {
        0.0
    } else {
        returns.iter().filter(|&&r| r > 0.0).count() as f64 / returns.len() as f64
    };

    let exposure_utilization = if accepted.is_empty() {
        0.0
    } else {
        accepted
            .iter()
            .map(|r| if r.leverage.is_finite() { r.leverage } else { 0.0 })
            .sum::<f64>()
            / accepted.len() as f64
    };
    let cap = cfg.risk.effective_leverage_cap();
    let cap_utilization = if cap > 0.0 { exposure_utilization / cap } else { 0.0 };

    // ── Attribution ──────────────────────────────────────────────────────
    let total_funding_settled: f64 = records.iter().map(|r| r.funding_settled).sum();
    let directional: f64 = records
        .iter()
        .map(|r| r.perp_pnl.directional + r.funding_accrued.directional)
        .sum();
    let carry: f64 = records
        .iter()
        .map(|r| r.spot_pnl + r.perp_pnl.carry + r.funding_accrued.carry)
        .sum();
    let share = |x: f64| if total_pnl.abs() > 1e-12 { x / total_pnl } else { 0.0 };

    // ── Per-regime returns ───────────────────────────────────────────────
    let mut by_regime: BTreeMap<Regime, (f64, u32)> =
        Regime::ALL.iter().map(|&r| (r, (0.0, 0))).collect();
    for (rec, ret) in accepted.iter().zip(returns.iter()) {
        let slot = by_regime.entry(rec.regime).or_insert((0.0, 0));
        slot.0 += ret;
        slot.1 += 1;
    }
    let regime_returns = by_regime
        .iter()
        .map(|(&k, &(sum, n))| (k, if n > 0 { sum / n as f64 } else { 0.0 }))
        .collect();
    let regime_bars = by_regime.iter().map(|(&k, &(_, n))| (k, n)).collect();

    let mut reason_counts: BTreeMap<ReasonCode, u32> = BTreeMap::new();
    for rec in records {
        for &code in &rec.reasons {
            *reason_counts.entry(code).or_insert(0) += 1;
        }
    }

    Ok(SimReport {
        symbol: cfg.symbol.clone(),
        config_fingerprint,
        ledger_fingerprint,
        start: accepted.first().and_then(|r| iso_ms(r.t)),
        end: accepted.last().and_then(|r| iso_ms(r.t)),
        bars: records.len() as u32,
        data_faults,
        initial_nav,
        final_nav,
        total_pnl,
        cagr,
        sharpe,
        sortino,
        max_drawdown_usd,
        max_drawdown_pct,
        win_rate,
        exposure_utilization,
        cap_utilization,
        funding_contribution: share(total_funding_settled),
        directional_contribution: share(directional),
        carry_contribution: share(carry),
        total_fees: records.iter().map(|r| r.fees).sum(),
        total_slippage: records.iter().map(|r| r.slippage).sum(),
        total_funding_settled,
        unsettled_funding,
        regime_returns,
        regime_bars,
        reason_counts,
        lifecycles: summarize_lifecycles(lifecycles),
        ledger: include_ledger.then(|| records.to_vec()),
        lifecycle_list: include_lifecycles.then(|| lifecycles.to_vec()),
    })
}

// ---------------------------------------------------------------------------
// Return statistics
// ---------------------------------------------------------------------------

/// Bars per year from the median spacing of the timestamps.
fn periods_per_year(ts: &[i64]) -> f64 {
    if ts.len() < 3 {
        return 0.0;
    }
    let mut deltas: Vec<i64> = ts.windows(2).map(|w| w[1] - w[0]).collect();
    deltas.sort_unstable();
    let dt = deltas[deltas.len() / 2];
    if dt <= 0 {
        return 0.0;
    }
    MS_PER_YEAR / dt as f64
}

/// Annualised Sharpe and Sortino of per-bar returns. Sortino uses the
/// downside deviation (root mean square of negative returns over all bars).
fn compute_sharpe_sortino(returns: &[f64], periods_per_year: f64) -> (f64, f64) {
    if returns.is_empty() || periods_per_year <= 0.0 {
        return (0.0, 0.0);
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / n).sqrt();
    let ann = periods_per_year.sqrt();

    let sharpe = if std_dev < 1e-12 { 0.0 } else { mean / std_dev * ann };
    let sortino = if downside < 1e-12 { 0.0 } else { mean / downside * ann };
    (sharpe, sortino)
}

/// Maximum drawdown in USD and as a fraction of peak NAV.
fn compute_max_drawdown(equity_curve: &[(i64, f64)]) -> (f64, f64) {
    if equity_curve.is_empty() {
        return (0.0, 0.0);
    }

    let mut peak = equity_curve[0].1;
    let mut max_dd_usd: f64 = 0.0;
    let mut max_dd_pct: f64 = 0.0;

    for &(_ts, nav) in equity_curve {
        if nav > peak {
            peak = nav;
        }
        let dd = peak - nav;
        if dd > max_dd_usd {
            max_dd_usd = dd;
        }
        let dd_pct = if peak > 1e-12 { dd / peak } else { 0.0 };
        if dd_pct > max_dd_pct {
            max_dd_pct = dd_pct;
        }
    }

    (max_dd_usd, max_dd_pct)
}

fn summarize_lifecycles(lifecycles: &[Lifecycle]) -> LifecycleSummary {
    let mut out = LifecycleSummary::default();
    for lc in lifecycles {
        match lc.group {
            LegGroup::Carry => {
                out.carry += 1;
                out.carry_net_pnl += lc.net_pnl();
            }
            LegGroup::Directional => {
                out.directional += 1;
                out.directional_net_pnl += lc.net_pnl();
                if lc.net_pnl() > 0.0 {
                    out.directional_wins += 1;
                }
            }
        }
    }
    if out.directional > 0 {
        out.directional_win_rate = out.directional_wins as f64 / out.directional as f64;
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
