use carry_core::candle::Bar;
use carry_core::config::{CompressionConfig, RegimeConfig, SimConfig};
use carry_core::engine::run_simulation;
use carry_core::reason_codes::ReasonCode;
use carry_core::regime::{Regime, RegimeReason};
use carry_core::report::{build_report, BuildReportInput};
use carry_core::venue::Leg;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use risk_core::{KillSwitchMode, RiskConfig};

mod common;

use common::{compressed_base, directional_cfg, HOUR_MS};

fn fast_cfg() -> SimConfig {
    SimConfig {
        initial_nav: 100_000.0,
        regime: RegimeConfig {
            long_ma_window: 20,
            rv_window: 10,
            vol_percentile_window: 50,
            confirm_bars: 2,
            ..RegimeConfig::default()
        },
        compression: CompressionConfig {
            atr_window: 5,
            contraction_lookback: 10,
            vol_pct_window: 20,
            range_window: 10,
            ..CompressionConfig::default()
        },
        ..SimConfig::default()
    }
}

fn flat_bars(n: usize, price: f64, funding: Option<f64>) -> Vec<Bar> {
    (0..n)
        .map(|i| Bar {
            funding,
            ..Bar::flat(i as i64 * HOUR_MS, price)
        })
        .collect()
}

#[test]
fn flat_market_stays_neutral_and_only_pays_costs() {
    let cfg = SimConfig::default();
    let out = run_simulation(&flat_bars(300, 50_000.0, None), &cfg).unwrap();

    assert!(out.records.iter().all(|r| r.regime == Regime::Neutral));
    assert!(out
        .records
        .iter()
        .flat_map(|r| &r.fills)
        .all(|f| f.leg != Leg::Directional));

    let fees: f64 = out.records.iter().map(|r| r.fees).sum();
    let slippage: f64 = out.records.iter().map(|r| r.slippage).sum();
    let settled: f64 = out.records.iter().map(|r| r.funding_settled).sum();
    assert!(fees > 0.0);
    assert_eq!(settled, 0.0);
    let expected = cfg.initial_nav - fees - slippage + settled;
    assert!(
        (out.final_nav() - expected).abs() < 1e-4,
        "final {} expected {expected}",
        out.final_nav()
    );
}

/// Compression, a steady breakout with the overlay on, a 25% fall over ten
/// bars (most of it in the first), then a second breakout.
fn crash_path() -> (Vec<Bar>, usize) {
    let mut path = compressed_base();
    path.grow(20, 1.005, 0.0005);
    let crash_bar = path.len();
    path.grow(1, 0.755, 0.0005);
    path.grow(9, (0.75f64 / 0.755).powf(1.0 / 9.0), 0.0005);
    path.grow(60, 1.005, 0.0005);
    (path.bars, crash_bar)
}

#[test]
fn drawdown_latches_carry_only_on_first_crossing_bar() {
    let (bars, crash_bar) = crash_path();
    for interval in [1, 7] {
        let mut cfg = directional_cfg();
        cfg.risk.max_drawdown = 0.20;
        cfg.risk.kill_switch_mode = KillSwitchMode::CarryOnly;
        cfg.control.rebalance_interval_bars = interval;
        let out = run_simulation(&bars, &cfg).unwrap();
        let (before, after) = out.records.split_at(crash_bar);

        // the overlay is really on going into the fall
        let last = before.last().unwrap();
        assert_eq!(last.regime, Regime::RiskOn, "interval {interval}");
        assert!(last.directional_frac > 0.8, "interval {interval}: {}", last.directional_frac);
        assert!(before.iter().all(|r| r.drawdown < 0.20 && !r.kill_switch_active));

        let latch = &after[0];
        assert!(latch.has_reason(ReasonCode::KillSwitchLatched), "interval {interval}");
        assert!(latch.drawdown >= 0.20);

        for r in after {
            assert!(r.kill_switch_active, "interval {interval} bar {}", r.bar_index);
            assert_eq!(r.approved.directional_frac, 0.0, "bar {}", r.bar_index);
            assert_eq!(r.directional_frac, 0.0, "interval {interval} bar {}", r.bar_index);
            assert!(r.carry_frac > 0.0, "bar {}", r.bar_index);
        }
        // the recovery breaks out again but the overlay stays off
        let blocked: Vec<_> = after
            .iter()
            .filter(|r| r.proposed.directional_frac > 0.0)
            .collect();
        assert!(!blocked.is_empty(), "interval {interval}");
        assert!(blocked.iter().all(|r| r.has_reason(ReasonCode::KillSwitchCarryOnly)));
        assert!(out.final_state.portfolio.spot_qty > 0.0);
    }
}

#[test]
fn halt_all_flattens_the_book_after_latch() {
    let cfg = SimConfig {
        risk: RiskConfig {
            max_drawdown: 0.10,
            kill_switch_mode: KillSwitchMode::HaltAll,
            ..RiskConfig::default()
        },
        ..fast_cfg()
    };
    let out = run_simulation(&flat_bars(60, 100.0, Some(-0.05)), &cfg).unwrap();

    let latch = out
        .records
        .iter()
        .position(|r| r.kill_switch_active)
        .expect("kill switch should latch");
    for r in &out.records[latch..] {
        assert!(r.approved.is_flat());
        assert_eq!(r.carry_frac, 0.0);
    }
    assert!(out.final_state.portfolio.is_flat());
}

#[test]
fn extreme_vol_spike_forces_risk_off_immediately() {
    let cfg = fast_cfg();
    let mut rng = StdRng::seed_from_u64(5);
    let mut price = 100.0;
    let mut bars: Vec<Bar> = (0..120)
        .map(|i| {
            let open = price;
            let ret: f64 = rng.gen_range(-0.003..0.003);
            price *= 1.0 + ret;
            Bar {
                t: i as i64 * HOUR_MS,
                o: open,
                h: open.max(price),
                l: open.min(price),
                c: price,
                v: 1.0,
                funding: Some(0.0001),
                open_interest: None,
            }
        })
        .collect();
    let open = price;
    let spike = price * 1.10;
    bars.push(Bar {
        t: 120 * HOUR_MS,
        o: open,
        h: spike,
        l: open,
        c: spike,
        v: 1.0,
        funding: Some(0.0001),
        open_interest: None,
    });

    let out = run_simulation(&bars, &cfg).unwrap();
    let last = out.records.last().unwrap();
    assert!(last.vol_pct.unwrap() >= cfg.regime.extreme_vol_pct);
    assert_eq!(last.regime, Regime::RiskOff);
    assert_eq!(last.regime_reason, Some(RegimeReason::ExtremeVolOverride));
    assert_eq!(last.approved.directional_frac, 0.0);
}

#[test]
fn positive_funding_shows_up_in_the_report() {
    let cfg = fast_cfg();
    let out = run_simulation(&flat_bars(100, 100.0, Some(0.0002)), &cfg).unwrap();
    let report = build_report(BuildReportInput::from_output(&out, &cfg)).unwrap();

    assert_eq!(report.bars, 100);
    assert!(report.total_funding_settled > 0.0);
    assert!(report.unsettled_funding > 0.0);
    assert_eq!(report.regime_bars.get(&Regime::Neutral), Some(&100));
    assert!(report.reason_counts.get(&ReasonCode::FundingSettlement).copied().unwrap_or(0) >= 12);
    assert_eq!(report.lifecycles.carry, 1);
    assert!(report.ledger.is_none());
}

#[test]
fn faulted_bars_are_counted_and_do_not_move_the_book() {
    let cfg = fast_cfg();
    let mut bars = flat_bars(30, 100.0, None);
    bars[10].h = 90.0;
    bars[20].c = f64::INFINITY;
    let out = run_simulation(&bars, &cfg).unwrap();

    assert_eq!(out.final_state.data_faults, 2);
    for i in [10, 20] {
        let r = &out.records[i];
        assert!(r.has_reason(ReasonCode::DataFault));
        assert!(r.fills.is_empty());
        assert_eq!(r.nav, out.records[i - 1].nav);
    }
}
