//! CLI entry point for the carry backtester.
//!
//! Subcommands:
//!   - `replay`       : Run a backtest over historical bars and emit a JSON report
//!   - `shadow`       : Drive the control loop against a paper venue, one JSON line per bar
//!   - `dump-features`: Dump features and regime decisions as CSV for debugging
//!   - `symbols`      : List the symbols and time range stored in the bar databases

use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use carry_core::candle::Bar;
use carry_core::config::{load_config, SimConfig};
use carry_core::engine::run_simulation;
use carry_core::regime;
use carry_core::report::{build_report, BuildReportInput, SimReport};
use carry_core::shadow::run_shadow;
use carry_data::clean::{
    count_missing_intervals, fill_missing_intervals, normalize_and_sort, parse_interval,
};
use carry_data::sqlite_loader::{
    attach_funding, load_bars_multi, load_funding_rates, load_symbols, query_time_range,
    take_symbol,
};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_SHA: &str = env!("CARRY_GIT_SHA");

// ---------------------------------------------------------------------------
// CLI argument structs
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "carry-backtester",
    version = VERSION,
    about = "Regime-gated spot+perp carry backtester and shadow runner",
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest
    Replay(ReplayArgs),
    /// Replay bars through the paper venue and log every decision
    Shadow(ShadowArgs),
    /// Dump features and regime decisions for debugging
    DumpFeatures(DumpArgs),
    /// List symbols and the stored time range per database
    Symbols(SymbolsArgs),
}

/// Where bars come from and how they are cleaned.
#[derive(Args)]
struct DataArgs {
    /// Path to the YAML config (defaults are used when the file is missing)
    #[arg(long, default_value = "carry.yaml")]
    config: PathBuf,

    /// Path to a SQLite bar database. Repeat for partitions; later ones win
    /// on overlapping bars.
    #[arg(long, default_value = "bars.db")]
    db: Vec<String>,

    /// Bar interval stored in the database (e.g. "1h", "15m")
    #[arg(long, default_value = "1h")]
    interval: String,

    /// Symbol to run
    #[arg(long, default_value = "BTC")]
    symbol: String,

    /// Start timestamp in milliseconds (inclusive)
    #[arg(long)]
    from_ts: Option<i64>,

    /// End timestamp in milliseconds (inclusive)
    #[arg(long)]
    to_ts: Option<i64>,

    /// Insert flat synthetic bars for missing intervals
    #[arg(long, default_value_t = false)]
    fill_gaps: bool,

    /// Path to a SQLite database with a `funding_rates` table. Its events
    /// replace the per-bar funding column.
    #[arg(long)]
    funding_db: Option<String>,
}

#[derive(Parser)]
struct ReplayArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Override the starting NAV from the config
    #[arg(long)]
    initial_nav: Option<f64>,

    /// Write the JSON report to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Include the full bar ledger in the report
    #[arg(long, default_value_t = false)]
    ledger: bool,

    /// Include every position lifecycle in the report
    #[arg(long, default_value_t = false)]
    lifecycles: bool,
}

#[derive(Parser)]
struct ShadowArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Write the JSONL log to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Parser)]
struct SymbolsArgs {
    /// Path to a SQLite bar database (repeatable)
    #[arg(long, default_value = "bars.db")]
    db: Vec<String>,

    /// Bar interval stored in the database
    #[arg(long, default_value = "1h")]
    interval: String,
}

#[derive(Parser)]
struct DumpArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Write CSV to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Shared loading
// ---------------------------------------------------------------------------

fn load_bars(args: &DataArgs) -> anyhow::Result<Vec<Bar>> {
    let interval_ms = parse_interval(&args.interval)?;
    let mut data = load_bars_multi(&args.db, &args.interval, args.from_ts, args.to_ts)
        .with_context(|| format!("loading bars from {}", args.db.join(", ")))?;
    let raw = take_symbol(&mut data, &args.symbol)?;

    let (mut bars, stats) = normalize_and_sort(raw);
    if stats.deduped > 0 || !stats.was_sorted {
        tracing::warn!(deduped = stats.deduped, sorted = stats.was_sorted, "bars needed normalising");
    }

    // Out-of-order rows cannot survive normalisation; a misaligned series
    // still runs, it just cannot be gap-counted.
    match count_missing_intervals(&bars, interval_ms) {
        Ok(0) => {}
        Ok(missing) if args.fill_gaps => {
            let (filled, stats) = fill_missing_intervals(&bars, interval_ms)?;
            tracing::info!(missing, filled = stats.filled, "filled missing intervals");
            bars = filled;
        }
        Ok(missing) => tracing::warn!(missing, "series has missing intervals"),
        Err(e) => tracing::warn!(error = %e, "could not count missing intervals"),
    }

    // After gap filling, so events inside a missing interval land on its
    // synthetic bar.
    if let Some(funding_db) = &args.funding_db {
        let rates = load_funding_rates(funding_db, args.from_ts, args.to_ts)
            .with_context(|| format!("loading funding from {funding_db}"))?;
        match rates.get(&args.symbol) {
            Some(events) => attach_funding(&mut bars, events, interval_ms),
            None => tracing::warn!(symbol = %args.symbol, "no funding events for symbol"),
        }
    }

    if bars.is_empty() {
        bail!("no bars for {} at interval {}", args.symbol, args.interval);
    }
    tracing::info!(symbol = %args.symbol, bars = bars.len(), "bars ready");
    Ok(bars)
}

fn load_cfg(args: &DataArgs, is_shadow: bool) -> anyhow::Result<SimConfig> {
    let cfg = load_config(&args.config, Some(&args.symbol), is_shadow)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    Ok(cfg)
}

fn open_output(path: Option<&PathBuf>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(p).with_context(|| format!("creating {}", p.display()))?,
        )),
        None => Box::new(std::io::BufWriter::new(std::io::stdout().lock())),
    })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_replay(args: ReplayArgs) -> anyhow::Result<()> {
    let mut cfg = load_cfg(&args.data, false)?;
    if let Some(nav) = args.initial_nav {
        cfg.initial_nav = nav;
    }
    let bars = load_bars(&args.data)?;
    if bars.len() <= cfg.warmup_bars() {
        tracing::warn!(
            bars = bars.len(),
            warmup = cfg.warmup_bars(),
            "series shorter than warmup, the regime will stay NEUTRAL"
        );
    }

    let start = Instant::now();
    let output = run_simulation(&bars, &cfg)?;
    let report = build_report(BuildReportInput {
        include_ledger: args.ledger,
        include_lifecycles: args.lifecycles,
        ..BuildReportInput::from_output(&output, &cfg)
    })?;
    tracing::info!(elapsed_s = start.elapsed().as_secs_f64(), "replay finished");

    let mut out = open_output(args.output.as_ref())?;
    serde_json::to_writer_pretty(&mut out, &report)?;
    writeln!(out)?;
    out.flush()?;

    print_summary(&report);
    Ok(())
}

fn cmd_shadow(args: ShadowArgs) -> anyhow::Result<()> {
    let cfg = load_cfg(&args.data, true)?;
    let bars = load_bars(&args.data)?;
    let run = run_shadow(&bars, &cfg)?;

    let mut out = open_output(args.output.as_ref())?;
    for entry in &run.entries {
        serde_json::to_writer(&mut out, entry)?;
        writeln!(out)?;
    }
    out.flush()?;

    let skipped = run.entries.iter().filter(|e| e.skipped).count();
    let p = &run.final_position;
    eprintln!(
        "[shadow] {} bars, {} skipped; final nav {:.2}, spot {:.6}, carry perp {:.6}, directional perp {:.6}",
        run.entries.len(),
        skipped,
        p.nav,
        p.spot_qty,
        p.carry_perp_qty,
        p.dir_perp_qty,
    );
    Ok(())
}

fn opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.8}")).unwrap_or_default()
}

fn cmd_dump_features(args: DumpArgs) -> anyhow::Result<()> {
    let cfg = load_cfg(&args.data, false)?;
    let bars = load_bars(&args.data)?;
    let rows = regime::replay(&bars, &cfg.regime, &cfg.compression);

    let mut out = open_output(args.output.as_ref())?;
    writeln!(
        out,
        "bar_index,t,close,log_return,realized_vol,vol_pct,moving_average,trend,funding,\
         compression_score,range_width,expansion,regime,candidate,reason"
    )?;
    for (snap, decision) in &rows {
        writeln!(
            out,
            "{},{},{:.8},{},{},{},{},{},{},{},{},{},{},{},{}",
            snap.bar_index,
            snap.t,
            snap.close,
            opt(snap.log_return),
            opt(snap.realized_vol),
            opt(snap.vol_pct),
            opt(snap.moving_average),
            snap.trend,
            opt(snap.funding),
            opt(snap.compression_score),
            opt(snap.range_width),
            snap.expansion as u8,
            decision.regime,
            decision.candidate,
            serde_json::to_value(decision.reason)?.as_str().unwrap_or_default(),
        )?;
    }
    out.flush()?;
    eprintln!("[dump-features] {} rows", rows.len());
    Ok(())
}

fn cmd_symbols(args: SymbolsArgs) -> anyhow::Result<()> {
    let mut symbols = std::collections::BTreeSet::new();
    let mut range: Option<(i64, i64)> = None;
    for db in &args.db {
        symbols.extend(
            load_symbols(db, &args.interval).with_context(|| format!("listing symbols in {db}"))?,
        );
        if let Some((lo, hi)) = query_time_range(db, &args.interval)? {
            range = Some(range.map_or((lo, hi), |(a, b)| (a.min(lo), b.max(hi))));
        }
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for sym in &symbols {
        writeln!(out, "{sym}")?;
    }
    match range {
        Some((lo, hi)) => eprintln!(
            "[symbols] {} symbols at {}, t {}..={}",
            symbols.len(),
            args.interval,
            lo,
            hi
        ),
        None => eprintln!("[symbols] no bars at {}", args.interval),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Summary printer
// ---------------------------------------------------------------------------

fn print_summary(r: &SimReport) {
    eprintln!("\n=== Carry Backtest Summary ({}) ===\n", r.symbol);
    eprintln!("Bars:               {} ({} data faults)", r.bars, r.data_faults);
    eprintln!("Initial NAV:        ${:.2}", r.initial_nav);
    eprintln!("Final NAV:          ${:.2}", r.final_nav);
    eprintln!(
        "Total PnL:          ${:.2} ({:+.2}%)",
        r.total_pnl,
        r.total_pnl / r.initial_nav * 100.0
    );
    eprintln!("CAGR:               {:+.2}%", r.cagr * 100.0);
    eprintln!("Sharpe / Sortino:   {:.3} / {:.3}", r.sharpe, r.sortino);
    eprintln!(
        "Max Drawdown:       ${:.2} ({:.2}%)",
        r.max_drawdown_usd,
        r.max_drawdown_pct * 100.0
    );
    eprintln!("Win Rate:           {:.1}%", r.win_rate * 100.0);
    eprintln!("Mean Leverage:      {:.3}x", r.exposure_utilization);
    eprintln!("Funding Settled:    ${:.2}", r.total_funding_settled);
    eprintln!("Fees / Slippage:    ${:.2} / ${:.2}", r.total_fees, r.total_slippage);
    eprintln!(
        "Contribution:       funding {:.1}%, directional {:.1}%",
        r.funding_contribution * 100.0,
        r.directional_contribution * 100.0
    );

    if !r.regime_bars.is_empty() {
        eprintln!("\n--- By Regime ---");
        for (regime, bars) in &r.regime_bars {
            let mean = r.regime_returns.get(regime).copied().unwrap_or(0.0);
            eprintln!("  {:>9}: {:>6} bars, mean return {:+.4}%", regime, bars, mean * 100.0);
        }
    }
    if !r.reason_counts.is_empty() {
        eprintln!("\n--- Reason Codes (bars) ---");
        for (code, n) in &r.reason_counts {
            eprintln!("  {:>22}: {}", format!("{code:?}"), n);
        }
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    tracing::info!(version = VERSION, git = GIT_SHA, "carry-backtester");

    let result = match cli.command {
        Commands::Replay(args) => cmd_replay(args),
        Commands::Shadow(args) => cmd_shadow(args),
        Commands::DumpFeatures(args) => cmd_dump_features(args),
        Commands::Symbols(args) => cmd_symbols(args),
    };

    if let Err(e) = result {
        eprintln!("\n[error] {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carry_data::sqlite_loader::BARS_SCHEMA;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn replay_flags_parse() {
        let cli = Cli::try_parse_from([
            "carry-backtester",
            "replay",
            "--symbol",
            "ETH",
            "--interval",
            "15m",
            "--ledger",
        ])
        .unwrap();
        match cli.command {
            Commands::Replay(args) => {
                assert_eq!(args.data.symbol, "ETH");
                assert_eq!(args.data.interval, "15m");
                assert!(args.ledger);
                assert!(!args.lifecycles);
            }
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn db_flag_repeats_for_partitions() {
        let cli = Cli::try_parse_from([
            "carry-backtester",
            "symbols",
            "--db",
            "a.db",
            "--db",
            "b.db",
        ])
        .unwrap();
        match cli.command {
            Commands::Symbols(args) => assert_eq!(args.db, vec!["a.db", "b.db"]),
            _ => panic!("expected symbols"),
        }
    }

    #[test]
    fn load_bars_fills_gaps_and_attaches_funding() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bars.db");
        {
            let conn = rusqlite::Connection::open(&db).unwrap();
            conn.execute_batch(BARS_SCHEMA).unwrap();
            for t in [0i64, 3_600_000, 3 * 3_600_000] {
                conn.execute(
                    "INSERT INTO bars (symbol, interval, t, o, h, l, c, v) \
                     VALUES ('BTC', '1h', ?1, 100.0, 100.0, 100.0, 100.0, 1.0)",
                    [t],
                )
                .unwrap();
            }
            for (time, rate) in [(3_600_000i64, 0.0002), (2 * 3_600_000 + 60_000, 0.0003)] {
                conn.execute(
                    "INSERT INTO funding_rates (symbol, time, funding_rate) VALUES ('BTC', ?1, ?2)",
                    rusqlite::params![time, rate],
                )
                .unwrap();
            }
        }
        let db = db.to_string_lossy().to_string();
        let args = DataArgs {
            config: dir.path().join("missing.yaml"),
            db: vec![db.clone()],
            interval: "1h".to_string(),
            symbol: "BTC".to_string(),
            from_ts: None,
            to_ts: None,
            fill_gaps: true,
            funding_db: Some(db),
        };
        let bars = load_bars(&args).unwrap();
        assert_eq!(bars.len(), 4);
        assert_eq!(bars[1].funding, Some(0.0002));
        // synthetic bar keeps the event that fell inside the gap
        assert_eq!(bars[2].v, 0.0);
        assert_eq!(bars[2].funding, Some(0.0003));
        assert_eq!(bars[3].funding, Some(0.0));

        let cfg = load_cfg(&args, false).unwrap();
        assert_eq!(cfg.symbol, "BTC");
        let out = run_simulation(&bars, &cfg).unwrap();
        assert_eq!(out.records.len(), 4);
    }
}
