use std::time::Instant;

use carry_core::candle::{Bar, CandleData};
use rusqlite::{Connection, OpenFlags};

use crate::clean::{normalize_and_sort, parse_interval};
use crate::DataError;

/// Funding events keyed by symbol as sorted `(timestamp_ms, rate)`.
pub type FundingRateData = rustc_hash::FxHashMap<String, Vec<(i64, f64)>>;

/// Schema of the bar table read by this module. Funding and open interest are
/// optional per row.
pub const BARS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    t INTEGER NOT NULL,
    o REAL NOT NULL,
    h REAL NOT NULL,
    l REAL NOT NULL,
    c REAL NOT NULL,
    v REAL NOT NULL,
    funding REAL,
    open_interest REAL,
    PRIMARY KEY (symbol, interval, t)
);
CREATE TABLE IF NOT EXISTS funding_rates (
    symbol TEXT NOT NULL,
    time INTEGER NOT NULL,
    funding_rate REAL NOT NULL,
    PRIMARY KEY (symbol, time)
);
"#;

fn open_read_only(db_path: &str) -> Result<Connection, DataError> {
    Ok(Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?)
}

/// `(min_t, max_t)` of the bars stored for `interval`, or `None` when empty.
pub fn query_time_range(db_path: &str, interval: &str) -> Result<Option<(i64, i64)>, DataError> {
    parse_interval(interval)?;
    let conn = open_read_only(db_path)?;
    let mut stmt = conn.prepare("SELECT MIN(t), MAX(t) FROM bars WHERE interval = ?")?;
    let range = stmt.query_row([interval], |row| {
        let min_t: Option<i64> = row.get(0)?;
        let max_t: Option<i64> = row.get(1)?;
        Ok(min_t.zip(max_t))
    })?;
    Ok(range)
}

/// Load every bar row for `interval`, grouped by symbol and sorted by open time.
/// `from_ts` / `to_ts` (ms, inclusive) restrict the range.
pub fn load_bars_filtered(
    db_path: &str,
    interval: &str,
    from_ts: Option<i64>,
    to_ts: Option<i64>,
) -> Result<CandleData, DataError> {
    parse_interval(interval)?;
    let start = Instant::now();
    let conn = open_read_only(db_path)?;

    let query = "SELECT symbol, t, o, h, l, c, v, funding, open_interest \
                 FROM bars \
                 WHERE interval = ?1 AND (?2 IS NULL OR t >= ?2) AND (?3 IS NULL OR t <= ?3) \
                 ORDER BY symbol, t ASC";
    let mut stmt = conn.prepare(query)?;
    let rows = stmt.query_map(rusqlite::params![interval, from_ts, to_ts], |row| {
        Ok((
            row.get::<_, String>(0)?,
            Bar {
                t: row.get(1)?,
                o: row.get(2)?,
                h: row.get(3)?,
                l: row.get(4)?,
                c: row.get(5)?,
                v: row.get(6)?,
                funding: row.get(7)?,
                open_interest: row.get(8)?,
            },
        ))
    })?;

    let mut data = CandleData::default();
    let mut total: u64 = 0;
    for row in rows {
        let (symbol, bar) = row?;
        total += 1;
        data.entry(symbol).or_default().push(bar);
    }

    tracing::info!(
        symbols = data.len(),
        bars = total,
        elapsed_s = start.elapsed().as_secs_f64(),
        db = db_path,
        interval,
        "loaded bars"
    );
    Ok(data)
}

/// Like [`load_bars_filtered`] across several partitions. Overlapping bars are
/// deduped per symbol, the later partition winning.
pub fn load_bars_multi(
    db_paths: &[String],
    interval: &str,
    from_ts: Option<i64>,
    to_ts: Option<i64>,
) -> Result<CandleData, DataError> {
    let mut merged = CandleData::default();
    for p in db_paths {
        for (symbol, bars) in load_bars_filtered(p, interval, from_ts, to_ts)? {
            merged.entry(symbol).or_default().extend(bars);
        }
    }
    for bars in merged.values_mut() {
        let (clean, stats) = normalize_and_sort(std::mem::take(bars));
        if stats.deduped > 0 {
            tracing::debug!(deduped = stats.deduped, "overlapping partitions");
        }
        *bars = clean;
    }
    Ok(merged)
}

pub fn load_symbols(db_path: &str, interval: &str) -> Result<Vec<String>, DataError> {
    parse_interval(interval)?;
    let conn = open_read_only(db_path)?;
    let mut stmt =
        conn.prepare("SELECT DISTINCT symbol FROM bars WHERE interval = ? ORDER BY symbol")?;
    let symbols = stmt
        .query_map([interval], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(symbols)
}

/// Take one symbol's bars out of `data`.
pub fn take_symbol(data: &mut CandleData, symbol: &str) -> Result<Vec<Bar>, DataError> {
    data.remove(symbol).ok_or_else(|| {
        let mut available: Vec<String> = data.keys().cloned().collect();
        available.sort();
        DataError::SymbolNotFound {
            symbol: symbol.to_string(),
            available,
        }
    })
}

/// Load discrete funding events from the `funding_rates` table.
pub fn load_funding_rates(
    db_path: &str,
    from_ts: Option<i64>,
    to_ts: Option<i64>,
) -> Result<FundingRateData, DataError> {
    let conn = open_read_only(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT symbol, time, funding_rate FROM funding_rates \
         WHERE (?1 IS NULL OR time >= ?1) AND (?2 IS NULL OR time <= ?2) \
         ORDER BY symbol, time ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![from_ts, to_ts], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, f64>(2)?,
        ))
    })?;

    let mut data = FundingRateData::default();
    for row in rows {
        let (symbol, time, rate) = row?;
        data.entry(symbol).or_default().push((time, rate));
    }
    tracing::info!(symbols = data.len(), db = db_path, "loaded funding rates");
    Ok(data)
}

/// Overwrite each bar's funding with the sum of funding events falling inside
/// `[t, t + interval_ms)`. Bars with no event get zero. `rates` must be sorted.
pub fn attach_funding(bars: &mut [Bar], rates: &[(i64, f64)], interval_ms: i64) {
    let mut i = 0;
    for bar in bars.iter_mut() {
        while i < rates.len() && rates[i].0 < bar.t {
            i += 1;
        }
        let mut sum = 0.0;
        let mut j = i;
        while j < rates.len() && rates[j].0 < bar.t + interval_ms {
            sum += rates[j].1;
            j += 1;
        }
        bar.funding = Some(sum);
        i = j;
    }
}
