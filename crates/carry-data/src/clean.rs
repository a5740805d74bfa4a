//! Cleaning passes applied to raw bars before simulation.

use carry_core::candle::Bar;
use serde::Serialize;

use crate::DataError;

/// What a cleaning pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanStats {
    pub deduped: usize,
    /// Input was already in ascending time order.
    pub was_sorted: bool,
    pub filled: usize,
}

/// Parse an interval such as `"15m"`, `"1h"` or `"1d"` into milliseconds.
pub fn parse_interval(s: &str) -> Result<i64, DataError> {
    let bad = || DataError::InvalidInterval(s.to_string());
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(bad)?;
    let (num, unit) = s.split_at(split);
    let n: i64 = num.parse().map_err(|_| bad())?;
    if n <= 0 {
        return Err(bad());
    }
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        _ => return Err(bad()),
    };
    n.checked_mul(unit_ms).ok_or_else(bad)
}

/// Sort ascending by open time and drop duplicate timestamps, keeping the
/// last occurrence of each.
pub fn normalize_and_sort(bars: Vec<Bar>) -> (Vec<Bar>, CleanStats) {
    let was_sorted = bars.windows(2).all(|w| w[0].t <= w[1].t);
    let mut bars = bars;
    // Stable: equal timestamps keep input order, so the last one wins below.
    bars.sort_by_key(|b| b.t);

    let mut out: Vec<Bar> = Vec::with_capacity(bars.len());
    let mut deduped = 0;
    for bar in bars {
        match out.last_mut() {
            Some(last) if last.t == bar.t => {
                *last = bar;
                deduped += 1;
            }
            _ => out.push(bar),
        }
    }
    (
        out,
        CleanStats {
            deduped,
            was_sorted,
            filled: 0,
        },
    )
}

/// Insert synthetic bars for every missing interval.
///
/// A synthetic bar sits at the previous close on all four prices with zero
/// volume; funding and open interest are zero when the series carries them.
pub fn fill_missing_intervals(
    bars: &[Bar],
    interval_ms: i64,
) -> Result<(Vec<Bar>, CleanStats), DataError> {
    if interval_ms <= 0 {
        return Err(DataError::InvalidInterval(format!("{interval_ms}ms")));
    }
    let Some(first) = bars.first() else {
        let stats = CleanStats {
            was_sorted: true,
            ..CleanStats::default()
        };
        return Ok((Vec::new(), stats));
    };

    let mut out = Vec::with_capacity(bars.len());
    out.push(*first);
    let (mut prev_t, mut prev_c) = (first.t, first.c);
    let mut filled = 0;
    for bar in &bars[1..] {
        let mut expected = prev_t + interval_ms;
        while expected < bar.t {
            out.push(Bar {
                t: expected,
                o: prev_c,
                h: prev_c,
                l: prev_c,
                c: prev_c,
                v: 0.0,
                funding: bar.funding.map(|_| 0.0),
                open_interest: bar.open_interest.map(|_| 0.0),
            });
            filled += 1;
            expected += interval_ms;
        }
        out.push(*bar);
        (prev_t, prev_c) = (bar.t, bar.c);
    }
    Ok((
        out,
        CleanStats {
            deduped: 0,
            was_sorted: true,
            filled,
        },
    ))
}

/// Number of bars missing between the first and last timestamp.
pub fn count_missing_intervals(bars: &[Bar], interval_ms: i64) -> Result<u64, DataError> {
    if interval_ms <= 0 {
        return Err(DataError::InvalidInterval(format!("{interval_ms}ms")));
    }
    let mut missing = 0u64;
    for w in bars.windows(2) {
        let (prev_t, t) = (w[0].t, w[1].t);
        if t <= prev_t {
            return Err(DataError::NotIncreasing { prev_t, t });
        }
        let delta = t - prev_t;
        if delta % interval_ms != 0 {
            return Err(DataError::Misaligned {
                prev_t,
                t,
                interval_ms,
            });
        }
        missing += (delta / interval_ms - 1) as u64;
    }
    Ok(missing)
}
