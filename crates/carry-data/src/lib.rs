//! Bar ingestion: SQLite loading plus the cleaning passes applied before a run.

pub mod clean;
pub mod sqlite_loader;

use std::fmt;

/// Failure while loading or cleaning bar data.
#[derive(Debug)]
pub enum DataError {
    Sqlite(rusqlite::Error),
    InvalidInterval(String),
    SymbolNotFound {
        symbol: String,
        available: Vec<String>,
    },
    /// Timestamps must strictly increase once sorted.
    NotIncreasing { prev_t: i64, t: i64 },
    /// Gap between two bars is not a whole number of intervals.
    Misaligned { prev_t: i64, t: i64, interval_ms: i64 },
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::Sqlite(e) => write!(f, "sqlite: {e}"),
            DataError::InvalidInterval(s) => write!(f, "invalid interval: {s:?}"),
            DataError::SymbolNotFound { symbol, available } => {
                write!(f, "symbol {symbol:?} not found, available: {available:?}")
            }
            DataError::NotIncreasing { prev_t, t } => {
                write!(f, "timestamp {t} does not follow {prev_t}")
            }
            DataError::Misaligned {
                prev_t,
                t,
                interval_ms,
            } => write!(
                f,
                "gap {prev_t}..{t} is not a multiple of the {interval_ms} ms interval"
            ),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DataError {
    fn from(e: rusqlite::Error) -> Self {
        DataError::Sqlite(e)
    }
}
