use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A single typed value of a data record cell.
///
/// Timestamps are tz-naive UTC; normalization happens at the API boundary
/// (see [`crate::time::to_naive_utc`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CellValue {
    Timestamp(NaiveDateTime),
    Text(String),
    Integer(i64),
    Float(f64),
}

impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            _ => false,
        }
    }
}

impl Eq for CellValue {}

impl CellValue {
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            CellValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            CellValue::Float(x) => Some(*x),
            _ => None,
        }
    }
}
