use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::CellValue;

/// The fixed set of supported column value types.
///
/// Both the column-creation validator and the insert-time validator go
/// through [`ColumnType::verify`], so a value accepted at schema definition
/// time is accepted at ingestion time and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Timestamp,
    Text,
    Integer,
    Float,
}

pub const ALL_COLUMN_TYPES: [ColumnType; 4] = [
    ColumnType::Timestamp,
    ColumnType::Text,
    ColumnType::Integer,
    ColumnType::Float,
];

impl ColumnType {
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        match name {
            "timestamp" => Ok(Self::Timestamp),
            "text" => Ok(Self::Text),
            "integer" => Ok(Self::Integer),
            "float" => Ok(Self::Float),
            other => Err(CoreError::InvalidColumnType(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
        }
    }

    /// SQL column type used when generating table DDL.
    pub fn storage_type(&self) -> &'static str {
        match self {
            Self::Timestamp => "TEXT",
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Float => "REAL",
        }
    }

    /// Checks that `value` carries this semantic type.
    pub fn verify(&self, value: &CellValue) -> bool {
        matches!(
            (self, value),
            (Self::Timestamp, CellValue::Timestamp(_))
                | (Self::Text, CellValue::Text(_))
                | (Self::Integer, CellValue::Integer(_))
                | (Self::Float, CellValue::Float(_))
        )
    }

    /// Casts a string literal (an `accept_values` entry) to this type.
    pub fn parse_literal(&self, literal: &str) -> Result<CellValue, CoreError> {
        match self {
            Self::Timestamp => NaiveDateTime::parse_from_str(literal, "%Y-%m-%dT%H:%M:%S%.f")
                .map(CellValue::Timestamp)
                .map_err(|_| {
                    CoreError::InvalidArgument(format!("invalid timestamp value: {literal}"))
                }),
            Self::Text => Ok(CellValue::Text(literal.to_string())),
            Self::Integer => literal
                .parse::<i64>()
                .map(CellValue::Integer)
                .map_err(|_| {
                    CoreError::InvalidArgument(format!("invalid integer value: {literal}"))
                }),
            Self::Float => literal
                .parse::<f64>()
                .map(CellValue::Float)
                .map_err(|_| CoreError::InvalidArgument(format!("invalid float value: {literal}"))),
        }
    }
}
