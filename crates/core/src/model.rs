use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::column_type::ColumnType;
use crate::ids::{CampaignId, ColumnId, DataSourceId, ParticipantId, UserId};
use crate::value::CellValue;

/// Name of the reserved timestamp column every data source owns.
pub const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner: UserId,
    pub name: String,
    pub start_ts: NaiveDateTime,
    pub end_ts: NaiveDateTime,
}

/// One typed field of a data source's schema.
///
/// Columns are immutable once created and referenced by id, so duplicate
/// names across different columns are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub name: String,
    pub column_type: ColumnType,
    pub is_categorical: bool,
    pub accept_values: Option<Vec<String>>,
}

impl Column {
    pub fn is_reserved(&self) -> bool {
        self.name == TIMESTAMP_COLUMN
    }

    /// Membership check against the constraint set, after casting each
    /// accepted literal through the column's type. Unconstrained columns
    /// accept every value of the right type.
    pub fn accepts(&self, value: &CellValue) -> bool {
        match &self.accept_values {
            None => true,
            Some(literals) => literals
                .iter()
                .filter_map(|literal| self.column_type.parse_literal(literal).ok())
                .any(|accepted| accepted == *value),
        }
    }
}

/// A named schema describing one kind of sensor/record stream.
///
/// `columns` is ordered: the reserved timestamp column first, then user
/// columns in their stored `column_order`. This order drives both generated
/// DDL and insert payload destructuring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: DataSourceId,
    pub name: String,
    pub columns: Vec<Column>,
}

impl DataSource {
    /// The user-defined columns, in canonical order.
    pub fn user_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_reserved())
    }

    pub fn column(&self, id: ColumnId) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub campaign_id: CampaignId,
    pub user_id: UserId,
    pub join_ts: NaiveDateTime,
    pub last_heartbeat_ts: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Supervisor {
    pub campaign_id: CampaignId,
    pub user_id: UserId,
}

/// One row read back from a dynamic data table. Not persisted as an object;
/// materialized from query results.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub data_source_id: DataSourceId,
    pub ts: NaiveDateTime,
    pub values: BTreeMap<ColumnId, CellValue>,
}
