use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use cohort_core::{floor_hour, to_naive_utc, Column, ColumnId, DataSource, ParticipantId};

use crate::connections::{lock, Connections, SchemaConn, CORE_SCHEMA};
use crate::error::StorageError;

/// Histogram key used for non-categorical columns, whose "histogram" is a
/// single cumulative row count.
pub const AMOUNT_KEY: &str = "amount";

/// Per-column counts for one snapshot hour. Categorical columns carry one
/// key per accepted value, everything else a single [`AMOUNT_KEY`] entry.
pub type Histogram = BTreeMap<String, i64>;

/// Snapshot payload of one `hourly_stats` row, keyed by column id.
pub type Amount = BTreeMap<ColumnId, Histogram>;

/// Cumulative hourly snapshots of per-participant data volume.
///
/// Rows are cumulative counters, not per-hour deltas. An hour with no
/// snapshot row inherits the latest earlier snapshot (forward fill).
pub struct HourlyStatsStore {
    conn: SchemaConn,
}

fn amount_to_json(amount: &Amount) -> Result<String, StorageError> {
    let keyed: BTreeMap<String, &Histogram> = amount
        .iter()
        .map(|(id, hist)| (id.as_i64().to_string(), hist))
        .collect();
    serde_json::to_string(&keyed).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn amount_from_json(raw: &str) -> Result<Amount, StorageError> {
    let keyed: BTreeMap<String, Histogram> =
        serde_json::from_str(raw).map_err(|e| StorageError::Serialization(e.to_string()))?;
    keyed
        .into_iter()
        .map(|(key, hist)| {
            let id = key
                .parse::<i64>()
                .map_err(|_| StorageError::Serialization(format!("bad column key {key:?}")))?;
            Ok((ColumnId::from_i64(id), hist))
        })
        .collect()
}

/// One zeroed histogram per non-reserved column of the data source.
fn zero_seeded(data_source: &DataSource) -> Vec<(Column, Histogram)> {
    data_source
        .user_columns()
        .map(|column| {
            let mut hist = Histogram::new();
            match (&column.accept_values, column.is_categorical) {
                (Some(values), true) => {
                    for value in values {
                        hist.insert(value.clone(), 0);
                    }
                }
                _ => {
                    hist.insert(AMOUNT_KEY.to_string(), 0);
                }
            }
            (column.clone(), hist)
        })
        .collect()
}

/// Overlays a stored snapshot onto the zero-seeded shape. Column ids no
/// longer attached to the data source are skipped.
fn merge(data_source: &DataSource, amount: &Amount) -> Vec<(Column, Histogram)> {
    let mut stats = zero_seeded(data_source);
    for (column, hist) in &mut stats {
        if let Some(stored) = amount.get(&column.id) {
            for (key, count) in stored {
                hist.insert(key.clone(), *count);
            }
        }
    }
    stats
}

fn total(amount: &Amount) -> i64 {
    amount.values().flat_map(Histogram::values).sum()
}

impl HourlyStatsStore {
    pub fn new(connections: &Connections) -> Result<Self, StorageError> {
        Ok(Self {
            conn: connections.get(CORE_SCHEMA)?,
        })
    }

    /// Upserts the snapshot for the hour containing `ts`. Every `amount`
    /// key must name a column of `data_source`; last writer wins.
    pub fn create_hourly_stats(
        &self,
        participant: ParticipantId,
        data_source: &DataSource,
        ts: DateTime<Utc>,
        amount: &Amount,
    ) -> Result<(), StorageError> {
        for id in amount.keys() {
            if data_source.column(*id).is_none() {
                return Err(StorageError::validation(
                    format!("column id {id}"),
                    "not part of the data source",
                ));
            }
        }
        let hour = floor_hour(to_naive_utc(ts));
        let payload = amount_to_json(amount)?;
        debug!(
            participant = participant.as_i64(),
            data_source = data_source.id.as_i64(),
            %hour,
            "writing hourly snapshot"
        );
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO hourly_stats (participant_id, data_source_id, ts, amount)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (participant_id, data_source_id, ts)
             DO UPDATE SET amount = excluded.amount",
            params![
                participant.as_i64(),
                data_source.id.as_i64(),
                hour,
                payload
            ],
        )?;
        Ok(())
    }

    /// Latest snapshot at or before `hour`, if any.
    fn snapshot_at(
        &self,
        participant: ParticipantId,
        data_source: &DataSource,
        hour: NaiveDateTime,
    ) -> Result<Option<Amount>, StorageError> {
        let raw: Option<String> = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT amount FROM hourly_stats
                 WHERE participant_id = ?1 AND data_source_id = ?2 AND ts <= ?3
                 ORDER BY ts DESC LIMIT 1",
                params![participant.as_i64(), data_source.id.as_i64(), hour],
                |row| row.get(0),
            )
            .optional()?
        };
        raw.map(|raw| amount_from_json(&raw)).transpose()
    }

    /// Snapshot histograms for the hour containing `hour_ts`. Hours without
    /// their own row forward-fill from the latest earlier snapshot; with no
    /// earlier snapshot at all the zero-seeded shape is returned.
    pub fn get_hourly_amount_of_data(
        &self,
        participant: ParticipantId,
        data_source: &DataSource,
        hour_ts: DateTime<Utc>,
    ) -> Result<Vec<(Column, Histogram)>, StorageError> {
        let hour = floor_hour(to_naive_utc(hour_ts));
        match self.snapshot_at(participant, data_source, hour)? {
            Some(amount) => Ok(merge(data_source, &amount)),
            None => Ok(zero_seeded(data_source)),
        }
    }

    /// The most recent snapshot regardless of hour, with its hour timestamp.
    pub fn get_latest_hourly_amount(
        &self,
        participant: ParticipantId,
        data_source: &DataSource,
    ) -> Result<Option<(NaiveDateTime, Vec<(Column, Histogram)>)>, StorageError> {
        let row: Option<(NaiveDateTime, String)> = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT ts, amount FROM hourly_stats
                 WHERE participant_id = ?1 AND data_source_id = ?2
                 ORDER BY ts DESC LIMIT 1",
                params![participant.as_i64(), data_source.id.as_i64()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };
        match row {
            None => Ok(None),
            Some((ts, raw)) => {
                let amount = amount_from_json(&raw)?;
                Ok(Some((ts, merge(data_source, &amount))))
            }
        }
    }

    /// Rows collected inside `(from, till]`, derived as the difference of
    /// the cumulative snapshots anchored at each end. Returns 0 when either
    /// anchor has no snapshot.
    pub fn get_filtered_amount_of_data(
        &self,
        participant: ParticipantId,
        data_source: &DataSource,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let from_hour = floor_hour(to_naive_utc(from));
        let till_hour = floor_hour(to_naive_utc(till));
        let start = self.snapshot_at(participant, data_source, from_hour)?;
        let end = self.snapshot_at(participant, data_source, till_hour)?;
        match (start, end) {
            (Some(start), Some(end)) => Ok(total(&end) - total(&start)),
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::{ColumnType, DataSourceId, TIMESTAMP_COLUMN};

    fn data_source() -> DataSource {
        DataSource {
            id: DataSourceId::from_i64(1),
            name: "app_usage".into(),
            columns: vec![
                Column {
                    id: ColumnId::from_i64(1),
                    name: TIMESTAMP_COLUMN.into(),
                    column_type: ColumnType::Timestamp,
                    is_categorical: false,
                    accept_values: None,
                },
                Column {
                    id: ColumnId::from_i64(2),
                    name: "package".into(),
                    column_type: ColumnType::Text,
                    is_categorical: true,
                    accept_values: Some(vec!["maps".into(), "mail".into()]),
                },
                Column {
                    id: ColumnId::from_i64(3),
                    name: "duration_ms".into(),
                    column_type: ColumnType::Integer,
                    is_categorical: false,
                    accept_values: None,
                },
            ],
        }
    }

    #[test]
    fn amount_json_round_trips_through_string_keys() {
        let mut amount = Amount::new();
        amount.insert(
            ColumnId::from_i64(2),
            BTreeMap::from([("maps".to_string(), 4), ("mail".to_string(), 1)]),
        );
        amount.insert(
            ColumnId::from_i64(3),
            BTreeMap::from([(AMOUNT_KEY.to_string(), 5)]),
        );
        let raw = amount_to_json(&amount).unwrap();
        assert_eq!(amount_from_json(&raw).unwrap(), amount);
    }

    #[test]
    fn zero_seed_uses_accept_values_for_categorical_columns() {
        let stats = zero_seeded(&data_source());
        assert_eq!(stats.len(), 2);
        assert_eq!(
            stats[0].1,
            BTreeMap::from([("maps".to_string(), 0), ("mail".to_string(), 0)])
        );
        assert_eq!(stats[1].1, BTreeMap::from([(AMOUNT_KEY.to_string(), 0)]));
    }

    #[test]
    fn merge_skips_stale_column_ids() {
        let mut amount = Amount::new();
        amount.insert(
            ColumnId::from_i64(3),
            BTreeMap::from([(AMOUNT_KEY.to_string(), 9)]),
        );
        amount.insert(
            ColumnId::from_i64(99),
            BTreeMap::from([(AMOUNT_KEY.to_string(), 7)]),
        );
        let stats = merge(&data_source(), &amount);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].1[AMOUNT_KEY], 9);
        assert!(stats.iter().all(|(c, _)| c.id != ColumnId::from_i64(99)));
    }
}
