use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Deref;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension};
use tracing::debug;

use cohort_core::{
    to_naive_utc, CampaignId, CellValue, ColumnId, ColumnType, DataRecord, DataSource,
    DataSourceId, Participant, UserId, TIMESTAMP_COLUMN,
};

use crate::connections::{lock, Connections, SchemaConn, DATA_SCHEMA};
use crate::error::StorageError;

/// Matches the text produced by rusqlite's chrono `ToSql` impl, so literal
/// comparisons against stored timestamps stay lexicographic-consistent.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A dynamically created per-participant table in the `data` schema.
///
/// Both the raw and the aggregated table of a (participant, data source)
/// pair share the same shape; only the table name differs.
pub struct PhysicalTable {
    conn: SchemaConn,
    data_source: DataSource,
    name: String,
}

fn table_name(campaign: CampaignId, user: UserId, data_source: &DataSource) -> String {
    format!(
        "c{}u{}d{}",
        campaign.as_i64(),
        user.as_i64(),
        data_source.id.as_i64()
    )
}

fn cell_to_sql(value: &CellValue) -> SqlValue {
    match value {
        CellValue::Timestamp(ts) => SqlValue::Text(ts.format(TS_FORMAT).to_string()),
        CellValue::Text(s) => SqlValue::Text(s.clone()),
        CellValue::Integer(n) => SqlValue::Integer(*n),
        CellValue::Float(x) => SqlValue::Real(*x),
    }
}

fn cell_to_csv(value: &CellValue) -> String {
    match value {
        CellValue::Timestamp(ts) => ts.format(TS_FORMAT).to_string(),
        CellValue::Text(s) => s.clone(),
        CellValue::Integer(n) => n.to_string(),
        CellValue::Float(x) => x.to_string(),
    }
}

impl PhysicalTable {
    fn open(
        connections: &Connections,
        campaign: CampaignId,
        user: UserId,
        data_source: &DataSource,
        suffix: &str,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            conn: connections.get(DATA_SCHEMA)?,
            data_source: data_source.clone(),
            name: format!("{}{}", table_name(campaign, user, data_source), suffix),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", DATA_SCHEMA, self.name)
    }

    pub fn create_table(&self) -> Result<(), StorageError> {
        let mut columns = vec![
            "data_source_id INTEGER NOT NULL".to_string(),
            format!(
                "\"{}\" TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%f', 'now'))",
                TIMESTAMP_COLUMN
            ),
        ];
        for column in self.data_source.user_columns() {
            columns.push(format!(
                "\"{}\" {} NOT NULL",
                column.name,
                column.column_type.storage_type()
            ));
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({});
             CREATE INDEX IF NOT EXISTS \"{}\".\"{}_ts_idx\" ON \"{}\" (\"{}\");",
            self.qualified(),
            columns.join(", "),
            DATA_SCHEMA,
            self.name,
            self.name,
            TIMESTAMP_COLUMN
        );
        debug!(table = %self.name, "creating data table");
        let conn = lock(&self.conn)?;
        conn.execute_batch(&ddl)?;
        Ok(())
    }

    pub fn drop_table(&self) -> Result<(), StorageError> {
        debug!(table = %self.name, "dropping data table");
        let conn = lock(&self.conn)?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", self.qualified()))?;
        Ok(())
    }

    pub fn table_exists(&self) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let exists = conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM \"{}\".sqlite_master
                 WHERE type = 'table' AND name = ?1)",
                DATA_SCHEMA
            ),
            [&self.name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Validates `values` against the data source's column set and writes one
    /// row. With `commit = false` the write is left inside an open
    /// transaction; call [`PhysicalTable::commit`] after the last row of a
    /// batch.
    pub fn insert(
        &self,
        ts: DateTime<Utc>,
        values: &BTreeMap<ColumnId, CellValue>,
        commit: bool,
    ) -> Result<(), StorageError> {
        for key in values.keys() {
            if self.data_source.column(*key).is_none() {
                return Err(StorageError::validation(
                    format!("column id {key}"),
                    "not part of the data source",
                ));
            }
        }

        let mut names = vec![
            "data_source_id".to_string(),
            format!("\"{TIMESTAMP_COLUMN}\""),
        ];
        let mut sql_values = vec![
            SqlValue::Integer(self.data_source.id.as_i64()),
            SqlValue::Text(to_naive_utc(ts).format(TS_FORMAT).to_string()),
        ];
        for column in self.data_source.user_columns() {
            let value = values.get(&column.id).ok_or_else(|| {
                StorageError::validation(&column.name, "missing value")
            })?;
            if !column.column_type.verify(value) {
                return Err(StorageError::validation(
                    &column.name,
                    format!("expected a {} value", column.column_type.name()),
                ));
            }
            if !column.accepts(value) {
                return Err(StorageError::validation(
                    &column.name,
                    "value outside the accepted set",
                ));
            }
            names.push(format!("\"{}\"", column.name));
            sql_values.push(cell_to_sql(value));
        }

        let placeholders = (1..=names.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.qualified(),
            names.join(", "),
            placeholders
        );

        let conn = lock(&self.conn)?;
        if !commit && conn.is_autocommit() {
            conn.execute_batch("BEGIN")?;
        }
        conn.execute(&sql, params_from_iter(sql_values))?;
        if commit && !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Commits a batch left open by `insert(.., commit = false)`.
    pub fn commit(&self) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Discards a batch left open by `insert(.., commit = false)`.
    pub fn rollback(&self) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn select_columns(&self) -> String {
        let mut names = vec![
            "data_source_id".to_string(),
            format!("\"{TIMESTAMP_COLUMN}\""),
        ];
        for column in self.data_source.user_columns() {
            names.push(format!("\"{}\"", column.name));
        }
        names.join(", ")
    }

    fn read_record(&self, row: &rusqlite::Row) -> Result<DataRecord, rusqlite::Error> {
        let data_source_id = DataSourceId::from_i64(row.get(0)?);
        let ts: NaiveDateTime = row.get(1)?;
        let mut values = BTreeMap::new();
        for (idx, column) in self.data_source.user_columns().enumerate() {
            let value = match column.column_type {
                ColumnType::Timestamp => CellValue::Timestamp(row.get(idx + 2)?),
                ColumnType::Text => CellValue::Text(row.get(idx + 2)?),
                ColumnType::Integer => CellValue::Integer(row.get(idx + 2)?),
                ColumnType::Float => CellValue::Float(row.get(idx + 2)?),
            };
            values.insert(column.id, value);
        }
        Ok(DataRecord {
            data_source_id,
            ts,
            values,
        })
    }

    /// Row count in the half-open window `[from, till)`.
    pub fn select_count(
        &self,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE \"{TIMESTAMP_COLUMN}\" >= ?1 AND \"{TIMESTAMP_COLUMN}\" < ?2",
                self.qualified()
            ),
            rusqlite::params![to_naive_utc(from), to_naive_utc(till)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Records in the half-open window `[from, till)`, oldest first.
    pub fn select_range(
        &self,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    ) -> Result<Vec<DataRecord>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE \"{TIMESTAMP_COLUMN}\" >= ?1 AND \"{TIMESTAMP_COLUMN}\" < ?2
             ORDER BY \"{TIMESTAMP_COLUMN}\" ASC",
            self.select_columns(),
            self.qualified()
        ))?;
        let records = stmt
            .query_map(
                rusqlite::params![to_naive_utc(from), to_naive_utc(till)],
                |row| self.read_record(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Up to `k` records strictly after `from`, oldest first. Cursor-style
    /// pagination: pass the last record's timestamp to get the next page.
    pub fn select_next_k(
        &self,
        from: DateTime<Utc>,
        k: u64,
    ) -> Result<Vec<DataRecord>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE \"{TIMESTAMP_COLUMN}\" > ?1
             ORDER BY \"{TIMESTAMP_COLUMN}\" ASC LIMIT ?2",
            self.select_columns(),
            self.qualified()
        ))?;
        let records = stmt
            .query_map(
                rusqlite::params![to_naive_utc(from), k as i64],
                |row| self.read_record(row),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn select_first_ts(&self) -> Result<Option<NaiveDateTime>, StorageError> {
        self.boundary_ts("ASC")
    }

    pub fn select_last_ts(&self) -> Result<Option<NaiveDateTime>, StorageError> {
        self.boundary_ts("DESC")
    }

    fn boundary_ts(&self, direction: &str) -> Result<Option<NaiveDateTime>, StorageError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT \"{TIMESTAMP_COLUMN}\" FROM {} ORDER BY \"{TIMESTAMP_COLUMN}\" {direction} LIMIT 1",
                    self.qualified()
                ),
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Writes the whole table as CSV into the system temp directory and
    /// returns the file path.
    pub fn dump_to_file(&self) -> Result<PathBuf, StorageError> {
        let path = std::env::temp_dir().join(format!("{}.csv", self.name));
        let mut out = BufWriter::new(File::create(&path)?);

        let mut header = vec!["data_source_id".to_string(), TIMESTAMP_COLUMN.to_string()];
        header.extend(self.data_source.user_columns().map(|c| c.name.clone()));
        writeln!(out, "{}", header.join(","))?;

        let records = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} ORDER BY \"{TIMESTAMP_COLUMN}\" ASC",
                self.select_columns(),
                self.qualified()
            ))?;
            let records = stmt
                .query_map([], |row| self.read_record(row))?
                .collect::<Result<Vec<_>, _>>()?;
            records
        };
        for record in records {
            let mut fields = vec![
                record.data_source_id.as_i64().to_string(),
                record.ts.format(TS_FORMAT).to_string(),
            ];
            for column in self.data_source.user_columns() {
                match record.values.get(&column.id) {
                    Some(value) => fields.push(cell_to_csv(value)),
                    None => fields.push(String::new()),
                }
            }
            writeln!(out, "{}", fields.join(","))?;
        }
        out.flush()?;
        Ok(path)
    }
}

/// Raw record table of one (participant, data source) pair.
pub struct DataTable(PhysicalTable);

/// Hourly-aggregate sibling of [`DataTable`], same shape under a
/// `_aggregated` suffix.
pub struct AggDataTable(PhysicalTable);

impl DataTable {
    pub fn new(
        connections: &Connections,
        participant: &Participant,
        data_source: &DataSource,
    ) -> Result<Self, StorageError> {
        Self::for_user(
            connections,
            participant.campaign_id,
            participant.user_id,
            data_source,
        )
    }

    /// Id-based constructor for fan-out paths that have not loaded the
    /// participant row yet.
    pub fn for_user(
        connections: &Connections,
        campaign: CampaignId,
        user: UserId,
        data_source: &DataSource,
    ) -> Result<Self, StorageError> {
        Ok(Self(PhysicalTable::open(
            connections,
            campaign,
            user,
            data_source,
            "",
        )?))
    }
}

impl AggDataTable {
    pub fn new(
        connections: &Connections,
        participant: &Participant,
        data_source: &DataSource,
    ) -> Result<Self, StorageError> {
        Self::for_user(
            connections,
            participant.campaign_id,
            participant.user_id,
            data_source,
        )
    }

    pub fn for_user(
        connections: &Connections,
        campaign: CampaignId,
        user: UserId,
        data_source: &DataSource,
    ) -> Result<Self, StorageError> {
        Ok(Self(PhysicalTable::open(
            connections,
            campaign,
            user,
            data_source,
            "_aggregated",
        )?))
    }
}

impl Deref for DataTable {
    type Target = PhysicalTable;

    fn deref(&self) -> &PhysicalTable {
        &self.0
    }
}

impl Deref for AggDataTable {
    type Target = PhysicalTable;

    fn deref(&self) -> &PhysicalTable {
        &self.0
    }
}
