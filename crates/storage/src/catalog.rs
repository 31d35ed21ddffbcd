use chrono::NaiveDateTime;
use rusqlite::{params, OptionalExtension, Row};

use cohort_core::{
    Campaign, CampaignId, Column, ColumnId, ColumnType, DataSource, DataSourceId, Participant,
    ParticipantId, Supervisor, User, UserId,
};

use crate::connections::{lock, Connections, SchemaConn, CORE_SCHEMA};
use crate::error::StorageError;

/// Read/write access to the fixed catalog tables in the `core` schema.
pub struct Catalog {
    conn: SchemaConn,
}

fn read_user(row: &Row) -> Result<User, rusqlite::Error> {
    Ok(User {
        id: UserId::from_i64(row.get(0)?),
        email: row.get(1)?,
        name: row.get(2)?,
        session_key: row.get(3)?,
    })
}

fn read_campaign(row: &Row) -> Result<Campaign, rusqlite::Error> {
    Ok(Campaign {
        id: CampaignId::from_i64(row.get(0)?),
        owner: UserId::from_i64(row.get(1)?),
        name: row.get(2)?,
        start_ts: row.get(3)?,
        end_ts: row.get(4)?,
    })
}

fn read_participant(row: &Row) -> Result<Participant, rusqlite::Error> {
    Ok(Participant {
        id: ParticipantId::from_i64(row.get(0)?),
        campaign_id: CampaignId::from_i64(row.get(1)?),
        user_id: UserId::from_i64(row.get(2)?),
        join_ts: row.get(3)?,
        last_heartbeat_ts: row.get(4)?,
    })
}

/// Raw column row; the type tag is parsed outside the query closure.
type ColumnRow = (i64, String, String, bool, Option<String>);

fn read_column_row(row: &Row) -> Result<ColumnRow, rusqlite::Error> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn column_from_row(raw: ColumnRow) -> Result<Column, StorageError> {
    let (id, name, type_name, is_categorical, accept_values) = raw;
    Ok(Column {
        id: ColumnId::from_i64(id),
        name,
        column_type: ColumnType::parse(&type_name)?,
        is_categorical,
        accept_values: accept_values
            .map(|joined| joined.split(',').map(str::to_string).collect()),
    })
}

impl Catalog {
    pub fn new(connections: &Connections) -> Result<Self, StorageError> {
        Ok(Self {
            conn: connections.get(CORE_SCHEMA)?,
        })
    }

    // --- users ---

    pub fn create_user(
        &self,
        email: &str,
        name: &str,
        session_key: Option<&str>,
    ) -> Result<User, StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO \"user\" (email, name, session_key) VALUES (?1, ?2, ?3)",
            params![email, name, session_key],
        )?;
        let id = conn.last_insert_rowid();
        Ok(User {
            id: UserId::from_i64(id),
            email: email.to_string(),
            name: name.to_string(),
            session_key: session_key.map(str::to_string),
        })
    }

    pub fn find_user_by_id(&self, id: UserId) -> Result<Option<User>, StorageError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT id, email, name, session_key FROM \"user\" WHERE id = ?1",
                params![id.as_i64()],
                read_user,
            )
            .optional()?)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT id, email, name, session_key FROM \"user\" WHERE email = ?1",
                params![email],
                read_user,
            )
            .optional()?)
    }

    pub fn set_user_session_key(
        &self,
        user: UserId,
        session_key: &str,
    ) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE \"user\" SET session_key = ?1 WHERE id = ?2",
            params![session_key, user.as_i64()],
        )?;
        Ok(())
    }

    // --- campaigns ---

    pub fn insert_campaign(
        &self,
        owner: UserId,
        name: &str,
        start_ts: NaiveDateTime,
        end_ts: NaiveDateTime,
    ) -> Result<Campaign, StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO campaign (owner_id, name, start_ts, end_ts) VALUES (?1, ?2, ?3, ?4)",
            params![owner.as_i64(), name, start_ts, end_ts],
        )?;
        Ok(Campaign {
            id: CampaignId::from_i64(conn.last_insert_rowid()),
            owner,
            name: name.to_string(),
            start_ts,
            end_ts,
        })
    }

    pub fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StorageError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT id, owner_id, name, start_ts, end_ts FROM campaign WHERE id = ?1",
                params![id.as_i64()],
                read_campaign,
            )
            .optional()?)
    }

    pub fn get_all_campaigns(&self) -> Result<Vec<Campaign>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt =
            conn.prepare("SELECT id, owner_id, name, start_ts, end_ts FROM campaign ORDER BY id")?;
        let campaigns = stmt
            .query_map([], read_campaign)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(campaigns)
    }

    pub fn update_campaign(
        &self,
        id: CampaignId,
        name: &str,
        start_ts: NaiveDateTime,
        end_ts: NaiveDateTime,
    ) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE campaign SET name = ?1, start_ts = ?2, end_ts = ?3 WHERE id = ?4",
            params![name, start_ts, end_ts, id.as_i64()],
        )?;
        Ok(())
    }

    pub fn delete_campaign(&self, id: CampaignId) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM campaign WHERE id = ?1", params![id.as_i64()])?;
        Ok(())
    }

    // --- supervisors ---

    pub fn add_supervisor(
        &self,
        campaign: CampaignId,
        user: UserId,
    ) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO supervisor (campaign_id, user_id) VALUES (?1, ?2)",
            params![campaign.as_i64(), user.as_i64()],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_supervisor(
        &self,
        campaign: CampaignId,
        user: UserId,
    ) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "DELETE FROM supervisor WHERE campaign_id = ?1 AND user_id = ?2",
            params![campaign.as_i64(), user.as_i64()],
        )?;
        Ok(())
    }

    pub fn is_supervisor(&self, campaign: CampaignId, user: UserId) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM supervisor WHERE campaign_id = ?1 AND user_id = ?2)",
            params![campaign.as_i64(), user.as_i64()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_campaign_supervisors(
        &self,
        campaign: CampaignId,
    ) -> Result<Vec<Supervisor>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT campaign_id, user_id FROM supervisor WHERE campaign_id = ?1")?;
        let supervisors = stmt
            .query_map(params![campaign.as_i64()], |row| {
                Ok(Supervisor {
                    campaign_id: CampaignId::from_i64(row.get(0)?),
                    user_id: UserId::from_i64(row.get(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(supervisors)
    }

    pub fn get_supervisor_campaigns(&self, user: UserId) -> Result<Vec<Campaign>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.owner_id, c.name, c.start_ts, c.end_ts
             FROM campaign c JOIN supervisor s ON s.campaign_id = c.id
             WHERE s.user_id = ?1 ORDER BY c.id",
        )?;
        let campaigns = stmt
            .query_map(params![user.as_i64()], read_campaign)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(campaigns)
    }

    // --- participants ---

    pub fn insert_participant(
        &self,
        campaign: CampaignId,
        user: UserId,
        now: NaiveDateTime,
    ) -> Result<Participant, StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO participant (campaign_id, user_id, join_ts, last_heartbeat_ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![campaign.as_i64(), user.as_i64(), now, now],
        )?;
        Ok(Participant {
            id: ParticipantId::from_i64(conn.last_insert_rowid()),
            campaign_id: campaign,
            user_id: user,
            join_ts: now,
            last_heartbeat_ts: now,
        })
    }

    pub fn is_participant(&self, campaign: CampaignId, user: UserId) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM participant WHERE campaign_id = ?1 AND user_id = ?2)",
            params![campaign.as_i64(), user.as_i64()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn get_participant(
        &self,
        campaign: CampaignId,
        user: UserId,
    ) -> Result<Option<Participant>, StorageError> {
        let conn = lock(&self.conn)?;
        Ok(conn
            .query_row(
                "SELECT id, campaign_id, user_id, join_ts, last_heartbeat_ts
                 FROM participant WHERE campaign_id = ?1 AND user_id = ?2",
                params![campaign.as_i64(), user.as_i64()],
                read_participant,
            )
            .optional()?)
    }

    pub fn get_campaign_participants(
        &self,
        campaign: CampaignId,
    ) -> Result<Vec<Participant>, StorageError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, campaign_id, user_id, join_ts, last_heartbeat_ts
             FROM participant WHERE campaign_id = ?1 ORDER BY id",
        )?;
        let participants = stmt
            .query_map(params![campaign.as_i64()], read_participant)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(participants)
    }

    pub fn participant_count(&self, campaign: CampaignId) -> Result<u64, StorageError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM participant WHERE campaign_id = ?1",
            params![campaign.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn update_heartbeat(
        &self,
        participant: ParticipantId,
        ts: NaiveDateTime,
    ) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE participant SET last_heartbeat_ts = ?1 WHERE id = ?2",
            params![ts, participant.as_i64()],
        )?;
        Ok(())
    }

    // --- data sources ---

    pub fn insert_data_source(&self, name: &str) -> Result<DataSourceId, StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute("INSERT INTO data_source (name) VALUES (?1)", params![name])?;
        Ok(DataSourceId::from_i64(conn.last_insert_rowid()))
    }

    pub fn find_data_source_by_id(
        &self,
        id: DataSourceId,
    ) -> Result<Option<DataSource>, StorageError> {
        let header = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT id, name FROM data_source WHERE id = ?1",
                params![id.as_i64()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
        };
        self.populate_data_source(header)
    }

    pub fn find_data_source_by_name(
        &self,
        name: &str,
    ) -> Result<Option<DataSource>, StorageError> {
        let header = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT id, name FROM data_source WHERE name = ?1",
                params![name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
        };
        self.populate_data_source(header)
    }

    fn populate_data_source(
        &self,
        header: Option<(i64, String)>,
    ) -> Result<Option<DataSource>, StorageError> {
        match header {
            None => Ok(None),
            Some((id, name)) => {
                let id = DataSourceId::from_i64(id);
                Ok(Some(DataSource {
                    id,
                    name,
                    columns: self.get_data_source_columns(id)?,
                }))
            }
        }
    }

    pub fn get_all_data_sources(&self) -> Result<Vec<DataSource>, StorageError> {
        let headers = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn.prepare("SELECT id, name FROM data_source ORDER BY id")?;
            let headers = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            headers
        };
        headers
            .into_iter()
            .map(|header| self.populate_data_source(Some(header)))
            .filter_map(Result::transpose)
            .collect()
    }

    pub fn is_campaign_data_source(
        &self,
        campaign: CampaignId,
        data_source: DataSourceId,
    ) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let exists = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM campaign_data_source
             WHERE campaign_id = ?1 AND data_source_id = ?2)",
            params![campaign.as_i64(), data_source.as_i64()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn add_campaign_data_source(
        &self,
        campaign: CampaignId,
        data_source: DataSourceId,
    ) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO campaign_data_source (campaign_id, data_source_id)
             VALUES (?1, ?2)",
            params![campaign.as_i64(), data_source.as_i64()],
        )?;
        Ok(changed > 0)
    }

    pub fn remove_campaign_data_source(
        &self,
        campaign: CampaignId,
        data_source: DataSourceId,
    ) -> Result<bool, StorageError> {
        let conn = lock(&self.conn)?;
        let changed = conn.execute(
            "DELETE FROM campaign_data_source WHERE campaign_id = ?1 AND data_source_id = ?2",
            params![campaign.as_i64(), data_source.as_i64()],
        )?;
        Ok(changed > 0)
    }

    pub fn get_campaign_data_sources(
        &self,
        campaign: CampaignId,
    ) -> Result<Vec<DataSource>, StorageError> {
        let headers = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn.prepare(
                "SELECT d.id, d.name
                 FROM data_source d
                 JOIN campaign_data_source cd ON cd.data_source_id = d.id
                 WHERE cd.campaign_id = ?1 ORDER BY d.id",
            )?;
            let headers = stmt
                .query_map(params![campaign.as_i64()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            headers
        };
        headers
            .into_iter()
            .map(|header| self.populate_data_source(Some(header)))
            .filter_map(Result::transpose)
            .collect()
    }

    // --- columns ---

    pub fn insert_column(
        &self,
        name: &str,
        column_type: ColumnType,
        is_categorical: bool,
        accept_values: Option<&[String]>,
    ) -> Result<Column, StorageError> {
        let joined = accept_values.map(|values| values.join(","));
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO \"column\" (name, column_type, is_categorical, accept_values)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, column_type.name(), is_categorical, joined],
        )?;
        Ok(Column {
            id: ColumnId::from_i64(conn.last_insert_rowid()),
            name: name.to_string(),
            column_type,
            is_categorical,
            accept_values: accept_values.map(<[String]>::to_vec),
        })
    }

    pub fn get_column(&self, id: ColumnId) -> Result<Option<Column>, StorageError> {
        let raw = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT id, name, column_type, is_categorical, accept_values
                 FROM \"column\" WHERE id = ?1",
                params![id.as_i64()],
                read_column_row,
            )
            .optional()?
        };
        raw.map(column_from_row).transpose()
    }

    /// Binds a column to a data source at a fixed position. `column_order`
    /// is the canonical ordering used by DDL generation and insert payload
    /// destructuring.
    pub fn link_column(
        &self,
        data_source: DataSourceId,
        column: ColumnId,
        column_order: i64,
    ) -> Result<(), StorageError> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO data_source_column (data_source_id, column_id, column_order)
             VALUES (?1, ?2, ?3)",
            params![data_source.as_i64(), column.as_i64(), column_order],
        )?;
        Ok(())
    }

    pub fn get_data_source_columns(
        &self,
        data_source: DataSourceId,
    ) -> Result<Vec<Column>, StorageError> {
        let raw = {
            let conn = lock(&self.conn)?;
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.column_type, c.is_categorical, c.accept_values
                 FROM \"column\" c
                 JOIN data_source_column dc ON dc.column_id = c.id
                 WHERE dc.data_source_id = ?1
                 ORDER BY dc.column_order ASC",
            )?;
            let raw = stmt
                .query_map(params![data_source.as_i64()], read_column_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raw
        };
        raw.into_iter().map(column_from_row).collect()
    }
}
