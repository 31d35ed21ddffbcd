//! Write operations and selectors tying the catalog, the dynamic data
//! tables, and the hourly snapshot store together. Everything a deployment
//! touches goes through [`Services`]; the storage crate stays a set of
//! narrow single-purpose wrappers.

pub mod error;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use cohort_core::{
    to_naive_utc, Campaign, CampaignId, CellValue, Column, ColumnId, ColumnType, DataRecord,
    DataSource, DataSourceId, Participant, ParticipantId, Supervisor, User, UserId,
    TIMESTAMP_COLUMN,
};
use cohort_storage::{
    AggDataTable, Catalog, Connections, DataTable, Histogram, HourlyStatsStore,
};

pub use error::ServiceError;

/// Column names end up interpolated into generated DDL and insert
/// statements, so they are restricted to plain identifiers.
fn valid_column_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One ingestion payload of the batched record path.
#[derive(Debug, Clone)]
pub struct RecordPayload {
    pub data_source_id: DataSourceId,
    pub ts: DateTime<Utc>,
    pub values: BTreeMap<ColumnId, CellValue>,
}

pub struct Services {
    connections: Arc<Connections>,
    catalog: Catalog,
    hourly: HourlyStatsStore,
}

impl Services {
    pub fn new(connections: Arc<Connections>) -> Result<Self, ServiceError> {
        let catalog = Catalog::new(&connections)?;
        let hourly = HourlyStatsStore::new(&connections)?;
        Ok(Self {
            connections,
            catalog,
            hourly,
        })
    }

    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }

    // --- users ---

    /// Idempotent by email: returns the existing user on collision.
    pub fn create_user(&self, email: &str, name: &str) -> Result<User, ServiceError> {
        if email.trim().is_empty() {
            return Err(ServiceError::invalid("email must not be empty"));
        }
        if let Some(user) = self.catalog.find_user_by_email(email)? {
            return Ok(user);
        }
        info!(email, "creating user");
        Ok(self.catalog.create_user(email, name, None)?)
    }

    pub fn set_user_session_key(
        &self,
        user: UserId,
        session_key: &str,
    ) -> Result<(), ServiceError> {
        self.require_user(user)?;
        Ok(self.catalog.set_user_session_key(user, session_key)?)
    }

    pub fn find_user(&self, email: &str) -> Result<Option<User>, ServiceError> {
        Ok(self.catalog.find_user_by_email(email)?)
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>, ServiceError> {
        Ok(self.catalog.find_user_by_id(id)?)
    }

    fn require_user(&self, id: UserId) -> Result<User, ServiceError> {
        self.catalog
            .find_user_by_id(id)?
            .ok_or_else(|| ServiceError::invalid(format!("unknown user {id}")))
    }

    fn require_campaign(&self, id: CampaignId) -> Result<Campaign, ServiceError> {
        self.catalog
            .get_campaign(id)?
            .ok_or_else(|| ServiceError::invalid(format!("unknown campaign {id}")))
    }

    fn require_data_source(&self, id: DataSourceId) -> Result<DataSource, ServiceError> {
        self.catalog
            .find_data_source_by_id(id)?
            .ok_or_else(|| ServiceError::invalid(format!("unknown data source {id}")))
    }

    // --- campaigns ---

    fn validate_campaign_window(
        start_ts: NaiveDateTime,
        end_ts: NaiveDateTime,
        check_start: bool,
    ) -> Result<(), ServiceError> {
        if check_start && start_ts.date() < Utc::now().date_naive() {
            return Err(ServiceError::invalid("campaign must not start in the past"));
        }
        if end_ts <= start_ts {
            return Err(ServiceError::invalid("campaign must end after it starts"));
        }
        if end_ts - start_ts < Duration::days(1) {
            return Err(ServiceError::invalid(
                "campaign must run for at least one day",
            ));
        }
        Ok(())
    }

    /// Creates a campaign, makes the owner its first supervisor, and binds
    /// the initial data sources with full table fan-out.
    pub fn create_campaign(
        &self,
        owner: UserId,
        name: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        data_sources: &[DataSourceId],
    ) -> Result<Campaign, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::invalid("campaign name must not be empty"));
        }
        self.require_user(owner)?;
        let start_ts = to_naive_utc(start_ts);
        let end_ts = to_naive_utc(end_ts);
        Self::validate_campaign_window(start_ts, end_ts, true)?;

        let campaign = self.catalog.insert_campaign(owner, name, start_ts, end_ts)?;
        self.catalog.add_supervisor(campaign.id, owner)?;
        for &data_source in data_sources {
            self.add_campaign_data_source(campaign.id, data_source)?;
        }
        info!(campaign = campaign.id.as_i64(), name, "created campaign");
        Ok(campaign)
    }

    /// Supervisor-only edit. The data source set is diffed against the
    /// current bindings; additions fan out tables, removals unbind without
    /// dropping tables.
    pub fn update_campaign(
        &self,
        campaign: CampaignId,
        actor: UserId,
        name: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        data_sources: &[DataSourceId],
    ) -> Result<(), ServiceError> {
        if !self.catalog.is_supervisor(campaign, actor)? {
            return Err(ServiceError::invalid(
                "only a supervisor may update a campaign",
            ));
        }
        if name.trim().is_empty() {
            return Err(ServiceError::invalid("campaign name must not be empty"));
        }
        let start_ts = to_naive_utc(start_ts);
        let end_ts = to_naive_utc(end_ts);
        Self::validate_campaign_window(start_ts, end_ts, false)?;
        self.catalog.update_campaign(campaign, name, start_ts, end_ts)?;

        let current: BTreeSet<DataSourceId> = self
            .catalog
            .get_campaign_data_sources(campaign)?
            .into_iter()
            .map(|ds| ds.id)
            .collect();
        let wanted: BTreeSet<DataSourceId> = data_sources.iter().copied().collect();
        for &added in wanted.difference(&current) {
            self.add_campaign_data_source(campaign, added)?;
        }
        for &removed in current.difference(&wanted) {
            self.remove_campaign_data_source(campaign, removed)?;
        }
        Ok(())
    }

    /// Owner-only. Catalog rows cascade; dynamic tables are retained, same
    /// policy as unbinding a data source.
    pub fn delete_campaign(
        &self,
        campaign: CampaignId,
        actor: UserId,
    ) -> Result<(), ServiceError> {
        let row = self.require_campaign(campaign)?;
        if row.owner != actor {
            return Err(ServiceError::invalid(
                "only the owner may delete a campaign",
            ));
        }
        info!(campaign = campaign.as_i64(), "deleting campaign");
        Ok(self.catalog.delete_campaign(campaign)?)
    }

    pub fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, ServiceError> {
        Ok(self.catalog.get_campaign(id)?)
    }

    pub fn get_all_campaigns(&self) -> Result<Vec<Campaign>, ServiceError> {
        Ok(self.catalog.get_all_campaigns()?)
    }

    pub fn get_supervisor_campaigns(&self, user: UserId) -> Result<Vec<Campaign>, ServiceError> {
        Ok(self.catalog.get_supervisor_campaigns(user)?)
    }

    // --- supervisors ---

    pub fn add_supervisor_to_campaign(
        &self,
        campaign: CampaignId,
        user: UserId,
    ) -> Result<bool, ServiceError> {
        self.require_campaign(campaign)?;
        self.require_user(user)?;
        Ok(self.catalog.add_supervisor(campaign, user)?)
    }

    /// The owner cannot be removed.
    pub fn remove_supervisor_from_campaign(
        &self,
        campaign: CampaignId,
        user: UserId,
    ) -> Result<(), ServiceError> {
        let row = self.require_campaign(campaign)?;
        if row.owner == user {
            return Err(ServiceError::invalid(
                "the campaign owner cannot be removed from supervisors",
            ));
        }
        Ok(self.catalog.remove_supervisor(campaign, user)?)
    }

    pub fn is_supervisor(&self, campaign: CampaignId, user: UserId) -> Result<bool, ServiceError> {
        Ok(self.catalog.is_supervisor(campaign, user)?)
    }

    pub fn get_supervisor(
        &self,
        campaign: CampaignId,
        user: UserId,
    ) -> Result<Option<Supervisor>, ServiceError> {
        Ok(self.catalog.is_supervisor(campaign, user)?.then_some(Supervisor {
            campaign_id: campaign,
            user_id: user,
        }))
    }

    pub fn get_campaign_supervisors(
        &self,
        campaign: CampaignId,
    ) -> Result<Vec<Supervisor>, ServiceError> {
        Ok(self.catalog.get_campaign_supervisors(campaign)?)
    }

    // --- participants ---

    /// Idempotent join. Raw and aggregated tables for every currently bound
    /// data source are created before the participant row becomes visible,
    /// so the insert path never sees a participant without tables.
    pub fn add_campaign_participant(
        &self,
        campaign: CampaignId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        self.require_campaign(campaign)?;
        self.require_user(user)?;
        if self.catalog.is_participant(campaign, user)? {
            return Ok(false);
        }
        for data_source in self.catalog.get_campaign_data_sources(campaign)? {
            DataTable::for_user(&self.connections, campaign, user, &data_source)?
                .create_table()?;
            AggDataTable::for_user(&self.connections, campaign, user, &data_source)?
                .create_table()?;
        }
        self.catalog.insert_participant(campaign, user, to_naive_utc(now))?;
        info!(
            campaign = campaign.as_i64(),
            user = user.as_i64(),
            "participant joined"
        );
        Ok(true)
    }

    pub fn is_participant(&self, campaign: CampaignId, user: UserId) -> Result<bool, ServiceError> {
        Ok(self.catalog.is_participant(campaign, user)?)
    }

    pub fn get_participant(
        &self,
        campaign: CampaignId,
        user: UserId,
    ) -> Result<Option<Participant>, ServiceError> {
        Ok(self.catalog.get_participant(campaign, user)?)
    }

    pub fn get_campaign_participants(
        &self,
        campaign: CampaignId,
    ) -> Result<Vec<Participant>, ServiceError> {
        Ok(self.catalog.get_campaign_participants(campaign)?)
    }

    pub fn get_campaign_participants_count(
        &self,
        campaign: CampaignId,
    ) -> Result<u64, ServiceError> {
        Ok(self.catalog.participant_count(campaign)?)
    }

    pub fn update_participant_heartbeat(
        &self,
        campaign: CampaignId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let participant = self
            .catalog
            .get_participant(campaign, user)?
            .ok_or_else(|| ServiceError::invalid("unknown participant"))?;
        Ok(self
            .catalog
            .update_heartbeat(participant.id, to_naive_utc(now))?)
    }

    // --- schema model ---

    /// Creates an immutable column definition. `accept_values` is a
    /// comma-separated list; entries are trimmed and must be non-empty,
    /// unique, and parseable as `column_type`.
    pub fn create_column(
        &self,
        name: &str,
        column_type: &str,
        is_categorical: bool,
        accept_values: Option<&str>,
    ) -> Result<Column, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::invalid("column name must not be empty"));
        }
        if !valid_column_name(name) {
            return Err(ServiceError::invalid(format!(
                "column name {name:?} is not a valid identifier"
            )));
        }
        if name == TIMESTAMP_COLUMN {
            return Err(ServiceError::invalid(format!(
                "{TIMESTAMP_COLUMN:?} is a reserved column name"
            )));
        }
        let column_type = ColumnType::parse(column_type)?;
        if column_type == ColumnType::Text && !is_categorical {
            return Err(ServiceError::invalid(
                "text columns must be categorical",
            ));
        }
        let accept_values = accept_values
            .map(|raw| Self::parse_accept_values(raw, column_type))
            .transpose()?;
        Ok(self.catalog.insert_column(
            name,
            column_type,
            is_categorical,
            accept_values.as_deref(),
        )?)
    }

    fn parse_accept_values(
        raw: &str,
        column_type: ColumnType,
    ) -> Result<Vec<String>, ServiceError> {
        let mut seen = BTreeSet::new();
        let mut values = Vec::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                return Err(ServiceError::invalid("accept_values entry is empty"));
            }
            if !seen.insert(entry.to_string()) {
                return Err(ServiceError::invalid(format!(
                    "duplicate accept_values entry {entry:?}"
                )));
            }
            column_type.parse_literal(entry).map_err(|_| {
                ServiceError::invalid(format!(
                    "accept_values entry {entry:?} is not a {} value",
                    column_type.name()
                ))
            })?;
            values.push(entry.to_string());
        }
        if values.is_empty() {
            return Err(ServiceError::invalid("accept_values must not be empty"));
        }
        Ok(values)
    }

    /// Idempotent by name. On first creation the reserved timestamp column
    /// is injected at position zero and any caller column literally named
    /// `timestamp` is skipped.
    pub fn create_data_source(
        &self,
        name: &str,
        columns: &[ColumnId],
    ) -> Result<DataSource, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::invalid("data source name must not be empty"));
        }
        if columns.is_empty() {
            return Err(ServiceError::invalid(
                "a data source needs at least one column",
            ));
        }
        if let Some(existing) = self.catalog.find_data_source_by_name(name)? {
            debug!(name, "data source already exists");
            return Ok(existing);
        }

        let resolved = columns
            .iter()
            .map(|&id| {
                self.catalog
                    .get_column(id)?
                    .ok_or_else(|| ServiceError::invalid(format!("unknown column {id}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        // Distinct columns may share a name globally, but not within one
        // data source: the generated table would have duplicate columns.
        let mut names = BTreeSet::new();
        for column in &resolved {
            if column.name != TIMESTAMP_COLUMN && !names.insert(column.name.as_str()) {
                return Err(ServiceError::invalid(format!(
                    "duplicate column name {:?} in data source",
                    column.name
                )));
            }
        }

        let id = self.catalog.insert_data_source(name)?;
        let reserved =
            self.catalog
                .insert_column(TIMESTAMP_COLUMN, ColumnType::Timestamp, false, None)?;
        self.catalog.link_column(id, reserved.id, 0)?;
        let mut order = 1;
        for column in resolved {
            if column.name == TIMESTAMP_COLUMN {
                continue;
            }
            self.catalog.link_column(id, column.id, order)?;
            order += 1;
        }
        info!(name, data_source = id.as_i64(), "created data source");
        self.require_data_source(id)
    }

    pub fn find_data_source(&self, name: &str) -> Result<Option<DataSource>, ServiceError> {
        Ok(self.catalog.find_data_source_by_name(name)?)
    }

    pub fn get_data_source(&self, id: DataSourceId) -> Result<Option<DataSource>, ServiceError> {
        Ok(self.catalog.find_data_source_by_id(id)?)
    }

    pub fn get_all_data_sources(&self) -> Result<Vec<DataSource>, ServiceError> {
        Ok(self.catalog.get_all_data_sources()?)
    }

    pub fn get_data_source_columns(
        &self,
        data_source: DataSourceId,
    ) -> Result<Vec<Column>, ServiceError> {
        Ok(self.catalog.get_data_source_columns(data_source)?)
    }

    // --- campaign data sources ---

    /// Binds a data source to a campaign. Raw and aggregated tables are
    /// created for every existing participant before the binding row lands,
    /// keeping fan-out commutative with participant joins.
    pub fn add_campaign_data_source(
        &self,
        campaign: CampaignId,
        data_source: DataSourceId,
    ) -> Result<bool, ServiceError> {
        self.require_campaign(campaign)?;
        let data_source = self.require_data_source(data_source)?;
        for participant in self.catalog.get_campaign_participants(campaign)? {
            DataTable::new(&self.connections, &participant, &data_source)?.create_table()?;
            AggDataTable::new(&self.connections, &participant, &data_source)?.create_table()?;
        }
        let added = self.catalog.add_campaign_data_source(campaign, data_source.id)?;
        if added {
            info!(
                campaign = campaign.as_i64(),
                data_source = data_source.id.as_i64(),
                "bound data source"
            );
        }
        Ok(added)
    }

    /// Unbinds only; existing tables are retained. Use
    /// [`Services::purge_data_source_tables`] to drop them.
    pub fn remove_campaign_data_source(
        &self,
        campaign: CampaignId,
        data_source: DataSourceId,
    ) -> Result<bool, ServiceError> {
        Ok(self.catalog.remove_campaign_data_source(campaign, data_source)?)
    }

    /// Drops the raw and aggregated tables of every participant for this
    /// data source. Destructive and opt-in.
    pub fn purge_data_source_tables(
        &self,
        campaign: CampaignId,
        data_source: DataSourceId,
    ) -> Result<(), ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        for participant in self.catalog.get_campaign_participants(campaign)? {
            DataTable::new(&self.connections, &participant, &data_source)?.drop_table()?;
            AggDataTable::new(&self.connections, &participant, &data_source)?.drop_table()?;
        }
        info!(
            campaign = campaign.as_i64(),
            data_source = data_source.id.as_i64(),
            "purged data source tables"
        );
        Ok(())
    }

    pub fn is_campaign_data_source(
        &self,
        campaign: CampaignId,
        data_source: DataSourceId,
    ) -> Result<bool, ServiceError> {
        Ok(self.catalog.is_campaign_data_source(campaign, data_source)?)
    }

    pub fn get_campaign_data_sources(
        &self,
        campaign: CampaignId,
    ) -> Result<Vec<DataSource>, ServiceError> {
        Ok(self.catalog.get_campaign_data_sources(campaign)?)
    }

    // --- records ---

    pub fn create_data_record(
        &self,
        campaign: CampaignId,
        user: UserId,
        data_source: DataSourceId,
        ts: DateTime<Utc>,
        values: &BTreeMap<ColumnId, CellValue>,
    ) -> Result<(), ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        let table = DataTable::for_user(&self.connections, campaign, user, &data_source)?;
        table.insert(ts, values, true)?;
        Ok(())
    }

    /// Batched ingestion. Payloads are grouped by data source and written
    /// inside one transaction per table; payloads naming an unknown data
    /// source are skipped.
    pub fn create_data_records(
        &self,
        campaign: CampaignId,
        user: UserId,
        payloads: &[RecordPayload],
    ) -> Result<(), ServiceError> {
        let mut grouped: BTreeMap<DataSourceId, Vec<&RecordPayload>> = BTreeMap::new();
        for payload in payloads {
            grouped.entry(payload.data_source_id).or_default().push(payload);
        }
        for (id, group) in grouped {
            let Some(data_source) = self.catalog.find_data_source_by_id(id)? else {
                warn!(data_source = id.as_i64(), "skipping unknown data source");
                continue;
            };
            let table = DataTable::for_user(&self.connections, campaign, user, &data_source)?;
            for payload in group {
                if let Err(err) = table.insert(payload.ts, &payload.values, false) {
                    table.rollback()?;
                    return Err(err.into());
                }
            }
            table.commit()?;
        }
        Ok(())
    }

    pub fn select_data_range(
        &self,
        campaign: CampaignId,
        user: UserId,
        data_source: DataSourceId,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    ) -> Result<Vec<DataRecord>, ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        let table = DataTable::for_user(&self.connections, campaign, user, &data_source)?;
        Ok(table.select_range(from, till)?)
    }

    pub fn select_next_k_data(
        &self,
        campaign: CampaignId,
        user: UserId,
        data_source: DataSourceId,
        from: DateTime<Utc>,
        k: u64,
    ) -> Result<Vec<DataRecord>, ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        let table = DataTable::for_user(&self.connections, campaign, user, &data_source)?;
        Ok(table.select_next_k(from, k)?)
    }

    /// Full CSV export of one participant's raw table.
    pub fn dump_data(
        &self,
        campaign: CampaignId,
        user: UserId,
        data_source: DataSourceId,
    ) -> Result<PathBuf, ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        let table = DataTable::for_user(&self.connections, campaign, user, &data_source)?;
        Ok(table.dump_to_file()?)
    }

    // --- hourly stats ---

    pub fn create_hourly_stats(
        &self,
        participant: ParticipantId,
        data_source: DataSourceId,
        ts: DateTime<Utc>,
        amount: &cohort_storage::Amount,
    ) -> Result<(), ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        Ok(self
            .hourly
            .create_hourly_stats(participant, &data_source, ts, amount)?)
    }

    pub fn get_hourly_amount_of_data(
        &self,
        participant: ParticipantId,
        data_source: DataSourceId,
        hour_ts: DateTime<Utc>,
    ) -> Result<Vec<(Column, Histogram)>, ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        Ok(self
            .hourly
            .get_hourly_amount_of_data(participant, &data_source, hour_ts)?)
    }

    pub fn get_latest_hourly_amount(
        &self,
        participant: ParticipantId,
        data_source: DataSourceId,
    ) -> Result<Option<(NaiveDateTime, Vec<(Column, Histogram)>)>, ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        Ok(self
            .hourly
            .get_latest_hourly_amount(participant, &data_source)?)
    }

    pub fn get_filtered_amount_of_data(
        &self,
        participant: ParticipantId,
        data_source: DataSourceId,
        from: DateTime<Utc>,
        till: DateTime<Utc>,
    ) -> Result<i64, ServiceError> {
        let data_source = self.require_data_source(data_source)?;
        Ok(self
            .hourly
            .get_filtered_amount_of_data(participant, &data_source, from, till)?)
    }
}
