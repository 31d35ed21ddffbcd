use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use cohort_core::{Campaign, Column, DataSource, Participant, User, UserId};
use cohort_services::{ServiceError, Services};
use cohort_storage::Connections;

/// A fresh single-process deployment backed by a temp directory. The
/// directory (and every schema database inside it) is removed on drop.
pub struct TestDeployment {
    _root: TempDir,
    pub connections: Arc<Connections>,
    pub services: Services,
}

impl TestDeployment {
    pub fn new() -> Result<Self, ServiceError> {
        let root = TempDir::new().map_err(cohort_storage::StorageError::from)?;
        let connections = Arc::new(Connections::new(root.path())?);
        let services = Services::new(connections.clone())?;
        Ok(Self {
            _root: root,
            connections,
            services,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn user(&self, email: &str) -> Result<User, ServiceError> {
        self.services.create_user(email, "Test User")
    }

    /// A campaign starting now and running for a week, with no data sources.
    pub fn campaign(&self, owner: UserId) -> Result<Campaign, ServiceError> {
        let now = Utc::now();
        self.services
            .create_campaign(owner, "study", now, now + Duration::days(7), &[])
    }

    pub fn float_column(&self, name: &str) -> Result<Column, ServiceError> {
        self.services.create_column(name, "float", false, None)
    }

    /// An `accel` data source with a single unconstrained float column.
    pub fn accel_data_source(&self) -> Result<DataSource, ServiceError> {
        let value = self.float_column("value")?;
        self.services.create_data_source("accel", &[value.id])
    }

    pub fn join(
        &self,
        campaign: &Campaign,
        user: &User,
    ) -> Result<Participant, ServiceError> {
        self.services
            .add_campaign_participant(campaign.id, user.id, Utc::now())?;
        self.services
            .get_participant(campaign.id, user.id)?
            .ok_or_else(|| ServiceError::invalid("participant missing after join"))
    }
}
