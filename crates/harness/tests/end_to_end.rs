use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use cohort_core::{to_naive_utc, CellValue};
use cohort_harness::TestDeployment;
use cohort_storage::{AggDataTable, DataTable};

/// Full happy path: schema definition, campaign setup, participant join,
/// ingestion, and range queries against one deployment.
#[test]
fn accel_campaign_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;

    // Data source "accel" with one unconstrained float column.
    let value = d.services.create_column("value", "float", false, None)?;
    let accel = d.services.create_data_source("accel", &[value.id])?;

    // Campaign with no data sources, then bind accel.
    let owner = d.user("owner@example.org")?;
    let campaign = d.campaign(owner.id)?;
    assert!(d.services.add_campaign_data_source(campaign.id, accel.id)?);

    // Participant joins; both tables must exist.
    let member = d.user("member@example.org")?;
    d.join(&campaign, &member)?;
    let raw = DataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    let agg = AggDataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    assert!(raw.table_exists()?);
    assert!(agg.table_exists()?);

    // One record at t = now.
    let now = Utc::now();
    let record = BTreeMap::from([(value.id, CellValue::Float(3.5))]);
    d.services
        .create_data_record(campaign.id, member.id, accel.id, now, &record)?;

    assert_eq!(
        raw.select_count(now - Duration::days(1), now + Duration::days(1))?,
        1
    );
    assert_eq!(raw.select_first_ts()?, Some(to_naive_utc(now)));
    assert_eq!(raw.select_last_ts()?, Some(to_naive_utc(now)));

    let records = raw.select_range(now - Duration::days(1), now + Duration::days(1))?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].values[&value.id], CellValue::Float(3.5));
    Ok(())
}

/// Unbinding keeps tables and data; purging drops them.
#[test]
fn unbind_retains_tables_until_purged() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;

    assert!(d.services.remove_campaign_data_source(campaign.id, accel.id)?);
    assert!(!d.services.is_campaign_data_source(campaign.id, accel.id)?);

    let raw = DataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    assert!(raw.table_exists()?);

    d.services.purge_data_source_tables(campaign.id, accel.id)?;
    assert!(!raw.table_exists()?);
    let agg = AggDataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    assert!(!agg.table_exists()?);
    Ok(())
}

/// A participant joining after an unbind gets no tables for that source.
#[test]
fn unbound_sources_do_not_fan_out_to_new_participants(
) -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.services.remove_campaign_data_source(campaign.id, accel.id)?;

    let late = d.user("late@example.org")?;
    d.join(&campaign, &late)?;
    let raw = DataTable::for_user(&d.connections, campaign.id, late.id, &accel)?;
    assert!(!raw.table_exists()?);
    Ok(())
}
