use std::collections::BTreeMap;
use std::fs;

use chrono::{Duration, Utc};
use cohort_core::{CampaignId, CellValue, ColumnId, DataSource, UserId};
use cohort_harness::TestDeployment;
use cohort_storage::{AggDataTable, DataTable};

fn assert_tables_exist(
    d: &TestDeployment,
    campaign: CampaignId,
    user: UserId,
    data_source: &DataSource,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = DataTable::for_user(&d.connections, campaign, user, data_source)?;
    let agg = AggDataTable::for_user(&d.connections, campaign, user, data_source)?;
    assert!(raw.table_exists()?, "raw table {} missing", raw.name());
    assert!(agg.table_exists()?, "agg table {} missing", agg.name());
    Ok(())
}

fn value_column(data_source: &DataSource) -> ColumnId {
    data_source.user_columns().next().unwrap().id
}

fn float_record(data_source: &DataSource, x: f64) -> BTreeMap<ColumnId, CellValue> {
    BTreeMap::from([(value_column(data_source), CellValue::Float(x))])
}

// ============================================================================
// Fan-out completeness (3 tests)
// ============================================================================

#[test]
fn binding_then_joining_creates_both_tables() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;

    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;
    assert_tables_exist(&d, campaign.id, member.id, &accel)
}

#[test]
fn joining_then_binding_creates_both_tables() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;

    d.join(&campaign, &member)?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    assert_tables_exist(&d, campaign.id, member.id, &accel)
}

#[test]
fn fan_out_is_complete_under_interleaving() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let a = d.user("a@example.org")?;
    let b = d.user("b@example.org")?;
    let accel = d.accel_data_source()?;
    let value = d.float_column("value")?;
    let gyro = d.services.create_data_source("gyro", &[value.id])?;

    // Mixed order: join, bind, join, bind.
    d.join(&campaign, &a)?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &b)?;
    d.services.add_campaign_data_source(campaign.id, gyro.id)?;

    for user in [a.id, b.id] {
        for data_source in [&accel, &gyro] {
            assert_tables_exist(&d, campaign.id, user, data_source)?;
        }
    }
    Ok(())
}

// ============================================================================
// Validation round-trip (4 tests)
// ============================================================================

#[test]
fn valid_records_are_inserted() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;

    let now = Utc::now();
    d.services.create_data_record(
        campaign.id,
        member.id,
        accel.id,
        now,
        &float_record(&accel, 3.5),
    )?;
    let table = DataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    assert_eq!(
        table.select_count(now - Duration::hours(1), now + Duration::hours(1))?,
        1
    );
    Ok(())
}

#[test]
fn missing_and_mistyped_values_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;

    let now = Utc::now();
    let table = DataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;

    // Missing required column.
    assert!(table.insert(now, &BTreeMap::new(), true).is_err());
    // Wrong type.
    let wrong = BTreeMap::from([(value_column(&accel), CellValue::Text("3.5".into()))]);
    assert!(table.insert(now, &wrong, true).is_err());
    // Unknown extra column id.
    let mut extra = float_record(&accel, 3.5);
    extra.insert(ColumnId::from_i64(9999), CellValue::Integer(1));
    assert!(table.insert(now, &extra, true).is_err());

    // No failed insert left a row behind.
    assert_eq!(
        table.select_count(now - Duration::hours(1), now + Duration::hours(1))?,
        0
    );
    Ok(())
}

#[test]
fn constrained_values_must_be_in_the_accepted_set() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let level = d.services.create_column("level", "integer", true, Some("1,2,3"))?;
    let ds = d.services.create_data_source("severity", &[level.id])?;
    d.services.add_campaign_data_source(campaign.id, ds.id)?;
    d.join(&campaign, &member)?;

    let now = Utc::now();
    let table = DataTable::for_user(&d.connections, campaign.id, member.id, &ds)?;
    let level_id = value_column(&ds);

    table.insert(now, &BTreeMap::from([(level_id, CellValue::Integer(2))]), true)?;
    assert!(table
        .insert(now, &BTreeMap::from([(level_id, CellValue::Integer(7))]), true)
        .is_err());
    assert_eq!(
        table.select_count(now - Duration::hours(1), now + Duration::hours(1))?,
        1
    );
    Ok(())
}

#[test]
fn batched_records_are_grouped_and_committed() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;

    let now = Utc::now();
    let mut payloads = Vec::new();
    for i in 0..5 {
        payloads.push(cohort_services::RecordPayload {
            data_source_id: accel.id,
            ts: now + Duration::seconds(i),
            values: float_record(&accel, i as f64),
        });
    }
    // An unknown data source id is skipped, not fatal.
    payloads.push(cohort_services::RecordPayload {
        data_source_id: cohort_core::DataSourceId::from_i64(9999),
        ts: now,
        values: BTreeMap::new(),
    });
    d.services.create_data_records(campaign.id, member.id, &payloads)?;

    let table = DataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    assert_eq!(
        table.select_count(now - Duration::hours(1), now + Duration::hours(1))?,
        5
    );
    Ok(())
}

// ============================================================================
// Range queries and export (3 tests)
// ============================================================================

#[test]
fn range_queries_are_half_open_and_ordered() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;

    let t0 = Utc::now();
    let n = 10;
    let table = DataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    for i in 0..n {
        table.insert(t0 + Duration::minutes(i), &float_record(&accel, i as f64), true)?;
    }
    let t_n = t0 + Duration::minutes(n);

    assert_eq!(table.select_count(t0, t_n)?, n as u64);
    assert_eq!(table.select_count(t0, t0)?, 0);

    let records = table.select_range(t0, t_n)?;
    assert_eq!(records.len(), n as usize);
    assert!(records.windows(2).all(|w| w[0].ts <= w[1].ts));

    assert_eq!(
        table.select_first_ts()?,
        Some(cohort_core::to_naive_utc(t0))
    );
    assert_eq!(
        table.select_last_ts()?,
        Some(cohort_core::to_naive_utc(t0 + Duration::minutes(n - 1)))
    );
    Ok(())
}

#[test]
fn next_k_paginates_strictly_after_the_cursor() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;

    let t0 = Utc::now();
    let table = DataTable::for_user(&d.connections, campaign.id, member.id, &accel)?;
    for i in 0..6 {
        table.insert(t0 + Duration::minutes(i), &float_record(&accel, i as f64), true)?;
    }

    let before = t0 - Duration::minutes(1);
    let first = table.select_next_k(before, 4)?;
    assert_eq!(first.len(), 4);
    let cursor = chrono::DateTime::from_naive_utc_and_offset(first[3].ts, Utc);
    let second = table.select_next_k(cursor, 4)?;
    assert_eq!(second.len(), 2);
    assert!(second[0].ts > first[3].ts);
    Ok(())
}

#[test]
fn dump_writes_headers_and_one_line_per_record() -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    d.join(&campaign, &member)?;

    let now = Utc::now();
    for i in 0..3 {
        d.services.create_data_record(
            campaign.id,
            member.id,
            accel.id,
            now + Duration::seconds(i),
            &float_record(&accel, i as f64),
        )?;
    }

    let path = d.services.dump_data(campaign.id, member.id, accel.id)?;
    let dumped = fs::read_to_string(&path)?;
    let lines: Vec<_> = dumped.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "data_source_id,timestamp,value");
    assert!(lines[1].starts_with(&format!("{},", accel.id.as_i64())));
    fs::remove_file(path)?;
    Ok(())
}
