use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cohort_core::{Campaign, ColumnId, DataSource, Participant};
use cohort_harness::TestDeployment;
use cohort_storage::{Amount, AMOUNT_KEY};

struct Fixture {
    d: TestDeployment,
    campaign: Campaign,
    participant: Participant,
    accel: DataSource,
}

fn fixture() -> Result<Fixture, Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let accel = d.accel_data_source()?;
    d.services.add_campaign_data_source(campaign.id, accel.id)?;
    let participant = d.join(&campaign, &member)?;
    Ok(Fixture {
        d,
        campaign,
        participant,
        accel,
    })
}

fn amount_of(data_source: &DataSource, count: i64) -> Amount {
    let column = data_source.user_columns().next().unwrap();
    BTreeMap::from([(
        column.id,
        BTreeMap::from([(AMOUNT_KEY.to_string(), count)]),
    )])
}

fn counts_at(
    f: &Fixture,
    at: DateTime<Utc>,
) -> Result<i64, Box<dyn std::error::Error>> {
    let stats = f
        .d
        .services
        .get_hourly_amount_of_data(f.participant.id, f.accel.id, at)?;
    assert_eq!(stats.len(), 1);
    Ok(stats[0].1[AMOUNT_KEY])
}

// ============================================================================
// Snapshot writes (2 tests)
// ============================================================================

#[test]
fn same_hour_snapshots_overwrite() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture()?;
    let h0 = Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap();

    f.d.services.create_hourly_stats(
        f.participant.id,
        f.accel.id,
        h0 + Duration::minutes(5),
        &amount_of(&f.accel, 3),
    )?;
    f.d.services.create_hourly_stats(
        f.participant.id,
        f.accel.id,
        h0 + Duration::minutes(40),
        &amount_of(&f.accel, 8),
    )?;
    assert_eq!(counts_at(&f, h0)?, 8);
    Ok(())
}

#[test]
fn unknown_column_ids_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture()?;
    let bogus: Amount = BTreeMap::from([(
        ColumnId::from_i64(9999),
        BTreeMap::from([(AMOUNT_KEY.to_string(), 1)]),
    )]);
    assert!(f
        .d
        .services
        .create_hourly_stats(f.participant.id, f.accel.id, Utc::now(), &bogus)
        .is_err());
    Ok(())
}

// ============================================================================
// Forward-fill reads (3 tests)
// ============================================================================

#[test]
fn snapshots_forward_fill_between_hours() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture()?;
    let h0 = Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap();
    let h1 = h0 + Duration::hours(1);

    f.d.services
        .create_hourly_stats(f.participant.id, f.accel.id, h0, &amount_of(&f.accel, 4))?;
    f.d.services
        .create_hourly_stats(f.participant.id, f.accel.id, h1, &amount_of(&f.accel, 9))?;

    // Before the first snapshot: zero-seeded shape.
    assert_eq!(counts_at(&f, h0 - Duration::hours(1))?, 0);
    // Inside [h0, h1): the h0 snapshot.
    assert_eq!(counts_at(&f, h0)?, 4);
    assert_eq!(counts_at(&f, h0 + Duration::minutes(30))?, 4);
    // At and after h1: the h1 snapshot.
    assert_eq!(counts_at(&f, h1)?, 9);
    assert_eq!(counts_at(&f, h1 + Duration::hours(5))?, 9);
    Ok(())
}

#[test]
fn zero_seed_uses_accept_values_for_categorical_columns(
) -> Result<(), Box<dyn std::error::Error>> {
    let d = TestDeployment::new()?;
    let owner = d.user("owner@example.org")?;
    let member = d.user("member@example.org")?;
    let campaign = d.campaign(owner.id)?;
    let app = d.services.create_column("app", "text", true, Some("maps,mail"))?;
    let usage = d.services.create_data_source("usage", &[app.id])?;
    d.services.add_campaign_data_source(campaign.id, usage.id)?;
    let participant = d.join(&campaign, &member)?;

    let stats = d
        .services
        .get_hourly_amount_of_data(participant.id, usage.id, Utc::now())?;
    assert_eq!(stats.len(), 1);
    assert_eq!(
        stats[0].1,
        BTreeMap::from([("maps".to_string(), 0), ("mail".to_string(), 0)])
    );
    Ok(())
}

#[test]
fn latest_snapshot_carries_its_hour() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture()?;
    assert!(f
        .d
        .services
        .get_latest_hourly_amount(f.participant.id, f.accel.id)?
        .is_none());

    let h0 = Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap();
    let h1 = h0 + Duration::hours(3);
    f.d.services
        .create_hourly_stats(f.participant.id, f.accel.id, h0, &amount_of(&f.accel, 4))?;
    f.d.services
        .create_hourly_stats(f.participant.id, f.accel.id, h1, &amount_of(&f.accel, 6))?;

    let (ts, stats) = f
        .d
        .services
        .get_latest_hourly_amount(f.participant.id, f.accel.id)?
        .unwrap();
    assert_eq!(ts, h1.naive_utc());
    assert_eq!(stats[0].1[AMOUNT_KEY], 6);
    Ok(())
}

// ============================================================================
// Filtered amount (2 tests)
// ============================================================================

#[test]
fn filtered_amount_is_the_snapshot_difference() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture()?;
    let h0 = Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap();
    let h3 = h0 + Duration::hours(3);

    f.d.services
        .create_hourly_stats(f.participant.id, f.accel.id, h0, &amount_of(&f.accel, 10))?;
    f.d.services
        .create_hourly_stats(f.participant.id, f.accel.id, h3, &amount_of(&f.accel, 25))?;

    assert_eq!(
        f.d.services
            .get_filtered_amount_of_data(f.participant.id, f.accel.id, h0, h3)?,
        15
    );
    // Forward-filled anchors: the hour between snapshots resolves to h0.
    assert_eq!(
        f.d.services.get_filtered_amount_of_data(
            f.participant.id,
            f.accel.id,
            h0 + Duration::hours(1),
            h3,
        )?,
        15
    );
    Ok(())
}

#[test]
fn filtered_amount_is_zero_without_an_anchor() -> Result<(), Box<dyn std::error::Error>> {
    let f = fixture()?;
    let h0 = Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap();
    f.d.services
        .create_hourly_stats(f.participant.id, f.accel.id, h0, &amount_of(&f.accel, 10))?;

    // No snapshot at or before the lower anchor.
    assert_eq!(
        f.d.services.get_filtered_amount_of_data(
            f.participant.id,
            f.accel.id,
            h0 - Duration::hours(2),
            h0,
        )?,
        0
    );
    Ok(())
}
