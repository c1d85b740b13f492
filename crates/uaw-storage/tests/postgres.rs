//! Runs against a live database only when `UAW_TEST_DATABASE_URL` is set.

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uaw_core::StagingRecord;
use uaw_storage::{PgWarehouse, Warehouse};
use uuid::Uuid;

// tests in this file share one database; each holds this for its whole body
static DB: Mutex<()> = Mutex::const_new(());

async fn warehouse() -> Option<PgWarehouse> {
    let url = std::env::var("UAW_TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.expect("connect to test database");
    let warehouse = PgWarehouse::from_pool(pool);
    warehouse.migrate().await.expect("migrate");
    Some(warehouse)
}

fn row(user_id: &str, action_type: &str, dated: bool) -> StagingRecord {
    StagingRecord {
        user_id: user_id.to_string(),
        action_type: action_type.to_string(),
        timestamp: dated.then(|| Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()),
        device: Some("ios".to_string()),
        location: None,
        load_ts: Utc::now(),
        is_processed: false,
    }
}

#[tokio::test]
async fn promotion_round_trip_against_postgres() {
    let _db = DB.lock().await;
    let Some(warehouse) = warehouse().await else {
        eprintln!("UAW_TEST_DATABASE_URL not set; skipping");
        return;
    };

    let tag = Uuid::new_v4().simple().to_string();
    let user = format!("user-{tag}");
    let action = format!("action-{tag}");
    let before = warehouse.counts().await.unwrap();

    let appended = warehouse
        .append_staging(&[row(&user, &action, true), row(&user, &action, false)])
        .await
        .unwrap();
    assert_eq!(appended, 2);

    let mut tx = warehouse.begin_promotion().await.unwrap();
    let claimed = tx.claim_unprocessed().await.unwrap();
    assert!(claimed.len() >= 2);
    assert!(tx.upsert_dim_users(&claimed).await.unwrap() >= 1);
    assert!(tx.upsert_dim_actions(&claimed).await.unwrap() >= 1);
    let promoted = tx.insert_facts(&claimed).await.unwrap();
    assert_eq!(tx.count_null_fact_keys().await.unwrap(), 0);
    let marked = tx.mark_processed(&promoted).await.unwrap();
    assert_eq!(marked, promoted.len() as u64);
    tx.commit().await.unwrap();

    let after = warehouse.counts().await.unwrap();
    assert_eq!(after.staging_rows, before.staging_rows + 2);
    assert_eq!(after.dim_users, before.dim_users + 1);
    assert_eq!(after.dim_actions, before.dim_actions + 1);
    assert!(after.facts > before.facts);
    // the undated row stays pending
    assert!(after.unprocessed_rows >= 1);
}

#[tokio::test]
async fn rolled_back_promotion_leaves_no_trace() {
    let _db = DB.lock().await;
    let Some(warehouse) = warehouse().await else {
        return;
    };

    let tag = Uuid::new_v4().simple().to_string();
    warehouse
        .append_staging(&[row(&format!("rb-{tag}"), "view", true)])
        .await
        .unwrap();
    let before = warehouse.counts().await.unwrap();

    let mut tx = warehouse.begin_promotion().await.unwrap();
    let claimed = tx.claim_unprocessed().await.unwrap();
    tx.upsert_dim_users(&claimed).await.unwrap();
    tx.rollback().await.unwrap();

    let after = warehouse.counts().await.unwrap();
    assert_eq!(after.dim_users, before.dim_users);
    assert_eq!(after.unprocessed_rows, before.unprocessed_rows);
}

#[tokio::test]
async fn concurrent_claims_skip_locked_rows() {
    let _db = DB.lock().await;
    let Some(warehouse) = warehouse().await else {
        return;
    };

    let tag = Uuid::new_v4().simple().to_string();
    let rows: Vec<_> = (0..4)
        .map(|i| row(&format!("skip-{tag}-{i}"), "view", true))
        .collect();
    warehouse.append_staging(&rows).await.unwrap();

    let mut first = warehouse.begin_promotion().await.unwrap();
    let mut second = warehouse.begin_promotion().await.unwrap();
    let claimed_first: HashSet<i64> = first.claim_unprocessed().await.unwrap().into_iter().collect();
    let claimed_second: HashSet<i64> =
        second.claim_unprocessed().await.unwrap().into_iter().collect();

    assert!(claimed_first.len() >= rows.len());
    assert!(claimed_first.is_disjoint(&claimed_second));

    // once the first claim is released the rows are claimable again
    first.rollback().await.unwrap();
    second.rollback().await.unwrap();
    let mut third = warehouse.begin_promotion().await.unwrap();
    let reclaimed: HashSet<i64> = third.claim_unprocessed().await.unwrap().into_iter().collect();
    assert!(claimed_first.is_subset(&reclaimed));
    third.rollback().await.unwrap();
}

#[tokio::test]
async fn overlapping_dimension_upserts_do_not_deadlock() {
    let _db = DB.lock().await;
    let Some(warehouse) = warehouse().await else {
        return;
    };

    let tag = Uuid::new_v4().simple().to_string();
    let users: Vec<String> = (0..8).map(|i| format!("dl-{tag}-{i}")).collect();
    let forward: Vec<_> = users.iter().map(|u| row(u, "view", true)).collect();
    let backward: Vec<_> = users.iter().rev().map(|u| row(u, "view", true)).collect();

    warehouse.append_staging(&forward).await.unwrap();
    let mut first = warehouse.begin_promotion().await.unwrap();
    let first_claim = first.claim_unprocessed().await.unwrap();

    warehouse.append_staging(&backward).await.unwrap();
    let mut second = warehouse.begin_promotion().await.unwrap();
    let second_claim = second.claim_unprocessed().await.unwrap();
    assert_eq!(second_claim.len(), backward.len());

    let (a, b) = tokio::join!(
        async {
            first.upsert_dim_users(&first_claim).await?;
            first.commit().await
        },
        async {
            second.upsert_dim_users(&second_claim).await?;
            second.commit().await
        }
    );
    a.unwrap();
    b.unwrap();

    let after = warehouse.counts().await.unwrap();
    assert!(after.dim_users >= users.len() as i64);
}
