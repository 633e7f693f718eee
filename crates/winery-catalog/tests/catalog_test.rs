//! Catalog integration tests.
//!
//! These run against a real PostgreSQL instance and are ignored by
//! default. Point `WINERY_TEST_DB` at a scratch database and run:
//!
//! ```bash
//! WINERY_TEST_DB=postgres://winery@localhost/winery_test \
//!     cargo test -p winery-catalog -- --ignored
//! ```

use uuid::Uuid;
use winery_catalog::{Catalog, CatalogError, InsertOutcome, ShardState, SignatureState};

fn test_db_url() -> Option<String> {
    std::env::var("WINERY_TEST_DB").ok()
}

async fn connect() -> Option<Catalog> {
    let url = test_db_url()?;
    Some(Catalog::connect(&url, Some("winery-catalog-tests")).await.unwrap())
}

/// Unique signature per test so runs do not interfere.
fn signature(tag: &str) -> Vec<u8> {
    let mut sig = Uuid::new_v4().as_bytes().to_vec();
    sig.extend_from_slice(tag.as_bytes());
    sig.resize(32, 0);
    sig
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_acquire_creates_then_reuses_standby() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();

    let shard = catalog.acquire_rw_shard(writer).await.unwrap();
    assert_eq!(shard.state, ShardState::Writing);
    assert_eq!(shard.locker, Some(writer));
    assert_eq!(shard.name.len(), 32);

    // Release and reacquire: the standby shard must be reused, not a new
    // one created.
    catalog.release_rw_shard(&shard.name, writer).await.unwrap();
    let released = catalog.shard_by_name(&shard.name).await.unwrap().unwrap();
    assert_eq!(released.state, ShardState::Standby);
    assert_eq!(released.locker, None);

    let writer2 = Uuid::new_v4();
    let reacquired = catalog
        .lock_one_shard(ShardState::Standby, ShardState::Writing, writer2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reacquired.state, ShardState::Writing);
    assert_eq!(reacquired.locker, Some(writer2));

    catalog.release_rw_shard(&reacquired.name, writer2).await.unwrap();
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_full_lifecycle_walk() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();
    let packer = Uuid::new_v4();
    let cleaner = Uuid::new_v4();

    let shard = catalog.create_shard(writer).await.unwrap();
    catalog.mark_full(&shard.name, writer).await.unwrap();

    assert!(catalog.start_packing(&shard.name, packer).await.unwrap());
    catalog.finish_packing(&shard.name, packer).await.unwrap();
    let packed = catalog.shard_by_name(&shard.name).await.unwrap().unwrap();
    assert_eq!(packed.state, ShardState::Packed);
    assert_eq!(packed.locker, None);

    catalog.record_mapped_host(&shard.name, "host-a").await.unwrap();
    assert!(catalog.start_cleaning(&shard.name, cleaner, 1).await.unwrap());
    catalog.finish_cleaning(&shard.name, cleaner).await.unwrap();

    let done = catalog.shard_by_name(&shard.name).await.unwrap().unwrap();
    assert_eq!(done.state, ShardState::Readonly);
    assert_eq!(done.locker, None);
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_packing_race_has_one_winner() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();

    let shard = catalog.create_shard(writer).await.unwrap();
    catalog.mark_full(&shard.name, writer).await.unwrap();

    let packer_a = Uuid::new_v4();
    let packer_b = Uuid::new_v4();
    let a = catalog.start_packing(&shard.name, packer_a).await.unwrap();
    let b = catalog.start_packing(&shard.name, packer_b).await.unwrap();
    assert!(a ^ b, "exactly one packer must win the conditional update");

    let winner = if a { packer_a } else { packer_b };
    catalog.abort_packing(&shard.name, winner).await.unwrap();
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_wrong_locker_cannot_transition() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    let shard = catalog.create_shard(writer).await.unwrap();
    let err = catalog.mark_full(&shard.name, stranger).await.unwrap_err();
    assert!(matches!(err, CatalogError::Conflict(_)));

    // The rightful owner still can.
    catalog.mark_full(&shard.name, writer).await.unwrap();
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_reclaim_packing_respects_grace_and_locker() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();
    let dead_packer = Uuid::new_v4();
    let reclaimer = Uuid::new_v4();

    let shard = catalog.create_shard(writer).await.unwrap();
    catalog.mark_full(&shard.name, writer).await.unwrap();
    assert!(catalog.start_packing(&shard.name, dead_packer).await.unwrap());

    // The lock is fresh: reclaim must refuse.
    assert!(!catalog
        .reclaim_packing(&shard.name, Some(dead_packer), reclaimer, 3600.0)
        .await
        .unwrap());

    // Zero grace: anything is stale, but the observed locker must match.
    assert!(!catalog
        .reclaim_packing(&shard.name, Some(Uuid::new_v4()), reclaimer, 0.0)
        .await
        .unwrap());
    assert!(catalog
        .reclaim_packing(&shard.name, Some(dead_packer), reclaimer, 0.0)
        .await
        .unwrap());

    let reclaimed = catalog.shard_by_name(&shard.name).await.unwrap().unwrap();
    assert_eq!(reclaimed.state, ShardState::Packing);
    assert_eq!(reclaimed.locker, Some(reclaimer));

    catalog.abort_packing(&shard.name, reclaimer).await.unwrap();
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_cleaning_requires_mapped_hosts() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();
    let packer = Uuid::new_v4();
    let cleaner = Uuid::new_v4();

    let shard = catalog.create_shard(writer).await.unwrap();
    catalog.mark_full(&shard.name, writer).await.unwrap();
    assert!(catalog.start_packing(&shard.name, packer).await.unwrap());
    catalog.finish_packing(&shard.name, packer).await.unwrap();

    // No hosts mapped yet.
    assert!(!catalog.start_cleaning(&shard.name, cleaner, 2).await.unwrap());

    catalog.record_mapped_host(&shard.name, "host-a").await.unwrap();
    catalog.record_mapped_host(&shard.name, "host-a").await.unwrap(); // idempotent
    assert!(!catalog.start_cleaning(&shard.name, cleaner, 2).await.unwrap());

    catalog.record_mapped_host(&shard.name, "host-b").await.unwrap();
    let shard_row = catalog.shard_by_name(&shard.name).await.unwrap().unwrap();
    assert_eq!(shard_row.mapped_on_hosts_when_packed, vec!["host-a", "host-b"]);

    assert!(catalog.start_cleaning(&shard.name, cleaner, 2).await.unwrap());
    catalog.abort_cleaning(&shard.name, cleaner).await.unwrap();
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_signature_insert_and_present() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();
    let shard = catalog.create_shard(writer).await.unwrap();
    let sig = signature("insert");

    assert_eq!(
        catalog.insert_inflight(&sig, shard.id).await.unwrap(),
        InsertOutcome::Created
    );
    // Readers must not see inflight entries as anything but inflight.
    assert_eq!(
        catalog.lookup(&sig).await.unwrap(),
        Some((SignatureState::Inflight, shard.id))
    );

    // A second writer sees the existing binding.
    assert_eq!(
        catalog.insert_inflight(&sig, shard.id + 1).await.unwrap(),
        InsertOutcome::Exists {
            state: SignatureState::Inflight,
            shard_id: shard.id
        }
    );

    catalog.mark_present(&sig, shard.id).await.unwrap();
    assert_eq!(
        catalog.lookup(&sig).await.unwrap(),
        Some((SignatureState::Present, shard.id))
    );

    // Once present, the binding is frozen.
    assert_eq!(
        catalog.insert_inflight(&sig, shard.id + 1).await.unwrap(),
        InsertOutcome::Exists {
            state: SignatureState::Present,
            shard_id: shard.id
        }
    );
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_signature_delete_and_undelete() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();
    let shard = catalog.create_shard(writer).await.unwrap();
    let sig = signature("delete");

    catalog.insert_inflight(&sig, shard.id).await.unwrap();
    catalog.mark_present(&sig, shard.id).await.unwrap();

    catalog.mark_deleted(&sig).await.unwrap();
    assert_eq!(
        catalog.lookup(&sig).await.unwrap(),
        Some((SignatureState::Deleted, shard.id))
    );

    // Double delete is NotFound, not silent success.
    assert!(matches!(
        catalog.mark_deleted(&sig).await.unwrap_err(),
        CatalogError::NotFound(_)
    ));

    // Undelete must name the recorded shard.
    assert!(matches!(
        catalog.undelete(&sig, shard.id + 1).await.unwrap_err(),
        CatalogError::NotFound(_)
    ));
    catalog.undelete(&sig, shard.id).await.unwrap();
    assert_eq!(
        catalog.lookup(&sig).await.unwrap(),
        Some((SignatureState::Present, shard.id))
    );
}

#[tokio::test]
#[ignore] // needs WINERY_TEST_DB
async fn test_list_signatures_pagination() {
    let Some(catalog) = connect().await else { return };
    let writer = Uuid::new_v4();
    let shard = catalog.create_shard(writer).await.unwrap();

    let mut sigs: Vec<Vec<u8>> = (0u8..10).map(|i| signature(&format!("page-{i}"))).collect();
    for sig in &sigs {
        catalog.insert_inflight(sig, shard.id).await.unwrap();
        catalog.mark_present(sig, shard.id).await.unwrap();
    }
    sigs.sort();

    // Walk the whole index in pages and make sure every inserted
    // signature shows up exactly once, in order.
    let mut seen = Vec::new();
    let mut after: Option<Vec<u8>> = None;
    loop {
        let page = catalog.list_signatures(after.as_deref(), 7).await.unwrap();
        if page.is_empty() {
            break;
        }
        after = Some(page.last().unwrap().clone());
        seen.extend(page);
    }
    let ours: Vec<&Vec<u8>> = seen.iter().filter(|s| sigs.contains(s)).collect();
    assert_eq!(ours.len(), sigs.len());
    assert!(ours.windows(2).all(|w| w[0] < w[1]));
}
