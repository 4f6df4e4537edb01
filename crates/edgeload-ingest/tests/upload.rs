//! Upload coordinator behaviour across both strategies
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::write_parts;
use edgeload_ingest::upload::RecordingSleeper;
use edgeload_ingest::{JobStateTracker, MemoryRemote, PartUploadCoordinator, UploadConfig, UploadMode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn coordinator(remote: &Arc<MemoryRemote>, mode: UploadMode) -> (PartUploadCoordinator, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let config = UploadConfig {
        mode,
        ..Default::default()
    };
    let coordinator = PartUploadCoordinator::new(JobStateTracker::new(remote.clone()), config)
        .with_sleeper(sleeper.clone());
    (coordinator, sleeper)
}

#[tokio::test]
async fn test_direct_resume_never_recreates_confirmed_parts() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let job = remote.seed_job("sales");
    remote.seed_part(&job, 1);
    remote.seed_part(&job, 3);
    let (coordinator, _) = coordinator(&remote, UploadMode::Direct);

    let outcome = coordinator.upload(&job, write_parts(dir.path(), 6)).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.uploaded, [1, 2, 3, 4, 5, 6]);
    assert_eq!(remote.create_calls(1), 0);
    assert_eq!(remote.create_calls(3), 0);
    for n in [2, 4, 5, 6] {
        assert_eq!(remote.create_calls(n), 1, "part {n}");
    }
}

#[tokio::test]
async fn test_batch_resume_only_submits_missing_parts() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let job = remote.seed_job("sales");
    remote.seed_part(&job, 1);
    remote.seed_part(&job, 3);
    let (coordinator, _) = coordinator(&remote, UploadMode::Batch);

    let outcome = coordinator.upload(&job, write_parts(dir.path(), 4)).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(remote.batch_submissions(), 2);
    assert_eq!(remote.uploaded_parts(&job), [1, 2, 3, 4]);
}

#[tokio::test]
async fn test_batch_failing_twice_settles_in_three_rounds() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let job = remote.seed_job("sales");
    remote.fail_batch(3, 2);
    let (coordinator, sleeper) = coordinator(&remote, UploadMode::Batch);

    let parts = write_parts(dir.path(), 5);
    let paths: Vec<_> = parts.iter().map(|p| p.path.clone()).collect();
    let outcome = coordinator.upload(&job, parts).await.unwrap();

    assert_eq!(outcome.rounds, 3);
    assert!(outcome.outstanding.is_empty());
    assert_eq!(remote.batch_submissions(), 5 + 1 + 1);
    assert!(paths.iter().all(|p| !p.exists()));

    // two backoffs between rounds, and one poll interval per round
    let delays = sleeper.delays();
    assert_eq!(delays.iter().filter(|d| **d == Duration::from_secs(10)).count(), 3);
    assert!(delays.contains(&Duration::from_secs(2)));
    assert!(delays.contains(&Duration::from_secs(4)));
}

#[tokio::test]
async fn test_direct_single_part_uses_one_worker_and_retries() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let job = remote.seed_job("sales");
    remote.fail_part(1, 1);
    let (coordinator, sleeper) = coordinator(&remote, UploadMode::Direct);

    let outcome = coordinator.upload(&job, write_parts(dir.path(), 1)).await.unwrap();

    assert_eq!(outcome.rounds, 2);
    assert!(outcome.is_complete());
    assert_eq!(remote.create_calls(1), 2);
    assert_eq!(sleeper.delays(), [Duration::from_secs(2)]);
}

#[tokio::test]
async fn test_batch_with_lagging_listing_keeps_confirmed_parts() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let job = remote.seed_job("sales");
    remote.lag_part_listing();
    remote.fail_batch(2, 1);
    let (coordinator, _) = coordinator(&remote, UploadMode::Batch);

    let parts = write_parts(dir.path(), 3);
    let paths: Vec<_> = parts.iter().map(|p| p.path.clone()).collect();
    let outcome = coordinator.upload(&job, parts).await.unwrap();

    assert_eq!(outcome.rounds, 2);
    assert!(outcome.is_complete());
    assert_eq!(outcome.uploaded, [1, 2, 3]);
    // only the failed batch went out again
    assert_eq!(remote.batch_submissions(), 4);
    assert_eq!(remote.uploaded_parts(&job), [1, 2, 3]);
    assert!(paths.iter().all(|p| !p.exists()));
}

#[tokio::test]
async fn test_batch_with_lagging_listing_reports_outstanding_part() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let job = remote.seed_job("sales");
    remote.lag_part_listing();
    remote.fail_batch(2, 5);
    let (coordinator, _) = coordinator(&remote, UploadMode::Batch);

    let parts = write_parts(dir.path(), 3);
    let failing = parts[1].path.clone();
    let outcome = coordinator.upload(&job, parts).await.unwrap();

    assert_eq!(outcome.rounds, 3);
    assert_eq!(outcome.uploaded, [1, 3]);
    assert_eq!(outcome.outstanding, [failing.clone()]);
    assert!(failing.exists());
}

#[tokio::test]
async fn test_direct_with_lagging_listing_creates_each_part_once() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let job = remote.seed_job("sales");
    remote.seed_part(&job, 1);
    remote.lag_part_listing();
    remote.fail_part(3, 1);
    let (coordinator, sleeper) = coordinator(&remote, UploadMode::Direct);

    let outcome = coordinator.upload(&job, write_parts(dir.path(), 4)).await.unwrap();

    assert_eq!(outcome.rounds, 2);
    assert!(outcome.is_complete());
    assert_eq!(outcome.uploaded, [1, 2, 3, 4]);
    assert_eq!(remote.create_calls(1), 0);
    assert_eq!(remote.create_calls(2), 1);
    assert_eq!(remote.create_calls(3), 2);
    assert_eq!(remote.create_calls(4), 1);
    assert_eq!(sleeper.delays(), [Duration::from_secs(2)]);
}
