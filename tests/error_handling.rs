//! Error handling tests: rejected requests, post-commit failures, locking.

use cohort::{
    ChangeRequest, Cohort, CohortConfig, CohortError, ExpiryInstruction, MembershipManager,
    PostCommitStage, Slug, Timestamp, UserId,
};
use tempfile::TempDir;

fn test_cohort(dir: &TempDir) -> Cohort {
    let mut config = CohortConfig::at(dir.path().join("cohort"));
    config.publisher.retry_backoff_ms = 0;
    config.publisher.max_retries = 1;
    let cohort = Cohort::open(config).unwrap();
    cohort.register_user(UserId(1), "alice").unwrap();
    cohort.register_segment("A").unwrap();
    cohort.register_segment("B").unwrap();
    cohort
}

fn add(user_id: i64, slugs: &[&str]) -> ChangeRequest {
    ChangeRequest {
        user_id,
        add_segments: slugs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn history_len(cohort: &Cohort) -> usize {
    cohort
        .history(UserId(1), Timestamp(0), Timestamp(i64::MAX))
        .unwrap()
        .len()
}

// --- Validation Errors ---

#[test]
fn test_malformed_ttl_rejected_before_any_change() {
    let dir = TempDir::new().unwrap();
    let cohort = test_cohort(&dir);

    let result = cohort.apply_change(&ChangeRequest {
        ttl: Some("next tuesday".into()),
        ..add(1, &["A"])
    });

    assert!(matches!(result, Err(CohortError::InvalidTtl(_))));
    assert!(cohort.user_segments(UserId(1)).unwrap().segments.is_empty());
    assert_eq!(history_len(&cohort), 0);
}

#[test]
fn test_blank_slug_rejected() {
    let dir = TempDir::new().unwrap();
    let cohort = test_cohort(&dir);

    assert!(matches!(
        cohort.apply_change(&add(1, &["A", ""])),
        Err(CohortError::InvalidRequest(_))
    ));
    assert!(matches!(
        cohort.register_segment("   "),
        Err(CohortError::InvalidRequest(_))
    ));
}

#[test]
fn test_bad_month_rejected() {
    let dir = TempDir::new().unwrap();
    let cohort = test_cohort(&dir);

    for month in ["2024-13", "2024", "May 2024", "2024-1"] {
        assert!(
            matches!(
                cohort.monthly_history(UserId(1), month),
                Err(CohortError::InvalidRequest(_))
            ),
            "{month} accepted"
        );
    }
}

#[test]
fn test_inverted_history_range_rejected() {
    let dir = TempDir::new().unwrap();
    let cohort = test_cohort(&dir);

    assert!(matches!(
        cohort.history(UserId(1), Timestamp(10), Timestamp(5)),
        Err(CohortError::InvalidRequest(_))
    ));
}

// --- Resolution Errors ---

#[test]
fn test_unknown_subject() {
    let dir = TempDir::new().unwrap();
    let cohort = test_cohort(&dir);

    assert!(matches!(
        cohort.apply_change(&add(99, &["A"])),
        Err(CohortError::SubjectNotFound(UserId(99)))
    ));
    assert!(matches!(
        cohort.user_segments(UserId(99)),
        Err(CohortError::SubjectNotFound(_))
    ));
}

#[test]
fn test_partial_resolution_applies_nothing() {
    let dir = TempDir::new().unwrap();
    let cohort = test_cohort(&dir);
    cohort.apply_change(&add(1, &["B"])).unwrap();

    let result = cohort.apply_change(&ChangeRequest {
        delete_segments: vec!["B".into()],
        ..add(1, &["A", "MISSING"])
    });

    match result {
        Err(CohortError::SegmentNotFound(missing)) => {
            assert_eq!(missing, vec![Slug::from("MISSING")]);
        }
        other => panic!("expected SegmentNotFound, got {:?}", other),
    }
    let segments = cohort.user_segments(UserId(1)).unwrap().segments;
    assert_eq!(segments, vec![Slug::from("B")]);
    assert_eq!(history_len(&cohort), 1);
}

// --- Post-commit Errors ---

#[test]
fn test_publish_failure_is_post_commit() {
    use cohort::{Collaborators, DeliveryMode, EventPublisher, MembershipChanged};
    use std::sync::Arc;

    struct Down;

    impl EventPublisher for Down {
        fn publish_change(&self, _event: &MembershipChanged) -> cohort::Result<()> {
            Err(CohortError::Broker("no leader".into()))
        }

        fn publish_expiry(&self, _instruction: &ExpiryInstruction) -> cohort::Result<()> {
            Err(CohortError::Broker("no leader".into()))
        }
    }

    let dir = TempDir::new().unwrap();
    let cohort = test_cohort(&dir);
    let db = cohort.database().clone();
    let manager = MembershipManager::new(
        Collaborators {
            subjects: db.clone(),
            segments: db.clone(),
            store: db.clone(),
            history: db.clone(),
            publisher: Arc::new(Down),
        },
        DeliveryMode::Immediate,
    );

    let change = add(1, &["A"]).validate().unwrap();
    let err = manager.apply_change(&change).unwrap_err();

    assert!(err.is_post_commit());
    assert!(matches!(
        err,
        CohortError::PostCommit {
            stage: PostCommitStage::Publish,
            ..
        }
    ));
    // Membership and history stay committed
    assert_eq!(
        cohort.user_segments(UserId(1)).unwrap().segments,
        vec![Slug::from("A")]
    );
    assert_eq!(history_len(&cohort), 1);
}

// --- Data Directory Errors ---

#[test]
fn test_open_missing_without_create() {
    let dir = TempDir::new().unwrap();
    let mut config = CohortConfig::at(dir.path().join("nonexistent"));
    config.create_if_missing = false;

    assert!(matches!(
        Cohort::open(config),
        Err(CohortError::NotInitialized)
    ));
}

#[test]
fn test_concurrent_open_is_locked() {
    let dir = TempDir::new().unwrap();
    let config = CohortConfig::at(dir.path().join("cohort"));

    let _first = Cohort::open(config.clone()).unwrap();

    // Second handle should fail with lock error
    assert!(matches!(Cohort::open(config), Err(CohortError::Locked)));
}

#[test]
fn test_locked_directory_is_not_initialized_by_second_opener() {
    use fs2::FileExt;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cohort");
    std::fs::create_dir_all(&path).unwrap();
    let holder = std::fs::File::create(path.join("LOCK")).unwrap();
    holder.lock_exclusive().unwrap();

    assert!(matches!(
        Cohort::open(CohortConfig::at(&path)),
        Err(CohortError::Locked)
    ));
    assert!(!path.join("MANIFEST").exists());

    holder.unlock().unwrap();
    drop(holder);
    Cohort::open(CohortConfig::at(&path)).unwrap();
    assert!(path.join("MANIFEST").exists());
}

#[test]
fn test_foreign_manifest_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cohort");
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("MANIFEST"), b"RST\0\x01").unwrap();

    assert!(matches!(
        Cohort::open(CohortConfig::at(path)),
        Err(CohortError::InvalidFormat(_))
    ));
}
