use async_trait::async_trait;
use bnr_common::testing::{FakeOp, FakeTableProvider};
use bnr_common::{BackupRecord, Notifier, Outcome, ProviderError, RetentionDays, TableCounts, TableStatus};
use chrono::Utc;
use mockall::mock;
use mockall::predicate::{always, eq};
use restore_validator::{report_validation, CountField, RestoreValidator, ValidationError, Verdict};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const TARGET: &str = "restored_orders_01-06-2025-10-00-00";

mock! {
    pub Sink {}

    #[async_trait]
    impl Notifier for Sink {
        async fn report(&self, title: &str, message: &str, outcome: Outcome);
    }
}

fn counts(item_count: u64, gsi_count: u64, lsi_count: u64) -> TableCounts {
    TableCounts {
        item_count,
        gsi_count,
        lsi_count,
    }
}

fn record(table_counts: TableCounts) -> BackupRecord {
    BackupRecord::new("arn:1", table_counts, None, Utc::now(), RetentionDays::new(7))
}

fn validator(provider: &Arc<FakeTableProvider>, max_attempts: u32) -> RestoreValidator {
    RestoreValidator::new(provider.clone())
        .with_poll_interval(Duration::ZERO)
        .with_max_attempts(max_attempts)
}

fn restored(provider: &FakeTableProvider, table_counts: TableCounts, statuses: Vec<TableStatus>) {
    provider.add_table(TARGET, table_counts);
    provider.script_statuses(TARGET, statuses);
}

#[tokio::test]
async fn test_matching_counts_verify() {
    let provider = Arc::new(FakeTableProvider::new());
    restored(
        &provider,
        counts(1_000, 2, 1),
        vec![TableStatus::Creating, TableStatus::Creating, TableStatus::Active],
    );

    let report = assert_ok!(
        validator(&provider, 10)
            .validate(TARGET, Some(&record(counts(1_000, 2, 1))))
            .await
    );
    assert_eq!(report.verdict, Verdict::Verified);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.actual, Some(counts(1_000, 2, 1)));
}

#[tokio::test]
async fn test_stuck_in_creating_times_out() {
    let provider = Arc::new(FakeTableProvider::new());
    restored(&provider, counts(1, 0, 0), vec![TableStatus::Creating]);

    let err = assert_err!(
        validator(&provider, 4)
            .validate(TARGET, Some(&record(counts(1, 0, 0))))
            .await
    );
    match err {
        ValidationError::Timeout {
            attempts,
            last_status,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(last_status, TableStatus::Creating);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(provider.calls(FakeOp::DescribeTable).len(), 4);
    assert!(provider.calls(FakeOp::CountItems).is_empty());
}

#[tokio::test]
async fn test_failed_status_is_not_a_mismatch() {
    let provider = Arc::new(FakeTableProvider::new());
    restored(
        &provider,
        counts(1, 0, 0),
        vec![
            TableStatus::Creating,
            TableStatus::Other("INACCESSIBLE_ENCRYPTION_CREDENTIALS".into()),
        ],
    );

    let err = assert_err!(
        validator(&provider, 10)
            .validate(TARGET, Some(&record(counts(1, 0, 0))))
            .await
    );
    assert!(matches!(err, ValidationError::CreationFailed { .. }));
}

#[tokio::test]
async fn test_each_field_is_compared_independently() {
    let cases = [
        (counts(99, 2, 1), CountField::ItemCount),
        (counts(100, 1, 1), CountField::GsiCount),
        (counts(100, 2, 0), CountField::LsiCount),
    ];

    for (actual, field) in cases {
        let provider = Arc::new(FakeTableProvider::new());
        restored(&provider, actual, vec![TableStatus::Active]);

        let err = assert_err!(
            validator(&provider, 1)
                .validate(TARGET, Some(&record(counts(100, 2, 1))))
                .await
        );
        match err {
            ValidationError::Mismatch(mismatches) => {
                assert_eq!(mismatches.len(), 1);
                assert_eq!(mismatches[0].field, field);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_all_differing_fields_are_reported() {
    let provider = Arc::new(FakeTableProvider::new());
    restored(&provider, counts(0, 0, 0), vec![TableStatus::Active]);

    let err = assert_err!(
        validator(&provider, 1)
            .validate(TARGET, Some(&record(counts(100, 2, 1))))
            .await
    );
    let ValidationError::Mismatch(mismatches) = err else {
        panic!("expected mismatch");
    };
    assert_eq!(mismatches.len(), 3);
}

#[tokio::test]
async fn test_without_record_only_readiness_is_checked() {
    let provider = Arc::new(FakeTableProvider::new());
    restored(
        &provider,
        counts(5, 0, 0),
        vec![TableStatus::Updating, TableStatus::Active],
    );

    let report = assert_ok!(validator(&provider, 5).validate(TARGET, None).await);
    assert_eq!(report.verdict, Verdict::ReadyUnverified);
    assert!(provider.calls(FakeOp::CountItems).is_empty());
}

#[tokio::test]
async fn test_missing_table_surfaces_provider_error() {
    let provider = Arc::new(FakeTableProvider::new());
    let err = assert_err!(validator(&provider, 5).validate("ghost", None).await);
    assert!(matches!(
        err,
        ValidationError::Provider(ProviderError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_results_are_reported() {
    let mut sink = MockSink::new();
    sink.expect_report()
        .with(
            eq("Restore Metadata Validation Failed!"),
            always(),
            eq(Outcome::Failure),
        )
        .times(1)
        .return_const(());

    let result = Err(ValidationError::Mismatch(vec![]));
    report_validation(&sink, TARGET, &result).await;
}
