//! Integration tests for the suspending compensator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use compensator::{
    AsyncCompensated, AsyncCompensation, AsyncCompensator, AsyncValueCompensation,
    CompensatorError, EntryStatus, Status,
};
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct TestError(String);

#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, entry: impl Into<String>) {
        self.log.lock().expect("log lock").push(entry.into());
    }

    fn undo(&self, name: &'static str) -> AsyncCompensation<TestError> {
        let recorder = self.clone();
        AsyncCompensation::new(move || async move {
            tokio::task::yield_now().await;
            recorder.push(name);
            Ok(())
        })
    }

    fn slow_undo(&self, name: &'static str, delay: Duration) -> AsyncCompensation<TestError> {
        let recorder = self.clone();
        AsyncCompensation::new(move || async move {
            tokio::time::sleep(delay).await;
            recorder.push(name);
            Ok(())
        })
    }

    fn failing_undo(&self, name: &'static str) -> AsyncCompensation<TestError> {
        let recorder = self.clone();
        AsyncCompensation::new(move || async move {
            recorder.push(format!("{name} failed"));
            Err(TestError(format!("cannot undo {name}")))
        })
    }

    fn entries(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }
}

async fn succeed() -> Result<(), TestError> {
    tokio::task::yield_now().await;
    Ok(())
}

async fn explode() -> Result<(), TestError> {
    panic!("undo exploded")
}

#[tokio::test]
async fn two_steps_then_compensate() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();

    compensator.execute(succeed, recorder.undo("undoA"), None).await?;
    compensator.execute(succeed, recorder.undo("undoB"), None).await?;
    compensator.compensate().await?;

    assert_eq!(recorder.entries(), vec!["undoB", "undoA"]);
    assert_eq!(compensator.status(), Status::Compensated);
    Ok(())
}

#[tokio::test]
async fn tags_group_compensations() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();

    compensator.execute(succeed, recorder.undo("undo1"), None).await?;
    let tag = compensator.create_tag(Some("slot")).await?;
    compensator.execute(succeed, recorder.undo("undo3"), None).await?;
    let late = recorder.clone();
    compensator
        .add_compensation(
            move || async move {
                late.push("undo2");
                Ok(())
            },
            Some(&tag),
        )
        .await?;

    compensator.compensate().await?;

    assert_eq!(recorder.entries(), vec!["undo3", "undo2", "undo1"]);
    Ok(())
}

#[tokio::test]
async fn failing_step_is_compensated_and_reported() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    compensator.execute(succeed, recorder.undo("prior"), None).await?;

    let result = compensator
        .execute(
            || async { Err(TestError("Err".to_string())) },
            recorder.undo("own"),
            None,
        )
        .await;

    match result {
        Err(CompensatorError::Execution(error)) => assert_eq!(error.0, "Err"),
        other => panic!("expected Execution error, got {other:?}"),
    }
    assert_eq!(recorder.entries(), vec!["prior"]);
    assert_eq!(compensator.status(), Status::Compensated);

    let result = compensator.create_tag(None).await;
    assert_eq!(
        result.err().and_then(|e| e.status()),
        Some(Status::Compensated)
    );
    Ok(())
}

#[tokio::test]
async fn compound_failure_reports_both_errors() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    compensator.execute(succeed, recorder.undo("bottom"), None).await?;
    compensator
        .execute(succeed, recorder.failing_undo("bad"), None)
        .await?;

    let result = compensator
        .execute(
            || async { Err(TestError("E1".to_string())) },
            AsyncCompensation::none(),
            None,
        )
        .await;

    match result {
        Err(CompensatorError::Compensation(error)) => {
            assert_eq!(error.while_executing.map(|e| e.0), Some("E1".to_string()));
            assert_eq!(error.while_compensating.0, "cannot undo bad");
        }
        other => panic!("expected Compensation error, got {other:?}"),
    }
    assert_eq!(compensator.status(), Status::FailedToCompensate);
    assert_eq!(recorder.entries(), vec!["bad failed"]);
    assert_eq!(
        compensator.journal().with_status(EntryStatus::Abandoned),
        vec![1]
    );

    let again = compensator.compensate().await;
    assert_eq!(
        again.err().and_then(|e| e.status()),
        Some(Status::FailedToCompensate)
    );
    Ok(())
}

#[tokio::test]
async fn foreach_rolls_back_items_before_the_failure() {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    let sink = recorder.clone();

    let result = compensator
        .foreach(
            ["x1", "x2", "x3"],
            |item| async move {
                if item == "x2" {
                    return Err(TestError(format!("{item} failed")));
                }
                Ok(())
            },
            AsyncValueCompensation::new(move |item: &'static str| {
                let sink = sink.clone();
                async move {
                    sink.push(format!("undo {item}"));
                    Ok(())
                }
            }),
            None,
        )
        .await;

    assert!(matches!(result, Err(CompensatorError::Execution(_))));
    assert_eq!(recorder.entries(), vec!["undo x1"]);
}

#[tokio::test]
async fn get_and_run_register_value_compensations() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    let sink = recorder.clone();

    let id = compensator
        .get(
            || async { Ok(7_u32) },
            AsyncValueCompensation::new(move |id: u32| {
                let sink = sink.clone();
                async move {
                    sink.push(format!("release {id}"));
                    Ok(())
                }
            }),
            None,
        )
        .await?;
    let name = compensator
        .run(
            || async {
                Ok(AsyncCompensated::new(
                    "lease".to_string(),
                    recorder.undo("drop lease"),
                ))
            },
            None,
        )
        .await?;
    let skipped = compensator
        .execute_if(
            || async { Ok(false) },
            succeed,
            recorder.undo("never"),
            None,
        )
        .await?;

    assert_eq!(id, 7);
    assert_eq!(name, "lease");
    assert!(!skipped);

    compensator.compensate().await?;
    assert_eq!(recorder.entries(), vec!["drop lease", "release 7"]);
    Ok(())
}

#[tokio::test]
async fn commit_discards_pending_compensations() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    compensator.execute(succeed, recorder.undo("a"), None).await?;

    compensator.commit().await?;
    compensator.compensate().await?;

    assert!(recorder.entries().is_empty());
    assert_eq!(compensator.status(), Status::Compensated);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compensation_waits_for_step_in_flight() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = Arc::new(AsyncCompensator::<TestError>::new());
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let step = {
        let compensator = Arc::clone(&compensator);
        let undo = recorder.undo("in flight");
        tokio::spawn(async move {
            compensator
                .execute(
                    move || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok(())
                    },
                    undo,
                    None,
                )
                .await
        })
    };

    started_rx.await?;
    let rollback = {
        let compensator = Arc::clone(&compensator);
        tokio::spawn(async move { compensator.compensate().await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while compensator.status() != Status::Compensating {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await?;
    assert!(recorder.entries().is_empty());

    let _ = release_tx.send(());
    assert!(step.await?.is_ok());
    assert!(rollback.await?.is_ok());

    assert_eq!(recorder.entries(), vec!["in flight"]);
    assert_eq!(compensator.status(), Status::Compensated);
    Ok(())
}

#[tokio::test]
async fn interrupted_rollback_resumes_on_next_compensate() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    compensator.execute(succeed, recorder.undo("bottom"), None).await?;
    compensator
        .execute(
            succeed,
            recorder.slow_undo("slow", Duration::from_millis(50)),
            None,
        )
        .await?;

    let first = tokio::time::timeout(Duration::from_millis(10), compensator.compensate()).await;

    assert!(first.is_err());
    assert_eq!(compensator.status(), Status::Compensating);
    let pending: Vec<u64> = compensator.pending().iter().map(|p| p.sequence).collect();
    assert_eq!(pending, vec![2, 1]);
    assert_eq!(
        compensator.journal().with_status(EntryStatus::Pending),
        vec![1, 2]
    );
    assert!(recorder.entries().is_empty());

    compensator.compensate().await?;

    assert_eq!(recorder.entries(), vec!["slow", "bottom"]);
    assert_eq!(compensator.status(), Status::Compensated);
    assert_eq!(
        compensator.journal().with_status(EntryStatus::Compensated),
        vec![1, 2]
    );
    Ok(())
}

#[tokio::test]
async fn steps_are_refused_after_an_interrupted_rollback() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    compensator
        .execute(
            succeed,
            recorder.slow_undo("slow", Duration::from_millis(50)),
            None,
        )
        .await?;

    let first = tokio::time::timeout(Duration::from_millis(10), compensator.compensate()).await;
    assert!(first.is_err());

    let step = compensator
        .execute(succeed, recorder.undo("late"), None)
        .await;
    assert_eq!(
        step.err().and_then(|e| e.status()),
        Some(Status::Compensating)
    );

    compensator.compensate().await?;
    assert_eq!(recorder.entries(), vec!["slow"]);
    Ok(())
}

#[tokio::test]
async fn panicking_compensation_ends_the_rollback() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = Arc::new(AsyncCompensator::<TestError>::new());
    compensator.execute(succeed, recorder.undo("bottom"), None).await?;
    compensator.add_compensation(explode, None).await?;

    let rollback = {
        let compensator = Arc::clone(&compensator);
        tokio::spawn(async move { compensator.compensate().await })
    };
    let outcome = rollback.await;

    assert!(outcome.is_err_and(|error| error.is_panic()));
    assert_eq!(compensator.status(), Status::FailedToCompensate);
    let journal = compensator.journal();
    assert_eq!(journal.with_status(EntryStatus::CompensationFailed), vec![2]);
    assert_eq!(journal.with_status(EntryStatus::Abandoned), vec![1]);

    let again = compensator.compensate().await;
    assert_eq!(
        again.err().and_then(|e| e.status()),
        Some(Status::FailedToCompensate)
    );
    assert!(recorder.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn enumeration_failure_rolls_back_earlier_items() {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    let seen = recorder.clone();
    let sink = recorder.clone();
    let items = vec![
        Ok("x1"),
        Err(TestError("unreadable".to_string())),
        Ok("x3"),
    ];

    let result = compensator
        .try_foreach(
            items,
            |item| {
                let seen = seen.clone();
                async move {
                    seen.push(format!("do {item}"));
                    Ok(())
                }
            },
            AsyncValueCompensation::new(move |item: &'static str| {
                let sink = sink.clone();
                async move {
                    sink.push(format!("undo {item}"));
                    Ok(())
                }
            }),
            None,
        )
        .await;

    match result {
        Err(CompensatorError::Execution(error)) => assert_eq!(error.0, "unreadable"),
        other => panic!("expected Execution error, got {other:?}"),
    }
    assert_eq!(recorder.entries(), vec!["do x1", "undo x1"]);
    assert_eq!(compensator.status(), Status::Compensated);
}

#[tokio::test]
async fn failing_test_is_handled_like_a_failing_step() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    compensator.execute(succeed, recorder.undo("prior"), None).await?;
    let ran = recorder.clone();

    let result = compensator
        .execute_if(
            || async { Err(TestError("cannot decide".to_string())) },
            || async move {
                ran.push("executed");
                Ok(())
            },
            recorder.undo("own"),
            None,
        )
        .await;

    match result {
        Err(CompensatorError::Execution(error)) => assert_eq!(error.0, "cannot decide"),
        other => panic!("expected Execution error, got {other:?}"),
    }
    assert_eq!(recorder.entries(), vec!["prior"]);
    assert_eq!(compensator.status(), Status::Compensated);
    Ok(())
}

#[tokio::test]
async fn tag_dropped_by_commit_is_rejected() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    let tag = compensator.create_tag(Some("slot")).await?;
    compensator.commit().await?;
    let ran = recorder.clone();

    let result = compensator
        .execute(
            || async move {
                ran.push("executed");
                Ok(())
            },
            recorder.undo("tagged"),
            Some(&tag),
        )
        .await;

    assert!(matches!(result, Err(CompensatorError::TagNotFound(_))));
    assert_eq!(compensator.status(), Status::Executing);
    assert!(recorder.entries().is_empty());
    assert!(compensator.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn explicit_compensate_reports_only_the_compensation_error() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let compensator = AsyncCompensator::<TestError>::new();
    compensator.execute(succeed, recorder.undo("bottom"), None).await?;
    compensator
        .execute(succeed, recorder.failing_undo("middle"), None)
        .await?;
    compensator.execute(succeed, recorder.undo("top"), None).await?;

    let result = compensator.compensate().await;

    match result {
        Err(CompensatorError::Compensation(error)) => {
            assert!(error.while_executing.is_none());
            assert_eq!(error.while_compensating.0, "cannot undo middle");
        }
        other => panic!("expected Compensation error, got {other:?}"),
    }
    assert_eq!(recorder.entries(), vec!["top", "middle failed"]);
    assert_eq!(compensator.status(), Status::FailedToCompensate);
    let journal = compensator.journal();
    assert_eq!(journal.with_status(EntryStatus::Compensated), vec![3]);
    assert_eq!(journal.with_status(EntryStatus::Abandoned), vec![1]);
    Ok(())
}
