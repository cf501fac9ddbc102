use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use saga_orchestrator::{BoxFuture, Context, SyncStepBuilder, WorkflowEngine, WorkflowError};
use serde_json::Value;

#[tokio::test]
async fn scenario_1_two_successful_steps_produce_final_result() {
    let engine = WorkflowEngine::new("scenario-1");
    engine.add_sync("A", || Ok("a".to_string())).unwrap();
    engine.add_sync("B", || Ok("b".to_string())).unwrap();

    let result = engine.execute().await.unwrap();

    assert_eq!(result, Value::from("b"));
    assert_eq!(engine.get_executed_step_names(), vec!["A", "B"]);
}

#[tokio::test]
async fn scenario_2_retry_exhaustion_triggers_one_compensation() {
    let recorded = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicU32::new(0));

    let engine = WorkflowEngine::new("scenario-2");
    let recorded_clone = recorded.clone();
    engine
        .add_sync_with_compensation(
            "A",
            || Ok("a".to_string()),
            move |value: String| {
                *recorded_clone.lock().unwrap() = Some(value);
                Ok(())
            },
        )
        .unwrap();

    let calls_clone = calls.clone();
    engine
        .add_sync_step(
            SyncStepBuilder::new("B", move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(anyhow::anyhow!("downstream unavailable"))
            })
            .with_max_retries(3)
            .with_retry_delay(Duration::ZERO)
            .build(),
        )
        .unwrap();

    let err = engine.execute().await.unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(err.to_string().contains("step 2"));
    assert_eq!(*recorded.lock().unwrap(), Some("a".to_string()));
}

#[tokio::test]
async fn scenario_3_critical_step_failure_preserves_original_cause() {
    let engine = WorkflowEngine::new("scenario-3");
    engine
        .add_sync_step(
            SyncStepBuilder::new("A", || Err::<String, _>(anyhow::anyhow!("fatal provisioning error")))
                .with_max_retries(0)
                .critical(true)
                .build(),
        )
        .unwrap();

    let err = engine.execute().await.unwrap_err();

    match err {
        WorkflowError::WorkflowFailed { cause, .. } => {
            let message = cause.to_string();
            assert!(message.contains("critical step"));
            assert!(message.contains("fatal provisioning error"));
        }
        other => panic!("expected WorkflowFailed wrapping a critical-step cause, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_4_parallel_branches_complete_before_final_step() {
    let engine = WorkflowEngine::new("scenario-4");
    let leaf = |value: &'static str| {
        move |_ctx: Arc<Context>| -> BoxFuture<'static, anyhow::Result<Value>> {
            Box::pin(async move { Ok(Value::from(value)) })
        }
    };

    engine
        .parallel("branches", vec![leaf("x"), leaf("y")])
        .unwrap();
    engine.add_sync("z", || Ok("z".to_string())).unwrap();

    let result = engine.execute().await.unwrap();
    assert_eq!(result, Value::from("z"));

    let snapshot = engine.get_context_snapshot().await;
    assert_eq!(
        snapshot.store.get("step_result_branches"),
        Some(&Value::Array(vec![Value::from("x"), Value::from("y")]))
    );
    assert_eq!(snapshot.store.get("step_result_z"), Some(&Value::from("z")));
}

#[tokio::test]
async fn scenario_5_serial_for_each_sum_is_exactly_six() {
    let engine = WorkflowEngine::new("scenario-5");
    engine
        .for_each(
            "sum-items",
            |_ctx| Box::pin(async { vec![Value::from(1), Value::from(2), Value::from(3)] }),
            |ctx, item, _index| {
                Box::pin(async move {
                    let current = ctx.get("sum").await.and_then(|v| v.as_i64()).unwrap_or(0);
                    let addend = item.as_i64().unwrap_or(0);
                    ctx.put("sum", Value::from(current + addend)).await;
                    Ok(())
                })
            },
        )
        .unwrap();

    engine.execute().await.unwrap();

    let snapshot = engine.get_context_snapshot().await;
    assert_eq!(snapshot.store.get("sum"), Some(&Value::from(6)));
}

#[tokio::test]
async fn scenario_6_third_step_failure_compensates_first_two_in_reverse() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::new("scenario-6");

    let order_a = order.clone();
    engine
        .add_sync_with_compensation("A", || Ok("a".to_string()), move |_: String| {
            order_a.lock().unwrap().push("A");
            Ok(())
        })
        .unwrap();

    let order_b = order.clone();
    engine
        .add_sync_with_compensation("B", || Ok("b".to_string()), move |_: String| {
            order_b.lock().unwrap().push("B");
            Ok(())
        })
        .unwrap();

    engine
        .add_sync_step(
            SyncStepBuilder::new("C", || Err::<String, _>(anyhow::anyhow!("c failed")))
                .with_compensation(|_: String| Ok(()))
                .with_max_retries(0)
                .build(),
        )
        .unwrap();

    let err = engine.execute().await.unwrap_err();

    assert_eq!(engine.get_executed_step_names(), vec!["A", "B"]);
    assert_eq!(*order.lock().unwrap(), vec!["B", "A"]);

    match err {
        WorkflowError::WorkflowFailed {
            cause,
            compensation_errors,
            step_number,
            ..
        } => {
            assert_eq!(step_number, 3);
            assert!(cause.to_string().contains("c failed"));
            assert!(compensation_errors.is_empty());
        }
        other => panic!("expected WorkflowFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_workflow_returns_null_without_executing_any_step() {
    let engine = WorkflowEngine::new("empty");
    let result = engine.execute().await.unwrap();
    assert_eq!(result, Value::Null);
    assert_eq!(engine.get_executed_step_count(), 0);
}

#[tokio::test]
async fn single_failing_step_with_zero_retries_runs_once_and_skips_compensation_sweep_body() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();

    let engine = WorkflowEngine::new("single-failure");
    engine
        .add_sync_step(
            SyncStepBuilder::new("A", move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(anyhow::anyhow!("boom"))
            })
            .with_max_retries(0)
            .build(),
        )
        .unwrap();

    let result = engine.execute().await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_shorter_than_action_escalates_through_retry_loop() {
    let engine = WorkflowEngine::new("timeout-escalation");
    engine
        .add_async_step(
            saga_orchestrator::AsyncStepBuilder::new("slow", |_ctx: Arc<Context>| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>("done".to_string())
            })
            .with_timeout(Duration::from_millis(10))
            .with_max_retries(0)
            .build(),
        )
        .unwrap();

    let err = engine.execute().await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn compensation_that_throws_is_collected_and_later_compensations_still_run() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let engine = WorkflowEngine::new("compensation-failure");

    let order_a = order.clone();
    engine
        .add_sync_with_compensation("A", || Ok("a".to_string()), move |_: String| {
            order_a.lock().unwrap().push("A");
            Ok(())
        })
        .unwrap();

    engine
        .add_sync_step(
            SyncStepBuilder::new("B", || Ok("b".to_string()))
                .with_compensation(|_: String| Err(anyhow::anyhow!("compensation unavailable")))
                .build(),
        )
        .unwrap();

    engine
        .add_sync_step(
            SyncStepBuilder::new("C", || Err::<String, _>(anyhow::anyhow!("c failed")))
                .with_max_retries(0)
                .build(),
        )
        .unwrap();

    let err = engine.execute().await.unwrap_err();

    assert_eq!(*order.lock().unwrap(), vec!["A"]);
    match err {
        WorkflowError::WorkflowFailed {
            compensation_errors,
            ..
        } => {
            assert_eq!(compensation_errors.len(), 1);
            assert_eq!(compensation_errors[0].step_name, "B");
        }
        other => panic!("expected WorkflowFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn reset_allows_an_identical_rerun_with_the_same_final_result() {
    let engine = WorkflowEngine::new("rerunnable");
    engine.add_sync("A", || Ok("a".to_string())).unwrap();
    engine.add_sync("B", || Ok("b".to_string())).unwrap();

    let first = engine.execute().await.unwrap();
    engine.reset().unwrap();
    engine.add_sync("A", || Ok("a".to_string())).unwrap();
    engine.add_sync("B", || Ok("b".to_string())).unwrap();
    let second = engine.execute().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(engine.get_executed_step_names(), vec!["A", "B"]);
}
