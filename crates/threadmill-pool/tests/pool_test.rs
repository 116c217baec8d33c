//! End-to-end tests over real worker threads
//!
//! Handlers that need a worker pinned in a known state block on named
//! gates; each test opens its gates before finishing so no worker thread
//! outlives its pool. Gate names are unique per test because the test
//! binary runs them in parallel.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use threadmill_pool::{
    worker_channel, ConfigError, DestroyOptions, Pool, PoolError, PoolEvent, PoolOptions,
    QueueLimit, RecycleOptions, RunnerRegistry, RuntimeKind, SubmitOptions, TaskId, TaskQueue,
    TaskRecord,
};

// =============================================================================
// Fixture handlers
// =============================================================================

struct Gate {
    open: Mutex<bool>,
    signal: Condvar,
}

fn gate(name: &str) -> Arc<Gate> {
    static GATES: OnceLock<Mutex<HashMap<String, Arc<Gate>>>> = OnceLock::new();
    GATES
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_insert_with(|| {
            Arc::new(Gate {
                open: Mutex::new(false),
                signal: Condvar::new(),
            })
        })
        .clone()
}

fn open_gate(name: &str) {
    let gate = gate(name);
    *gate.open.lock().unwrap() = true;
    gate.signal.notify_all();
}

static TEARDOWNS: AtomicUsize = AtomicUsize::new(0);
static STAMP: AtomicUsize = AtomicUsize::new(0);

fn fixtures() -> RunnerRegistry {
    RunnerRegistry::new()
        .with_handler("fixtures", "default", |_ctx, input| Ok(input.payload))
        .with_handler("fixtures", "double", |_ctx, input| {
            Ok(json!(input.payload.as_i64().unwrap_or(0) * 2))
        })
        .with_handler("fixtures", "fail", |_ctx, _input| {
            Err("synthetic handler failure".to_string())
        })
        .with_handler("fixtures", "boom", |_ctx, _input| -> Result<Value, String> {
            panic!("handler exploded")
        })
        .with_handler("fixtures", "calls", |_ctx, _input| {
            // Counts invocations on the current worker thread, which makes
            // worker replacement observable from the outside.
            thread_local! {
                static CALLS: Cell<u64> = const { Cell::new(0) };
            }
            CALLS.with(|calls| {
                calls.set(calls.get() + 1);
                Ok(json!(calls.get()))
            })
        })
        .with_handler("fixtures", "stamp", |_ctx, _input| {
            Ok(json!(STAMP.fetch_add(1, Ordering::SeqCst) as u64))
        })
        .with_handler("fixtures", "hold", |_ctx, input| {
            let name = input.payload["gate"].as_str().unwrap_or_default();
            let gate = gate(name);
            let mut open = gate.open.lock().unwrap();
            while !*open {
                open = gate.signal.wait(open).unwrap();
            }
            Ok(json!("released"))
        })
        .with_handler("fixtures", "sizes", |_ctx, input| {
            let sizes: Vec<usize> = input.attachments.iter().map(Bytes::len).collect();
            Ok(json!(sizes))
        })
        .with_handler("fixtures", "cleanup", |_ctx, _input| {
            TEARDOWNS.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
}

// =============================================================================
// Test plumbing
// =============================================================================

fn pool_with(configure: impl FnOnce(PoolOptions) -> PoolOptions) -> Pool {
    Pool::new(
        fixtures(),
        configure(PoolOptions::new().with_target_file("fixtures")),
    )
    .unwrap()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn submit_named(pool: &Pool, name: &str, payload: Value) -> JoinHandle<Result<Value, PoolError>> {
    let pool = pool.clone();
    let options = SubmitOptions::new().with_target_name(name);
    tokio::spawn(async move { pool.submit_with(payload, options).await })
}

fn hold(pool: &Pool, gate_name: &str) -> JoinHandle<Result<Value, PoolError>> {
    submit_named(pool, "hold", json!({ "gate": gate_name }))
}

// =============================================================================
// Round trips and handler outcomes
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_round_trip_with_default_target() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let result = pool.submit(json!({"n": 7})).await.unwrap();
    assert_eq!(result, json!({"n": 7}));
    assert_eq!(pool.completed(), 1);

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_named_handler_overrides_the_default() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let result = pool
        .submit_with(json!(21), SubmitOptions::new().with_target_name("double"))
        .await
        .unwrap();
    assert_eq!(result, json!(42));

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_handler_error_fails_only_that_task() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let err = submit_named(&pool, "fail", Value::Null).await.unwrap();
    match err {
        Err(PoolError::Execution(message)) => assert_eq!(message, "synthetic handler failure"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    // The worker survived and keeps serving.
    let result = submit_named(&pool, "double", json!(4)).await.unwrap();
    assert_eq!(result.unwrap(), json!(8));
    assert_eq!(pool.worker_ids().len(), 1);

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_panicking_handler_leaves_the_worker_usable() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let err = submit_named(&pool, "boom", Value::Null).await.unwrap();
    match err {
        Err(PoolError::Execution(message)) => {
            assert!(message.contains("handler exploded"), "got: {message}")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let result = submit_named(&pool, "double", json!(5)).await.unwrap();
    assert_eq!(result.unwrap(), json!(10));

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_unknown_handler_is_an_execution_error() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let err = submit_named(&pool, "nope", Value::Null).await.unwrap();
    match err {
        Err(PoolError::Execution(message)) => assert!(message.contains("nope"), "got: {message}"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_attachments_reach_the_handler() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let result = pool
        .submit_with(
            Value::Null,
            SubmitOptions::new()
                .with_target_name("sizes")
                .with_attachments(vec![
                    Bytes::from_static(b"abc"),
                    Bytes::from_static(b"lighthouse"),
                ]),
        )
        .await
        .unwrap();
    assert_eq!(result, json!([3, 10]));

    pool.destroy().await.unwrap();
}

// =============================================================================
// Sizing, queueing, and admission
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_construction_starts_minimum_workers() {
    let pool = pool_with(|options| options.with_min_threads(3).with_max_threads(4));

    eventually("three workers to come up", || pool.worker_ids().len() == 3).await;
    assert_eq!(pool.active_tasks(), 0);

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_more_tasks_than_workers_all_resolve() {
    let pool = pool_with(|options| options.with_min_threads(2).with_max_threads(2));

    let handles: Vec<_> = (0..16)
        .map(|n| submit_named(&pool, "double", json!(n)))
        .collect();
    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), json!(n as i64 * 2));
    }
    assert_eq!(pool.completed(), 16);
    assert!(pool.worker_ids().len() <= 2);

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_busy_pool_queues_and_caps_at_max() {
    let pool = pool_with(|options| options.with_min_threads(2).with_max_threads(2));

    let first = hold(&pool, "busy-cap-1");
    let second = hold(&pool, "busy-cap-2");
    eventually("both workers to be busy", || pool.active_tasks() == 2).await;

    let third = submit_named(&pool, "default", json!(3));
    let fourth = submit_named(&pool, "default", json!(4));
    eventually("the backlog to build", || pool.queue_depth() == 2).await;
    assert_eq!(pool.worker_ids().len(), 2);

    open_gate("busy-cap-1");
    open_gate("busy-cap-2");
    assert_eq!(first.await.unwrap().unwrap(), json!("released"));
    assert_eq!(second.await.unwrap().unwrap(), json!("released"));
    assert_eq!(third.await.unwrap().unwrap(), json!(3));
    assert_eq!(fourth.await.unwrap().unwrap(), json!(4));
    assert_eq!(pool.completed(), 4);

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_no_queue_mode_rejects_overflow() {
    let pool = pool_with(|options| {
        options
            .with_min_threads(1)
            .with_max_threads(1)
            .with_max_queue(QueueLimit::Limit(0))
    });

    let held = hold(&pool, "no-queue-1");
    eventually("the worker to be busy", || pool.active_tasks() == 1).await;

    let rejected = pool.submit(json!(2)).await;
    assert!(matches!(rejected, Err(PoolError::NoQueueAvailable)));

    open_gate("no-queue-1");
    assert_eq!(held.await.unwrap().unwrap(), json!("released"));

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_bounded_queue_rejects_and_destroy_fails_the_rest() {
    let pool = pool_with(|options| {
        options
            .with_min_threads(1)
            .with_max_threads(1)
            .with_max_queue(QueueLimit::Limit(2))
    });

    let held = hold(&pool, "bounded-queue-1");
    eventually("the worker to be busy", || pool.active_tasks() == 1).await;
    let second = pool.clone();
    let second = tokio::spawn(async move { second.submit(json!(2)).await });
    eventually("the first task to queue", || pool.queue_depth() == 1).await;
    let third = pool.clone();
    let third = tokio::spawn(async move { third.submit(json!(3)).await });
    eventually("the second task to queue", || pool.queue_depth() == 2).await;

    let rejected = pool.submit(json!(4)).await;
    assert!(matches!(rejected, Err(PoolError::QueueAtLimit)));

    // The worker is stuck inside its handler, so teardown has to give up
    // on it after the window and fail everything it still owed.
    let destroyed = pool
        .destroy_with(DestroyOptions::new().with_timeout(Duration::from_millis(300)))
        .await;
    assert!(matches!(destroyed, Err(PoolError::TerminateTimeout)));
    assert!(matches!(
        second.await.unwrap(),
        Err(PoolError::Terminating)
    ));
    assert!(matches!(third.await.unwrap(), Err(PoolError::Terminating)));
    assert!(matches!(held.await.unwrap(), Err(PoolError::Terminating)));

    open_gate("bounded-queue-1");
}

#[test_log::test(tokio::test)]
async fn test_idle_workers_shrink_to_minimum_and_regrow() {
    let pool = pool_with(|options| {
        options
            .with_min_threads(1)
            .with_max_threads(3)
            .with_idle_timeout(Duration::from_millis(50))
    });

    let first = hold(&pool, "shrink-1");
    eventually("one busy worker", || pool.active_tasks() == 1).await;
    let second = hold(&pool, "shrink-2");
    eventually("two busy workers", || pool.active_tasks() == 2).await;
    let third = hold(&pool, "shrink-3");
    eventually("three busy workers", || pool.active_tasks() == 3).await;
    assert_eq!(pool.worker_ids().len(), 3);

    open_gate("shrink-1");
    open_gate("shrink-2");
    open_gate("shrink-3");
    for handle in [first, second, third] {
        assert_eq!(handle.await.unwrap().unwrap(), json!("released"));
    }

    eventually("idle workers to be evicted", || pool.worker_ids().len() == 1).await;

    // Load brings the pool back up without waiting for anything.
    let fourth = hold(&pool, "shrink-4");
    eventually("the survivor to pick up work", || pool.active_tasks() == 1).await;
    let fifth = hold(&pool, "shrink-5");
    eventually("a replacement worker to spawn", || {
        pool.worker_ids().len() == 2
    })
    .await;

    open_gate("shrink-4");
    open_gate("shrink-5");
    assert_eq!(fourth.await.unwrap().unwrap(), json!("released"));
    assert_eq!(fifth.await.unwrap().unwrap(), json!("released"));

    pool.destroy().await.unwrap();
}

// =============================================================================
// Worker replacement: isolation, memory pressure, recycling
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_workers_keep_state_between_tasks_without_isolation() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));
    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(2));

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_isolated_workers_start_fresh_per_task() {
    let pool = pool_with(|options| {
        options
            .with_min_threads(1)
            .with_max_threads(1)
            .with_isolate_workers(true)
    });
    assert!(pool.isolate_workers());

    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));
    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_memory_pressure_replaces_workers() {
    // Any real process dwarfs a one-byte ceiling, so every completion
    // recycles the worker that produced it.
    let pool = pool_with(|options| {
        options
            .with_min_threads(1)
            .with_max_threads(1)
            .with_max_memory_before_recycle(1)
    });

    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));
    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_recycle_replaces_idle_workers() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));
    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(2));

    pool.recycle().await.unwrap();

    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_recycle_to_process_without_a_program_fails() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let err = pool
        .recycle_with(RecycleOptions::new().with_runtime(RuntimeKind::Process))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Config(ConfigError::MissingProgram)
    ));
    assert_eq!(pool.runtime(), RuntimeKind::Thread);

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_live_getters_track_recycle_changes() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));
    assert!(!pool.isolate_workers());

    pool.recycle_with(RecycleOptions::new().with_isolate_workers(true))
        .await
        .unwrap();

    // config() keeps the construction-time snapshot; the live getter and
    // the pool's behavior both reflect the change.
    assert!(!pool.config().isolate_workers);
    assert!(pool.isolate_workers());
    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));
    assert_eq!(submit_named(&pool, "calls", Value::Null).await.unwrap().unwrap(), json!(1));

    pool.destroy().await.unwrap();
}

// =============================================================================
// Cancellation
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_cancel_running_task_kills_the_worker() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let cancel = CancellationToken::new();
    let running = {
        let pool = pool.clone();
        let options = SubmitOptions::new()
            .with_target_name("hold")
            .with_cancellation(cancel.clone());
        tokio::spawn(async move { pool.submit_with(json!({"gate": "cancel-run-1"}), options).await })
    };
    eventually("the task to start", || pool.active_tasks() == 1).await;

    cancel.cancel();
    assert!(matches!(
        running.await.unwrap(),
        Err(PoolError::Cancelled)
    ));

    // A replacement keeps the pool at its minimum even though the doomed
    // worker is still stuck inside the handler.
    eventually("a replacement worker", || {
        pool.worker_ids().len() == 1 && pool.active_tasks() == 0
    })
    .await;
    let result = submit_named(&pool, "double", json!(6)).await.unwrap();
    assert_eq!(result.unwrap(), json!(12));

    open_gate("cancel-run-1");
    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_cancel_queued_tasks_reports_the_count() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let held = hold(&pool, "cancel-queued-1");
    eventually("the worker to be busy", || pool.active_tasks() == 1).await;
    let second = pool.clone();
    let second = tokio::spawn(async move { second.submit(json!(2)).await });
    eventually("the first task to queue", || pool.queue_depth() == 1).await;
    let third = pool.clone();
    let third = tokio::spawn(async move { third.submit(json!(3)).await });
    eventually("the second task to queue", || pool.queue_depth() == 2).await;

    assert_eq!(pool.cancel_queued_tasks().await, 2);
    assert!(matches!(second.await.unwrap(), Err(PoolError::Cancelled)));
    assert!(matches!(third.await.unwrap(), Err(PoolError::Cancelled)));

    open_gate("cancel-queued-1");
    assert_eq!(held.await.unwrap().unwrap(), json!("released"));

    pool.destroy().await.unwrap();
}

// =============================================================================
// Teardown
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_destroy_waits_for_idle_workers() {
    let pool = pool_with(|options| options.with_min_threads(2).with_max_threads(2));

    assert_eq!(pool.submit(json!(1)).await.unwrap(), json!(1));
    pool.destroy().await.unwrap();

    // The pool is gone for good; later submissions bounce.
    let err = pool.submit(json!(2)).await.unwrap_err();
    assert!(matches!(err, PoolError::Terminating));
    assert_eq!(pool.completed(), 1);
}

#[test_log::test(tokio::test)]
async fn test_teardown_hook_runs_before_exit() {
    let pool = pool_with(|options| {
        options
            .with_min_threads(2)
            .with_max_threads(2)
            .with_teardown("cleanup")
    });

    assert_eq!(pool.submit(json!(1)).await.unwrap(), json!(1));
    pool.destroy().await.unwrap();

    assert_eq!(TEARDOWNS.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Delivery paths and channels
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_fast_path_and_event_delivery_agree() {
    for fast_path in [true, false] {
        let pool = pool_with(|options| {
            options
                .with_min_threads(1)
                .with_max_threads(2)
                .with_fast_path(fast_path)
        });

        let handles: Vec<_> = (0..8)
            .map(|n| submit_named(&pool, "double", json!(n)))
            .collect();
        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), json!(n as i64 * 2));
        }

        pool.destroy().await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_channel_binding_is_rejected_on_the_thread_runtime() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    let (_user, handle) = worker_channel();
    let err = pool
        .submit_with(json!(1), SubmitOptions::new().with_channel(handle))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Transport(_)));

    pool.destroy().await.unwrap();
}

// =============================================================================
// Custom queues and events
// =============================================================================

/// Serves the highest submitted priority first
#[derive(Default)]
struct PriorityQueue {
    tasks: Vec<TaskRecord>,
}

impl PriorityQueue {
    fn priority(task: &TaskRecord) -> i64 {
        task.queue_options()
            .and_then(|options| options.get("priority"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

impl TaskQueue for PriorityQueue {
    fn size(&self) -> usize {
        self.tasks.len()
    }

    fn push(&mut self, task: TaskRecord) {
        self.tasks.push(task);
    }

    fn shift(&mut self) -> Option<TaskRecord> {
        let index = self
            .tasks
            .iter()
            .enumerate()
            .max_by_key(|(_, task)| Self::priority(task))
            .map(|(index, _)| index)?;
        Some(self.tasks.remove(index))
    }

    fn remove(&mut self, id: TaskId) -> Option<TaskRecord> {
        let index = self.tasks.iter().position(|task| task.id() == id)?;
        Some(self.tasks.remove(index))
    }
}

#[test_log::test(tokio::test)]
async fn test_custom_queue_controls_dispatch_order() {
    let pool = Pool::builder()
        .runner(fixtures())
        .options(
            PoolOptions::new()
                .with_target_file("fixtures")
                .with_min_threads(1)
                .with_max_threads(1),
        )
        .queue(Box::new(PriorityQueue::default()))
        .build()
        .unwrap();

    let held = hold(&pool, "priority-1");
    eventually("the worker to be busy", || pool.active_tasks() == 1).await;

    let low = {
        let pool = pool.clone();
        let options = SubmitOptions::new()
            .with_target_name("stamp")
            .with_queue_options(json!({"priority": 1}));
        tokio::spawn(async move { pool.submit_with(Value::Null, options).await })
    };
    eventually("the low-priority task to queue", || pool.queue_depth() == 1).await;
    let high = {
        let pool = pool.clone();
        let options = SubmitOptions::new()
            .with_target_name("stamp")
            .with_queue_options(json!({"priority": 5}));
        tokio::spawn(async move { pool.submit_with(Value::Null, options).await })
    };
    eventually("the high-priority task to queue", || pool.queue_depth() == 2).await;

    open_gate("priority-1");
    assert_eq!(held.await.unwrap().unwrap(), json!("released"));
    let high_stamp = high.await.unwrap().unwrap().as_u64().unwrap();
    let low_stamp = low.await.unwrap().unwrap().as_u64().unwrap();
    assert!(
        high_stamp < low_stamp,
        "high priority ran at {high_stamp}, low at {low_stamp}"
    );

    pool.destroy().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_drain_event_fires_once_the_backlog_clears() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));
    let mut events = pool.subscribe();

    let held = hold(&pool, "drain-1");
    eventually("the worker to be busy", || pool.active_tasks() == 1).await;
    let queued = pool.clone();
    let queued = tokio::spawn(async move { queued.submit(json!(2)).await });
    eventually("the task to queue", || pool.queue_depth() == 1).await;

    // Flush drain notifications from the initial dispatch; the one that
    // matters is emitted when the queued task leaves the backlog.
    while events.try_recv().is_ok() {}
    open_gate("drain-1");
    assert_eq!(held.await.unwrap().unwrap(), json!("released"));
    assert_eq!(queued.await.unwrap().unwrap(), json!(2));

    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(PoolEvent::Drain) => break true,
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break false,
            }
        }
    })
    .await
    .unwrap();
    assert!(drained);

    pool.destroy().await.unwrap();
}

// =============================================================================
// Introspection
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_counters_track_work() {
    let pool = pool_with(|options| options.with_min_threads(1).with_max_threads(1));

    for n in 0..3 {
        assert_eq!(pool.submit(json!(n)).await.unwrap(), json!(n));
    }

    assert_eq!(pool.completed(), 3);
    assert_eq!(pool.active_tasks(), 0);
    assert_eq!(pool.queue_depth(), 0);
    assert!(pool.elapsed() > Duration::ZERO);
    assert_eq!(pool.config().max_threads, 1);
    assert_eq!(pool.runtime(), RuntimeKind::Thread);

    pool.destroy().await.unwrap();
}
