//! Integration tests for vdm-scheduler
//!
//! Drives whole simulations through `ResourceScheduler` and checks ordering,
//! isolation, periodic timing, messaging and failure handling.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use vdm_scheduler::{
    metric, operation, BusConfig, CpuConfig, ErrorKind, FnOperation, ObjectId, Operation,
    PeriodicSpec, Policy, ResourceScheduler, RunOutcome, RunResult, RunState, SchedulerConfig,
    SchedulerError, Signal, StoreView, TestStep, ThreadCx, ThreadKind, TraceKind, Value, Verdict,
    PERIODIC_OVERLAP_CODE,
};

fn scheduler() -> ResourceScheduler {
    ResourceScheduler::new(SchedulerConfig::default()).unwrap()
}

fn noop(name: &str) -> Arc<dyn Operation> {
    operation(name, |_cx, _args| async { Ok(Value::Void) })
}

/// Operation that appends `tag` to a shared log and returns
fn logging(name: &str, tag: usize, priority: u32, log: &Arc<Mutex<Vec<usize>>>) -> Arc<dyn Operation> {
    let log = Arc::clone(log);
    FnOperation::new(name, move |_cx, _args| {
        let log = Arc::clone(&log);
        async move {
            log.lock().push(tag);
            Ok(Value::Void)
        }
    })
    .with_priority(priority)
    .into_arc()
}

// ==================== Priority Ordering Tests ====================

#[test]
fn test_higher_priority_runs_first() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    sched.spawn_async(obj, logging("low", 0, 1, &log), vec![], false).unwrap();
    sched.spawn_async(obj, logging("high", 1, 5, &log), vec![], false).unwrap();
    sched.spawn_async(obj, logging("mid", 2, 3, &log), vec![], false).unwrap();

    assert_eq!(sched.run().unwrap(), RunOutcome::Completed(Value::Void));
    assert_eq!(*log.lock(), vec![1, 2, 0]);
}

#[test]
fn test_fcfs_ignores_priority() {
    let mut sched = scheduler();
    let cpu = sched
        .add_cpu(CpuConfig::new("cpu1").with_policy(Policy::Fcfs))
        .unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    sched.spawn_async(obj, logging("low", 0, 1, &log), vec![], false).unwrap();
    sched.spawn_async(obj, logging("high", 1, 5, &log), vec![], false).unwrap();

    sched.run().unwrap();
    assert_eq!(*log.lock(), vec![0, 1]);
}

#[test]
fn test_cpu_priority_override() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    sched.set_priority(cpu, "first", 9).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    sched.spawn_async(obj, logging("second", 0, 2, &log), vec![], false).unwrap();
    sched.spawn_async(obj, logging("first", 1, 1, &log), vec![], false).unwrap();

    sched.run().unwrap();
    assert_eq!(*log.lock(), vec![1, 0]);
}

proptest! {
    #[test]
    fn prop_priority_then_creation_order(priorities in prop::collection::vec(1u32..5, 1..8)) {
        let mut sched = scheduler();
        let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
        let obj = sched.deploy("obj", cpu).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for (tag, priority) in priorities.iter().enumerate() {
            let op = logging(&format!("op{}", tag), tag, *priority, &log);
            sched.spawn_async(obj, op, vec![], false).unwrap();
        }
        sched.run().unwrap();

        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by_key(|tag| std::cmp::Reverse(priorities[*tag]));
        prop_assert_eq!(log.lock().clone(), expected);
    }
}

// ==================== Periodic Activation Tests ====================

#[test]
fn test_two_periodic_chains_alternate() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let a = sched.deploy("a", cpu).unwrap();
    let b = sched.deploy("b", cpu).unwrap();
    let tick = noop("tick");

    sched
        .spawn_periodic(a, Arc::clone(&tick), vec![], PeriodicSpec::periodic(10))
        .unwrap();
    sched
        .spawn_periodic(b, tick, vec![], PeriodicSpec::periodic(10))
        .unwrap();

    assert_eq!(sched.run_until(25).unwrap(), RunOutcome::Stopped { at: 20 });
    let activations = sched.trace().activations();
    let expected: Vec<(u64, String)> = vec![
        (0, "a.tick#1".into()),
        (0, "b.tick#1".into()),
        (10, "a.tick#2".into()),
        (10, "b.tick#2".into()),
        (20, "a.tick#3".into()),
        (20, "b.tick#3".into()),
    ];
    assert_eq!(activations, expected);

    let metrics = sched.metrics();
    assert_eq!(metrics.get_counter(metric::PERIODIC_ACTIVATIONS), Some(6));
    assert_eq!(metrics.get_counter(metric::CLOCK_ADVANCES), Some(2));
}

#[test]
fn test_offset_delays_first_activation() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    sched
        .spawn_periodic(obj, noop("tick"), vec![], PeriodicSpec::periodic(10).with_offset(4))
        .unwrap();

    sched.run_until(30).unwrap();
    let times: Vec<u64> = sched.trace().activations().into_iter().map(|(t, _)| t).collect();
    assert_eq!(times, vec![4, 14, 24]);
}

#[test]
fn test_sporadic_follows_actual_start() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    sched
        .spawn_periodic(obj, noop("poll"), vec![], PeriodicSpec::sporadic(7))
        .unwrap();

    sched.run_until(20).unwrap();
    let times: Vec<u64> = sched.trace().activations().into_iter().map(|(t, _)| t).collect();
    assert_eq!(times, vec![0, 7, 14]);
}

#[test]
fn test_minimum_delay_clamps_period() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    sched
        .spawn_periodic(obj, noop("tick"), vec![], PeriodicSpec::periodic(2).with_delay(5))
        .unwrap();

    sched.run_until(12).unwrap();
    let times: Vec<u64> = sched.trace().activations().into_iter().map(|(t, _)| t).collect();
    assert_eq!(times, vec![0, 5, 10]);
}

#[test]
fn test_same_seed_same_activations() {
    let config = SchedulerConfig::default().with_seed(3);
    let mut sched = ResourceScheduler::new(config).unwrap();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let spec = PeriodicSpec::periodic(10).with_jitter(6);

    sched.spawn_periodic(obj, noop("tick"), vec![], spec).unwrap();
    sched.run_until(100).unwrap();
    let first = sched.trace().activations();

    sched.reset();
    assert_eq!(sched.current_time(), 0);
    sched.spawn_periodic(obj, noop("tick"), vec![], spec).unwrap();
    sched.run_until(100).unwrap();
    assert_eq!(sched.trace().activations(), first);
}

proptest! {
    #[test]
    fn prop_periodic_gaps_within_jitter(period in 1u64..40, jitter in 0u64..15, seed in any::<u64>()) {
        let mut sched = ResourceScheduler::new(SchedulerConfig::default().with_seed(seed)).unwrap();
        let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
        let obj = sched.deploy("obj", cpu).unwrap();
        let spec = PeriodicSpec::periodic(period).with_jitter(jitter);
        sched.spawn_periodic(obj, noop("tick"), vec![], spec).unwrap();
        sched.run_until(period * 12 + jitter * 12).unwrap();

        let times: Vec<u64> = sched.trace().activations().into_iter().map(|(t, _)| t).collect();
        prop_assert!(times.len() >= 2);
        for pair in times.windows(2) {
            let gap = pair[1] - pair[0];
            prop_assert!(gap >= period && gap <= period + jitter, "gap {} outside [{}, {}]", gap, period, period + jitter);
        }
    }
}

#[test]
fn test_overlap_limit_aborts_activation() {
    let config = SchedulerConfig::default().with_max_periodic_overlaps(2);
    let mut sched = ResourceScheduler::new(config).unwrap();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let slow = operation("slow", |cx: ThreadCx, _args| async move {
        let runs = cx.read_field("runs")?.add_int(1).map_err(|e| cx.runtime_error(e.to_string()))?;
        cx.write_field("runs", runs)?;
        cx.duration(100).await?;
        Ok(Value::Void)
    });

    sched
        .spawn_periodic(obj, slow, vec![], PeriodicSpec::periodic(10))
        .unwrap();
    match sched.run().unwrap() {
        RunOutcome::Failed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::PeriodicOverlap);
            assert_eq!(error.code, Some(PERIODIC_OVERLAP_CODE));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sched.current_time(), 20);
    // the third activation never ran its body
    assert_eq!(sched.read_committed(obj, "runs"), Value::Int(2));
    assert!(sched.threads().is_empty());
}

#[test]
fn test_invalid_periodic_rejected() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let result = sched.spawn_periodic(obj, noop("tick"), vec![], PeriodicSpec::periodic(0));
    assert!(matches!(result, Err(SchedulerError::InvalidPeriodic(_))));
}

// ==================== Transaction Isolation Tests ====================

#[test]
fn test_guard_wakes_on_commit() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();

    let consumer = operation("consume", move |cx: ThreadCx, _args| async move {
        cx.guard(move |view: &StoreView<'_>| view.int(obj, "ready") > 0)
            .await?;
        cx.write_field("seen", Value::Int(cx.now() as i64))?;
        Ok(Value::Void)
    });
    sched.spawn_async(obj, consumer, vec![], false).unwrap();

    let producer = operation("produce", move |cx: ThreadCx, _args| async move {
        cx.duration(3).await?;
        cx.write(obj, "ready", Value::Int(1))?;
        cx.duration(1).await?;
        Ok(cx.read(obj, "seen"))
    });
    let outcome = sched.spawn_main(producer, vec![]).unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Value::Int(3)));
}

#[test]
fn test_reader_sees_final_committed_value() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    sched.define_field(obj, "x", Value::Int(0)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let writer = FnOperation::new("writer", |cx: ThreadCx, _args| async move {
        cx.write_field("x", Value::Int(1))?;
        cx.write_field("x", Value::Int(2))?;
        Ok(Value::Void)
    })
    .with_priority(5)
    .into_arc();
    let seen = Arc::clone(&log);
    let reader = FnOperation::new("reader", move |cx: ThreadCx, _args| {
        let seen = Arc::clone(&seen);
        async move {
            let x = cx.read_field("x")?.as_int().unwrap_or(-1);
            seen.lock().push(x as usize);
            Ok(Value::Void)
        }
    })
    .with_priority(1)
    .into_arc();

    sched.spawn_async(obj, reader, vec![], false).unwrap();
    sched.spawn_async(obj, writer, vec![], false).unwrap();
    sched.run().unwrap();

    assert_eq!(*log.lock(), vec![2]);
    assert_eq!(sched.read_committed(obj, "x"), Value::Int(2));
}

#[test]
fn test_failed_thread_commits_its_writes() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let op = operation("partial", move |cx: ThreadCx, _args| async move {
        cx.write(obj, "x", Value::Int(5))?;
        Err(cx.runtime_error("late failure"))
    });

    assert!(matches!(sched.spawn_main(op, vec![]).unwrap(), RunOutcome::Failed { .. }));
    assert_eq!(sched.read_committed(obj, "x"), Value::Int(5));
}

#[test]
fn test_cancelled_thread_discards_late_writes() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();

    let sleeper = operation("sleeper", |cx: ThreadCx, _args| async move {
        cx.write_field("x", Value::Int(1))?;
        let woke = cx.duration(50).await;
        // runs only during cancellation
        cx.write_field("x", Value::Int(99))?;
        woke.map(|_| Value::Void)
    });
    sched.spawn_async(obj, sleeper, vec![], false).unwrap();
    let boom = operation("boom", |cx: ThreadCx, _args| async move {
        cx.duration(5).await?;
        Err(cx.runtime_error("boom"))
    });

    assert!(matches!(sched.spawn_main(boom, vec![]).unwrap(), RunOutcome::Failed { .. }));
    assert_eq!(sched.read_committed(obj, "x"), Value::Int(1));
}

// ==================== Messaging Tests ====================

#[test]
fn test_sync_call_over_bus_pays_latency() {
    let mut sched = scheduler();
    let cpu1 = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let cpu2 = sched.add_cpu(CpuConfig::new("cpu2")).unwrap();
    sched
        .add_bus(BusConfig::new("bus", vec![cpu1, cpu2]).with_latency(5))
        .unwrap();
    let client = sched.deploy("client", cpu1).unwrap();
    let server = sched.deploy("server", cpu2).unwrap();

    let get = operation("get", |_cx, _args| async { Ok(Value::Int(7)) });
    let relay = operation("relay", move |cx: ThreadCx, _args| {
        let get = Arc::clone(&get);
        async move {
            let v = cx.call(server, get, vec![]).await?;
            Ok(Value::Int(v.as_int().unwrap_or(0) + 1))
        }
    });

    let outcome = sched.spawn_sync(client, relay, vec![]).unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Value::Int(8)));
    // request and reply each cross the bus
    assert_eq!(sched.current_time(), 10);
}

#[test]
fn test_bus_serialises_messages() {
    let mut sched = scheduler();
    let cpu1 = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let cpu2 = sched.add_cpu(CpuConfig::new("cpu2")).unwrap();
    sched
        .add_bus(BusConfig::new("bus", vec![cpu1, cpu2]).with_latency(2).with_speed(1))
        .unwrap();
    let client = sched.deploy("client", cpu1).unwrap();
    let server = sched.deploy("server", cpu2).unwrap();

    let record = operation("record", |cx: ThreadCx, _args| async move {
        let count = cx.read_field("hits")?.add_int(1).map_err(|e| cx.runtime_error(e.to_string()))?;
        cx.write_field("hits", count)?;
        cx.write_field("last", Value::Int(cx.now() as i64))?;
        Ok(Value::Void)
    });
    let fan_out = operation("fan_out", move |cx: ThreadCx, _args| {
        let record = Arc::clone(&record);
        async move {
            cx.call_async(server, Arc::clone(&record), vec![Value::Int(1)], false)?;
            cx.call_async(server, record, vec![Value::Int(1), Value::Int(2)], false)?;
            Ok(Value::Void)
        }
    });
    sched.spawn_async(client, fan_out, vec![], false).unwrap();

    assert!(sched.run().unwrap().is_completed());
    assert_eq!(sched.read_committed(server, "hits"), Value::Int(2));
    // first message arrives at 0 + 2 + 1, the second waits for it: 3 + 2 + 2
    assert_eq!(sched.read_committed(server, "last"), Value::Int(7));
}

#[test]
fn test_no_bus_route_is_runtime_error() {
    let mut sched = scheduler();
    let cpu1 = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let cpu2 = sched.add_cpu(CpuConfig::new("cpu2")).unwrap();
    let client = sched.deploy("client", cpu1).unwrap();
    let server = sched.deploy("server", cpu2).unwrap();
    let get = noop("get");
    let relay = operation("relay", move |cx: ThreadCx, _args| {
        let get = Arc::clone(&get);
        async move { cx.call(server, get, vec![]).await }
    });

    match sched.spawn_sync(client, relay, vec![]).unwrap() {
        RunOutcome::Failed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::Runtime);
            assert!(error.message.contains("no bus route"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_async_reply_mailbox() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let server = sched.deploy("server", cpu).unwrap();
    let get = operation("get", |cx: ThreadCx, _args| async move {
        cx.duration(4).await?;
        Ok(Value::Int(7))
    });

    let handle = sched.spawn_async(server, Arc::clone(&get), vec![], true).unwrap();
    assert!(sched.take_reply(handle).is_none());
    assert!(sched.run().unwrap().is_completed());
    assert_eq!(sched.take_reply(handle), Some(Ok(Value::Int(7))));

    let caller = operation("caller", move |cx: ThreadCx, _args| {
        let get = Arc::clone(&get);
        async move {
            let handle = cx.call_async(server, get, vec![], true)?;
            cx.duration(1).await?;
            cx.await_reply(handle).await
        }
    });
    let outcome = sched.spawn_main(caller, vec![]).unwrap();
    assert_eq!(outcome, RunOutcome::Completed(Value::Int(7)));
    assert_eq!(sched.current_time(), 8);
}

// ==================== Time Tests ====================

#[test]
fn test_cycles_use_cpu_speed() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("fast").with_speed(4)).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let op = operation("crunch", |cx: ThreadCx, _args| async move {
        cx.cycles(10).await?;
        Ok(Value::Int(cx.now() as i64))
    });
    assert_eq!(
        sched.spawn_sync(obj, op, vec![]).unwrap(),
        RunOutcome::Completed(Value::Int(3))
    );
}

#[test]
fn test_timestep_waits_for_next_advance() {
    let mut sched = scheduler();
    let op = operation("step", |cx: ThreadCx, _args| async move {
        cx.timestep().await?;
        cx.sleep_until(9).await?;
        Ok(Value::Int(cx.now() as i64))
    });
    assert_eq!(
        sched.spawn_main(op, vec![]).unwrap(),
        RunOutcome::Completed(Value::Int(9))
    );
    assert_eq!(sched.metrics().get_counter(metric::CLOCK_ADVANCES), Some(2));
}

#[test]
fn test_time_limit_stops_run() {
    let config = SchedulerConfig::default().with_time_limit(15);
    let mut sched = ResourceScheduler::new(config).unwrap();
    let op = operation("long", |cx: ThreadCx, _args| async move {
        cx.duration(10).await?;
        cx.duration(10).await?;
        Ok(Value::Void)
    });
    assert_eq!(
        sched.spawn_main(op, vec![]).unwrap(),
        RunOutcome::Stopped { at: 10 }
    );
    assert_eq!(sched.threads().len(), 1);
}

// ==================== Deadlock Tests ====================

#[test]
fn test_unsatisfiable_guard_deadlocks() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let waiter = operation("waiter", move |cx: ThreadCx, _args| async move {
        cx.duration(4).await?;
        cx.guard(move |view: &StoreView<'_>| view.int(obj, "never") > 0)
            .await?;
        Ok(Value::Void)
    });
    sched.spawn_async(obj, waiter, vec![], false).unwrap();

    let report = match sched.run().unwrap() {
        RunOutcome::Deadlocked(report) => report,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(report.time, 4);
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].state, RunState::Waiting);
    assert_eq!(report.blocked[0].kind, ThreadKind::Async);
    assert!(sched.is_deadlocked());
    assert!(sched.error().is_none());

    // the clock is frozen until reset
    assert!(matches!(
        sched.run_until(100),
        Err(SchedulerError::Halted(Signal::Deadlocked))
    ));
    assert_eq!(sched.current_time(), 4);
    assert!(sched.threads().is_empty());
}

#[test]
fn test_main_waiting_on_itself_deadlocks() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let op = operation("stuck", move |cx: ThreadCx, _args| async move {
        cx.guard(move |view: &StoreView<'_>| view.int(obj, "flag") == 1)
            .await?;
        Ok(Value::Void)
    });
    let outcome = sched.spawn_main(op, vec![]).unwrap();
    assert!(matches!(outcome, RunOutcome::Deadlocked(_)));
    assert_eq!(sched.deadlock_report().map(|r| r.time), Some(0));
}

// ==================== Error Handling Tests ====================

struct Recurse;

impl Operation for Recurse {
    fn name(&self) -> &str {
        "recurse"
    }

    fn invoke(&self, cx: ThreadCx, args: Vec<Value>) -> BoxFuture<'static, RunResult<Value>> {
        async move { cx.invoke(None, Arc::new(Recurse), args).await }.boxed()
    }
}

#[test]
fn test_stack_overflow_is_unwrapped() {
    let config = SchedulerConfig::default().with_max_call_depth(3);
    let mut sched = ResourceScheduler::new(config).unwrap();
    match sched.spawn_main(Arc::new(Recurse), vec![]).unwrap() {
        RunOutcome::Failed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::StackOverflow);
            assert_eq!(error.context.len(), 3);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_first_error_wins() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let obj = sched.deploy("obj", cpu).unwrap();
    let first = operation("first", |cx: ThreadCx, _args| async move {
        Err(cx.runtime_error("first"))
    });
    let second = operation("second", |cx: ThreadCx, _args| async move {
        Err(cx.runtime_error("second"))
    });
    sched.spawn_async(obj, first, vec![], false).unwrap();
    sched.spawn_async(obj, second, vec![], false).unwrap();

    match sched.run().unwrap() {
        RunOutcome::Failed { error, .. } => assert_eq!(error.message, "first"),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sched.error().map(|(_, e)| e.message), Some("first".to_string()));
}

#[test]
fn test_unknown_object_rejected() {
    let mut sched = scheduler();
    let result = sched.spawn_sync(ObjectId::new(42), noop("x"), vec![]);
    assert!(matches!(result, Err(SchedulerError::UnknownObject(_))));
}

/// Caller that swallows the callee's failure and keeps going
fn forgiving_caller(server: ObjectId, callee: Arc<dyn Operation>) -> Arc<dyn Operation> {
    operation("caller", move |cx: ThreadCx, _args| {
        let callee = Arc::clone(&callee);
        async move {
            let _ = cx.call(server, callee, vec![]).await;
            cx.duration(5).await?;
            Ok(Value::Int(1))
        }
    })
}

/// Name and kind a thread was created with
fn created(sched: &ResourceScheduler, thread: vdm_scheduler::ThreadId) -> Option<(String, ThreadKind)> {
    sched.trace().events().iter().find_map(|event| match &event.kind {
        TraceKind::ThreadCreated { name, kind, .. } if event.thread == Some(thread) => {
            Some((name.clone(), *kind))
        }
        _ => None,
    })
}

#[test]
fn test_sync_callee_failure_halts_run() {
    let mut sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let server = sched.deploy("server", cpu).unwrap();
    let boom = operation("boom", |cx: ThreadCx, _args| async move {
        Err(cx.runtime_error("division by zero"))
    });

    // caller and callee share cpu1
    match sched.spawn_sync(server, forgiving_caller(server, boom), vec![]).unwrap() {
        RunOutcome::Failed { thread, error } => {
            assert_eq!(error.message, "division by zero");
            assert_eq!(created(&sched, thread), Some(("server.boom".to_string(), ThreadKind::Object)));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // the caller never got to consume its duration
    assert_eq!(sched.current_time(), 0);
}

#[test]
fn test_sync_callee_failure_across_bus_halts_on_arrival() {
    let mut sched = scheduler();
    let cpu1 = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let cpu2 = sched.add_cpu(CpuConfig::new("cpu2")).unwrap();
    sched
        .add_bus(BusConfig::new("bus", vec![cpu1, cpu2]).with_latency(3))
        .unwrap();
    let client = sched.deploy("client", cpu1).unwrap();
    let server = sched.deploy("server", cpu2).unwrap();
    sched.define_field(client, "ticks", Value::Int(0)).unwrap();
    let ticker = operation("ticker", |cx: ThreadCx, _args| async move {
        for _ in 0..10 {
            cx.duration(1).await?;
            let ticks = cx.read_field("ticks")?.add_int(1).map_err(|e| cx.runtime_error(e.to_string()))?;
            cx.write_field("ticks", ticks)?;
        }
        Ok(Value::Void)
    });
    sched.spawn_async(client, ticker, vec![], false).unwrap();
    let boom = operation("boom", |cx: ThreadCx, _args| async move {
        Err(cx.runtime_error("division by zero"))
    });

    match sched.spawn_sync(client, forgiving_caller(server, boom), vec![]).unwrap() {
        RunOutcome::Failed { thread, error } => {
            assert_eq!(error.message, "division by zero");
            assert_eq!(created(&sched, thread), Some(("server.boom".to_string(), ThreadKind::Object)));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    // halted when the request arrived, not after the reply crossed back
    assert_eq!(sched.current_time(), 3);
    assert!(sched.read_committed(client, "ticks").as_int().unwrap() <= 3);
}

#[test]
fn test_sync_callee_precondition_halts_outside_tests() {
    let Account { mut sched, acct } = account();
    match sched.spawn_main(forgiving_caller(acct, withdraw_all()), vec![]).unwrap() {
        RunOutcome::Failed { error, .. } => {
            assert_eq!(error.kind, ErrorKind::Precondition);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sched.current_time(), 0);
}

// ==================== Test Runner Tests ====================

struct Account {
    sched: ResourceScheduler,
    acct: ObjectId,
}

fn account() -> Account {
    let sched = scheduler();
    let cpu = sched.add_cpu(CpuConfig::new("cpu1")).unwrap();
    let acct = sched.deploy("acct", cpu).unwrap();
    sched.define_field(acct, "balance", Value::Int(0)).unwrap();
    Account { sched, acct }
}

fn deposit() -> Arc<dyn Operation> {
    operation("deposit", |cx: ThreadCx, args: Vec<Value>| async move {
        let amount = args.first().and_then(|v| v.as_int().ok()).unwrap_or(0);
        let balance = cx.read_field("balance")?.as_int().unwrap_or(0);
        cx.write_field("balance", Value::Int(balance + amount))?;
        Ok(Value::Void)
    })
}

fn withdraw() -> Arc<dyn Operation> {
    operation("withdraw", |cx: ThreadCx, args: Vec<Value>| async move {
        let amount = args.first().and_then(|v| v.as_int().ok()).unwrap_or(0);
        let balance = cx.read_field("balance")?.as_int().unwrap_or(0);
        if balance < amount {
            return Err(cx.precondition_failed("balance >= amount"));
        }
        cx.write_field("balance", Value::Int(balance - amount))?;
        Ok(Value::Int(balance - amount))
    })
}

fn withdraw_all() -> Arc<dyn Operation> {
    let withdraw = withdraw();
    operation("withdraw_all", move |cx: ThreadCx, _args| {
        let withdraw = Arc::clone(&withdraw);
        async move { withdraw.invoke(cx, vec![Value::Int(1)]).await }
    })
}

#[test]
fn test_verdict_passed() {
    let Account { mut sched, acct } = account();
    let result = sched
        .run_test(vec![
            TestStep::new(acct, deposit(), vec![Value::Int(10)]),
            TestStep::new(acct, withdraw(), vec![Value::Int(4)]),
        ])
        .unwrap();
    assert_eq!(result.verdict, Verdict::Passed);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[1].result, Ok(Value::Int(6)));
}

#[test]
fn test_verdict_inconclusive_for_direct_precondition() {
    let Account { mut sched, acct } = account();
    let result = sched
        .run_test(vec![
            TestStep::new(acct, withdraw(), vec![Value::Int(4)]),
            TestStep::new(acct, deposit(), vec![Value::Int(10)]),
        ])
        .unwrap();
    assert_eq!(result.verdict, Verdict::Inconclusive);
    // the sequence stops at the failing step
    assert_eq!(result.steps.len(), 1);
    assert!(!sched.is_deadlocked());
    assert!(sched.error().is_none());
}

#[test]
fn test_verdict_failed_for_nested_precondition() {
    let Account { mut sched, acct } = account();
    let audit = operation("audit", |cx: ThreadCx, _args| async move {
        cx.invoke(None, withdraw(), vec![Value::Int(1)]).await
    });
    let result = sched
        .run_test(vec![TestStep::new(acct, audit, vec![])])
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failed);
    let error = result.steps[0].result.clone().unwrap_err();
    assert_eq!(error.root_cause().kind, ErrorKind::Precondition);
    assert_eq!(error.root_cause().depth, 2);
}

#[test]
fn test_verdict_failed_for_runtime_error_in_step() {
    let Account { mut sched, acct } = account();
    let broken = operation("broken", |cx: ThreadCx, _args| async move {
        Err(cx.runtime_error("division by zero"))
    });
    let result = sched
        .run_test(vec![
            TestStep::new(acct, broken, vec![]),
            TestStep::new(acct, deposit(), vec![Value::Int(10)]),
        ])
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failed);
    assert_eq!(result.steps.len(), 1);
    assert!(result.fault.is_none());
    // the runner classified the failure, the run itself did not stop
    assert!(sched.error().is_none());
}

#[test]
fn test_verdict_failed_for_precondition_behind_nested_call() {
    let Account { mut sched, acct } = account();
    let audit = operation("audit", move |cx: ThreadCx, _args| async move {
        cx.call(acct, withdraw(), vec![Value::Int(1)]).await
    });
    let result = sched
        .run_test(vec![TestStep::new(acct, audit, vec![])])
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failed);
    let error = result.steps[0].result.clone().unwrap_err();
    assert_eq!(error.root_cause().depth, 2);
    assert!(sched.error().is_none());
}

#[test]
fn test_verdict_failed_when_another_thread_fails() {
    let Account { mut sched, acct } = account();
    let bad = operation("bad", |cx: ThreadCx, _args| async move {
        Err(cx.runtime_error("corrupt ledger"))
    });
    let kick = operation("kick", move |cx: ThreadCx, _args| {
        let bad = Arc::clone(&bad);
        async move {
            cx.call_async(cx.this()?, bad, vec![], false)?;
            cx.duration(10).await?;
            Ok(Value::Void)
        }
    });
    let result = sched
        .run_test(vec![TestStep::new(acct, kick, vec![])])
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failed);
    assert!(!result.deadlocked);
    assert_eq!(result.fault.map(|e| e.message), Some("corrupt ledger".to_string()));
}

#[test]
fn test_verdict_failed_on_deadlock() {
    let Account { mut sched, acct } = account();
    let stuck = operation("stuck", move |cx: ThreadCx, _args| async move {
        cx.guard(move |view: &StoreView<'_>| view.int(acct, "balance") > 100)
            .await?;
        Ok(Value::Void)
    });
    let result = sched
        .run_test(vec![TestStep::new(acct, stuck, vec![])])
        .unwrap();
    assert_eq!(result.verdict, Verdict::Failed);
    assert!(result.deadlocked);
}

// ==================== Trace Tests ====================

#[test]
fn test_trace_json_lines() {
    let mut sched = scheduler();
    let op = operation("work", |cx: ThreadCx, _args| async move {
        cx.duration(2).await?;
        Ok(Value::Void)
    });
    sched.spawn_main(op, vec![]).unwrap();

    let lines = sched.trace().to_json_lines().unwrap();
    let events: Vec<serde_json::Value> = lines
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events[0]["event"], "thread_created");
    assert!(events.iter().any(|e| e["event"] == "clock_advanced" && e["time"] == 2));
    assert_eq!(events.last().unwrap()["event"], "completed");
}
