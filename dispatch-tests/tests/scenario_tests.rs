// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use dispatch_runtime::{context, BoundRefPtr, Directory, DispatcherBuilder, SharedRefPtr};
use dispatch_tests::trace::{ExecutionTrace, TraceLog};
use std::collections::HashSet;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_primary_posts_to_secondary_and_back() {
    init_logging();
    let directory = Directory::new();
    let trace = ExecutionTrace::new();
    let secondary = directory.create_dispatcher("secondary").expect("secondary starts");

    let t1_trace = trace.clone();
    let t1_directory = directory.clone();
    directory
        .create_and_enter_dispatcher("primary", move || {
            t1_trace.record("T1");
            let t2_trace = t1_trace.clone();
            let t2_directory = t1_directory.clone();
            t1_directory
                .post_task_to("secondary", move || {
                    t2_trace.record("T2");
                    let t3_trace = t2_trace.clone();
                    t2_directory
                        .post_task_to("primary", move || {
                            t3_trace.record("T3");
                            context::end();
                        })
                        .expect("primary is registered");
                })
                .expect("secondary is registered");
        })
        .expect("primary entered");

    assert_eq!(trace.labels(), vec!["T1", "T2", "T3"]);
    let on = |label: &str| trace.find(label).and_then(|event| event.dispatcher);
    assert_eq!(on("T1").as_deref(), Some("primary"));
    assert_eq!(on("T2").as_deref(), Some("secondary"));
    assert_eq!(on("T3").as_deref(), Some("primary"));

    assert!(!secondary.is_completed());
    secondary.stop();
    assert!(secondary.wait());
    directory.wait_all();
}

#[test]
fn test_reply_runs_on_the_posting_thread() {
    init_logging();
    let directory = Directory::new();
    let trace = ExecutionTrace::new();
    directory.create_dispatcher("backend").expect("backend starts");

    let recorder = trace.clone();
    let inner_directory = directory.clone();
    directory
        .create_and_enter_dispatcher("frontend", move || {
            recorder.record("request");
            let task_trace = recorder.clone();
            let reply_trace = recorder.clone();
            inner_directory
                .post_task_and_reply_to(
                    "backend",
                    move || task_trace.record("work"),
                    move || {
                        reply_trace.record("reply");
                        context::end();
                    },
                )
                .expect("backend is registered");
        })
        .expect("frontend entered");

    let request = trace.find("request").expect("request recorded");
    let work = trace.find("work").expect("work recorded");
    let reply = trace.find("reply").expect("reply recorded");
    assert_eq!(reply.thread, request.thread);
    assert_ne!(work.thread, request.thread);
    assert_eq!(work.dispatcher.as_deref(), Some("backend"));
    assert!(work.elapsed_usec <= reply.elapsed_usec);

    directory.stop("backend").expect("backend is registered");
    directory.wait_all();
}

#[test]
fn test_pool_runs_each_task_once_across_workers() {
    init_logging();
    let directory = Directory::new();
    let pool = directory.create_pool("fanout", Some(4)).expect("pool starts");
    let (tx, rx) = mpsc::channel();

    for i in 0..200usize {
        let tx = tx.clone();
        pool.post_task(move || {
            thread::sleep(Duration::from_micros(200));
            let worker = context::current_queue().map(|q| q.name().to_string());
            tx.send((i, worker)).unwrap();
        });
    }

    let mut tasks = HashSet::new();
    let mut workers = HashSet::new();
    for _ in 0..200 {
        let (i, worker) = rx.recv_timeout(TIMEOUT).expect("task ran");
        assert!(tasks.insert(i), "task {i} ran twice");
        workers.insert(worker.expect("ran on a worker"));
    }
    assert!(workers.len() > 1, "only {workers:?} did any work");
    assert_eq!(pool.tasks_dispatched(), 200);

    pool.stop();
    directory.wait_all();
    assert_eq!(pool.active_workers(), 0);
}

#[test]
fn test_barrier_returns_promptly_after_last_completion() {
    init_logging();
    let directory = Directory::new();
    let finished = Arc::new(AtomicUsize::new(0));

    for i in 0..5u64 {
        let finished = finished.clone();
        directory
            .spawn(
                DispatcherBuilder::new()
                    .name(format!("sleeper-{i}"))
                    .keep_alive(false)
                    .entry(move || {
                        context::post_delayed_task(
                            move || {
                                finished.fetch_add(1, Ordering::SeqCst);
                            },
                            Duration::from_millis(10 * (i + 1)),
                        );
                    }),
            )
            .expect("sleeper starts");
    }

    let start = Instant::now();
    directory.wait_all();
    assert_eq!(finished.load(Ordering::SeqCst), 5);
    assert!(start.elapsed() < TIMEOUT);
    assert_eq!(directory.active_count(), 0);
}

#[test]
fn test_bound_payload_travels_and_returns_to_owner() {
    init_logging();
    let directory = Directory::new();
    directory.create_dispatcher("courier").expect("courier starts");
    let (tx, rx) = mpsc::channel();

    let inner_directory = directory.clone();
    directory
        .create_and_enter_dispatcher("home", move || {
            let payload = BoundRefPtr::new(vec![1u64, 2, 3]);
            let back = inner_directory.clone();
            inner_directory
                .post_task_to("courier", move || {
                    let accessible_on_courier = payload.is_accessible();
                    back.post_task_to("home", move || {
                        let sum: u64 = payload.iter().sum();
                        tx.send((accessible_on_courier, sum, payload.ref_count()))
                            .unwrap();
                        context::end();
                    })
                    .expect("home is registered");
                })
                .expect("courier is registered");
        })
        .expect("home entered");

    let (accessible_on_courier, sum, refs) = rx.recv_timeout(TIMEOUT).expect("payload returned");
    assert!(!accessible_on_courier);
    assert_eq!(sum, 6);
    assert_eq!(refs, 1);

    directory.stop("courier").expect("courier is registered");
    directory.wait_all();
}

#[test]
fn test_bound_payload_touched_off_thread_terminates_dispatcher() {
    init_logging();
    let directory = Directory::new();
    let intruder = directory.create_dispatcher("intruder").expect("intruder starts");
    let payload = BoundRefPtr::new(String::from("mine"));

    intruder.post_task(move || {
        let _ = payload.len();
    });

    assert!(intruder.wait());
    assert!(intruder.is_completed());
    assert!(directory.wait_all_timeout(TIMEOUT));
}

#[test]
fn test_shared_payload_freed_once_after_pool_work() {
    init_logging();

    struct Tracked(Arc<AtomicUsize>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let directory = Directory::new();
    let pool = directory.create_pool("readers", Some(3)).expect("pool starts");
    let payload = SharedRefPtr::new(Tracked(drops.clone()));
    let (tx, rx) = mpsc::channel();

    for _ in 0..30 {
        let copy = payload.clone();
        let tx = tx.clone();
        pool.post_task(move || {
            assert!(copy.ref_count() >= 1);
            drop(copy);
            tx.send(()).unwrap();
        });
    }
    for _ in 0..30 {
        rx.recv_timeout(TIMEOUT).expect("reader ran");
    }

    assert_eq!(payload.ref_count(), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(payload);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    pool.stop();
    directory.wait_all();
}

#[test]
fn test_ping_pong_demo() {
    let ping_pong = env!("CARGO_BIN_EXE_ping-pong");
    let out = Command::new(ping_pong)
        .args(["--rounds", "2", "--burst", "10", "--pool-size", "2", "--json"])
        .output()
        .unwrap_or_else(|e| panic!("failed to run ping-pong: {e}"));

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let log: TraceLog = serde_json::from_slice(&out.stdout).expect("trace is valid JSON");
    let labels: Vec<&str> = log.events.iter().map(|e| e.label.as_str()).collect();

    assert_eq!(&labels[..5], &["ping-0", "pong-0", "ping-1", "pong-1", "ping-2"]);
    assert_eq!(labels.last(), Some(&"finished"));
    assert_eq!(labels.iter().filter(|l| l.starts_with("burst-")).count(), 10);
}

#[test]
fn test_stress_demo_terminates() {
    let stress = env!("CARGO_BIN_EXE_stress");
    let out = Command::new(stress)
        .args(["--seed", "3", "--actions", "500", "--max-burst", "20", "--runs", "3"])
        .output()
        .unwrap_or_else(|e| panic!("failed to run stress: {e}"));

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout.lines().count(), 3);
}

#[test]
fn test_delayed_tasks_demo_runs_in_trigger_order() {
    let delayed = env!("CARGO_BIN_EXE_delayed-tasks");
    let out = Command::new(delayed)
        .args(["--count", "4", "--step-ms", "5", "--json"])
        .output()
        .unwrap_or_else(|e| panic!("failed to run delayed-tasks: {e}"));

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let log: TraceLog = serde_json::from_slice(&out.stdout).expect("trace is valid JSON");
    let labels: Vec<&str> = log.events.iter().map(|e| e.label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["immediate", "delayed-1", "delayed-2", "delayed-3", "delayed-4"]
    );
    assert!(log.events[4].elapsed_usec >= 20_000);
}
