use workpool::{Fifo, Priority, SubmitError, SubmitOptions, TaskError, ThreadPool};

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Polls `cond` until it holds or the timeout elapses.
fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn type_bounds() {
    fn is_send<T: Send>() {}
    fn is_sync<T: Sync>() {}

    is_send::<ThreadPool<Fifo>>();
    is_sync::<ThreadPool<Fifo>>();
    is_send::<ThreadPool<Priority>>();
    is_sync::<ThreadPool<Priority>>();
}

#[test]
fn fifo_square_sum() {
    let pool = ThreadPool::<Fifo>::new(10);

    let mut handles = Vec::new();
    for i in 0u64..10 {
        handles.push(pool.submit(move || i * i).unwrap());
    }

    let sum: u64 = handles.iter_mut().map(|h| h.recv().unwrap()).sum();
    assert_eq!(sum, 285);
}

#[test]
fn submit_round_trips_the_value() {
    let pool = ThreadPool::<Fifo>::single_thread();

    let payload = vec![0x00u8, 0xff, 0x7f, 0x80];
    let expected = payload.clone();
    let mut handle = pool.submit(move || payload.clone()).unwrap();

    assert_eq!(handle.recv().unwrap(), expected);
}

#[test]
fn fifo_preserves_program_order() {
    let pool = ThreadPool::<Fifo>::single_thread();
    let order = Arc::new(Mutex::new(Vec::new()));

    // Park the only worker so every record is queued before any runs.
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let _gate = pool
        .submit(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap()
        })
        .unwrap();
    started_rx.recv().unwrap();

    let mut handles = Vec::new();
    for i in 0..10 {
        let order = order.clone();
        handles.push(
            pool.submit(move || order.lock().unwrap().push(i))
                .unwrap(),
        );
    }

    gate_tx.send(()).unwrap();
    for handle in &mut handles {
        handle.recv().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn priority_order_on_single_worker() {
    let pool = ThreadPool::<Priority>::single_thread();
    let order = Arc::new(Mutex::new(Vec::new()));

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let _gate = pool
        .submit(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap()
        })
        .unwrap();
    started_rx.recv().unwrap();

    let mut handles = Vec::new();
    for i in 0u16..10 {
        let order = order.clone();
        handles.push(
            pool.submit_with(
                move || order.lock().unwrap().push(i),
                SubmitOptions::with_priority(i),
            )
            .unwrap(),
        );
    }

    gate_tx.send(()).unwrap();
    for handle in &mut handles {
        handle.recv().unwrap();
    }

    let observed = order.lock().unwrap().clone();
    assert_eq!(observed, (0..10).rev().collect::<Vec<_>>());
}

#[test]
fn retry_convergence() {
    let pool = ThreadPool::<Priority>::single_thread();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let mut handle = pool
        .submit_with(
            move || {
                counter.fetch_add(1, SeqCst);
                panic!("flaky dependency");
            },
            SubmitOptions::default().retries(3),
        )
        .unwrap();

    match handle.recv() {
        Err(TaskError::RetryExhausted {
            attempts: reported,
            reason,
        }) => {
            assert_eq!(reported, 4);
            assert_eq!(reason, "flaky dependency");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(attempts.load(SeqCst), 4);
}

#[test]
fn single_failure_reports_through_handle() {
    let pool = ThreadPool::<Fifo>::single_thread();

    let mut handle = pool
        .submit(|| -> u32 { panic!("no budget attached") })
        .unwrap();

    assert!(matches!(handle.recv(), Err(TaskError::Failed { .. })));

    // The worker survives the panic and keeps serving.
    let mut ok = pool.submit(|| 7).unwrap();
    assert_eq!(ok.recv().unwrap(), 7);
    assert_eq!(pool.workers_size(), 1);
}

#[test]
fn drain_on_shutdown() {
    let counter = Arc::new(AtomicUsize::new(0));

    {
        let pool = ThreadPool::<Fifo>::new(8);
        for _ in 0..10_000 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, SeqCst);
            })
            .unwrap();
        }
        // Dropped immediately; the destructor drains the backlog.
    }

    assert_eq!(counter.load(SeqCst), 10_000);
}

#[test]
fn shutdown_rejects_new_work_but_finishes_queued() {
    let pool = ThreadPool::<Fifo>::new(2);

    let mut handles = Vec::new();
    for i in 0..16 {
        handles.push(
            pool.submit(move || {
                thread::sleep(Duration::from_millis(5));
                i
            })
            .unwrap(),
        );
    }

    pool.shutdown();
    assert!(matches!(pool.submit(|| 0), Err(SubmitError::Shutdown)));

    for (i, handle) in handles.iter_mut().enumerate() {
        assert_eq!(handle.recv().unwrap(), i);
    }
}

#[test]
fn double_recv_reports_already_retrieved() {
    let pool = ThreadPool::<Fifo>::single_thread();

    let mut handle = pool.submit(|| 11).unwrap();
    assert_eq!(handle.recv().unwrap(), 11);
    assert!(matches!(handle.recv(), Err(TaskError::AlreadyRetrieved)));
}

#[test]
fn fixed_pool_keeps_its_worker_set() {
    let pool = ThreadPool::<Fifo>::new(3);
    assert!(!pool.is_adaptive());

    let before = pool.workers_size();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.workers_size(), before);
}

#[test]
fn adaptive_pool_grows_under_backlog() {
    let pool = ThreadPool::<Fifo>::builder()
        .workers(2)
        .max_workers(8)
        .adaptive_tick(Duration::from_millis(1))
        .build();

    assert_eq!(pool.workers_size(), 2);

    let mut handles = Vec::new();
    for _ in 0..64 {
        handles.push(
            pool.submit(|| thread::sleep(Duration::from_millis(50)))
                .unwrap(),
        );
    }

    assert!(
        wait_until(Duration::from_secs(5), || pool.workers_size() == 8),
        "worker set never reached the upper bound, stuck at {}",
        pool.workers_size()
    );

    for handle in &mut handles {
        handle.recv().unwrap();
    }
}

#[test]
fn adaptive_pool_shrinks_to_floor_when_idle() {
    let pool = ThreadPool::<Fifo>::builder()
        .workers(10)
        .max_workers(10)
        .adaptive_tick(Duration::from_millis(1))
        .build();

    assert_eq!(pool.workers_size(), 10);

    // floor = ceil(10 / 5)
    assert!(
        wait_until(Duration::from_secs(5), || pool.workers_size() == 2),
        "worker set never shrank to the floor, stuck at {}",
        pool.workers_size()
    );

    // The floor holds; the pool does not collapse further.
    thread::sleep(Duration::from_millis(100));
    assert!(pool.workers_size() >= 2);
}

#[test]
fn adaptive_pool_still_drains_on_drop() {
    let counter = Arc::new(AtomicUsize::new(0));

    {
        let pool = ThreadPool::<Priority>::builder()
            .workers(2)
            .max_workers(4)
            .adaptive_tick(Duration::from_millis(1))
            .build();

        for _ in 0..200 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, SeqCst);
            })
            .unwrap();
        }
    }

    assert_eq!(counter.load(SeqCst), 200);
}

#[test]
fn priority_pool_accepts_prebuilt_records() {
    use workpool::Task;

    let pool = ThreadPool::<Priority>::single_thread();

    let (mut task, mut handle) = Task::new(|| 5);
    task.increase_priority(3);
    task.increment_retries();
    assert_eq!(task.priority(), 3);
    assert_eq!(task.retries(), 1);

    pool.submit_task(task).unwrap();
    assert_eq!(handle.recv().unwrap(), 5);
}

#[test]
fn submit_task_after_shutdown_fulfils_handle() {
    use workpool::Task;

    let pool = ThreadPool::<Priority>::single_thread();
    pool.shutdown();

    let (task, mut handle) = Task::new(|| 5);
    assert!(matches!(pool.submit_task(task), Err(SubmitError::Shutdown)));
    assert!(matches!(handle.recv(), Err(TaskError::Shutdown)));
}

#[test]
fn concurrent_producers_each_get_their_result() {
    let pool = Arc::new(ThreadPool::<Fifo>::new(4));

    let mut producers = Vec::new();
    for p in 0u64..8 {
        let pool = pool.clone();
        producers.push(thread::spawn(move || {
            let mut handles = Vec::new();
            for i in 0..50 {
                handles.push(pool.submit(move || p * 1_000 + i).unwrap());
            }
            for (i, handle) in handles.iter_mut().enumerate() {
                assert_eq!(handle.recv().unwrap(), p * 1_000 + i as u64);
            }
        }));
    }

    for producer in producers {
        producer.join().unwrap();
    }
}
