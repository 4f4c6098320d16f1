//! Facade-level behavior: admission failures, shutdown, executor faults

use anvil_scheduler::{Callbacks, Clock, DynamicBatchScheduler};
use anvil_types::{
    InferenceRequest, InputTensor, OverflowAction, QueuePolicy, RequestOutcome, Responder,
    ScheduleError, SchedulerConfig,
};
use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn request(value: i64) -> (InferenceRequest, mpsc::Receiver<RequestOutcome>) {
    let (responder, rx) = Responder::channel();
    let req = InferenceRequest::new(vec![InputTensor::scalar("i", value)], responder);
    (req, rx)
}

fn scalar_value(request: &InferenceRequest) -> i64 {
    request.input("i").expect("scalar input").as_i64s()[0]
}

/// Identity executor; negative values block until released
fn gated_identity(
    started: mpsc::Sender<i64>,
    release: Arc<Mutex<mpsc::Receiver<()>>>,
) -> Callbacks {
    Callbacks::new(move |_runner_id, requests: &mut [InferenceRequest]| {
        for request in requests.iter_mut() {
            if scalar_value(request) < 0 {
                started.send(scalar_value(request)).unwrap();
                release.lock().unwrap().recv().unwrap();
            }
            let outputs = request.inputs.clone();
            request.set_outputs(outputs);
        }
        Ok(())
    })
}

/// Single pinned runner with immediate dispatch, depth-1 level
fn pinned_config(overflow_action: OverflowAction) -> SchedulerConfig {
    SchedulerConfig {
        runner_count: 1,
        preferred_batch_sizes: BTreeSet::new(),
        max_queue_delay: Duration::ZERO,
        default_queue_policy: QueuePolicy {
            max_queue_size: 1,
            overflow_action,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn full_level_rejects_new_request() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let callbacks = gated_identity(started_tx, Arc::new(Mutex::new(release_rx)));
    let scheduler =
        DynamicBatchScheduler::create(pinned_config(OverflowAction::RejectNew), callbacks).unwrap();

    let (blocker, _blocker_rx) = request(-1);
    scheduler.enqueue(blocker).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let (queued, queued_rx) = request(1);
    scheduler.enqueue(queued).unwrap();

    let (overflow, overflow_rx) = request(2);
    let result = scheduler.enqueue(overflow);
    assert!(matches!(result, Err(ScheduleError::QueueFull { .. })));
    let outcome = overflow_rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome.status, Err(ScheduleError::QueueFull { .. })));

    release_tx.send(()).unwrap();
    assert!(queued_rx.recv_timeout(WAIT).unwrap().is_ok());

    let metrics = scheduler.metrics();
    assert_eq!(metrics.rejected, 1);
    assert_eq!(metrics.enqueued, 2);
}

#[test]
fn full_level_displaces_oldest_request() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let callbacks = gated_identity(started_tx, Arc::new(Mutex::new(release_rx)));
    let scheduler =
        DynamicBatchScheduler::create(pinned_config(OverflowAction::RejectOldest), callbacks)
            .unwrap();

    let (blocker, _blocker_rx) = request(-1);
    scheduler.enqueue(blocker).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let (old, old_rx) = request(1);
    scheduler.enqueue(old).unwrap();
    let (new, new_rx) = request(2);
    scheduler.enqueue(new).unwrap();

    // The older request was pushed out with a displacement failure
    let outcome = old_rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(
        outcome.status,
        Err(ScheduleError::QueueDisplaced { .. })
    ));

    release_tx.send(()).unwrap();
    let outcome = new_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(outcome.outputs[0].as_i64s(), vec![2]);
    assert_eq!(scheduler.metrics().displaced, 1);
}

#[test]
fn out_of_range_priority_is_rejected() {
    let callbacks = Callbacks::new(|_id, _requests: &mut [InferenceRequest]| Ok(()));
    let scheduler = DynamicBatchScheduler::create(SchedulerConfig::default(), callbacks).unwrap();

    let (req, rx) = request(1);
    let result = scheduler.enqueue(req.with_priority(7));
    assert!(matches!(
        result,
        Err(ScheduleError::InvalidPriority {
            priority: 7,
            levels: 1
        })
    ));
    let outcome = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(
        outcome.status,
        Err(ScheduleError::InvalidPriority { .. })
    ));
}

#[test]
fn per_request_timeout_override_expires_early() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let callbacks = gated_identity(started_tx, Arc::new(Mutex::new(release_rx)));
    let config = SchedulerConfig {
        runner_count: 1,
        preferred_batch_sizes: BTreeSet::new(),
        max_queue_delay: Duration::ZERO,
        ..Default::default()
    };
    let scheduler = DynamicBatchScheduler::create(config, callbacks).unwrap();

    let (blocker, _blocker_rx) = request(-1);
    scheduler.enqueue(blocker).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let (responder, rx) = Responder::channel();
    let victim = InferenceRequest::new(vec![InputTensor::scalar("i", 1)], responder)
        .with_timeout(Duration::from_millis(2));
    scheduler.enqueue(victim).unwrap();

    std::thread::sleep(Duration::from_millis(30));
    release_tx.send(()).unwrap();

    let outcome = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome.status, Err(ScheduleError::TimedOut { .. })));
}

#[test]
fn shutdown_drains_residual_requests() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let callbacks = gated_identity(started_tx, Arc::new(Mutex::new(release_rx)));
    let config = SchedulerConfig {
        runner_count: 1,
        preferred_batch_sizes: BTreeSet::new(),
        max_queue_delay: Duration::ZERO,
        ..Default::default()
    };
    let scheduler = DynamicBatchScheduler::create(config, callbacks).unwrap();

    let (blocker, blocker_rx) = request(-1);
    scheduler.enqueue(blocker).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let (residual, residual_rx) = request(1);
    scheduler.enqueue(residual).unwrap();

    // Unblock the in-flight batch while the destructor is joining
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();
    });
    drop(scheduler);
    releaser.join().unwrap();

    // The in-hand batch drained normally; the queued request was failed
    assert!(blocker_rx.recv_timeout(WAIT).unwrap().is_ok());
    let outcome = residual_rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome.status, Err(ScheduleError::ShuttingDown)));
}

#[test]
fn batch_error_reaches_every_request() {
    let callbacks = Callbacks::new(|_id, _requests: &mut [InferenceRequest]| {
        Err(ScheduleError::execute_failed("backend fault"))
    });
    let config = SchedulerConfig {
        preferred_batch_sizes: BTreeSet::from([2]),
        max_queue_delay: Duration::from_millis(10),
        runner_count: 1,
        ..Default::default()
    };
    let scheduler = DynamicBatchScheduler::create(config, callbacks).unwrap();

    let (r1, r1_rx) = request(1);
    let (r2, r2_rx) = request(2);
    scheduler.enqueue(r1).unwrap();
    scheduler.enqueue(r2).unwrap();

    for rx in [r1_rx, r2_rx] {
        let outcome = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(
            outcome.status,
            Err(ScheduleError::ExecuteFailed { .. })
        ));
        assert!(outcome.outputs.is_empty());
    }
    assert_eq!(scheduler.metrics().batch_failures, 1);
}

#[test]
fn executor_panic_is_contained() {
    let callbacks = Callbacks::new(|_id, requests: &mut [InferenceRequest]| {
        for request in requests.iter_mut() {
            if scalar_value(request) == 13 {
                panic!("unlucky batch");
            }
            let outputs = request.inputs.clone();
            request.set_outputs(outputs);
        }
        Ok(())
    });
    let config = SchedulerConfig {
        runner_count: 1,
        preferred_batch_sizes: BTreeSet::new(),
        max_queue_delay: Duration::ZERO,
        ..Default::default()
    };
    let scheduler = DynamicBatchScheduler::create(config, callbacks).unwrap();

    let (poisoned, poisoned_rx) = request(13);
    scheduler.enqueue(poisoned).unwrap();
    let outcome = poisoned_rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(
        outcome.status,
        Err(ScheduleError::ExecuteFailed { .. })
    ));

    // The worker survived and keeps serving
    let (healthy, healthy_rx) = request(1);
    scheduler.enqueue(healthy).unwrap();
    let outcome = healthy_rx.recv_timeout(WAIT).unwrap();
    assert!(outcome.is_ok());
}

#[test]
fn disabled_batching_dispatches_head_only() {
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sizes_in = Arc::clone(&sizes);
    let callbacks = Callbacks::new(move |_id, requests: &mut [InferenceRequest]| {
        sizes_in.lock().unwrap().push(requests.len());
        for request in requests.iter_mut() {
            let outputs = request.inputs.clone();
            request.set_outputs(outputs);
        }
        Ok(())
    });
    let config = SchedulerConfig {
        dynamic_batching_enabled: false,
        preferred_batch_sizes: BTreeSet::from([4]),
        max_batch_size: 4,
        runner_count: 1,
        ..Default::default()
    };
    let scheduler = DynamicBatchScheduler::create(config, callbacks).unwrap();

    let mut receivers = Vec::new();
    for value in 1..=3 {
        let (req, rx) = request(value);
        scheduler.enqueue(req).unwrap();
        receivers.push(rx);
    }
    for rx in receivers {
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    }
    assert_eq!(*sizes.lock().unwrap(), vec![1, 1, 1]);
}

#[test]
fn failed_runner_init_aborts_construction() {
    let callbacks = Callbacks::new(|_id, _requests: &mut [InferenceRequest]| Ok(()))
        .with_init(|runner_id| {
            if runner_id == 1 {
                Err(ScheduleError::internal("no device for runner"))
            } else {
                Ok(())
            }
        });
    let config = SchedulerConfig {
        runner_count: 2,
        ..Default::default()
    };
    let result = DynamicBatchScheduler::create(config, callbacks);
    assert!(result.is_err());
}

#[test]
fn injected_clock_drives_queue_timeouts() {
    use anvil_scheduler::ManualClock;

    let callbacks = Callbacks::new(|_id, requests: &mut [InferenceRequest]| {
        for request in requests.iter_mut() {
            let outputs = request.inputs.clone();
            request.set_outputs(outputs);
        }
        Ok(())
    });
    let config = SchedulerConfig {
        runner_count: 1,
        // A preferred size above 1 keeps the lone request waiting
        preferred_batch_sizes: BTreeSet::from([2]),
        max_queue_delay: Duration::from_millis(10),
        default_queue_policy: QueuePolicy {
            default_timeout: Some(Duration::from_millis(5)),
            ..Default::default()
        },
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::new());
    let scheduler =
        DynamicBatchScheduler::create_with_clock(
            config,
            callbacks,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap();

    let (req, rx) = request(1);
    scheduler.enqueue(req).unwrap();

    // On the injected timeline the request is now long past its deadline
    clock.advance(Duration::from_millis(20));

    let outcome = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(outcome.status, Err(ScheduleError::TimedOut { .. })));
}

#[test]
fn metrics_track_dispatches() {
    let callbacks = Callbacks::new(|_id, requests: &mut [InferenceRequest]| {
        for request in requests.iter_mut() {
            let outputs = request.inputs.clone();
            request.set_outputs(outputs);
        }
        Ok(())
    });
    let config = SchedulerConfig {
        runner_count: 1,
        preferred_batch_sizes: BTreeSet::new(),
        max_queue_delay: Duration::ZERO,
        ..Default::default()
    };
    let scheduler = DynamicBatchScheduler::create(config, callbacks).unwrap();

    let mut receivers = Vec::new();
    for value in 1..=4 {
        let (req, rx) = request(value);
        scheduler.enqueue(req).unwrap();
        receivers.push(rx);
    }
    for rx in receivers {
        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    }

    let metrics = scheduler.metrics();
    assert_eq!(metrics.enqueued, 4);
    assert_eq!(metrics.requests_dispatched, 4);
    assert!(metrics.batches_executed >= 1);
    assert!(metrics.avg_batch_size >= 1.0);
}
