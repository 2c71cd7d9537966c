//! End-to-end scenarios for the cultio scheduler.
//!
//! These tests drive routines across real worker threads: continuation
//! chains, failure propagation, participant checks and every interrupt
//! policy against both parked and computing routines.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded};
use cultio::signal::{SIGINT, SIGTERM};
use cultio::{
    Failure, InterruptPolicy, Promise, Routine, RuntimeError, Scheduler, SchedulerConfig,
    SchedulerHandle,
};
use pretty_assertions::assert_eq;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn scheduler(workers: usize) -> Scheduler {
    Scheduler::with_config(
        SchedulerConfig::new()
            .with_max_workers(workers)
            .allow_any_home_thread(),
    )
    .unwrap()
}

/// Poll until `condition` holds, panicking after a few seconds.
fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Spawn a routine that parks on a promise it created, and hand that
/// promise back once the routine is parked.
fn parked_routine(scheduler: &Scheduler, name: &str) -> (Routine<i32>, Promise<i32>) {
    let handle = scheduler.handle();
    let (tx, rx) = bounded(1);

    let routine = scheduler
        .routine_named(name, move || {
            let promise = handle.promise::<i32>()?;
            let future = promise.future()?;
            tx.send(promise).map_err(Failure::new)?;
            Ok(future.wait(WAIT)?)
        })
        .unwrap();
    routine.spawn().unwrap();

    let promise = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    wait_until(|| routine.handle().is_parked());
    (routine, promise)
}

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded for {0}")]
struct QuotaExceeded(&'static str);

// ============================================================================
// Continuations and Failures
// ============================================================================

#[test]
fn test_callback_chain_on_single_worker() {
    let scheduler = scheduler(1);

    let a = scheduler
        .routine_named("a", || {
            thread::sleep(Duration::from_millis(20));
            Ok(42)
        })
        .unwrap();
    let b = a
        .future()
        .unwrap()
        .callback_routine_named("b", |p: Promise<i32>| Ok(p.get()? * 2))
        .unwrap();

    assert!(!b.is_spawned());
    a.spawn().unwrap();

    assert_eq!(b.future().unwrap().wait(WAIT).unwrap(), 84);
    assert_eq!(a.future().unwrap().wait(WAIT).unwrap(), 42);
}

#[test]
fn test_failure_is_reraised_unchanged() {
    let scheduler = scheduler(2);
    let failure = Failure::new(QuotaExceeded("uploads"));
    let raised = failure.clone();

    let routine = scheduler
        .routine(move || -> Result<i32, Failure> { Err(raised) })
        .unwrap();
    let forward = routine
        .future()
        .unwrap()
        .callback_routine(|p: Promise<i32>| Ok(p.get()? + 1))
        .unwrap();
    routine.spawn().unwrap();

    for future in [routine.future().unwrap(), forward.future().unwrap()] {
        match future.wait(WAIT) {
            Err(RuntimeError::Failed(seen)) => {
                assert!(seen.ptr_eq(&failure));
                assert_eq!(seen.downcast_ref::<QuotaExceeded>().map(|e| e.0), Some("uploads"));
            }
            other => panic!("expected the original failure, got {:?}", other),
        }
    }
}

#[test]
fn test_promise_from_unregistered_thread() {
    let scheduler = scheduler(1);
    let handle: SchedulerHandle = scheduler.handle();

    let result = thread::spawn(move || {
        let promise = handle.promise::<i32>().map(|_| ());
        let routine = handle.routine(|| Ok(1)).map(|_| ());
        (promise, routine)
    })
    .join()
    .unwrap();

    assert!(matches!(result.0, Err(RuntimeError::NotParticipant)));
    assert!(matches!(result.1, Err(RuntimeError::NotParticipant)));
}

#[test]
fn test_spawning_twice_is_rejected() {
    let scheduler = scheduler(1);
    let routine = scheduler.routine(|| Ok("once")).unwrap();

    routine.spawn().unwrap();
    assert!(matches!(routine.spawn(), Err(RuntimeError::AlreadySpawned)));
    assert_eq!(routine.future().unwrap().wait(WAIT).unwrap(), "once");
}

#[test]
fn test_many_routines_across_workers() {
    let scheduler = scheduler(4);
    let routines: Vec<_> = (0..64)
        .map(|i| {
            let routine = scheduler.routine(move || Ok(i * 2)).unwrap();
            routine.spawn().unwrap();
            routine
        })
        .collect();

    let sum: i32 = routines
        .iter()
        .map(|r| r.future().unwrap().wait(WAIT).unwrap())
        .sum();
    assert_eq!(sum, (0..64).map(|i| i * 2).sum());
}

// ============================================================================
// Interrupts on Parked Routines
// ============================================================================

#[test]
fn test_ignored_interrupt_has_no_effect() {
    let scheduler = scheduler(2);
    let (routine, promise) = parked_routine(&scheduler, "ignoring");
    routine.set_interrupt(SIGTERM, InterruptPolicy::Ignore);

    assert!(scheduler.interrupt(routine.handle(), SIGTERM));
    thread::sleep(Duration::from_millis(20));
    assert!(routine.handle().is_parked());
    assert!(routine.handle().enqueued_interrupts().is_empty());

    promise.set_result(5);
    assert_eq!(routine.future().unwrap().wait(WAIT).unwrap(), 5);
}

#[test]
fn test_raise_wakes_parked_wait() {
    let scheduler = scheduler(2);
    let (routine, promise) = parked_routine(&scheduler, "raising");

    assert!(scheduler.interrupt(routine.handle(), SIGTERM));

    match routine.future().unwrap().wait(WAIT) {
        Err(RuntimeError::Failed(failure)) => {
            let error = failure.downcast_ref::<RuntimeError>().unwrap();
            assert_eq!(error.interrupt(), Some(SIGTERM));
        }
        other => panic!("expected an interrupt, got {:?}", other),
    }
    assert!(!promise.is_set());
}

#[test]
fn test_handler_spawns_one_routine() {
    let scheduler = scheduler(2);
    let (routine, promise) = parked_routine(&scheduler, "handled");
    let (tx, rx) = unbounded();

    routine.set_interrupt(
        SIGINT,
        InterruptPolicy::handler(move |signal| {
            tx.send(signal).map_err(Failure::new)?;
            Ok(())
        }),
    );
    assert!(scheduler.interrupt(routine.handle(), SIGINT));

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), SIGINT);
    assert!(routine.handle().is_parked());

    promise.set_result(3);
    assert_eq!(routine.future().unwrap().wait(WAIT).unwrap(), 3);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(rx.try_iter().count(), 0);
}

#[test]
fn test_enqueued_interrupt_is_recorded() {
    let scheduler = scheduler(2);
    let (routine, promise) = parked_routine(&scheduler, "enqueuing");
    routine.set_interrupt(SIGTERM, InterruptPolicy::Enqueue);

    assert!(scheduler.interrupt(routine.handle(), SIGTERM));
    assert!(scheduler.interrupt(routine.handle(), SIGTERM));

    promise.set_result(1);
    assert_eq!(routine.future().unwrap().wait(WAIT).unwrap(), 1);
    assert_eq!(routine.handle().take_enqueued_interrupts(), vec![SIGTERM, SIGTERM]);
}

#[test]
fn test_worker_handle_routes_to_current_routine() {
    let scheduler = scheduler(1);
    let (routine, _promise) = parked_routine(&scheduler, "on-worker");

    let worker = scheduler
        .workers()
        .into_iter()
        .find(|w| w.current_routine().as_ref() == Some(routine.handle()))
        .unwrap();
    worker.interrupt(SIGTERM);

    assert!(matches!(
        routine.future().unwrap().wait(WAIT),
        Err(RuntimeError::Failed(_))
    ));
}

// ============================================================================
// Interrupts on Computing Routines
// ============================================================================

#[test]
fn test_checkpoint_surfaces_injected_interrupt() {
    let scheduler = scheduler(1);
    let handle = scheduler.handle();
    let (started, started_rx) = bounded(1);

    let routine = scheduler
        .routine_named("spinner", move || {
            started.send(()).map_err(Failure::new)?;
            for _ in 0..5_000 {
                handle.checkpoint()?;
                thread::sleep(Duration::from_millis(1));
            }
            Ok(false)
        })
        .unwrap();
    routine.spawn().unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(scheduler.interrupt(routine.handle(), SIGTERM));

    match routine.future().unwrap().wait(WAIT) {
        Err(RuntimeError::Failed(failure)) => {
            assert!(matches!(
                failure.downcast_ref::<RuntimeError>(),
                Some(RuntimeError::Interrupted(signal)) if *signal == SIGTERM
            ));
        }
        other => panic!("expected an interrupt, got {:?}", other),
    }
}

#[test]
fn test_interrupt_losing_race_is_dropped() {
    let scheduler = scheduler(1);
    let (started, started_rx) = bounded(1);

    let routine = scheduler
        .routine(move || {
            started.send(()).map_err(Failure::new)?;
            thread::sleep(Duration::from_millis(30));
            Ok(7)
        })
        .unwrap();
    routine.spawn().unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(scheduler.interrupt(routine.handle(), SIGTERM));
    assert_eq!(routine.future().unwrap().wait(WAIT).unwrap(), 7);

    wait_until(|| scheduler.workers()[0].is_idle());
    assert!(!scheduler.interrupt(routine.handle(), SIGTERM));
}

// ============================================================================
// Home Thread and Shutdown
// ============================================================================

#[test]
fn test_interrupt_home_wait() {
    let scheduler = scheduler(1);
    let routine = scheduler
        .routine(|| {
            thread::sleep(Duration::from_secs(1));
            Ok(())
        })
        .unwrap();
    routine.spawn().unwrap();
    let future = routine.future().unwrap();

    let handle = scheduler.handle();
    let interrupter = thread::spawn(move || {
        wait_until(|| handle.home_routine().is_parked());
        handle.interrupt_home(SIGINT);
    });

    let result = future.wait(None);
    interrupter.join().unwrap();

    match result {
        Err(err @ RuntimeError::Interrupted(_)) => assert_eq!(err.to_string(), "keyboard interrupt"),
        other => panic!("expected keyboard interrupt, got {:?}", other),
    }
    assert!(future.is_interrupted());
}

#[test]
fn test_shutdown_rejects_new_work() {
    let scheduler = scheduler(2);
    let routine = scheduler.routine(|| Ok(1)).unwrap();
    routine.spawn().unwrap();
    assert_eq!(routine.future().unwrap().wait(WAIT).unwrap(), 1);

    scheduler.shutdown();

    let late = scheduler.routine(|| Ok(2)).unwrap();
    assert!(matches!(late.spawn(), Err(RuntimeError::Shutdown)));
}

#[test]
fn test_default_config_requires_main_thread() {
    let result = thread::spawn(|| Scheduler::new().map(|_| ())).join().unwrap();
    assert!(matches!(result, Err(RuntimeError::NotMainThread)));
}
