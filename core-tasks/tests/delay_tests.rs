//! Timer behavior observed through the public API.

use chrono::TimeDelta;
use core_async::time::{Duration, Instant};
use core_tasks::{
    delay, delay_with_cancel, when_any, ArgumentError, CancellationSignal, TaskFailure,
    TimerRegistry,
};

#[core_async::test]
async fn test_delay_completes_no_earlier_than_due() {
    for millis in [1u64, 15, 40] {
        let start = Instant::now();
        delay(Duration::from_millis(millis)).unwrap().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(millis));
    }
}

#[test]
fn test_zero_delay_returns_cached_instance() {
    let a = delay(Duration::ZERO).unwrap();
    let b = delay(TimeDelta::zero()).unwrap();
    assert!(a.ptr_eq(&b));
    assert!(a.is_completed());
}

#[test]
fn test_negative_delay_is_rejected() {
    let result = delay(TimeDelta::milliseconds(-10));
    assert_eq!(
        result.unwrap_err(),
        ArgumentError::NegativeDuration(TimeDelta::milliseconds(-10))
    );
}

#[core_async::test]
async fn test_cancel_before_due_releases_timer() {
    let registry = TimerRegistry::new();
    let baseline = registry.len();
    let signal = CancellationSignal::new();

    let task = registry
        .delay(Duration::from_secs(3600), Some(&signal))
        .unwrap();
    assert_eq!(registry.len(), baseline + 1);

    signal.cancel();
    assert!(matches!(task.await, Err(TaskFailure::Canceled)));
    assert_eq!(registry.len(), baseline);
}

#[core_async::test]
async fn test_cancel_after_fire_is_ignored() {
    let signal = CancellationSignal::new();
    let task = delay_with_cancel(Duration::from_millis(5), &signal).unwrap();

    task.observe().await.unwrap();
    assert!(signal.cancel());
    assert!(task.is_completed());
}

#[core_async::test]
async fn test_one_signal_cancels_many_delays() {
    let registry = TimerRegistry::new();
    let signal = CancellationSignal::new();
    let tasks: Vec<_> = (0..5)
        .map(|_| {
            registry
                .delay(Duration::from_secs(60), Some(&signal))
                .unwrap()
        })
        .collect();
    assert_eq!(registry.len(), 5);

    signal.cancel();
    assert!(tasks.iter().all(|task| task.is_canceled()));
    assert!(registry.is_empty());
}

#[core_async::test]
async fn test_timeout_pattern() {
    let signal = CancellationSignal::new();
    let work = delay_with_cancel(Duration::from_secs(60), &signal).unwrap();
    let deadline = delay(Duration::from_millis(10)).unwrap();

    let first = when_any([work.clone(), deadline.clone()]).await.unwrap();
    assert_eq!(first, deadline);

    signal.cancel();
    assert!(work.is_canceled());
}

#[test]
fn test_blocking_wait_on_shared_executor() {
    let start = Instant::now();
    delay(Duration::from_millis(20)).unwrap().wait().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_delay_armed_on_finished_runtime_is_released() {
    let registry = TimerRegistry::new();
    let baseline = registry.len();

    let task = core_async::runtime::block_on(async {
        registry.delay(Duration::from_millis(20), None).unwrap()
    });
    std::thread::sleep(std::time::Duration::from_millis(50));

    assert_eq!(registry.len(), baseline);
    assert!(task.is_terminal());
    match task.wait() {
        Err(TaskFailure::Faulted(err)) => {
            assert!(err.to_string().contains("dropped by its executor"))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_concurrent_fire_and_cancel_settle_exactly_once() {
    let registry = TimerRegistry::new();
    let baseline = registry.len();
    let (mut completed, mut canceled) = (0, 0);

    for i in 0..300u64 {
        let signal = CancellationSignal::new();
        let task = registry
            .delay(Duration::from_millis(1), Some(&signal))
            .unwrap();

        let remote = signal.clone();
        let canceler = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_micros(700 + (i % 7) * 100));
            remote.cancel()
        });

        match task.wait() {
            Ok(()) => completed += 1,
            Err(TaskFailure::Canceled) => canceled += 1,
            Err(other) => panic!("unexpected {:?}", other),
        }
        canceler.join().unwrap();

        assert!(task.is_completed() ^ task.is_canceled());
        assert_eq!(registry.len(), baseline);
        assert_eq!(signal.registered_callbacks(), 0);
    }
    assert_eq!(completed + canceled, 300);
}
