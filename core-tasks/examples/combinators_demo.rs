//! Task combinator demonstration
//!
//! Installs a configured shared executor, then composes scheduled work,
//! delays and cancellation.
//!
//! Run with:
//! ```bash
//! cargo run -p core-tasks --example combinators_demo
//!
//! # JSON logs with timer events
//! cargo run -p core-tasks --example combinators_demo -- json "core_tasks=trace"
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use core_runtime::config::ExecutorConfig;
use core_runtime::logging::{ConsoleSink, LogFormat, LogLevel, LoggingConfig};
use core_tasks::{
    delay, delay_with_cancel, run, run_with_cancel, when_all, when_any, CancellationSignal,
    TaskFailure,
};
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let format = match args.get(1).map(String::as_str) {
        Some("json") => LogFormat::Json,
        Some("compact") => LogFormat::Compact,
        _ => LogFormat::Pretty,
    };

    let mut logging = LoggingConfig::default()
        .with_format(format)
        .with_level(LogLevel::Debug)
        .with_log_sink(Arc::new(ConsoleSink::default()));
    if let Some(filter) = args.get(2) {
        logging = logging.with_filter(filter.clone());
    }

    ExecutorConfig::builder()
        .worker_threads(2)
        .max_blocking_threads(8)
        .thread_name("demo-worker")
        .logging(logging)
        .build()?
        .install()?;

    info!("=== Combinator Demo ===");

    demo_when_all()?;
    demo_when_any()?;
    demo_cancellation()?;

    info!("=== Demo Complete ===");
    Ok(())
}

fn demo_when_all() -> anyhow::Result<()> {
    let parts = (1..=4u64).map(|i| {
        run(move || {
            std::thread::sleep(Duration::from_millis(10 * (5 - i)));
            Ok::<_, anyhow::Error>(i * 100)
        })
    });

    let totals = when_all(parts).wait()?;
    info!(?totals, "when_all finished in input order");

    let mixed = when_all([
        run(|| Ok::<_, anyhow::Error>(1)),
        run(|| Err(anyhow::anyhow!("disk unavailable"))),
    ]);
    match mixed.wait() {
        Err(TaskFailure::Faulted(err)) => warn!(error = %err, "when_all faulted"),
        other => info!(?other, "unexpected when_all outcome"),
    }
    Ok(())
}

fn demo_when_any() -> anyhow::Result<()> {
    let slow = delay(Duration::from_secs(2))?;
    let fast = run(|| {
        std::thread::sleep(Duration::from_millis(20));
        Ok::<_, anyhow::Error>(())
    });

    let winner = when_any([slow.clone(), fast.clone()]).wait()?;
    let fast_won = winner == fast;
    info!(
        fast_won,
        slow_status = %slow.status(),
        "when_any settled"
    );
    Ok(())
}

fn demo_cancellation() -> anyhow::Result<()> {
    let signal = CancellationSignal::new();

    let timer = delay_with_cancel(Duration::from_secs(30), &signal)?;
    let queued = run_with_cancel(|| Ok::<_, anyhow::Error>("ran"), &signal);

    signal.cancel();
    info!(timer = %timer.status(), "timer after cancel");

    match queued.wait() {
        Ok(value) => info!(value, "work had already started"),
        Err(failure) if failure.is_canceled() => info!("work canceled before it started"),
        Err(failure) => return Err(failure.into()),
    }
    Ok(())
}
