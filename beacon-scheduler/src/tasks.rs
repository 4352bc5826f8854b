use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::{self, MissedTickBehavior};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::config::Period;

/// Shortest accepted repeat period
pub(crate) const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Run `step` forever on the given schedule
///
/// The period is measured from the start of one run to the start of the
/// next. Runs that overrun their period push the schedule back instead of
/// bursting to catch up. A run that panics is logged and the loop carries on
/// with the next tick.
pub(crate) async fn every<F, Fut>(name: &'static str, period: Period, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    time::sleep(period.delay).await;

    let every = if period.every < MIN_PERIOD {
        warn!(task = name, "period {:?} too short, using {MIN_PERIOD:?}", period.every);
        MIN_PERIOD
    } else {
        period.every
    };

    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        debug!(task = name, "running");
        let run = AssertUnwindSafe(step().instrument(info_span!("task", name)));
        if let Err(panic) = run.catch_unwind().await {
            error!(task = name, "run panicked: {}", panic_message(&*panic));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}
