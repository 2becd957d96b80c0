//! System-sleep detection via heartbeat gaps.
//!
//! The process cannot observe suspend directly. What it can observe is a
//! loop that should tick every second suddenly reporting a multi-second gap;
//! that is the machine having been asleep in between. Hosts that get their
//! own wake notifications report them through the `system_wake` request
//! instead; this monitor is the fallback for those that do not.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::session::Session;

const TICK: Duration = Duration::from_secs(1);

/// Whether an observed heartbeat gap indicates the system was suspended.
fn slept(elapsed: Duration, gap: Duration) -> bool {
    elapsed > TICK + gap
}

/// Runs until cancelled, triggering the session's wake fast path whenever
/// the heartbeat stalls for longer than `gap`.
pub async fn monitor(session: Session, gap: Duration, token: CancellationToken) {
    let mut last = Instant::now();
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            () = sleep(TICK) => {}
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last);
        last = now;

        if slept(elapsed, gap) {
            info!(
                "heartbeat gap of {:.1}s, assuming system wake",
                elapsed.as_secs_f64()
            );
            let outcome = session.trigger_wake_reconnect().await;
            debug!("wake reconnect: {}", outcome.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_ticks_are_not_wakes() {
        let gap = Duration::from_secs(5);
        assert!(!slept(Duration::from_secs(1), gap));
        assert!(!slept(Duration::from_secs(6), gap));
    }

    #[test]
    fn long_gaps_are_wakes() {
        let gap = Duration::from_secs(5);
        assert!(slept(Duration::from_secs(7), gap));
        assert!(slept(Duration::from_secs(3600), gap));
    }
}
