//! Forward heartbeats

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use cp_core::ControlPlane;

use crate::ssh::TickCallback;

/// Timeouts above this get a jittered interval just under the timeout
const JITTER_THRESHOLD_SECS: u64 = 30;

/// Heartbeat period for a forward whose control-plane timeout is
/// `last_seen_timeout` seconds.
///
/// Above thirty seconds the period is `t - 5 - rand(0..=9)`, which keeps
/// forwards sharing a timeout from beating in lockstep. Otherwise it is
/// two thirds of the timeout, rounded down to whole seconds.
pub fn tick_duration(last_seen_timeout: u32) -> Duration {
    let t = u64::from(last_seen_timeout);
    if t > JITTER_THRESHOLD_SECS {
        let jitter = rand::thread_rng().gen_range(0..10);
        Duration::from_secs(t - 5 - jitter)
    } else {
        Duration::from_secs((t / 3) * 2)
    }
}

/// Tick callback that reports the forward alive to the control plane.
/// Failures are logged; the next tick tries again.
pub fn heartbeat_callback(api: Arc<dyn ControlPlane>, forward_id: String) -> TickCallback {
    Arc::new(move || {
        let api = Arc::clone(&api);
        let forward_id = forward_id.clone();
        Box::pin(async move {
            match api.heartbeat_forward(&forward_id).await {
                Ok(()) => tracing::trace!(%forward_id, "Heartbeat sent"),
                Err(e) => tracing::warn!(%forward_id, error = %e, "Heartbeat failed"),
            }
        })
    })
}
