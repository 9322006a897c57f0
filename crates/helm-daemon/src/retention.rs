//! Log retention task.
//!
//! Deletes log entries older than the configured horizon. Deletion by
//! age is the only mutation permitted on the log table; the sweep runs
//! once at boot and then periodically.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::state::SharedState;

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Run the retention loop until the process exits.
pub async fn run(state: SharedState, horizon_days: u32) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(horizon_days));
        match state.store.purge_logs_before(cutoff) {
            Ok(0) => {}
            Ok(deleted) => {
                info!(deleted, horizon_days, "retention sweep removed old log entries");
            }
            Err(e) => warn!("retention sweep failed: {e}"),
        }
    }
}
