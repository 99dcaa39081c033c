//! Minute ticker driving cron triggers.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use convoy_scheduler::BuildService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Fire cron triggers once per wall-clock minute until `shutdown` flips.
pub async fn run_cron_ticker(service: Arc<dyn BuildService>, mut shutdown: watch::Receiver<bool>) {
    info!("Starting cron ticker");
    let mut last: Option<DateTime<Utc>> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(until_next_minute(Utc::now())) => {}
            _ = shutdown.changed() => break,
        }

        let Some(minute) = minute_of(Utc::now()) else {
            continue;
        };
        if last == Some(minute) {
            continue;
        }
        last = Some(minute);

        debug!(at = %minute, "Firing cron triggers");
        if let Err(e) = service.fire_cron_triggers(minute).await {
            warn!(at = %minute, error = %e, "Failed to fire cron triggers");
        }
    }

    info!("Cron ticker stopped");
}

fn minute_of(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    at.duration_trunc(TimeDelta::minutes(1)).ok()
}

fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let into_minute = minute_of(now)
        .and_then(|start| (now - start).to_std().ok())
        .unwrap_or_default();
    Duration::from_secs(60).saturating_sub(into_minute)
}
