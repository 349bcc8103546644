use std::time::Duration;

use tokio::time::sleep;

use crate::models::TriggeredBy;
use crate::state::AppState;

/// Spawn the background scheduler that runs the periodic all-listings sync.
///
/// Each run happens in its own `tokio::spawn` so a failure in one run never
/// crashes the scheduler loop.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    if state.sync_engine().is_err() {
        tracing::warn!("Scheduler: no database pool configured, exiting");
        return;
    }

    let sync_interval =
        Duration::from_secs(state.config.ical_sync_interval_minutes.max(5) * 60);
    let mut last_sync_run = tokio::time::Instant::now();

    loop {
        sleep(Duration::from_secs(15)).await;

        let now_instant = tokio::time::Instant::now();
        if now_instant.duration_since(last_sync_run) < sync_interval {
            continue;
        }
        last_sync_run = now_instant;

        let state = state.clone();
        tokio::spawn(async move {
            let engine = match state.sync_engine() {
                Ok(engine) => engine,
                Err(_) => return,
            };
            match engine.sync_all(TriggeredBy::Cron).await {
                Ok(report) => {
                    tracing::info!(
                        session_id = %report.session_id,
                        listings = report.totals.listings,
                        added = report.totals.added,
                        deactivated = report.totals.deactivated,
                        errors = report.totals.errors,
                        "Scheduler: iCal sync completed"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        error = %error.detail_message(),
                        "Scheduler: iCal sync failed"
                    );
                }
            }
        });
    }
}
