use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically retries ledger mirroring for records left LEDGER_PENDING.
pub fn start_mirror_sweeper(
    state: Arc<AppState>,
    every: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match state.service.retry_pending().await {
                        Ok(report) if report.scanned > 0 => {
                            tracing::info!(
                                scanned = report.scanned,
                                mirrored = report.mirrored,
                                pending = report.pending,
                                failed = report.failed,
                                superseded = report.superseded,
                                "Ledger mirror sweep finished"
                            );
                            state.events.publish("ledger:sweep", &report);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Ledger mirror sweep failed");
                        }
                    }
                }
            }
        }
        tracing::info!("Mirror sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::TestApp;

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let app = TestApp::new().await;
        let cancel = CancellationToken::new();
        let handle = start_mirror_sweeper(
            app.state.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
