use devhost_orchestrator::InstanceManager;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

/// Periodically restart teardown for Terminating instances that have no
/// live teardown task.
pub async fn start_reconciler_task(manager: InstanceManager, interval_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_secs, "Reconciler task running");

    loop {
        interval.tick().await;

        match manager.reconcile_terminating().await {
            Ok(0) => debug!("reconcile pass found nothing to restart"),
            Ok(restarted) => info!(restarted, "restarted orphaned teardowns"),
            Err(e) => error!(error = %e, "reconcile pass failed"),
        }
    }
}
