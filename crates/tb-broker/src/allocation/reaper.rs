//! Allocation expiry task
//!
//! Periodically force-releases allocations whose expiry policy has run
//! out: an end time in the past, or no keepalive or target activity
//! within the idle timeout. Releasing promotes queued requests exactly as
//! an owner's release would.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tb_core::time::current_time_millis;
use tb_core::AllocationId;

use super::AllocationManager;

/// Run the allocation expiry reaper.
///
/// Every `interval` this task force-releases the allocations whose expiry
/// policy has run out, queued ones included, until `cancel` fires.
///
/// # Arguments
///
/// * `manager` - The allocation manager to sweep
/// * `interval` - Time between sweeps
/// * `cancel` - Cancellation token for graceful shutdown
pub async fn run_expiry_reaper(
    manager: Arc<AllocationManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    tracing::info!("Starting allocation reaper (check interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_expired(&manager, current_time_millis());
            }
            _ = cancel.cancelled() => {
                tracing::info!("Allocation reaper shutting down");
                break;
            }
        }
    }
}

/// Release every allocation expired at `now`, returning their IDs
pub fn sweep_expired(manager: &AllocationManager, now: u64) -> Vec<AllocationId> {
    let mut reaped = Vec::new();
    for id in manager.expired(now) {
        match manager.expire(id) {
            Ok(()) => reaped.push(id),
            // The owner released it between the scan and now
            Err(e) => tracing::debug!(allocation = %id, "Skipping expiry: {}", e),
        }
    }

    if !reaped.is_empty() {
        tracing::info!("Reaped {} expired allocations", reaped.len());
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use tb_core::{Principal, TargetId};

    use crate::allocation::{AcquireOutcome, AllocationEvent, ExpiryPolicy, TargetGroup};
    use crate::registry::tests::qemu_target;
    use crate::registry::TargetRegistry;

    fn group(target: &str) -> TargetGroup {
        TargetGroup::from([("dut".to_string(), BTreeSet::from([TargetId::new(target)]))])
    }

    fn manager() -> Arc<AllocationManager> {
        let registry = TargetRegistry::new(vec![qemu_target("a")]);
        Arc::new(AllocationManager::new(Arc::new(registry)))
    }

    #[test]
    fn test_sweep_releases_and_promotes() {
        let mgr = manager();
        let mut events = mgr.subscribe();
        let idle = ExpiryPolicy::Idle {
            timeout: Duration::from_secs(60),
        };

        let held = mgr
            .acquire(&Principal::user("x"), group("a"), false, idle)
            .unwrap()
            .id();
        let waiting = mgr
            .acquire(&Principal::user("y"), group("a"), true, ExpiryPolicy::Never)
            .unwrap();
        assert!(matches!(waiting, AcquireOutcome::Queued { .. }));

        // Nothing is idle yet
        assert!(sweep_expired(&mgr, current_time_millis()).is_empty());

        let later = current_time_millis() + 61_000;
        assert_eq!(sweep_expired(&mgr, later), vec![held]);
        assert_eq!(
            mgr.owner_of(&TargetId::new("a")).unwrap(),
            Some(waiting.id())
        );

        let mut saw_expired = false;
        while let Ok(event) = events.try_recv() {
            if event == (AllocationEvent::Expired { id: held }) {
                saw_expired = true;
            }
        }
        assert!(saw_expired);
    }

    #[test]
    fn test_keepalive_defers_expiry() {
        let mgr = manager();
        let alice = Principal::user("alice");
        let id = mgr
            .acquire(
                &alice,
                group("a"),
                false,
                ExpiryPolicy::Idle {
                    timeout: Duration::from_secs(60),
                },
            )
            .unwrap()
            .id();

        let created = mgr.get(id).unwrap().last_activity;
        std::thread::sleep(Duration::from_millis(5));
        mgr.keepalive(id, &alice).unwrap();
        let refreshed = mgr.get(id).unwrap().last_activity;
        assert!(refreshed > created);

        // Idle deadline is measured from the keepalive, not creation
        assert!(sweep_expired(&mgr, refreshed + 59_999).is_empty());
        assert_eq!(sweep_expired(&mgr, refreshed + 60_000), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_stops_on_cancel() {
        let mgr = manager();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_expiry_reaper(
            Arc::clone(&mgr),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        task.await.unwrap();
    }
}
