//! Lease Reclaimer
//!
//! Deletes rows whose lease expired more than a grace window ago, so crashed
//! or abandoned instances do not leave rows behind forever. Failures are
//! logged and the next pass simply tries again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{jittered, Background, ElectionState, Leadership, Shared};
use crate::error::{Error, Result};
use crate::lease::LeaseStore;

/// Run one reclaim pass against `store`
pub async fn reclaim_expired(store: &dyn LeaseStore, grace: Duration) -> Result<u64> {
    let deleted = store
        .reclaim(grace)
        .await
        .map_err(|e| Error::ReclaimFailure(e.to_string()))?;

    if deleted > 0 {
        tracing::info!("Reclaimed {} expired lease row(s)", deleted);
    } else {
        tracing::debug!("No expired lease rows to reclaim");
    }

    Ok(deleted)
}

pub(super) fn spawn(
    shared: Arc<Shared>,
    state_rx: watch::Receiver<Leadership>,
) -> Background<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(run(shared, state_rx, stop_rx));
    Background {
        stop: stop_tx,
        handle,
    }
}

async fn run(
    shared: Arc<Shared>,
    state_rx: watch::Receiver<Leadership>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let delay = jittered(
            shared.config.cleanup_interval(),
            shared.config.jitter_range(),
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }

        let state = state_rx.borrow().state_at(tokio::time::Instant::now());
        if shared.config.reclaim_on_leader_only && state != ElectionState::Leader {
            tracing::trace!("Skipping reclaim pass, not leader");
            continue;
        }

        if let Err(e) = reclaim_expired(shared.store.as_ref(), shared.config.reclaim_grace()).await {
            tracing::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::LeaseConfig;
    use crate::election::LeaderElection;
    use crate::error::Error;
    use crate::lease::{LeaseStore, SqliteLeaseStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn reclaiming_config(instance: &str, leader_only: bool) -> LeaseConfig {
        LeaseConfig {
            lease_duration_ms: 300,
            renewal_interval_ms: Some(50),
            cleanup_interval_ms: Some(80),
            jitter_range_ms: 10,
            reclaim_grace_ms: 50,
            reclaim_on_leader_only: leader_only,
            instance_id: Some(instance.to_string()),
            ..LeaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_reclaim_expired_counts_rows() {
        let store = SqliteLeaseStore::open_in_memory(&LeaseConfig::default()).unwrap();
        store.ensure_table().await.unwrap();
        store.try_claim(5, "ghost", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(super::reclaim_expired(&store, Duration::from_secs(5)).await.unwrap(), 0);
        assert_eq!(super::reclaim_expired(&store, Duration::ZERO).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_failure_is_reported() {
        // No table: the store fails and the pass reports it
        let store = SqliteLeaseStore::open_in_memory(&LeaseConfig::default()).unwrap();
        let err = super::reclaim_expired(&store, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::ReclaimFailure(_)));
    }

    #[tokio::test]
    async fn test_background_reclaimer_removes_abandoned_rows() {
        let store = Arc::new(SqliteLeaseStore::open_in_memory(&LeaseConfig::default()).unwrap());
        let engine = LeaderElection::create(store.clone(), reclaiming_config("node-a", false))
            .await
            .unwrap();

        // An instance that competed for lock 9 and crashed
        store.try_claim(9, "crashed", Duration::from_millis(20)).await.unwrap();
        assert!(store.current(9).await.unwrap().is_some());

        let mut reclaimed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.current(9).await.unwrap().is_none() {
                reclaimed = true;
                break;
            }
        }
        assert!(reclaimed);

        // The live lease is renewed and never reclaimed
        assert!(engine.am_i_leader());
        assert!(store.current(1).await.unwrap().unwrap().is_held_by("node-a"));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_leader_only_reclaimer_skips_on_followers() {
        let store = Arc::new(SqliteLeaseStore::open_in_memory(&LeaseConfig::default()).unwrap());
        store.ensure_table().await.unwrap();
        // Lock 1 is held elsewhere for the whole test
        store.try_claim(1, "other", Duration::from_secs(30)).await.unwrap();

        let follower = LeaderElection::create(store.clone(), reclaiming_config("node-b", true))
            .await
            .unwrap();
        assert!(!follower.am_i_leader());

        store.try_claim(9, "crashed", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(store.current(9).await.unwrap().is_some());

        follower.shutdown().await;
    }
}
