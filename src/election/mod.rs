//! Leader Election
//!
//! Lease-based election over a shared [`LeaseStore`]. Each instance runs one
//! recurring acquire-or-renew attempt; the store's conditional write decides
//! who holds the lease, and the local flag only ever turns on right after
//! the store confirmed that write.
//!
//! Leadership is also bounded locally: a confirmed claim is trusted until
//! `attempt start + lease duration`, minus a tenth of the lease. Past that
//! instant the flag reads `false` even if the next attempt is still in flight.

mod reclaimer;

pub use reclaimer::reclaim_expired;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::LeaseConfig;
use crate::error::{Error, Result};
use crate::lease::{duration_millis, LeaseStore};

/// Election state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not holding the lease
    Follower,
    /// Holding a lease confirmed by the last attempt
    Leader,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Follower => write!(f, "follower"),
            ElectionState::Leader => write!(f, "leader"),
        }
    }
}

/// Outcome of the last attempt and how long it may be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Leadership {
    state: ElectionState,
    /// Local deadline of the confirmed lease, set only for `Leader`
    valid_until: Option<Instant>,
}

impl Leadership {
    fn follower() -> Self {
        Self {
            state: ElectionState::Follower,
            valid_until: None,
        }
    }

    fn leader(valid_until: Instant) -> Self {
        Self {
            state: ElectionState::Leader,
            valid_until: Some(valid_until),
        }
    }

    /// Deadline of the lease this instance believes it holds
    fn deadline(&self) -> Option<Instant> {
        match self.state {
            ElectionState::Leader => self.valid_until,
            ElectionState::Follower => None,
        }
    }

    /// State as of `now`; an expired lease reads as follower
    fn state_at(&self, now: Instant) -> ElectionState {
        match self.deadline() {
            Some(until) if now < until => ElectionState::Leader,
            _ => ElectionState::Follower,
        }
    }
}

/// State shared between the engine handle and its background tasks
struct Shared {
    store: Arc<dyn LeaseStore>,
    config: LeaseConfig,
    instance_id: String,
    state_tx: watch::Sender<Leadership>,
}

/// A spawned loop and the signal that stops it
struct Background<T> {
    stop: watch::Sender<bool>,
    handle: JoinHandle<T>,
}

impl<T> Background<T> {
    /// Signal the loop and wait for it to finish its current iteration
    async fn stop(self) -> Option<T> {
        let _ = self.stop.send(true);
        match self.handle.await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Background lease task failed: {}", e);
                None
            }
        }
    }
}

/// Lease-based leader election engine.
///
/// Dropping the engine stops its background tasks without releasing the
/// lease; the row then expires on its own. Call [`shutdown`](Self::shutdown)
/// to hand leadership over immediately.
pub struct LeaderElection {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<Leadership>,
    renewal: Mutex<Option<Background<ElectionState>>>,
    reclaimer: Mutex<Option<Background<()>>>,
}

impl LeaderElection {
    /// Create and start an election engine.
    ///
    /// Prepares the lease table, starts the reclaimer, runs the first
    /// acquisition attempt and arms the renewal timer. Fails when the store
    /// cannot be reached or the table is missing and may not be created.
    pub async fn create(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Result<Self> {
        config.validate()?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(generate_instance_id);

        if config.lease_duration() <= config.renewal_interval() {
            tracing::warn!(
                "Lease duration {:?} does not exceed renewal interval {:?}; a single late renewal will cause failover",
                config.lease_duration(),
                config.renewal_interval()
            );
        }

        if config.create_table_on_init {
            store.ensure_table().await?;
        } else if !store.table_exists().await? {
            return Err(Error::SchemaMissing {
                table: config.qualified_table(),
            });
        }

        let (state_tx, state_rx) = watch::channel(Leadership::follower());
        let shared = Arc::new(Shared {
            store,
            config,
            instance_id,
            state_tx,
        });

        tracing::info!(
            "Starting leader election (instance={}, lock_id={}, backend={}, lease={:?}, renew={:?})",
            shared.instance_id,
            shared.config.lock_id,
            shared.store.backend(),
            shared.config.lease_duration(),
            shared.config.renewal_interval()
        );

        let reclaimer = reclaimer::spawn(Arc::clone(&shared), state_rx.clone());

        let initial = shared.attempt(Leadership::follower()).await;
        shared.publish(initial);

        let renewal = spawn_renewal(Arc::clone(&shared), initial);

        Ok(Self {
            shared,
            state_rx,
            renewal: Mutex::new(Some(renewal)),
            reclaimer: Mutex::new(Some(reclaimer)),
        })
    }

    /// Check if this instance is currently the leader.
    ///
    /// Reads the cached outcome of the last attempt; never blocks on the store.
    /// Turns `false` on its own once the confirmed lease runs out.
    pub fn am_i_leader(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    /// Get current state
    pub fn state(&self) -> ElectionState {
        self.state_rx.borrow().state_at(Instant::now())
    }

    /// Identifier this instance writes as `leader_id`
    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Lock identifier this engine competes for
    pub fn lock_id(&self) -> i64 {
        self.shared.config.lock_id
    }

    /// Stop competing and give up the lease if held.
    ///
    /// Cancels the pending renewal, waits for an in-flight attempt, clears the
    /// local flag and deletes the row owned by this instance. Calling it again,
    /// or while not leader, leaves the store untouched.
    pub async fn release(&self) {
        let Some(renewal) = self.renewal.lock().await.take() else {
            return;
        };

        // A failed join leaves the last state unknown; deleting our own row
        // is harmless either way.
        let state = renewal.stop().await.unwrap_or(ElectionState::Leader);
        self.shared.publish(Leadership::follower());
        if state != ElectionState::Leader {
            return;
        }

        match self.shared.release_row().await {
            Ok(true) => tracing::info!(
                "Released lease {} (instance={})",
                self.shared.config.lock_id,
                self.shared.instance_id
            ),
            Ok(false) => tracing::debug!(
                "Lease {} was no longer held by {} at release",
                self.shared.config.lock_id,
                self.shared.instance_id
            ),
            Err(e) => tracing::warn!(
                "Failed to release lease {}, leaving it to expire: {}",
                self.shared.config.lock_id,
                e
            ),
        }
    }

    /// Release the lease and stop all background activity
    pub async fn shutdown(&self) {
        self.release().await;

        if let Some(reclaimer) = self.reclaimer.lock().await.take() {
            reclaimer.stop().await;
            tracing::info!(
                "Leader election stopped (instance={})",
                self.shared.instance_id
            );
        }
    }
}

impl Shared {
    fn publish(&self, leadership: Leadership) {
        self.state_tx.send_replace(leadership);
    }

    /// Local deadline for a lease whose claim started at `start`
    fn lease_deadline(&self, start: Instant) -> Instant {
        let lease = self.config.lease_duration();
        start + (lease - lease / 10)
    }

    /// One acquire-or-renew round trip, resolved to the next state.
    ///
    /// The write started at `start` expires no earlier than
    /// `start + lease` in the store, so the local deadline never outlives it.
    async fn attempt(&self, current: Leadership) -> Leadership {
        let lock_id = self.config.lock_id;
        let start = Instant::now();

        // A renewal must not run past the lease it is renewing
        let mut bound = start + self.config.attempt_timeout();
        if let Some(until) = current.deadline() {
            bound = bound.min(until);
        }

        let result = match tokio::time::timeout_at(
            bound,
            self.store
                .try_claim(lock_id, &self.instance_id, self.config.lease_duration()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(bound.saturating_duration_since(start))),
        };

        match result {
            Ok(lease) if lease.is_held_by(&self.instance_id) => {
                if current.state_at(start) == ElectionState::Follower {
                    tracing::info!(
                        "Acquired leadership of lock {} (instance={}, expires_at={})",
                        lock_id,
                        self.instance_id,
                        lease.expires_at
                    );
                } else {
                    tracing::trace!("Renewed lease {} until {}", lock_id, lease.expires_at);
                }
                Leadership::leader(self.lease_deadline(start))
            }
            Ok(lease) => {
                tracing::warn!(
                    "Store returned lease {} held by {} to claim from {}",
                    lock_id,
                    lease.leader_id,
                    self.instance_id
                );
                self.step_down(current).await
            }
            Err(e) if e.is_rejection() => {
                tracing::debug!("Lease {} is held by another instance", lock_id);
                self.step_down(current).await
            }
            Err(e) => {
                tracing::warn!("Lease attempt for lock {} failed: {}", lock_id, e);
                self.step_down(current).await
            }
        }
    }

    /// Become follower; a leader also drops its row on the way out
    async fn step_down(&self, current: Leadership) -> Leadership {
        if current.state == ElectionState::Leader {
            self.publish(Leadership::follower());
            tracing::warn!(
                "Leadership of lock {} LOST (instance={})",
                self.config.lock_id,
                self.instance_id
            );

            if let Err(e) = self.release_row().await {
                tracing::debug!("Best-effort release after losing lease failed: {}", e);
            }
        }
        Leadership::follower()
    }

    async fn release_row(&self) -> Result<bool> {
        let timeout = self.config.attempt_timeout();
        tokio::time::timeout(
            timeout,
            self.store.release(self.config.lock_id, &self.instance_id),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))?
    }
}

fn spawn_renewal(shared: Arc<Shared>, initial: Leadership) -> Background<ElectionState> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(run_renewal(shared, initial, stop_rx));
    Background {
        stop: stop_tx,
        handle,
    }
}

/// Re-arm a single-shot delay after every attempt so attempts never overlap
async fn run_renewal(
    shared: Arc<Shared>,
    mut leadership: Leadership,
    mut stop: watch::Receiver<bool>,
) -> ElectionState {
    loop {
        let delay = jittered(
            shared.config.renewal_interval(),
            shared.config.jitter_range(),
        );
        let deadline = leadership.deadline();

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                tracing::warn!(
                    "Lease {} ran out before it could be renewed",
                    shared.config.lock_id
                );
                leadership = shared.step_down(leadership).await;
                shared.publish(leadership);
            }
            _ = stop.changed() => break,
        }

        leadership = shared.attempt(leadership).await;
        shared.publish(leadership);
    }

    leadership.state
}

/// Add a uniform offset in `[-range/2, +range/2]` to `base`, floored at zero
pub(crate) fn jittered(base: Duration, range: Duration) -> Duration {
    let half = duration_millis(range) / 2;
    if half == 0 {
        return base;
    }

    let offset = rand::thread_rng().gen_range(-half..=half);
    let ms = duration_millis(base).saturating_add(offset).max(0);
    Duration::from_millis(ms as u64)
}

/// Random short token identifying this process
fn generate_instance_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}
