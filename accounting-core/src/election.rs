//! Leader election for the processor
//!
//! Only one instance per deployment may mutate the ledger. Instances compete
//! for a lease; the holder renews it on every heartbeat and everyone else
//! forwards mutations to the holder's address.

use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pluggable leader-lease provider
#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Address of the current lease holder, if the lease is live
    async fn current_leader(&self) -> Result<Option<String>>;

    /// Take or renew the lease for `candidate`; `false` if someone else holds it
    async fn try_acquire(&self, candidate: &str, ttl: Duration) -> Result<bool>;

    /// Give the lease up if `candidate` holds it
    async fn release(&self, candidate: &str) -> Result<()>;

    /// Whether the lease lapses unless renewed. Fixed leases need no heartbeat.
    fn expires(&self) -> bool {
        true
    }
}

/// Lease shared by instances living in one process
#[derive(Debug, Default)]
pub struct InMemoryLease {
    holder: Mutex<Option<(String, Instant)>>,
}

impl InMemoryLease {
    /// Create an unheld lease
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaderLease for InMemoryLease {
    async fn current_leader(&self) -> Result<Option<String>> {
        let holder = self.holder.lock();
        Ok(holder
            .as_ref()
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(address, _)| address.clone()))
    }

    async fn try_acquire(&self, candidate: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut holder = self.holder.lock();
        let free = match holder.as_ref() {
            None => true,
            Some((address, expires)) => address == candidate || *expires <= now,
        };
        if free {
            *holder = Some((candidate.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release(&self, candidate: &str) -> Result<()> {
        let mut holder = self.holder.lock();
        if holder.as_ref().map_or(false, |(address, _)| address == candidate) {
            *holder = None;
        }
        Ok(())
    }
}

/// Leadership assigned by deployment configuration
#[derive(Debug, Clone, Default)]
pub struct StaticLease {
    leader: Option<String>,
}

impl StaticLease {
    /// Fixed leader (or none: every instance processes locally)
    pub fn new(leader: Option<String>) -> Self {
        Self { leader }
    }
}

#[async_trait]
impl LeaderLease for StaticLease {
    async fn current_leader(&self) -> Result<Option<String>> {
        Ok(self.leader.clone())
    }

    async fn try_acquire(&self, candidate: &str, _ttl: Duration) -> Result<bool> {
        Ok(self.leader.as_deref() == Some(candidate))
    }

    async fn release(&self, _candidate: &str) -> Result<()> {
        Ok(())
    }

    fn expires(&self) -> bool {
        false
    }
}

/// This instance's view of who the active processor is
pub struct ProcessorElection {
    lease: Arc<dyn LeaderLease>,
    self_address: String,
    lease_ttl: Duration,
    heartbeat_interval: Duration,
    is_leader: AtomicBool,
    running: AtomicBool,
}

impl std::fmt::Debug for ProcessorElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorElection")
            .field("self_address", &self.self_address)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

impl ProcessorElection {
    /// Create election for the instance reachable at `self_address`
    pub fn new(
        lease: Arc<dyn LeaderLease>,
        self_address: impl Into<String>,
        lease_ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            lease,
            self_address: self_address.into(),
            lease_ttl,
            heartbeat_interval,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Address other instances use for this one
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Whether the last heartbeat kept the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Try to take or renew the lease once
    pub async fn heartbeat(&self) -> Result<bool> {
        let acquired = self
            .lease
            .try_acquire(&self.self_address, self.lease_ttl)
            .await?;
        let was_leader = self.is_leader.swap(acquired, Ordering::SeqCst);

        if acquired && !was_leader {
            tracing::info!(address = %self.self_address, "Became active processor");
        } else if !acquired && was_leader {
            tracing::warn!(address = %self.self_address, "Lost processor lease");
        }
        Ok(acquired)
    }

    /// Address to forward mutations to.
    ///
    /// `None` when this instance holds the lease or no leader is known; in
    /// both cases the caller processes locally.
    pub async fn active_processor_address(&self) -> Result<Option<String>> {
        let leader = self.lease.current_leader().await?;
        Ok(leader.filter(|address| *address != self.self_address))
    }

    /// Release the lease if held
    pub async fn step_down(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if self.is_leader.swap(false, Ordering::SeqCst) {
            tracing::info!(address = %self.self_address, "Stepping down as active processor");
        }
        self.lease.release(&self.self_address).await
    }

    /// Renew the lease every heartbeat interval until [`step_down`](Self::step_down).
    ///
    /// Returns `None` for a lease that never lapses; one [`heartbeat`](Self::heartbeat)
    /// settles leadership for those.
    pub fn spawn_heartbeat(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.lease.expires() {
            tracing::info!(address = %self.self_address, "Processor lease is fixed, no heartbeat");
            return None;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Election heartbeat already running");
            return None;
        }

        tracing::info!(
            address = %self.self_address,
            interval = ?self.heartbeat_interval,
            "Starting election heartbeat"
        );

        let election = Arc::clone(&self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(election.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if !election.running.load(Ordering::SeqCst) {
                    tracing::info!("Election heartbeat stopped");
                    break;
                }

                if let Err(e) = election.heartbeat().await {
                    election.is_leader.store(false, Ordering::SeqCst);
                    tracing::error!(error = %e, "Failed to renew processor lease");
                }
            }
        }))
    }
}
