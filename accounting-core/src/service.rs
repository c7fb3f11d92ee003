//! Accounting service
//!
//! Request-facing orchestration. `apply` normalizes a command (transaction
//! ids, default dates, category validation) and then makes one decision:
//! run it on the local processor actor, or forward it to the active
//! processor. Dry-run checks and reads always stay local.

use crate::actor::{spawn_processor_actor, ProcessorHandle};
use crate::catalog::{ProductCatalog, StaticCatalog};
use crate::election::{LeaderLease, ProcessorElection, StaticLease};
use crate::forwarding::{Forwarder, HttpForwarder};
use crate::metrics::Metrics;
use crate::notifications::DepositNotificationService;
use crate::processor::{Clock, Processor, SystemClock};
use crate::storage::StorageStats;
use crate::types::{
    Actor, ActorAndProject, Allocation, ChargeRequest, Command, CommandEnvelope,
    DepositNotification, DepositRequest, NotificationId, ProductCategoryId, RootDepositRequest,
    UpdateAllocationRequest, Wallet, WalletOwner,
};
use crate::wallets::WalletDirectory;
use crate::{Config, Error, Result, Storage};
use std::sync::Arc;
use uuid::Uuid;

/// External collaborators of the service
pub struct Collaborators {
    /// Product-category catalog
    pub catalog: Arc<dyn ProductCatalog>,
    /// Leader-lease provider
    pub lease: Arc<dyn LeaderLease>,
    /// Transport towards the active processor
    pub forwarder: Arc<dyn Forwarder>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators described by configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            catalog: Arc::new(StaticCatalog::new(config.categories.clone())),
            lease: Arc::new(StaticLease::new(config.election.static_leader.clone())),
            forwarder: Arc::new(HttpForwarder::new(std::time::Duration::from_millis(
                config.forwarding.timeout_ms,
            ))?),
            clock: Arc::new(SystemClock),
        })
    }
}

/// Accounting service
pub struct AccountingService {
    storage: Arc<Storage>,
    catalog: Arc<dyn ProductCatalog>,
    wallets: WalletDirectory,
    notifications: DepositNotificationService,
    processor: Arc<Processor>,
    handle: ProcessorHandle,
    election: Arc<ProcessorElection>,
    forwarder: Arc<dyn Forwarder>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl std::fmt::Debug for AccountingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountingService")
            .field("storage", &self.storage)
            .field("election", &self.election)
            .finish_non_exhaustive()
    }
}

impl AccountingService {
    /// Open the store and start the processor actor. Must run inside a Tokio runtime.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with(config, Collaborators::from_config(config)?)
    }

    /// Like [`open`](Self::open) with explicit collaborators
    pub fn open_with(config: &Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let processor = Arc::new(Processor::new(
            storage.clone(),
            collaborators.catalog.clone(),
            collaborators.clock.clone(),
            config.processor.allocation_priority,
            metrics.clone(),
        ));
        let handle = spawn_processor_actor(processor.clone(), config.processor.mailbox_capacity);

        let election = Arc::new(ProcessorElection::new(
            collaborators.lease,
            config.advertised_address.clone(),
            config.election.lease_ttl(),
            config.election.heartbeat_interval(),
        ));

        tracing::info!(
            service = %config.service_name,
            address = %config.advertised_address,
            categories = config.categories.len(),
            "Accounting service opened"
        );

        Ok(Self {
            wallets: WalletDirectory::new(storage.clone(), collaborators.catalog.clone()),
            notifications: DepositNotificationService::new(storage.clone()),
            storage,
            catalog: collaborators.catalog,
            processor,
            handle,
            election,
            forwarder: collaborators.forwarder,
            clock: collaborators.clock,
            metrics,
        })
    }

    /// Leader election of this instance
    pub fn election(&self) -> &Arc<ProcessorElection> {
        &self.election
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Store statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Apply a command on behalf of `actor`
    pub async fn apply(&self, actor: &ActorAndProject, command: Command) -> Result<Vec<bool>> {
        if command.is_empty() {
            return Ok(Vec::new());
        }
        let command = self.normalize(actor, command)?;

        if !command.is_mutating() {
            return self.processor.apply(actor, &command);
        }

        match self.election.active_processor_address().await? {
            Some(address) => {
                tracing::debug!(%address, command = command.name(), items = command.len(), "Forwarding to active processor");
                self.metrics.forwarded_total.inc();
                let envelope = CommandEnvelope {
                    actor: actor.clone(),
                    command,
                };
                self.forwarder.forward(&address, &envelope).await
            }
            None => self.handle.apply(actor.clone(), command).await,
        }
    }

    /// Run a command forwarded by another instance.
    ///
    /// The command was normalized by the sender and is never forwarded again.
    pub async fn execute_forwarded(&self, envelope: CommandEnvelope) -> Result<Vec<bool>> {
        if envelope.command.is_mutating() && !self.election.is_leader() {
            tracing::warn!(
                command = envelope.command.name(),
                "Received forwarded command without holding the processor lease"
            );
        }
        if !envelope.command.is_mutating() {
            return self.processor.apply(&envelope.actor, &envelope.command);
        }
        self.handle.apply(envelope.actor, envelope.command).await
    }

    // Convenience entry points

    /// Charge a wallet
    pub async fn charge(&self, actor: &ActorAndProject, request: ChargeRequest) -> Result<bool> {
        single(self.apply(actor, Command::Charge(vec![request])).await?)
    }

    /// Dry-run a charge
    pub async fn check(&self, actor: &ActorAndProject, request: ChargeRequest) -> Result<bool> {
        single(self.apply(actor, Command::Check(vec![request])).await?)
    }

    /// Create sub-allocations
    pub async fn deposit(&self, actor: &ActorAndProject, items: Vec<DepositRequest>) -> Result<Vec<bool>> {
        self.apply(actor, Command::Deposit(items)).await
    }

    /// Create root allocations
    pub async fn root_deposit(
        &self,
        actor: &ActorAndProject,
        items: Vec<RootDepositRequest>,
    ) -> Result<Vec<bool>> {
        self.apply(actor, Command::RootDeposit(items)).await
    }

    /// Correct allocations
    pub async fn update_allocation(
        &self,
        actor: &ActorAndProject,
        items: Vec<UpdateAllocationRequest>,
    ) -> Result<Vec<bool>> {
        self.apply(actor, Command::UpdateAllocation(items)).await
    }

    // Reads (local, may lag the leader)

    /// Wallets of an owner
    pub fn retrieve_wallets_internal(
        &self,
        actor: &ActorAndProject,
        owner: &WalletOwner,
    ) -> Result<Vec<Wallet>> {
        require_internal(actor)?;
        Ok(self
            .wallets
            .wallets_of(owner)?
            .into_iter()
            .filter(|wallet| provider_may_see(actor, &wallet.category))
            .collect())
    }

    /// Allocations of the wallet of `owner` for `category`
    pub fn retrieve_allocations_internal(
        &self,
        actor: &ActorAndProject,
        owner: &WalletOwner,
        category: &ProductCategoryId,
    ) -> Result<Vec<Allocation>> {
        require_internal(actor)?;
        if !provider_may_see(actor, category) {
            return Err(Error::Forbidden(format!(
                "{} does not provide {}",
                actor.actor.name(),
                category
            )));
        }
        let wallet = self.wallets.require_wallet(owner, category)?;
        self.wallets.allocations_of(wallet.id)
    }

    /// Address of the active processor, `None` if this instance is it or none is known
    pub async fn retrieve_active_processor_address(&self) -> Result<Option<String>> {
        self.election.active_processor_address().await
    }

    /// Unread deposit notifications of the caller
    pub fn retrieve_notifications(&self, actor: &ActorAndProject) -> Result<Vec<DepositNotification>> {
        self.notifications.retrieve_notifications(actor)
    }

    /// Acknowledge deposit notifications. Routed like any other mutation,
    /// so only the active processor writes. Returns how many changed.
    pub async fn mark_as_read(&self, actor: &ActorAndProject, ids: Vec<NotificationId>) -> Result<usize> {
        let outcomes = self.apply(actor, Command::MarkAsRead(ids)).await?;
        Ok(outcomes.into_iter().filter(|changed| *changed).count())
    }

    /// Stop the processor actor and give up the lease
    pub async fn shutdown(&self) -> Result<()> {
        self.election.step_down().await?;
        self.handle.shutdown().await
    }

    fn normalize(&self, actor: &ActorAndProject, command: Command) -> Result<Command> {
        let now = self.clock.now();
        let name = actor.actor.name();
        let namespaced = |id: Option<String>| {
            let id = id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            Some(format!("{}-{}", name, id))
        };

        let command = match command {
            Command::Charge(items) => Command::Charge(
                items
                    .into_iter()
                    .map(|mut item| {
                        item.transaction_id = namespaced(item.transaction_id.take());
                        item
                    })
                    .collect(),
            ),
            Command::Check(items) => Command::Check(items),
            Command::MarkAsRead(ids) => Command::MarkAsRead(ids),
            Command::Deposit(items) => Command::Deposit(
                items
                    .into_iter()
                    .map(|mut item| {
                        item.transaction_id = namespaced(item.transaction_id.take());
                        item.start_date = Some(item.start_date.unwrap_or(now));
                        item
                    })
                    .collect(),
            ),
            Command::RootDeposit(items) => Command::RootDeposit(
                items
                    .into_iter()
                    .map(|mut item| {
                        item.transaction_id = namespaced(item.transaction_id.take());
                        item.start_date = Some(item.start_date.unwrap_or(now));
                        item
                    })
                    .collect(),
            ),
            Command::UpdateAllocation(items) => Command::UpdateAllocation(
                items
                    .into_iter()
                    .map(|mut item| {
                        item.transaction_id = namespaced(item.transaction_id.take());
                        item
                    })
                    .collect(),
            ),
        };

        self.validate_categories(&command)?;
        Ok(command)
    }

    fn validate_categories(&self, command: &Command) -> Result<()> {
        match command {
            Command::Charge(items) | Command::Check(items) => {
                for item in items {
                    self.catalog.category(&item.category)?;
                }
            }
            Command::Deposit(items) => {
                for item in items {
                    self.catalog.category(&item.target.category)?;
                }
            }
            Command::RootDeposit(items) => {
                for item in items {
                    self.catalog.category(&item.target.category)?;
                }
            }
            Command::UpdateAllocation(_) | Command::MarkAsRead(_) => {}
        }
        Ok(())
    }
}

fn single(outcomes: Vec<bool>) -> Result<bool> {
    outcomes
        .first()
        .copied()
        .ok_or_else(|| Error::Other("Empty response for single-item command".to_string()))
}

fn require_internal(actor: &ActorAndProject) -> Result<()> {
    match actor.actor {
        Actor::System | Actor::Provider(_) => Ok(()),
        Actor::User(_) => Err(Error::Forbidden(format!(
            "{} may not use internal endpoints",
            actor.actor.name()
        ))),
    }
}

fn provider_may_see(actor: &ActorAndProject, category: &ProductCategoryId) -> bool {
    match &actor.actor {
        Actor::Provider(provider) => *provider == category.provider,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::InMemoryLease;
    use crate::processor::ManualClock;
    use crate::types::{ChargeType, ProductCategory, ProductType, WalletRef};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Runs forwarded commands on another in-process service
    #[derive(Default)]
    struct LoopbackForwarder {
        target: Mutex<Option<Arc<AccountingService>>>,
        forwarded: Mutex<Vec<(String, CommandEnvelope)>>,
    }

    #[async_trait]
    impl Forwarder for LoopbackForwarder {
        async fn forward(&self, address: &str, envelope: &CommandEnvelope) -> Result<Vec<bool>> {
            self.forwarded
                .lock()
                .push((address.to_string(), envelope.clone()));
            let target = self.target.lock().clone();
            match target {
                Some(service) => service.execute_forwarded(envelope.clone()).await,
                None => Err(Error::LeaderUnreachable(format!("{} is down", address))),
            }
        }
    }

    fn cpu() -> ProductCategoryId {
        ProductCategoryId::new("cpu", "hpc")
    }

    fn open(
        temp_dir: &TempDir,
        address: &str,
        lease: Arc<dyn LeaderLease>,
        forwarder: Arc<dyn Forwarder>,
    ) -> AccountingService {
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.advertised_address = address.to_string();
        let collaborators = Collaborators {
            catalog: Arc::new(StaticCatalog::new(vec![ProductCategory {
                id: cpu(),
                product_type: ProductType::Compute,
                charge_type: ChargeType::Absolute,
            }])),
            lease,
            forwarder,
            clock: Arc::new(ManualClock::new(Utc::now())),
        };
        AccountingService::open_with(&config, collaborators).unwrap()
    }

    fn standalone(temp_dir: &TempDir) -> (AccountingService, Arc<LoopbackForwarder>) {
        let forwarder = Arc::new(LoopbackForwarder::default());
        let service = open(
            temp_dir,
            "solo:8080",
            Arc::new(StaticLease::new(None)),
            forwarder.clone(),
        );
        (service, forwarder)
    }

    fn grant(owner: WalletOwner, amount: i64, tx: Option<&str>) -> RootDepositRequest {
        RootDepositRequest {
            target: WalletRef::new(owner, cpu()),
            amount,
            transaction_id: tx.map(str::to_string),
            start_date: None,
            end_date: None,
        }
    }

    #[tokio::test]
    async fn test_transaction_ids_are_namespaced() {
        let temp_dir = TempDir::new().unwrap();
        let (service, forwarder) = standalone(&temp_dir);
        let system = ActorAndProject::system();

        let out = service
            .root_deposit(&system, vec![grant(WalletOwner::project("p1"), 100, Some("g1"))])
            .await
            .unwrap();
        assert_eq!(out, vec![true]);
        assert!(service.storage.get_transaction("_system-g1").unwrap().is_some());
        assert!(service.storage.get_transaction("g1").unwrap().is_none());

        // A missing id is generated, so the same payload twice creates two allocations
        service
            .root_deposit(&system, vec![grant(WalletOwner::project("p1"), 100, None)])
            .await
            .unwrap();
        service
            .root_deposit(&system, vec![grant(WalletOwner::project("p1"), 100, None)])
            .await
            .unwrap();
        let allocations = service
            .retrieve_allocations_internal(&system, &WalletOwner::project("p1"), &cpu())
            .unwrap();
        assert_eq!(allocations.len(), 3);
        assert!(allocations.iter().all(|a| a.start_date <= Utc::now()));

        assert!(forwarder.forwarded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_same_client_id_from_different_actors_does_not_collide() {
        let temp_dir = TempDir::new().unwrap();
        let (service, _) = standalone(&temp_dir);
        let system = ActorAndProject::system();
        service
            .root_deposit(&system, vec![grant(WalletOwner::project("p1"), 1_000, Some("g1"))])
            .await
            .unwrap();

        let a = ActorAndProject::provider("hpc");
        let b = ActorAndProject::system();
        let request = ChargeRequest::new(WalletOwner::project("p1"), cpu(), 10, "job-1");
        assert!(service.charge(&a, request.clone()).await.unwrap());
        assert!(service.charge(&b, request.clone()).await.unwrap());
        // Provider retry is a replay
        assert!(service.charge(&a, request).await.unwrap());

        let allocations = service
            .retrieve_allocations_internal(&system, &WalletOwner::project("p1"), &cpu())
            .unwrap();
        assert_eq!(allocations[0].balance, 980);
    }

    #[tokio::test]
    async fn test_unknown_category_rejected_before_routing() {
        let temp_dir = TempDir::new().unwrap();
        let (service, forwarder) = standalone(&temp_dir);

        let mut request = grant(WalletOwner::project("p1"), 100, Some("g1"));
        request.target.category = ProductCategoryId::new("gpu", "hpc");
        let err = service
            .root_deposit(&ActorAndProject::system(), vec![request])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCategory(_)));
        assert!(forwarder.forwarded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_follower_forwards_mutations_to_leader() {
        let lease: Arc<dyn LeaderLease> = Arc::new(InMemoryLease::new());
        let leader_dir = TempDir::new().unwrap();
        let follower_dir = TempDir::new().unwrap();

        let leader = Arc::new(open(
            &leader_dir,
            "leader:8080",
            lease.clone(),
            Arc::new(LoopbackForwarder::default()),
        ));
        let forwarder = Arc::new(LoopbackForwarder::default());
        *forwarder.target.lock() = Some(leader.clone());
        let follower = open(&follower_dir, "follower:8080", lease.clone(), forwarder.clone());

        assert!(leader.election().heartbeat().await.unwrap());
        assert!(!follower.election().heartbeat().await.unwrap());
        assert_eq!(
            follower.retrieve_active_processor_address().await.unwrap().as_deref(),
            Some("leader:8080")
        );
        assert_eq!(leader.retrieve_active_processor_address().await.unwrap(), None);

        let system = ActorAndProject::system();
        let out = follower
            .root_deposit(&system, vec![grant(WalletOwner::project("p1"), 100, Some("g1"))])
            .await
            .unwrap();
        assert_eq!(out, vec![true]);

        let forwarded = forwarder.forwarded.lock().clone();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, "leader:8080");
        match &forwarded[0].1.command {
            Command::RootDeposit(items) => {
                assert_eq!(items[0].transaction_id.as_deref(), Some("_system-g1"));
                assert!(items[0].start_date.is_some());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(follower.metrics().forwarded_total.get(), 1);

        // Written on the leader's store only
        assert_eq!(leader.stats().unwrap().total_allocations, 1);
        assert_eq!(follower.stats().unwrap().total_allocations, 0);

        // Checks are never forwarded
        let check = follower
            .check(&system, ChargeRequest::new(WalletOwner::project("p1"), cpu(), 1, "k1"))
            .await
            .unwrap();
        assert!(!check);
        assert_eq!(forwarder.forwarded.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_follower_forwards_mark_as_read() {
        let lease: Arc<dyn LeaderLease> = Arc::new(InMemoryLease::new());
        let leader_dir = TempDir::new().unwrap();
        let follower_dir = TempDir::new().unwrap();

        let leader = Arc::new(open(
            &leader_dir,
            "leader:8080",
            lease.clone(),
            Arc::new(LoopbackForwarder::default()),
        ));
        let forwarder = Arc::new(LoopbackForwarder::default());
        *forwarder.target.lock() = Some(leader.clone());
        let follower = open(&follower_dir, "follower:8080", lease, forwarder.clone());
        assert!(leader.election().heartbeat().await.unwrap());

        let system = ActorAndProject::system();
        let lab = WalletOwner::project("lab");
        follower
            .root_deposit(&system, vec![grant(lab.clone(), 100, Some("g1"))])
            .await
            .unwrap();
        let parent = leader.retrieve_allocations_internal(&system, &lab, &cpu()).unwrap()[0].id;
        follower
            .deposit(
                &system,
                vec![DepositRequest {
                    target: WalletRef::new(WalletOwner::user("alice"), cpu()),
                    parent_ids: vec![parent],
                    amount: 10,
                    transaction_id: Some("d1".to_string()),
                    start_date: None,
                    end_date: None,
                }],
            )
            .await
            .unwrap();

        let alice = ActorAndProject::user("alice");
        let ids: Vec<_> = leader
            .retrieve_notifications(&alice)
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids.len(), 1);

        assert_eq!(follower.mark_as_read(&alice, ids.clone()).await.unwrap(), 1);
        assert_eq!(follower.mark_as_read(&alice, ids).await.unwrap(), 0);

        let forwarded = forwarder.forwarded.lock().clone();
        assert_eq!(forwarded.len(), 4);
        assert!(matches!(forwarded[3].1.command, Command::MarkAsRead(_)));
        assert!(leader.retrieve_notifications(&alice).unwrap().is_empty());
        assert_eq!(follower.stats().unwrap().total_notifications, 0);
    }

    #[tokio::test]
    async fn test_unreachable_leader_surfaces_retryable_error() {
        let lease: Arc<dyn LeaderLease> = Arc::new(StaticLease::new(Some("leader:8080".to_string())));
        let temp_dir = TempDir::new().unwrap();
        let follower = open(
            &temp_dir,
            "follower:8080",
            lease,
            Arc::new(LoopbackForwarder::default()),
        );

        let err = follower
            .root_deposit(&ActorAndProject::system(), vec![grant(WalletOwner::project("p1"), 1, Some("g1"))])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(follower.stats().unwrap().total_allocations, 0);
    }

    #[tokio::test]
    async fn test_internal_reads_require_internal_caller() {
        let temp_dir = TempDir::new().unwrap();
        let (service, _) = standalone(&temp_dir);
        let owner = WalletOwner::project("p1");
        service
            .root_deposit(&ActorAndProject::system(), vec![grant(owner.clone(), 10, Some("g1"))])
            .await
            .unwrap();

        assert!(matches!(
            service.retrieve_wallets_internal(&ActorAndProject::user("alice"), &owner),
            Err(Error::Forbidden(_))
        ));
        assert_eq!(
            service
                .retrieve_wallets_internal(&ActorAndProject::provider("hpc"), &owner)
                .unwrap()
                .len(),
            1
        );
        assert!(service
            .retrieve_wallets_internal(&ActorAndProject::provider("other"), &owner)
            .unwrap()
            .is_empty());
        assert!(matches!(
            service.retrieve_allocations_internal(&ActorAndProject::provider("other"), &owner, &cpu()),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            service.retrieve_allocations_internal(
                &ActorAndProject::system(),
                &WalletOwner::project("nobody"),
                &cpu()
            ),
            Err(Error::WalletNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let temp_dir = TempDir::new().unwrap();
        let (service, _) = standalone(&temp_dir);
        let out = service
            .apply(&ActorAndProject::system(), Command::Deposit(vec![]))
            .await
            .unwrap();
        assert!(out.is_empty());
        service.shutdown().await.unwrap();
    }
}
