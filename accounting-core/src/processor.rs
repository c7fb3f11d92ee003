//! Accounting processor
//!
//! The serialized mutation engine. Every command runs against one staged
//! [`StoreTxn`] and is committed as a single write batch: a batch either
//! applies completely or leaves the store untouched.
//!
//! # Tree invariants
//!
//! - A charge never increases a balance.
//! - `max_usable_balance = min(balance, min(max_usable_balance of parents))`
//!   holds for every stored allocation after every commit.
//! - A charge deducts from the chosen allocation and every ancestor in the
//!   same commit. Ancestors reachable through several parents are charged once.
//! - A transaction id is applied at most once; replays return the recorded
//!   outcome.

use crate::catalog::ProductCatalog;
use crate::metrics::Metrics;
use crate::notifications::DepositNotificationService;
use crate::storage::{Sequence, Storage, StoreTxn};
use crate::types::{
    Actor, ActorAndProject, Allocation, AllocationId, AllocationPriority, AllocationUpdate,
    ChargeRequest, ChargeType, Command, Credits, DepositRequest, Fingerprint, ProductCategory,
    ProductCategoryId, RootDepositRequest, TransactionKind, TransactionRecord,
    UpdateAllocationRequest, Wallet, WalletOwner,
};
use crate::wallets::WalletDirectory;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Source of "now" for validity windows and timestamps
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create clock frozen at `at`
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Jump to `at`
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    /// Move forward by `by`
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Allocation chosen for a charge together with everything above it
#[derive(Debug, Clone)]
struct ChargePlan {
    target: AllocationId,
    path: Vec<Allocation>,
}

/// Serialized mutation engine
pub struct Processor {
    storage: Arc<Storage>,
    catalog: Arc<dyn ProductCatalog>,
    wallets: WalletDirectory,
    notifications: DepositNotificationService,
    clock: Arc<dyn Clock>,
    priority: AllocationPriority,
    metrics: Metrics,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("storage", &self.storage)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Processor {
    /// Create new processor
    pub fn new(
        storage: Arc<Storage>,
        catalog: Arc<dyn ProductCatalog>,
        clock: Arc<dyn Clock>,
        priority: AllocationPriority,
        metrics: Metrics,
    ) -> Self {
        Self {
            wallets: WalletDirectory::new(storage.clone(), catalog.clone()),
            notifications: DepositNotificationService::new(storage.clone()),
            storage,
            catalog,
            clock,
            priority,
            metrics,
        }
    }

    /// Underlying store
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Apply a command. One outcome per item; `false` means declined.
    pub fn apply(&self, actor: &ActorAndProject, command: &Command) -> Result<Vec<bool>> {
        let now = self.clock.now();
        let mut txn = self.storage.begin();

        let outcomes = match command {
            Command::Check(items) => {
                // Evaluated independently against committed state; nothing is staged
                return items
                    .iter()
                    .map(|item| self.check_item(&txn, actor, item, now))
                    .collect();
            }
            Command::Charge(items) => items
                .iter()
                .map(|item| self.charge_item(&mut txn, actor, item, now))
                .collect::<Result<Vec<_>>>()?,
            Command::Deposit(items) => items
                .iter()
                .map(|item| self.deposit_item(&mut txn, actor, item, now))
                .collect::<Result<Vec<_>>>()?,
            Command::RootDeposit(items) => items
                .iter()
                .map(|item| self.root_deposit_item(&mut txn, actor, item, now))
                .collect::<Result<Vec<_>>>()?,
            Command::UpdateAllocation(items) => items
                .iter()
                .map(|item| self.update_allocation_item(&mut txn, actor, item, now))
                .collect::<Result<Vec<_>>>()?,
            Command::MarkAsRead(ids) => self.notifications.mark_as_read(&mut txn, actor, ids)?,
        };

        let started = std::time::Instant::now();
        txn.commit()?;
        self.metrics
            .record_commit_duration(started.elapsed().as_secs_f64());

        tracing::info!(
            command = command.name(),
            items = outcomes.len(),
            accepted = outcomes.iter().filter(|ok| **ok).count(),
            "Committed command"
        );
        Ok(outcomes)
    }

    // Charge

    fn charge_item(
        &self,
        txn: &mut StoreTxn<'_>,
        actor: &ActorAndProject,
        item: &ChargeRequest,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let transaction_id = require_transaction_id(&item.transaction_id)?;
        let fingerprint = item.fingerprint();
        if let Some(outcome) = replayed(txn, transaction_id, &fingerprint)? {
            tracing::debug!(transaction_id, outcome, "Replayed charge");
            self.metrics.record_replay();
            return Ok(outcome);
        }

        let category = self.catalog.category(&item.category)?;
        authorize_charge(actor, &item.owner, &category.id, false)?;
        let wallet = txn
            .wallet(&item.owner, &item.category)?
            .ok_or_else(|| Error::WalletNotFound(format!("{} / {}", item.owner, item.category)))?;

        let (amount, usage) = charge_amount(txn, &category, &wallet, item)?;

        let mut charged = None;
        let outcome = if amount <= 0 {
            true
        } else {
            match self.plan_charge(txn, &wallet, amount, now)? {
                Some(plan) => {
                    charged = Some(plan.target);
                    self.apply_plan(txn, plan, amount, transaction_id)?;
                    true
                }
                None => false,
            }
        };

        if outcome {
            if let Some(usage) = usage {
                txn.set_usage(wallet.id, usage);
            }
        }

        tracing::debug!(
            transaction_id,
            wallet_id = %wallet.id,
            amount,
            outcome,
            allocation_id = ?charged,
            "Processed charge"
        );

        txn.record_transaction(TransactionRecord {
            transaction_id: transaction_id.to_string(),
            kind: TransactionKind::Charge,
            fingerprint,
            outcome,
            allocation_id: charged,
            committed_at: now,
        });
        self.metrics.record_charge(outcome);
        Ok(outcome)
    }

    fn check_item(
        &self,
        txn: &StoreTxn<'_>,
        actor: &ActorAndProject,
        item: &ChargeRequest,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let category = self.catalog.category(&item.category)?;
        authorize_charge(actor, &item.owner, &category.id, true)?;
        let Some(wallet) = txn.wallet(&item.owner, &item.category)? else {
            return Ok(false);
        };

        let (amount, _) = charge_amount(txn, &category, &wallet, item)?;
        if amount <= 0 {
            return Ok(true);
        }
        Ok(self.plan_charge(txn, &wallet, amount, now)?.is_some())
    }

    /// First allocation, in priority order, whose whole ancestor path covers `amount`
    fn plan_charge(
        &self,
        txn: &StoreTxn<'_>,
        wallet: &Wallet,
        amount: Credits,
        now: DateTime<Utc>,
    ) -> Result<Option<ChargePlan>> {
        let mut candidates: Vec<Allocation> = WalletDirectory::allocations_in(txn, wallet.id)?
            .into_iter()
            .filter(|alloc| alloc.is_valid_at(now))
            .collect();
        self.priority.sort(&mut candidates);

        for candidate in candidates {
            let target = candidate.id;
            let ceiling = candidate.max_usable_balance;
            let path = ancestor_path(txn, candidate)?;

            if !path.iter().all(|alloc| alloc.is_valid_at(now)) {
                continue;
            }
            let bottleneck = path
                .iter()
                .map(|alloc| alloc.balance)
                .min()
                .unwrap_or(0)
                .min(ceiling);

            if bottleneck >= amount {
                return Ok(Some(ChargePlan { target, path }));
            }
        }
        Ok(None)
    }

    fn apply_plan(
        &self,
        txn: &mut StoreTxn<'_>,
        plan: ChargePlan,
        amount: Credits,
        transaction_id: &str,
    ) -> Result<()> {
        let mut charged = Vec::with_capacity(plan.path.len());
        for mut alloc in plan.path {
            alloc.balance = alloc
                .balance
                .checked_sub(amount)
                .ok_or_else(|| Error::InvalidRequest("Credit amount out of range".to_string()))?;
            if alloc.id == plan.target {
                alloc.transaction_log.push(transaction_id.to_string());
            }
            charged.push(alloc.id);
            txn.put_allocation(alloc);
        }
        recompute_max_usable(txn, &charged)
    }

    // Deposits

    fn deposit_item(
        &self,
        txn: &mut StoreTxn<'_>,
        actor: &ActorAndProject,
        item: &DepositRequest,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let transaction_id = require_transaction_id(&item.transaction_id)?;
        let fingerprint = item.fingerprint();
        if let Some(outcome) = replayed(txn, transaction_id, &fingerprint)? {
            tracing::debug!(transaction_id, outcome, "Replayed deposit");
            return Ok(outcome);
        }

        self.catalog.category(&item.target.category)?;
        if item.amount < 0 {
            return Err(Error::InvalidRequest(format!(
                "Deposit amount must not be negative: {}",
                item.amount
            )));
        }
        if item.parent_ids.is_empty() {
            return Err(Error::InvalidRequest(
                "Deposit needs at least one parent allocation".to_string(),
            ));
        }
        let start_date = item.start_date.unwrap_or(now);
        validate_window(start_date, item.end_date)?;

        let mut parents = Vec::with_capacity(item.parent_ids.len());
        for parent_id in &item.parent_ids {
            if parents.iter().any(|p: &Allocation| p.id == *parent_id) {
                continue;
            }
            parents.push(txn.require_allocation(*parent_id)?);
        }

        if let Some(parent) = parents.iter().find(|p| p.category != item.target.category) {
            return Err(Error::Conflict(format!(
                "Allocation {} belongs to {}, not {}",
                parent.id, parent.category, item.target.category
            )));
        }
        if !actor.is_system() {
            let owner = acting_owner(actor)?;
            if let Some(parent) = parents.iter().find(|p| p.owner != owner) {
                return Err(Error::Forbidden(format!(
                    "{} may not sub-allocate from allocation {}",
                    owner, parent.id
                )));
            }
        }

        if parents.iter().any(|p| p.is_expired_at(start_date)) {
            tracing::debug!(transaction_id, "Declined deposit from expired parent");
            record_declined(txn, transaction_id, TransactionKind::Deposit, fingerprint, now);
            return Ok(false);
        }

        let wallet = self
            .wallets
            .resolve_or_create(txn, &item.target.owner, &item.target.category, now)?;
        let ceiling = parents
            .iter()
            .map(|p| p.max_usable_balance)
            .fold(item.amount, Credits::min);

        let allocation = Allocation {
            id: AllocationId(txn.next_id(Sequence::Allocation)?),
            wallet_id: wallet.id,
            owner: wallet.owner.clone(),
            category: wallet.category.clone(),
            parent_ids: parents.iter().map(|p| p.id).collect(),
            initial_balance: item.amount,
            balance: item.amount,
            max_usable_balance: ceiling,
            start_date,
            end_date: item.end_date,
            granted_in: transaction_id.to_string(),
            transaction_log: vec![transaction_id.to_string()],
            updates: Vec::new(),
            created_at: now,
        };

        for parent in &parents {
            txn.add_edge(parent.id, allocation.id);
        }
        txn.link_wallet_allocation(wallet.id, allocation.id);
        self.notifications.stage(txn, &allocation, now)?;

        tracing::info!(
            transaction_id,
            allocation_id = %allocation.id,
            wallet_id = %wallet.id,
            amount = item.amount,
            "Created sub-allocation"
        );

        record_created(txn, transaction_id, TransactionKind::Deposit, fingerprint, allocation.id, now);
        txn.put_allocation(allocation);
        self.metrics.deposits_total.inc();
        Ok(true)
    }

    fn root_deposit_item(
        &self,
        txn: &mut StoreTxn<'_>,
        actor: &ActorAndProject,
        item: &RootDepositRequest,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let transaction_id = require_transaction_id(&item.transaction_id)?;
        let fingerprint = item.fingerprint();
        if let Some(outcome) = replayed(txn, transaction_id, &fingerprint)? {
            tracing::debug!(transaction_id, outcome, "Replayed root deposit");
            return Ok(outcome);
        }

        if !actor.is_system() {
            return Err(Error::Forbidden(format!(
                "{} may not create root allocations",
                actor.actor.name()
            )));
        }
        self.catalog.category(&item.target.category)?;
        if item.amount < 0 {
            return Err(Error::InvalidRequest(format!(
                "Deposit amount must not be negative: {}",
                item.amount
            )));
        }
        let start_date = item.start_date.unwrap_or(now);
        validate_window(start_date, item.end_date)?;

        let wallet = self
            .wallets
            .resolve_or_create(txn, &item.target.owner, &item.target.category, now)?;
        let allocation = Allocation {
            id: AllocationId(txn.next_id(Sequence::Allocation)?),
            wallet_id: wallet.id,
            owner: wallet.owner.clone(),
            category: wallet.category.clone(),
            parent_ids: Vec::new(),
            initial_balance: item.amount,
            balance: item.amount,
            max_usable_balance: item.amount,
            start_date,
            end_date: item.end_date,
            granted_in: transaction_id.to_string(),
            transaction_log: vec![transaction_id.to_string()],
            updates: Vec::new(),
            created_at: now,
        };
        txn.link_wallet_allocation(wallet.id, allocation.id);

        tracing::info!(
            transaction_id,
            allocation_id = %allocation.id,
            wallet_id = %wallet.id,
            amount = item.amount,
            "Created root allocation"
        );

        record_created(txn, transaction_id, TransactionKind::RootDeposit, fingerprint, allocation.id, now);
        txn.put_allocation(allocation);
        self.metrics.root_deposits_total.inc();
        Ok(true)
    }

    // Administrative updates

    fn update_allocation_item(
        &self,
        txn: &mut StoreTxn<'_>,
        actor: &ActorAndProject,
        item: &UpdateAllocationRequest,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let transaction_id = require_transaction_id(&item.transaction_id)?;
        let fingerprint = item.fingerprint();
        if let Some(outcome) = replayed(txn, transaction_id, &fingerprint)? {
            tracing::debug!(transaction_id, outcome, "Replayed allocation update");
            return Ok(outcome);
        }

        let mut alloc = txn.require_allocation(item.allocation_id)?;
        self.authorize_update(txn, actor, &alloc)?;
        if item.new_balance < 0 {
            return Err(Error::InvalidRequest(format!(
                "Allocation balance must not be negative: {}",
                item.new_balance
            )));
        }

        let end_date = item.new_end_date.or(alloc.end_date);
        if end_date.map_or(false, |end| item.new_start_date > end) {
            tracing::debug!(transaction_id, allocation_id = %alloc.id, "Declined update ending before it starts");
            record_declined(txn, transaction_id, TransactionKind::UpdateAllocation, fingerprint, now);
            return Ok(false);
        }

        // Keep what was already consumed; only the grant changes
        let previous_balance = alloc.balance;
        alloc.balance = item
            .new_balance
            .checked_sub(alloc.consumed())
            .ok_or_else(|| Error::InvalidRequest("Credit amount out of range".to_string()))?;
        alloc.initial_balance = item.new_balance;
        alloc.start_date = item.new_start_date;
        alloc.end_date = end_date;
        alloc.transaction_log.push(transaction_id.to_string());
        alloc.updates.push(AllocationUpdate {
            transaction_id: transaction_id.to_string(),
            performed_by: actor.actor.name().to_string(),
            reason: item.reason.clone(),
            previous_balance,
            applied_at: now,
        });

        tracing::info!(
            transaction_id,
            allocation_id = %alloc.id,
            previous_balance,
            balance = alloc.balance,
            reason = %item.reason,
            "Updated allocation"
        );

        let id = alloc.id;
        txn.put_allocation(alloc);
        recompute_max_usable(txn, &[id])?;

        record_created(txn, transaction_id, TransactionKind::UpdateAllocation, fingerprint, id, now);
        self.metrics.allocation_updates_total.inc();
        Ok(true)
    }

    fn authorize_update(
        &self,
        txn: &StoreTxn<'_>,
        actor: &ActorAndProject,
        alloc: &Allocation,
    ) -> Result<()> {
        if actor.is_system() {
            return Ok(());
        }
        if alloc.parent_ids.is_empty() {
            return Err(Error::Forbidden(format!(
                "Root allocation {} can only be updated by the system",
                alloc.id
            )));
        }

        let owner = acting_owner(actor)?;
        for parent_id in &alloc.parent_ids {
            if txn.require_allocation(*parent_id)?.owner == owner {
                return Ok(());
            }
        }
        Err(Error::Forbidden(format!(
            "{} does not own a parent of allocation {}",
            owner, alloc.id
        )))
    }
}

fn require_transaction_id(transaction_id: &Option<String>) -> Result<&str> {
    transaction_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::InvalidRequest("Missing transaction id".to_string()))
}

/// Outcome of an already applied transaction; `Conflict` if the id was used for another payload
fn replayed(txn: &StoreTxn<'_>, transaction_id: &str, fingerprint: &[u8]) -> Result<Option<bool>> {
    match txn.transaction(transaction_id)? {
        Some(record) if record.fingerprint == fingerprint => Ok(Some(record.outcome)),
        Some(record) => Err(Error::Conflict(format!(
            "Transaction {} was already used for a different {:?} request",
            transaction_id, record.kind
        ))),
        None => Ok(None),
    }
}

fn record_declined(
    txn: &mut StoreTxn<'_>,
    transaction_id: &str,
    kind: TransactionKind,
    fingerprint: Vec<u8>,
    now: DateTime<Utc>,
) {
    txn.record_transaction(TransactionRecord {
        transaction_id: transaction_id.to_string(),
        kind,
        fingerprint,
        outcome: false,
        allocation_id: None,
        committed_at: now,
    });
}

fn record_created(
    txn: &mut StoreTxn<'_>,
    transaction_id: &str,
    kind: TransactionKind,
    fingerprint: Vec<u8>,
    allocation_id: AllocationId,
    now: DateTime<Utc>,
) {
    txn.record_transaction(TransactionRecord {
        transaction_id: transaction_id.to_string(),
        kind,
        fingerprint,
        outcome: true,
        allocation_id: Some(allocation_id),
        committed_at: now,
    });
}

fn acting_owner(actor: &ActorAndProject) -> Result<WalletOwner> {
    actor.acting_owner().ok_or_else(|| {
        Error::Forbidden(format!("{} does not own any wallet", actor.actor.name()))
    })
}

/// Providers charge their own categories; users may only dry-run their own wallets
fn authorize_charge(
    actor: &ActorAndProject,
    owner: &WalletOwner,
    category: &ProductCategoryId,
    dry_run: bool,
) -> Result<()> {
    let allowed = match &actor.actor {
        Actor::System => true,
        Actor::Provider(provider) => *provider == category.provider,
        Actor::User(_) => dry_run && actor.acting_owner().as_ref() == Some(owner),
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "{} may not charge {} for {}",
            actor.actor.name(),
            owner,
            category
        )))
    }
}

fn validate_window(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Result<()> {
    match end {
        Some(end) if end < start => Err(Error::InvalidRequest(format!(
            "Allocation would end ({}) before it starts ({})",
            end, start
        ))),
        _ => Ok(()),
    }
}

/// Amount to deduct, plus the absolute usage to record for differential categories
fn charge_amount(
    txn: &StoreTxn<'_>,
    category: &ProductCategory,
    wallet: &Wallet,
    item: &ChargeRequest,
) -> Result<(Credits, Option<Credits>)> {
    if item.units < 0 {
        return Err(Error::InvalidRequest(format!(
            "Charged units must not be negative: {}",
            item.units
        )));
    }

    match category.charge_type {
        ChargeType::Absolute => {
            let periods = item.periods.unwrap_or(1);
            if periods == 0 {
                return Err(Error::InvalidRequest("Periods must be positive".to_string()));
            }
            let amount = i64::try_from(periods)
                .ok()
                .and_then(|periods| item.units.checked_mul(periods))
                .ok_or_else(|| Error::InvalidRequest("Credit amount out of range".to_string()))?;
            Ok((amount, None))
        }
        ChargeType::DifferentialQuota => {
            let last = txn.usage(wallet.id)?.unwrap_or(0);
            Ok((item.units - last, Some(item.units)))
        }
    }
}

/// The allocation followed by all of its ancestors, each exactly once
fn ancestor_path(txn: &StoreTxn<'_>, start: Allocation) -> Result<Vec<Allocation>> {
    let mut seen = HashSet::from([start.id]);
    let mut queue: VecDeque<AllocationId> = start.parent_ids.iter().copied().collect();
    let mut path = vec![start];

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let alloc = txn.require_allocation(id)?;
        queue.extend(alloc.parent_ids.iter().copied());
        path.push(alloc);
    }
    Ok(path)
}

/// Recompute `max_usable_balance` for `roots` and every allocation below them
fn recompute_max_usable(txn: &mut StoreTxn<'_>, roots: &[AllocationId]) -> Result<()> {
    let mut affected: HashSet<AllocationId> = HashSet::new();
    let mut queue: VecDeque<AllocationId> = roots.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if affected.insert(id) {
            queue.extend(txn.children_of(id)?);
        }
    }

    let mut memo = HashMap::with_capacity(affected.len());
    let mut changed = Vec::new();
    for id in &affected {
        let value = resolve_max(txn, *id, &affected, &mut memo)?;
        let alloc = txn.require_allocation(*id)?;
        if alloc.max_usable_balance != value {
            changed.push((alloc, value));
        }
    }

    tracing::debug!(affected = affected.len(), changed = changed.len(), "Recomputed usable balances");
    for (mut alloc, value) in changed {
        alloc.max_usable_balance = value;
        txn.put_allocation(alloc);
    }
    Ok(())
}

/// Usable ceiling of `id`; allocations outside `affected` keep their stored value
fn resolve_max(
    txn: &StoreTxn<'_>,
    id: AllocationId,
    affected: &HashSet<AllocationId>,
    memo: &mut HashMap<AllocationId, Credits>,
) -> Result<Credits> {
    if let Some(value) = memo.get(&id) {
        return Ok(*value);
    }

    let alloc = txn.require_allocation(id)?;
    let value = if affected.contains(&id) {
        let mut value = alloc.balance;
        for parent in &alloc.parent_ids {
            value = value.min(resolve_max(txn, *parent, affected, memo)?);
        }
        value
    } else {
        alloc.max_usable_balance
    };

    memo.insert(id, value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::types::{ProductType, WalletRef};
    use crate::Config;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Fixture {
        processor: Processor,
        clock: Arc<ManualClock>,
        _temp: TempDir,
    }

    fn cpu() -> ProductCategoryId {
        ProductCategoryId::new("cpu", "hpc")
    }

    fn cephfs() -> ProductCategoryId {
        ProductCategoryId::new("cephfs", "hpc")
    }

    fn fixture_with(priority: AllocationPriority) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let catalog = Arc::new(StaticCatalog::new(vec![
            ProductCategory {
                id: cpu(),
                product_type: ProductType::Compute,
                charge_type: ChargeType::Absolute,
            },
            ProductCategory {
                id: cephfs(),
                product_type: ProductType::Storage,
                charge_type: ChargeType::DifferentialQuota,
            },
        ]));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let processor = Processor::new(
            storage,
            catalog,
            clock.clone(),
            priority,
            Metrics::new().unwrap(),
        );
        Fixture {
            processor,
            clock,
            _temp: temp_dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AllocationPriority::default())
    }

    impl Fixture {
        fn root(&self, owner: WalletOwner, category: ProductCategoryId, amount: Credits, tx: &str) -> AllocationId {
            let ok = self
                .processor
                .apply(
                    &ActorAndProject::system(),
                    &Command::RootDeposit(vec![RootDepositRequest {
                        target: WalletRef::new(owner, category),
                        amount,
                        transaction_id: Some(tx.to_string()),
                        start_date: None,
                        end_date: None,
                    }]),
                )
                .unwrap();
            assert_eq!(ok, vec![true]);
            self.created_by(tx)
        }

        fn sub(&self, parent: AllocationId, owner: WalletOwner, amount: Credits, tx: &str) -> AllocationId {
            let ok = self
                .processor
                .apply(&ActorAndProject::system(), &Command::Deposit(vec![deposit(parent, owner, amount, tx)]))
                .unwrap();
            assert_eq!(ok, vec![true]);
            self.created_by(tx)
        }

        fn created_by(&self, tx: &str) -> AllocationId {
            self.processor
                .storage()
                .get_transaction(tx)
                .unwrap()
                .unwrap()
                .allocation_id
                .unwrap()
        }

        fn alloc(&self, id: AllocationId) -> Allocation {
            self.processor.storage().get_allocation(id).unwrap().unwrap()
        }

        fn charge(&self, owner: WalletOwner, units: Credits, tx: &str) -> Result<bool> {
            self.charge_in(owner, cpu(), units, tx)
        }

        fn charge_in(&self, owner: WalletOwner, category: ProductCategoryId, units: Credits, tx: &str) -> Result<bool> {
            let out = self.processor.apply(
                &ActorAndProject::provider("hpc"),
                &Command::Charge(vec![ChargeRequest::new(owner, category, units, tx)]),
            )?;
            Ok(out[0])
        }

        fn update(&self, id: AllocationId, new_balance: Credits, tx: &str) -> Result<Vec<bool>> {
            self.processor.apply(
                &ActorAndProject::system(),
                &Command::UpdateAllocation(vec![UpdateAllocationRequest {
                    allocation_id: id,
                    new_balance,
                    new_start_date: self.clock.now(),
                    new_end_date: None,
                    reason: "correction".to_string(),
                    transaction_id: Some(tx.to_string()),
                }]),
            )
        }

        /// root(10000) -> mid(5000) -> leaf(1000)
        fn tree(&self) -> (AllocationId, AllocationId, AllocationId) {
            let root = self.root(WalletOwner::project("root"), cpu(), 10_000, "r1");
            let mid = self.sub(root, WalletOwner::project("mid"), 5_000, "d1");
            let leaf = self.sub(mid, WalletOwner::project("leaf"), 1_000, "d2");
            (root, mid, leaf)
        }
    }

    fn deposit(parent: AllocationId, owner: WalletOwner, amount: Credits, tx: &str) -> DepositRequest {
        DepositRequest {
            target: WalletRef::new(owner, cpu()),
            parent_ids: vec![parent],
            amount,
            transaction_id: Some(tx.to_string()),
            start_date: None,
            end_date: None,
        }
    }

    #[test]
    fn test_charge_propagates_to_ancestors() {
        let f = fixture();
        let (root, mid, leaf) = f.tree();

        assert!(f.charge(WalletOwner::project("leaf"), 50, "c1").unwrap());

        assert_eq!(f.alloc(root).balance, 9_950);
        assert_eq!(f.alloc(mid).balance, 4_950);
        assert_eq!(f.alloc(leaf).balance, 950);
        assert_eq!(f.alloc(leaf).max_usable_balance, 950);
        assert_eq!(f.alloc(leaf).transaction_log.last().map(String::as_str), Some("c1"));
        assert_eq!(f.processor.metrics().charges_accepted.get(), 1);
    }

    #[test]
    fn test_ancestor_records_do_not_grow_with_charges() {
        let f = fixture();
        let root = f.root(WalletOwner::project("root"), cpu(), 10_000, "r1");
        let children: Vec<_> = (0..5)
            .map(|i| f.sub(root, WalletOwner::project(format!("c{}", i)), 1_000, &format!("d{}", i)))
            .collect();

        for n in 0..100 {
            let owner = WalletOwner::project(format!("c{}", n % 5));
            assert!(f.charge(owner, 1, &format!("job-{}", n)).unwrap());
        }

        assert_eq!(f.alloc(root).balance, 9_900);
        assert_eq!(f.alloc(root).transaction_log, vec!["r1".to_string()]);
        for child in children {
            // Grant plus its own charges
            assert_eq!(f.alloc(child).transaction_log.len(), 1 + 20);
        }
    }

    #[test]
    fn test_charge_replay_is_idempotent() {
        let f = fixture();
        let (root, _, leaf) = f.tree();

        assert!(f.charge(WalletOwner::project("leaf"), 50, "c1").unwrap());
        assert!(f.charge(WalletOwner::project("leaf"), 50, "c1").unwrap());

        assert_eq!(f.alloc(leaf).balance, 950);
        assert_eq!(f.alloc(root).balance, 9_950);
        assert_eq!(f.processor.metrics().charges_replayed.get(), 1);
    }

    #[test]
    fn test_reused_transaction_id_conflicts() {
        let f = fixture();
        let (_, _, leaf) = f.tree();

        assert!(f.charge(WalletOwner::project("leaf"), 50, "c1").unwrap());
        let err = f.charge(WalletOwner::project("leaf"), 60, "c1").unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(f.alloc(leaf).balance, 950);
    }

    #[test]
    fn test_update_tightens_descendant_ceiling() {
        let f = fixture();
        let (_, mid, leaf) = f.tree();

        assert_eq!(f.update(mid, 10, "u1").unwrap(), vec![true]);

        let leaf_alloc = f.alloc(leaf);
        assert_eq!(leaf_alloc.max_usable_balance, 10);
        assert_eq!(leaf_alloc.balance, 1_000);

        let mid_alloc = f.alloc(mid);
        assert_eq!(mid_alloc.balance, 10);
        assert_eq!(mid_alloc.updates.len(), 1);
        assert_eq!(mid_alloc.updates[0].previous_balance, 5_000);
        assert_eq!(mid_alloc.updates[0].reason, "correction");
    }

    #[test]
    fn test_balance_may_go_negative_after_update() {
        let f = fixture();
        let (root, mid, leaf) = f.tree();
        let leaf_owner = WalletOwner::project("leaf");

        assert!(f.charge(leaf_owner.clone(), 50, "c1").unwrap());
        f.update(mid, 10, "u1").unwrap();
        assert_eq!(f.alloc(mid).balance, -40);

        assert!(f.charge(leaf_owner.clone(), 0, "c2").unwrap());
        assert!(!f.charge(leaf_owner, 40, "c3").unwrap());

        assert_eq!(f.alloc(root).balance, 9_950);
        assert_eq!(f.alloc(mid).balance, -40);
        assert_eq!(f.alloc(leaf).balance, 950);
        assert_eq!(f.processor.metrics().charges_declined.get(), 1);
    }

    #[test]
    fn test_charge_tightens_sibling_ceilings() {
        let f = fixture();
        let root = f.root(WalletOwner::project("root"), cpu(), 100, "r1");
        let a = f.sub(root, WalletOwner::project("a"), 100, "d1");
        let b = f.sub(root, WalletOwner::project("b"), 100, "d2");

        assert!(f.charge(WalletOwner::project("a"), 70, "c1").unwrap());
        assert_eq!(f.alloc(a).max_usable_balance, 30);
        assert_eq!(f.alloc(b).max_usable_balance, 30);
        assert_eq!(f.alloc(b).balance, 100);

        assert!(!f.charge(WalletOwner::project("b"), 31, "c2").unwrap());
        assert!(f.charge(WalletOwner::project("b"), 30, "c3").unwrap());
        assert_eq!(f.alloc(root).balance, 0);
    }

    #[test]
    fn test_shared_ancestor_charged_once() {
        let f = fixture();
        let root = f.root(WalletOwner::project("root"), cpu(), 1_000, "r1");
        let left = f.sub(root, WalletOwner::project("team"), 500, "d1");
        let right = f.sub(root, WalletOwner::project("team"), 500, "d2");

        let ok = f
            .processor
            .apply(
                &ActorAndProject::system(),
                &Command::Deposit(vec![DepositRequest {
                    target: WalletRef::new(WalletOwner::project("leaf"), cpu()),
                    parent_ids: vec![left, right],
                    amount: 100,
                    transaction_id: Some("d3".to_string()),
                    start_date: None,
                    end_date: None,
                }]),
            )
            .unwrap();
        assert_eq!(ok, vec![true]);

        assert!(f.charge(WalletOwner::project("leaf"), 10, "c1").unwrap());
        assert_eq!(f.alloc(root).balance, 990);
        assert_eq!(f.alloc(left).balance, 490);
        assert_eq!(f.alloc(right).balance, 490);
    }

    #[test]
    fn test_earliest_expiring_allocation_charged_first() {
        let f = fixture();
        let now = f.clock.now();
        let owner = WalletOwner::user("alice");
        for (tx, days) in [("r1", 30), ("r2", 5)] {
            f.processor
                .apply(
                    &ActorAndProject::system(),
                    &Command::RootDeposit(vec![RootDepositRequest {
                        target: WalletRef::new(owner.clone(), cpu()),
                        amount: 100,
                        transaction_id: Some(tx.to_string()),
                        start_date: Some(now),
                        end_date: Some(now + Duration::days(days)),
                    }]),
                )
                .unwrap();
        }

        assert!(f.charge(owner.clone(), 60, "c1").unwrap());
        assert_eq!(f.alloc(f.created_by("r2")).balance, 40);
        assert_eq!(f.alloc(f.created_by("r1")).balance, 100);

        // Too much for the soon-expiring one, falls through to the next
        assert!(f.charge(owner, 70, "c2").unwrap());
        assert_eq!(f.alloc(f.created_by("r1")).balance, 30);
    }

    #[test]
    fn test_expired_allocation_not_charged() {
        let f = fixture();
        let now = f.clock.now();
        let owner = WalletOwner::user("alice");
        f.processor
            .apply(
                &ActorAndProject::system(),
                &Command::RootDeposit(vec![RootDepositRequest {
                    target: WalletRef::new(owner.clone(), cpu()),
                    amount: 100,
                    transaction_id: Some("r1".to_string()),
                    start_date: Some(now),
                    end_date: Some(now + Duration::days(1)),
                }]),
            )
            .unwrap();

        f.clock.advance(Duration::days(2));
        assert!(!f.charge(owner, 10, "c1").unwrap());
    }

    #[test]
    fn test_differential_charges_delta() {
        let f = fixture();
        let owner = WalletOwner::project("p1");
        let alloc = f.root(owner.clone(), cephfs(), 1_000, "r1");

        assert!(f.charge_in(owner.clone(), cephfs(), 100, "c1").unwrap());
        assert_eq!(f.alloc(alloc).balance, 900);

        assert!(f.charge_in(owner.clone(), cephfs(), 150, "c2").unwrap());
        assert_eq!(f.alloc(alloc).balance, 850);

        // Usage dropped: bookkeeping only
        assert!(f.charge_in(owner.clone(), cephfs(), 120, "c3").unwrap());
        assert_eq!(f.alloc(alloc).balance, 850);

        assert!(f.charge_in(owner, cephfs(), 170, "c4").unwrap());
        assert_eq!(f.alloc(alloc).balance, 800);
    }

    #[test]
    fn test_check_does_not_mutate() {
        let f = fixture();
        let (_, _, leaf) = f.tree();
        let owner = WalletOwner::project("leaf");

        let out = f
            .processor
            .apply(
                &ActorAndProject::user_in_project("bob", "leaf"),
                &Command::Check(vec![
                    ChargeRequest::new(owner.clone(), cpu(), 800, "k1"),
                    ChargeRequest::new(owner.clone(), cpu(), 1_001, "k2"),
                    ChargeRequest::new(WalletOwner::project("leaf"), cpu(), 0, "k3"),
                ]),
            )
            .unwrap();
        assert_eq!(out, vec![true, false, true]);
        assert_eq!(f.alloc(leaf).balance, 1_000);
        assert!(f.processor.storage().get_transaction("k1").unwrap().is_none());

        // Users may not really charge
        let err = f
            .processor
            .apply(
                &ActorAndProject::user_in_project("bob", "leaf"),
                &Command::Charge(vec![ChargeRequest::new(owner, cpu(), 1, "c1")]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_deposit_rules() {
        let f = fixture();
        let root = f.root(WalletOwner::project("p1"), cpu(), 1_000, "r1");
        let pi = ActorAndProject::user_in_project("pi", "p1");
        let outsider = ActorAndProject::user_in_project("eve", "p2");

        // Owner of the parent may sub-allocate, and a notification is produced
        let ok = f
            .processor
            .apply(&pi, &Command::Deposit(vec![deposit(root, WalletOwner::user("student"), 100, "d1")]))
            .unwrap();
        assert_eq!(ok, vec![true]);
        assert_eq!(f.processor.storage().unread_notifications().unwrap().len(), 1);

        let err = f
            .processor
            .apply(&outsider, &Command::Deposit(vec![deposit(root, WalletOwner::user("eve"), 100, "d2")]))
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let mut wrong_category = deposit(root, WalletOwner::user("student"), 100, "d3");
        wrong_category.target.category = cephfs();
        let err = f
            .processor
            .apply(&pi, &Command::Deposit(vec![wrong_category]))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = f
            .processor
            .apply(&pi, &Command::Deposit(vec![deposit(AllocationId(999), WalletOwner::user("student"), 1, "d4")]))
            .unwrap_err();
        assert!(matches!(err, Error::AllocationNotFound(_)));

        let err = f
            .processor
            .apply(
                &pi,
                &Command::RootDeposit(vec![RootDepositRequest {
                    target: WalletRef::new(WalletOwner::project("p1"), cpu()),
                    amount: 1,
                    transaction_id: Some("r2".to_string()),
                    start_date: None,
                    end_date: None,
                }]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[test]
    fn test_deposit_ceiling_bounded_by_parent() {
        let f = fixture();
        let root = f.root(WalletOwner::project("p1"), cpu(), 100, "r1");
        let child = f.sub(root, WalletOwner::project("p2"), 500, "d1");

        let alloc = f.alloc(child);
        assert_eq!(alloc.balance, 500);
        assert_eq!(alloc.max_usable_balance, 100);
        // Parents are not drawn down by a deposit
        assert_eq!(f.alloc(root).balance, 100);
    }

    #[test]
    fn test_deposit_from_expired_parent_declined() {
        let f = fixture();
        let now = f.clock.now();
        f.processor
            .apply(
                &ActorAndProject::system(),
                &Command::RootDeposit(vec![RootDepositRequest {
                    target: WalletRef::new(WalletOwner::project("p1"), cpu()),
                    amount: 100,
                    transaction_id: Some("r1".to_string()),
                    start_date: Some(now),
                    end_date: Some(now + Duration::days(1)),
                }]),
            )
            .unwrap();
        let root = f.created_by("r1");

        let mut late = deposit(root, WalletOwner::project("p2"), 10, "d1");
        late.start_date = Some(now + Duration::days(3));
        let out = f
            .processor
            .apply(&ActorAndProject::system(), &Command::Deposit(vec![late.clone()]))
            .unwrap();
        assert_eq!(out, vec![false]);

        // Declines are remembered too
        let out = f
            .processor
            .apply(&ActorAndProject::system(), &Command::Deposit(vec![late]))
            .unwrap();
        assert_eq!(out, vec![false]);
        assert!(f.processor.storage().unread_notifications().unwrap().is_empty());
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let f = fixture();
        let root = f.root(WalletOwner::project("p1"), cpu(), 100, "r1");

        let err = f
            .processor
            .apply(
                &ActorAndProject::system(),
                &Command::Deposit(vec![
                    deposit(root, WalletOwner::project("p2"), 10, "d1"),
                    deposit(AllocationId(404), WalletOwner::project("p3"), 10, "d2"),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AllocationNotFound(_)));
        assert!(f.processor.storage().get_transaction("d1").unwrap().is_none());
        assert!(f
            .processor
            .storage()
            .get_wallet(&WalletOwner::project("p2"), &cpu())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_rules() {
        let f = fixture();
        let (root, mid, leaf) = f.tree();

        // Owner of the parent may update the child, not the other way round
        let mid_owner = ActorAndProject::user_in_project("pi", "mid");
        let request = |id, tx: &str| UpdateAllocationRequest {
            allocation_id: id,
            new_balance: 500,
            new_start_date: f.clock.now(),
            new_end_date: None,
            reason: "resize".to_string(),
            transaction_id: Some(tx.to_string()),
        };
        assert_eq!(
            f.processor
                .apply(&mid_owner, &Command::UpdateAllocation(vec![request(leaf, "u1")]))
                .unwrap(),
            vec![true]
        );
        assert!(matches!(
            f.processor
                .apply(&mid_owner, &Command::UpdateAllocation(vec![request(mid, "u2")])),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            f.processor
                .apply(&mid_owner, &Command::UpdateAllocation(vec![request(root, "u3")])),
            Err(Error::Forbidden(_))
        ));

        let mut backwards = request(leaf, "u4");
        backwards.new_end_date = Some(f.clock.now() - Duration::days(1));
        assert_eq!(
            f.processor
                .apply(&ActorAndProject::system(), &Command::UpdateAllocation(vec![backwards]))
                .unwrap(),
            vec![false]
        );
        assert_eq!(f.alloc(leaf).balance, 500);
    }

    #[test]
    fn test_unknown_wallet_and_category() {
        let f = fixture();
        assert!(matches!(
            f.charge(WalletOwner::user("ghost"), 1, "c1"),
            Err(Error::WalletNotFound(_))
        ));
        assert!(matches!(
            f.charge_in(WalletOwner::user("ghost"), ProductCategoryId::new("gpu", "hpc"), 1, "c2"),
            Err(Error::UnknownCategory(_))
        ));
    }
}
