//! Core types for the accounting engine
//!
//! All types stored in RocksDB are serialized with bincode, so enums stay
//! externally tagged and no field is skipped conditionally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Amount of credits. Signed: administrative updates may leave a balance negative.
pub type Credits = i64;

/// Wallet identifier (sequential)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub u64);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocation identifier (sequential)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deposit notification identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub u64);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owner of a wallet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletOwner {
    /// Personal wallet of a user
    User(String),
    /// Wallet of a project
    Project(String),
}

impl WalletOwner {
    /// Create a user owner
    pub fn user(username: impl Into<String>) -> Self {
        WalletOwner::User(username.into())
    }

    /// Create a project owner
    pub fn project(project_id: impl Into<String>) -> Self {
        WalletOwner::Project(project_id.into())
    }

    /// Key used by the store (`u:alice`, `p:1234`)
    pub fn storage_key(&self) -> String {
        match self {
            WalletOwner::User(username) => format!("u:{}", username),
            WalletOwner::Project(project) => format!("p:{}", project),
        }
    }
}

impl fmt::Display for WalletOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletOwner::User(username) => write!(f, "user:{}", username),
            WalletOwner::Project(project) => write!(f, "project:{}", project),
        }
    }
}

/// Product category reference (name within a provider)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductCategoryId {
    /// Category name (e.g. `u1-standard`)
    pub name: String,
    /// Provider offering the category
    pub provider: String,
}

impl ProductCategoryId {
    /// Create new category reference
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
        }
    }
}

impl fmt::Display for ProductCategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.provider)
    }
}

/// Kind of resource a category sells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Compute,
    Storage,
    Ingress,
    License,
    NetworkIp,
}

/// How usage reported against a category is turned into a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeType {
    /// Each charge is an amount to subtract
    Absolute,
    /// Each charge reports absolute usage-to-date; only the delta is subtracted
    DifferentialQuota,
}

/// Chargeable product category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCategory {
    /// Category reference
    pub id: ProductCategoryId,
    /// Resource kind
    pub product_type: ProductType,
    /// Charging mode
    pub charge_type: ChargeType,
}

/// Wallet: the allocations of one owner for one product category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub id: WalletId,
    /// Owner
    pub owner: WalletOwner,
    /// Category the wallet pays for
    pub category: ProductCategoryId,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Audit entry for an administrative allocation update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationUpdate {
    /// Transaction that applied the update
    pub transaction_id: String,
    /// Who performed the update
    pub performed_by: String,
    /// Free-form justification
    pub reason: String,
    /// Balance before the update
    pub previous_balance: Credits,
    /// When the update was applied
    pub applied_at: DateTime<Utc>,
}

/// Node of the allocation forest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation ID
    pub id: AllocationId,
    /// Wallet holding the allocation
    pub wallet_id: WalletId,
    /// Owner of the wallet
    pub owner: WalletOwner,
    /// Category of the wallet
    pub category: ProductCategoryId,
    /// Direct parents (empty for roots)
    pub parent_ids: Vec<AllocationId>,
    /// Amount originally granted
    pub initial_balance: Credits,
    /// Remaining credit
    pub balance: Credits,
    /// Spendable ceiling: `min(balance, min(max_usable_balance of parents))`
    pub max_usable_balance: Credits,
    /// Start of validity window
    pub start_date: DateTime<Utc>,
    /// End of validity window (open-ended if `None`)
    pub end_date: Option<DateTime<Utc>>,
    /// Transaction that created this allocation
    pub granted_in: String,
    /// Transactions aimed at this allocation itself. Charges paid as an ancestor are not listed.
    pub transaction_log: Vec<String>,
    /// Administrative updates
    pub updates: Vec<AllocationUpdate>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    /// Whether the allocation may be charged at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && self.end_date.map_or(true, |end| now <= end)
    }

    /// Whether the validity window ended before `at`
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.end_date.map_or(false, |end| end < at)
    }

    /// Credits consumed from this allocation so far
    pub fn consumed(&self) -> Credits {
        self.initial_balance - self.balance
    }

    /// Derived lifecycle state
    pub fn state(&self, now: DateTime<Utc>) -> AllocationState {
        if self.is_expired_at(now) {
            AllocationState::Expired
        } else if now < self.start_date {
            AllocationState::Created
        } else if self.max_usable_balance <= 0 {
            AllocationState::Exhausted
        } else {
            AllocationState::Active
        }
    }
}

/// Allocation lifecycle, computed at read time and never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Created,
    Active,
    Exhausted,
    Expired,
}

/// Order in which a wallet's allocations are tried by a charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPriority {
    /// Soonest `end_date` first, open-ended allocations last
    #[default]
    EarliestExpiring,
    /// Earliest `start_date` first
    OldestFirst,
    /// Largest `max_usable_balance` first
    LargestBalanceFirst,
}

impl AllocationPriority {
    /// Compare two allocations; ties are broken by ID so the order is total
    pub fn compare(&self, a: &Allocation, b: &Allocation) -> Ordering {
        let primary = match self {
            AllocationPriority::EarliestExpiring => match (a.end_date, b.end_date) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            AllocationPriority::OldestFirst => a.start_date.cmp(&b.start_date),
            AllocationPriority::LargestBalanceFirst => {
                b.max_usable_balance.cmp(&a.max_usable_balance)
            }
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    /// Sort candidates in priority order
    pub fn sort(&self, allocations: &mut [Allocation]) {
        allocations.sort_by(|a, b| self.compare(a, b));
    }
}

/// Who is calling
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// Internal services
    System,
    /// End user
    User(String),
    /// Resource provider
    Provider(String),
}

impl Actor {
    /// Name used to namespace transaction ids
    pub fn name(&self) -> &str {
        match self {
            Actor::System => "_system",
            Actor::User(username) => username,
            Actor::Provider(provider) => provider,
        }
    }
}

/// Verified caller identity plus the project it is acting in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorAndProject {
    /// Caller
    pub actor: Actor,
    /// Project the caller acts on behalf of
    pub project: Option<String>,
}

impl ActorAndProject {
    /// Internal system caller
    pub fn system() -> Self {
        Self {
            actor: Actor::System,
            project: None,
        }
    }

    /// User acting personally
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            actor: Actor::User(username.into()),
            project: None,
        }
    }

    /// User acting within a project
    pub fn user_in_project(username: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            actor: Actor::User(username.into()),
            project: Some(project.into()),
        }
    }

    /// Provider caller
    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            actor: Actor::Provider(provider.into()),
            project: None,
        }
    }

    /// Whether the caller bypasses ownership checks
    pub fn is_system(&self) -> bool {
        self.actor == Actor::System
    }

    /// Wallet owner the caller speaks for
    pub fn acting_owner(&self) -> Option<WalletOwner> {
        match (&self.actor, &self.project) {
            (Actor::System, _) | (Actor::Provider(_), _) => None,
            (Actor::User(_), Some(project)) => Some(WalletOwner::Project(project.clone())),
            (Actor::User(username), None) => Some(WalletOwner::User(username.clone())),
        }
    }
}

/// Wallet a deposit is aimed at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletRef {
    /// Recipient
    pub owner: WalletOwner,
    /// Category
    pub category: ProductCategoryId,
}

impl WalletRef {
    /// Create new wallet reference
    pub fn new(owner: WalletOwner, category: ProductCategoryId) -> Self {
        Self { owner, category }
    }
}

/// Charge (or dry-run check) of a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Wallet owner
    pub owner: WalletOwner,
    /// Category charged
    pub category: ProductCategoryId,
    /// Units used; for differential categories the absolute usage-to-date
    pub units: Credits,
    /// Number of periods the units were used for (default 1)
    #[serde(default)]
    pub periods: Option<u64>,
    /// Idempotency key
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Description for audit logs
    #[serde(default)]
    pub description: Option<String>,
}

impl ChargeRequest {
    /// Create a single-period charge
    pub fn new(
        owner: WalletOwner,
        category: ProductCategoryId,
        units: Credits,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self {
            owner,
            category,
            units,
            periods: None,
            transaction_id: Some(transaction_id.into()),
            description: None,
        }
    }
}

/// Sub-allocation from existing allocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    /// Recipient wallet
    pub target: WalletRef,
    /// Allocations the new one is drawn from
    pub parent_ids: Vec<AllocationId>,
    /// Amount granted
    pub amount: Credits,
    /// Idempotency key
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Start of validity (defaults to now)
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    /// End of validity
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

/// Top-level credit issuance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDepositRequest {
    /// Recipient wallet
    pub target: WalletRef,
    /// Amount granted
    pub amount: Credits,
    /// Idempotency key
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Start of validity (defaults to now)
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    /// End of validity
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

/// Administrative correction of an allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAllocationRequest {
    /// Allocation to correct
    pub allocation_id: AllocationId,
    /// New granted amount
    pub new_balance: Credits,
    /// New start of validity
    pub new_start_date: DateTime<Utc>,
    /// New end of validity (keeps the current one if absent)
    #[serde(default)]
    pub new_end_date: Option<DateTime<Utc>>,
    /// Audit justification
    pub reason: String,
    /// Idempotency key
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Request payload digest, used to tell a retry from a reused transaction id.
///
/// Only fields that change the economic effect are covered, so defaults
/// filled in on a retry (e.g. a start date of "now") do not break replay.
pub trait Fingerprint {
    /// SHA-256 digest of the economic fields
    fn fingerprint(&self) -> Vec<u8>;
}

fn digest<T: Serialize>(value: &T) -> Vec<u8> {
    // bincode cannot fail on plain data tuples
    let bytes = bincode::serialize(value).unwrap_or_default();
    Sha256::digest(&bytes).to_vec()
}

impl Fingerprint for ChargeRequest {
    fn fingerprint(&self) -> Vec<u8> {
        digest(&("charge", &self.owner, &self.category, self.units, self.periods))
    }
}

impl Fingerprint for DepositRequest {
    fn fingerprint(&self) -> Vec<u8> {
        digest(&("deposit", &self.target, &self.parent_ids, self.amount, self.end_date))
    }
}

impl Fingerprint for RootDepositRequest {
    fn fingerprint(&self) -> Vec<u8> {
        digest(&("root_deposit", &self.target, self.amount, self.end_date))
    }
}

impl Fingerprint for UpdateAllocationRequest {
    fn fingerprint(&self) -> Vec<u8> {
        digest(&(
            "update_allocation",
            self.allocation_id,
            self.new_balance,
            self.new_start_date,
            self.new_end_date,
        ))
    }
}

/// Ledger command, routed through a single entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Charge(Vec<ChargeRequest>),
    Deposit(Vec<DepositRequest>),
    RootDeposit(Vec<RootDepositRequest>),
    UpdateAllocation(Vec<UpdateAllocationRequest>),
    Check(Vec<ChargeRequest>),
    /// Acknowledge deposit notifications; one outcome per id, `true` if it changed
    MarkAsRead(Vec<NotificationId>),
}

impl Command {
    /// Whether the command writes to the store
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Command::Check(_))
    }

    /// Command name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Command::Charge(_) => "charge",
            Command::Deposit(_) => "deposit",
            Command::RootDeposit(_) => "root_deposit",
            Command::UpdateAllocation(_) => "update_allocation",
            Command::Check(_) => "check",
            Command::MarkAsRead(_) => "mark_as_read",
        }
    }

    /// Number of items in the batch
    pub fn len(&self) -> usize {
        match self {
            Command::Charge(items) | Command::Check(items) => items.len(),
            Command::Deposit(items) => items.len(),
            Command::RootDeposit(items) => items.len(),
            Command::UpdateAllocation(items) => items.len(),
            Command::MarkAsRead(ids) => ids.len(),
        }
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalized command together with its caller, as sent to the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Verified caller
    pub actor: ActorAndProject,
    /// Normalized command
    pub command: Command,
}

/// Per-item outcome of a bulk command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    /// `false` means declined, never failed
    pub responses: Vec<bool>,
}

/// Error body returned by the HTTP layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error detail
    pub error: ErrorDetail,
}

/// Error detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// HTTP status code
    pub code: u16,
    /// Human-readable message
    pub message: String,
    /// Error kind (see `Error::kind`)
    #[serde(rename = "type")]
    pub kind: String,
}

/// Kind of a recorded transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Charge,
    Deposit,
    RootDeposit,
    UpdateAllocation,
}

/// Outcome of an applied transaction, kept for idempotent replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction id (namespaced by actor)
    pub transaction_id: String,
    /// Operation kind
    pub kind: TransactionKind,
    /// Digest of the request's economic fields
    pub fingerprint: Vec<u8>,
    /// Result returned to the caller
    pub outcome: bool,
    /// Allocation created or charged, if any
    pub allocation_id: Option<AllocationId>,
    /// Commit time
    pub committed_at: DateTime<Utc>,
}

/// "Allocation granted" notification produced by a deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositNotification {
    /// Notification ID
    pub id: NotificationId,
    /// Recipient wallet owner
    pub owner: WalletOwner,
    /// Category of the granted allocation
    pub category: ProductCategoryId,
    /// Granted allocation
    pub allocation_id: AllocationId,
    /// Granted amount
    pub balance: Credits,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Whether it was acknowledged
    pub read: bool,
}
