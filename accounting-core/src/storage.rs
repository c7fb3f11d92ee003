//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `allocations` - Allocation arena (key: allocation_id)
//! - `edges` - Parent/child join table (key: parent_id || child_id)
//! - `wallets` - Wallets (key: len-prefixed owner || provider || category)
//! - `wallet_allocations` - Wallet membership index (key: wallet_id || allocation_id)
//! - `transactions` - Applied transaction outcomes (key: transaction_id)
//! - `usage` - Last absolute usage of differential wallets (key: wallet_id)
//! - `notifications` - Deposit notifications (key: notification_id)
//! - `unread_notifications` - Unread index (key: len-prefixed owner || notification_id)
//! - `meta` - ID sequences
//!
//! Mutations are staged in a [`StoreTxn`] and land in a single `WriteBatch`,
//! so an ancestor-path update is either fully visible or not at all.

use crate::{
    error::{Error, Result},
    types::{
        Allocation, AllocationId, DepositNotification, NotificationId, ProductCategoryId,
        TransactionRecord, Wallet, WalletId, WalletOwner,
    },
    Config,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Column family names
const CF_ALLOCATIONS: &str = "allocations";
const CF_EDGES: &str = "edges";
const CF_WALLETS: &str = "wallets";
const CF_WALLET_ALLOCATIONS: &str = "wallet_allocations";
const CF_TRANSACTIONS: &str = "transactions";
const CF_USAGE: &str = "usage";
const CF_NOTIFICATIONS: &str = "notifications";
const CF_UNREAD: &str = "unread_notifications";
const CF_META: &str = "meta";

const ALL_CFS: [&str; 9] = [
    CF_ALLOCATIONS,
    CF_EDGES,
    CF_WALLETS,
    CF_WALLET_ALLOCATIONS,
    CF_TRANSACTIONS,
    CF_USAGE,
    CF_NOTIFICATIONS,
    CF_UNREAD,
    CF_META,
];

/// ID sequences kept in the `meta` column family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    Wallet,
    Allocation,
    Notification,
}

impl Sequence {
    fn key(&self) -> &'static [u8] {
        match self {
            Sequence::Wallet => b"seq:wallet",
            Sequence::Allocation => b"seq:allocation",
            Sequence::Notification => b"seq:notification",
        }
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            "Opened RocksDB at {:?} with {} column families",
            path,
            ALL_CFS.len()
        );

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Index-only families are point-probed by prefix
            CF_EDGES | CF_WALLET_ALLOCATIONS | CF_TRANSACTIONS | CF_UNREAD => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Keys starting with `prefix`, in order
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    // Allocation operations

    /// Get allocation by ID
    pub fn get_allocation(&self, id: AllocationId) -> Result<Option<Allocation>> {
        self.get_value(CF_ALLOCATIONS, &id.0.to_be_bytes())
    }

    /// Direct children of an allocation
    pub fn children_of(&self, id: AllocationId) -> Result<Vec<AllocationId>> {
        let prefix = id.0.to_be_bytes();
        self.scan_prefix(CF_EDGES, &prefix)?
            .into_iter()
            .map(|(key, _)| decode_u64_suffix(&key).map(AllocationId))
            .collect()
    }

    // Wallet operations

    /// Get wallet by owner and category
    pub fn get_wallet(
        &self,
        owner: &WalletOwner,
        category: &ProductCategoryId,
    ) -> Result<Option<Wallet>> {
        self.get_value(CF_WALLETS, &wallet_key(owner, category))
    }

    /// All wallets of an owner
    pub fn wallets_of_owner(&self, owner: &WalletOwner) -> Result<Vec<Wallet>> {
        let prefix = owner_prefix(owner);
        let wallets = self
            .scan_prefix(CF_WALLETS, &prefix)?
            .into_iter()
            .map(|(_, value)| Ok(bincode::deserialize::<Wallet>(&value)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(wallets.into_iter().filter(|w| w.owner == *owner).collect())
    }

    /// IDs of the allocations held by a wallet
    pub fn wallet_allocation_ids(&self, wallet_id: WalletId) -> Result<Vec<AllocationId>> {
        let prefix = wallet_id.0.to_be_bytes();
        self.scan_prefix(CF_WALLET_ALLOCATIONS, &prefix)?
            .into_iter()
            .map(|(key, _)| decode_u64_suffix(&key).map(AllocationId))
            .collect()
    }

    // Transaction log

    /// Get recorded transaction outcome
    pub fn get_transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>> {
        self.get_value(CF_TRANSACTIONS, transaction_id.as_bytes())
    }

    // Differential usage

    /// Last absolute usage recorded for a wallet
    pub fn get_usage(&self, wallet_id: WalletId) -> Result<Option<i64>> {
        self.get_value(CF_USAGE, &wallet_id.0.to_be_bytes())
    }

    // Notifications

    /// Get notification by ID
    pub fn get_notification(&self, id: NotificationId) -> Result<Option<DepositNotification>> {
        self.get_value(CF_NOTIFICATIONS, &id.0.to_be_bytes())
    }

    /// Unread notifications of one owner, oldest first
    pub fn unread_notifications_of(&self, owner: &WalletOwner) -> Result<Vec<DepositNotification>> {
        let keys = self.scan_prefix(CF_UNREAD, &owner_prefix(owner))?;
        self.resolve_unread(keys.iter().map(|(key, _)| &**key))
    }

    /// Unread notifications of every owner, oldest first
    pub fn unread_notifications(&self) -> Result<Vec<DepositNotification>> {
        let cf = self.cf_handle(CF_UNREAD)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(key);
        }
        let mut out = self.resolve_unread(keys.iter().map(|key| &**key))?;
        out.sort_by_key(|n| n.id);
        Ok(out)
    }

    fn resolve_unread<'k>(
        &self,
        keys: impl Iterator<Item = &'k [u8]>,
    ) -> Result<Vec<DepositNotification>> {
        keys.map(|key| {
            let id = NotificationId(decode_trailing_u64(key)?);
            self.get_notification(id)?
                .ok_or_else(|| Error::Storage(format!("Unread index points at missing notification {}", id)))
        })
        .collect()
    }

    // Sequences

    /// Last ID handed out by a sequence (0 if none)
    pub fn sequence_value(&self, sequence: Sequence) -> Result<u64> {
        Ok(self.get_value(CF_META, sequence.key())?.unwrap_or(0))
    }

    /// Start a staged write transaction
    pub fn begin(&self) -> StoreTxn<'_> {
        StoreTxn::new(self)
    }

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_allocations: self.sequence_value(Sequence::Allocation)?,
            total_wallets: self.sequence_value(Sequence::Wallet)?,
            total_notifications: self.sequence_value(Sequence::Notification)?,
        })
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch)?;
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_allocations: u64,
    pub total_wallets: u64,
    pub total_notifications: u64,
}

/// Read-your-writes overlay over [`Storage`].
///
/// Nothing reaches RocksDB until [`StoreTxn::commit`]; dropping the value
/// discards every staged change.
pub struct StoreTxn<'a> {
    storage: &'a Storage,
    allocations: BTreeMap<AllocationId, Allocation>,
    edges: BTreeSet<(AllocationId, AllocationId)>,
    wallets: BTreeMap<Vec<u8>, Wallet>,
    wallet_allocations: BTreeSet<(WalletId, AllocationId)>,
    transactions: BTreeMap<String, TransactionRecord>,
    usage: HashMap<WalletId, i64>,
    notifications: BTreeMap<NotificationId, DepositNotification>,
    unread: BTreeMap<Vec<u8>, bool>,
    sequences: HashMap<Sequence, u64>,
}

impl<'a> StoreTxn<'a> {
    fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            allocations: BTreeMap::new(),
            edges: BTreeSet::new(),
            wallets: BTreeMap::new(),
            wallet_allocations: BTreeSet::new(),
            transactions: BTreeMap::new(),
            usage: HashMap::new(),
            notifications: BTreeMap::new(),
            unread: BTreeMap::new(),
            sequences: HashMap::new(),
        }
    }

    /// Get allocation, staged version first
    pub fn allocation(&self, id: AllocationId) -> Result<Option<Allocation>> {
        match self.allocations.get(&id) {
            Some(alloc) => Ok(Some(alloc.clone())),
            None => self.storage.get_allocation(id),
        }
    }

    /// Get allocation or fail with `AllocationNotFound`
    pub fn require_allocation(&self, id: AllocationId) -> Result<Allocation> {
        self.allocation(id)?
            .ok_or_else(|| Error::AllocationNotFound(id.to_string()))
    }

    /// Stage allocation write
    pub fn put_allocation(&mut self, allocation: Allocation) {
        self.allocations.insert(allocation.id, allocation);
    }

    /// Direct children, including staged edges
    pub fn children_of(&self, id: AllocationId) -> Result<Vec<AllocationId>> {
        let mut children = self.storage.children_of(id)?;
        children.extend(
            self.edges
                .range((id, AllocationId(0))..=(id, AllocationId(u64::MAX)))
                .map(|(_, child)| *child),
        );
        children.sort();
        children.dedup();
        Ok(children)
    }

    /// Stage parent/child edge
    pub fn add_edge(&mut self, parent: AllocationId, child: AllocationId) {
        self.edges.insert((parent, child));
    }

    /// Get wallet, staged version first
    pub fn wallet(
        &self,
        owner: &WalletOwner,
        category: &ProductCategoryId,
    ) -> Result<Option<Wallet>> {
        match self.wallets.get(&wallet_key(owner, category)) {
            Some(wallet) => Ok(Some(wallet.clone())),
            None => self.storage.get_wallet(owner, category),
        }
    }

    /// Stage wallet write
    pub fn put_wallet(&mut self, wallet: Wallet) {
        self.wallets
            .insert(wallet_key(&wallet.owner, &wallet.category), wallet);
    }

    /// Allocation IDs of a wallet, including staged ones
    pub fn wallet_allocation_ids(&self, wallet_id: WalletId) -> Result<Vec<AllocationId>> {
        let mut ids = self.storage.wallet_allocation_ids(wallet_id)?;
        ids.extend(
            self.wallet_allocations
                .range((wallet_id, AllocationId(0))..=(wallet_id, AllocationId(u64::MAX)))
                .map(|(_, alloc)| *alloc),
        );
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Stage wallet membership
    pub fn link_wallet_allocation(&mut self, wallet_id: WalletId, allocation_id: AllocationId) {
        self.wallet_allocations.insert((wallet_id, allocation_id));
    }

    /// Get recorded transaction, staged version first
    pub fn transaction(&self, transaction_id: &str) -> Result<Option<TransactionRecord>> {
        match self.transactions.get(transaction_id) {
            Some(record) => Ok(Some(record.clone())),
            None => self.storage.get_transaction(transaction_id),
        }
    }

    /// Stage transaction outcome
    pub fn record_transaction(&mut self, record: TransactionRecord) {
        self.transactions
            .insert(record.transaction_id.clone(), record);
    }

    /// Last absolute usage of a wallet
    pub fn usage(&self, wallet_id: WalletId) -> Result<Option<i64>> {
        match self.usage.get(&wallet_id) {
            Some(usage) => Ok(Some(*usage)),
            None => self.storage.get_usage(wallet_id),
        }
    }

    /// Stage absolute usage
    pub fn set_usage(&mut self, wallet_id: WalletId, usage: i64) {
        self.usage.insert(wallet_id, usage);
    }

    /// Get notification, staged version first
    pub fn notification(&self, id: NotificationId) -> Result<Option<DepositNotification>> {
        match self.notifications.get(&id) {
            Some(n) => Ok(Some(n.clone())),
            None => self.storage.get_notification(id),
        }
    }

    /// Stage notification write and keep the unread index in step
    pub fn put_notification(&mut self, notification: DepositNotification) {
        self.unread.insert(
            unread_key(&notification.owner, notification.id),
            !notification.read,
        );
        self.notifications.insert(notification.id, notification);
    }

    /// Next value of a sequence (IDs start at 1)
    pub fn next_id(&mut self, sequence: Sequence) -> Result<u64> {
        let current = match self.sequences.get(&sequence) {
            Some(value) => *value,
            None => self.storage.sequence_value(sequence)?,
        };
        let next = current + 1;
        self.sequences.insert(sequence, next);
        Ok(next)
    }

    /// Whether anything has been staged
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
            && self.edges.is_empty()
            && self.wallets.is_empty()
            && self.wallet_allocations.is_empty()
            && self.transactions.is_empty()
            && self.usage.is_empty()
            && self.notifications.is_empty()
            && self.unread.is_empty()
            && self.sequences.is_empty()
    }

    /// Write every staged change atomically
    pub fn commit(self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let storage = self.storage;
        let mut batch = WriteBatch::default();

        let cf = storage.cf_handle(CF_ALLOCATIONS)?;
        for (id, alloc) in &self.allocations {
            batch.put_cf(cf, id.0.to_be_bytes(), bincode::serialize(alloc)?);
        }

        let cf = storage.cf_handle(CF_EDGES)?;
        for (parent, child) in &self.edges {
            batch.put_cf(cf, pair_key(parent.0, child.0), b"");
        }

        let cf = storage.cf_handle(CF_WALLETS)?;
        for (key, wallet) in &self.wallets {
            batch.put_cf(cf, key, bincode::serialize(wallet)?);
        }

        let cf = storage.cf_handle(CF_WALLET_ALLOCATIONS)?;
        for (wallet, alloc) in &self.wallet_allocations {
            batch.put_cf(cf, pair_key(wallet.0, alloc.0), b"");
        }

        let cf = storage.cf_handle(CF_TRANSACTIONS)?;
        for (id, record) in &self.transactions {
            batch.put_cf(cf, id.as_bytes(), bincode::serialize(record)?);
        }

        let cf = storage.cf_handle(CF_USAGE)?;
        for (wallet, usage) in &self.usage {
            batch.put_cf(cf, wallet.0.to_be_bytes(), bincode::serialize(usage)?);
        }

        let cf = storage.cf_handle(CF_NOTIFICATIONS)?;
        for (id, notification) in &self.notifications {
            batch.put_cf(cf, id.0.to_be_bytes(), bincode::serialize(notification)?);
        }

        let cf = storage.cf_handle(CF_UNREAD)?;
        for (key, unread) in &self.unread {
            if *unread {
                batch.put_cf(cf, key, b"");
            } else {
                batch.delete_cf(cf, key);
            }
        }

        let cf = storage.cf_handle(CF_META)?;
        for (sequence, value) in &self.sequences {
            batch.put_cf(cf, sequence.key(), bincode::serialize(value)?);
        }

        tracing::debug!(
            allocations = self.allocations.len(),
            transactions = self.transactions.len(),
            notifications = self.notifications.len(),
            "Committing store transaction"
        );

        storage.write(batch)
    }
}

// Key helpers

/// Appends a length-prefixed component, so no component can run into the next
fn push_component(key: &mut Vec<u8>, part: &[u8]) {
    key.extend_from_slice(&(part.len() as u32).to_be_bytes());
    key.extend_from_slice(part);
}

fn owner_prefix(owner: &WalletOwner) -> Vec<u8> {
    let mut key = Vec::new();
    push_component(&mut key, owner.storage_key().as_bytes());
    key
}

fn wallet_key(owner: &WalletOwner, category: &ProductCategoryId) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    push_component(&mut key, category.provider.as_bytes());
    push_component(&mut key, category.name.as_bytes());
    key
}

fn unread_key(owner: &WalletOwner, id: NotificationId) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

fn pair_key(first: u64, second: u64) -> Vec<u8> {
    let mut key = first.to_be_bytes().to_vec();
    key.extend_from_slice(&second.to_be_bytes());
    key
}

fn decode_trailing_u64(key: &[u8]) -> Result<u64> {
    let start = key
        .len()
        .checked_sub(8)
        .ok_or_else(|| Error::Storage(format!("Malformed index key of {} bytes", key.len())))?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[start..]);
    Ok(u64::from_be_bytes(bytes))
}

fn decode_u64_suffix(key: &[u8]) -> Result<u64> {
    if key.len() != 16 {
        return Err(Error::Storage(format!("Malformed index key of {} bytes", key.len())));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[8..16]);
    Ok(u64::from_be_bytes(bytes))
}
