//! Wallet directory
//!
//! Maps `(owner, category)` to a wallet and a wallet to its allocations.
//! There is at most one wallet per pair; wallets are created lazily by the
//! first deposit that targets them.

use crate::catalog::ProductCatalog;
use crate::storage::{Sequence, Storage, StoreTxn};
use crate::types::{Allocation, ProductCategoryId, Wallet, WalletId, WalletOwner};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Wallet lookups over the allocation store
#[derive(Clone)]
pub struct WalletDirectory {
    storage: Arc<Storage>,
    catalog: Arc<dyn ProductCatalog>,
}

impl WalletDirectory {
    /// Create new directory
    pub fn new(storage: Arc<Storage>, catalog: Arc<dyn ProductCatalog>) -> Self {
        Self { storage, catalog }
    }

    /// Find the wallet of an owner for a category
    pub fn resolve_wallet(
        &self,
        owner: &WalletOwner,
        category: &ProductCategoryId,
    ) -> Result<Option<Wallet>> {
        self.catalog.category(category)?;
        self.storage.get_wallet(owner, category)
    }

    /// Find the wallet or fail with `WalletNotFound`
    pub fn require_wallet(&self, owner: &WalletOwner, category: &ProductCategoryId) -> Result<Wallet> {
        self.resolve_wallet(owner, category)?
            .ok_or_else(|| Error::WalletNotFound(format!("{} / {}", owner, category)))
    }

    /// Find the wallet inside a transaction, creating it if missing
    pub fn resolve_or_create(
        &self,
        txn: &mut StoreTxn<'_>,
        owner: &WalletOwner,
        category: &ProductCategoryId,
        now: DateTime<Utc>,
    ) -> Result<Wallet> {
        self.catalog.category(category)?;
        if let Some(wallet) = txn.wallet(owner, category)? {
            return Ok(wallet);
        }

        let wallet = Wallet {
            id: WalletId(txn.next_id(Sequence::Wallet)?),
            owner: owner.clone(),
            category: category.clone(),
            created_at: now,
        };
        tracing::info!(wallet_id = %wallet.id, owner = %owner, category = %category, "Creating wallet");
        txn.put_wallet(wallet.clone());
        Ok(wallet)
    }

    /// Allocations of a wallet as committed
    pub fn allocations_of(&self, wallet_id: WalletId) -> Result<Vec<Allocation>> {
        let txn = self.storage.begin();
        Self::allocations_in(&txn, wallet_id)
    }

    /// Allocations of a wallet as seen by a transaction
    pub fn allocations_in(txn: &StoreTxn<'_>, wallet_id: WalletId) -> Result<Vec<Allocation>> {
        txn.wallet_allocation_ids(wallet_id)?
            .into_iter()
            .map(|id| txn.require_allocation(id))
            .collect()
    }

    /// All wallets of an owner
    pub fn wallets_of(&self, owner: &WalletOwner) -> Result<Vec<Wallet>> {
        self.storage.wallets_of_owner(owner)
    }
}
