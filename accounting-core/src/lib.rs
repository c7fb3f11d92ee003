//! Accounting Core
//!
//! Hierarchical resource-credit ledger: wallets hold allocations, allocations
//! form a forest, and a charge against a leaf is paid by the leaf and every
//! ancestor at once.
//!
//! # Architecture
//!
//! - **Single Writer**: one elected instance, one actor task, mutates the ledger
//! - **Arena + Index**: allocations keyed by id, parent edges in a join table
//! - **Atomic Commands**: a command batch is one RocksDB write batch
//! - **Idempotency**: transaction ids are recorded with a payload fingerprint
//!
//! # Invariants
//!
//! - A charge never increases a balance
//! - `max_usable_balance = min(balance, min over parents of max_usable_balance)`
//! - Replaying a transaction id yields the recorded outcome
//! - Declined (`false`) is never an error

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod actor;
pub mod catalog;
pub mod config;
pub mod election;
pub mod error;
pub mod forwarding;
pub mod handlers;
pub mod metrics;
pub mod notifications;
pub mod processor;
pub mod service;
pub mod storage;
pub mod types;
pub mod wallets;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use service::{AccountingService, Collaborators};
pub use storage::Storage;
pub use types::{
    ActorAndProject, Allocation, AllocationId, AllocationState, ChargeRequest, Command,
    CommandEnvelope, DepositRequest, ProductCategoryId, RootDepositRequest,
    UpdateAllocationRequest, Wallet, WalletOwner, WalletRef,
};
