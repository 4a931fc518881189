// Circular Market Engine - Core Library
// Deterministic state-transition engine for listings, product ownership and
// recycling rewards, applied one call at a time over per-module ledgers.

pub mod call;        // Call envelope, outcomes, contract errors
pub mod ledger;      // Ledger trait, record keys, in-memory backend
pub mod db;          // SQLite backend and genesis allocations
pub mod policy;      // Host-tunable amount policy
pub mod marketplace; // Listings and the purchase flow
pub mod products;    // Product ownership registry
pub mod recycling;   // Recycling events and reward minting
pub mod platform;    // Host that composes the three modules

// Re-export commonly used types
pub use call::{
    arg_identity, arg_str, arg_u64, to_outcome_value,
    Call, ContractError, Identity, Outcome,
};
pub use db::{
    apply_allocations, load_allocations_csv, read_allocations,
    Allocation, SqliteLedger,
};
pub use ledger::{
    with_unit, Ledger, LedgerError, MemoryLedger, RecordKey, RecordKind,
};
pub use marketplace::{Listing, Marketplace, MarketplaceRequest};
pub use platform::{MemoryPlatform, ModuleId, Platform, SqlitePlatform};
pub use policy::EnginePolicy;
pub use products::{Product, ProductRegistry, ProductRequest, ProductStatus};
pub use recycling::{RecyclingEvent, RecyclingRequest, RecyclingRewards};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
