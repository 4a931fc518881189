// Platform host
// Owns one instance of each module and routes calls to them. Modules never
// see each other; composing their effects is strictly a host concern.

use crate::call::{Call, Identity, Outcome};
use crate::db::{apply_allocations, load_allocations_csv, Allocation, SqliteLedger};
use crate::ledger::{Ledger, LedgerError, MemoryLedger};
use crate::marketplace::{Listing, Marketplace};
use crate::policy::EnginePolicy;
use crate::products::{Product, ProductRegistry};
use crate::recycling::{RecyclingEvent, RecyclingRewards};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;

// ============================================================================
// MODULE IDS
// ============================================================================

/// The three deployed modules a call can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleId {
    Marketplace,
    ProductRegistry,
    RecyclingRewards,
}

impl ModuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleId::Marketplace => "marketplace",
            ModuleId::ProductRegistry => "product-registry",
            ModuleId::RecyclingRewards => "recycling-rewards",
        }
    }

    pub fn parse(s: &str) -> Option<ModuleId> {
        match s {
            "marketplace" => Some(ModuleId::Marketplace),
            "product-registry" => Some(ModuleId::ProductRegistry),
            "recycling-rewards" => Some(ModuleId::RecyclingRewards),
            _ => None,
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PLATFORM
// ============================================================================

/// One deployed engine: a marketplace, a product registry and a recycling
/// rewards module, each over its own ledger.
///
/// Calls are applied strictly one at a time through `&mut self`, which is
/// what makes every call an all-or-nothing unit from the outside.
pub struct Platform<ML, PL, RL>
where
    ML: Ledger<Record = Listing>,
    PL: Ledger<Record = Product>,
    RL: Ledger<Record = RecyclingEvent>,
{
    marketplace: Marketplace<ML>,
    products: ProductRegistry<PL>,
    recycling: RecyclingRewards<RL>,
}

pub type MemoryPlatform =
    Platform<MemoryLedger<Listing>, MemoryLedger<Product>, MemoryLedger<RecyclingEvent>>;

pub type SqlitePlatform =
    Platform<SqliteLedger<Listing>, SqliteLedger<Product>, SqliteLedger<RecyclingEvent>>;

impl MemoryPlatform {
    /// Ephemeral platform, used by tests and replay tooling.
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_policy(EnginePolicy::default())
    }

    pub fn in_memory_with_policy(policy: EnginePolicy) -> Result<Self> {
        Ok(Platform {
            marketplace: Marketplace::with_policy(MemoryLedger::new(), policy.clone())
                .context("Failed to attach marketplace")?,
            products: ProductRegistry::new(MemoryLedger::new())
                .context("Failed to attach product registry")?,
            recycling: RecyclingRewards::with_policy(MemoryLedger::new(), policy)
                .context("Failed to attach recycling rewards")?,
        })
    }
}

impl SqlitePlatform {
    /// Durable platform with one database file per module under `dir`.
    /// Reopening the same directory resumes id assignment where it left off.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_policy(dir, EnginePolicy::default())
    }

    pub fn open_with_policy(dir: &Path, policy: EnginePolicy) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

        let marketplace = Marketplace::with_policy(
            SqliteLedger::open(&dir.join("marketplace.db"))?,
            policy.clone(),
        )
        .context("Failed to attach marketplace")?;

        let products = ProductRegistry::new(SqliteLedger::open(&dir.join("products.db"))?)
            .context("Failed to attach product registry")?;

        let recycling =
            RecyclingRewards::with_policy(SqliteLedger::open(&dir.join("recycling.db"))?, policy)
                .context("Failed to attach recycling rewards")?;

        tracing::info!(dir = %dir.display(), "platform opened");

        Ok(Platform {
            marketplace,
            products,
            recycling,
        })
    }
}

impl<ML, PL, RL> Platform<ML, PL, RL>
where
    ML: Ledger<Record = Listing>,
    PL: Ledger<Record = Product>,
    RL: Ledger<Record = RecyclingEvent>,
{
    /// Route one call to its module.
    pub fn dispatch(&mut self, module: ModuleId, call: &Call) -> Outcome {
        tracing::debug!(call_id = %call.call_id, module = %module, method = %call.method, caller = %call.caller, "dispatch");

        match module {
            ModuleId::Marketplace => self.marketplace.apply(call),
            ModuleId::ProductRegistry => self.products.apply(call),
            ModuleId::RecyclingRewards => self.recycling.apply(call),
        }
    }

    /// Credit marketplace spending funds to an identity.
    pub fn fund(&mut self, id: &Identity, amount: u64) -> Result<()> {
        self.marketplace
            .fund(id, amount)
            .with_context(|| format!("Failed to fund {}", id))
    }

    /// Seed marketplace balances from genesis allocation rows. Runs before
    /// the first call is accepted.
    pub fn seed_marketplace(&mut self, allocations: &[Allocation]) -> Result<()> {
        apply_allocations(self.marketplace.ledger_mut(), allocations)
    }

    pub fn seed_marketplace_from_csv(&mut self, csv_path: &Path) -> Result<()> {
        let allocations = load_allocations_csv(csv_path)?;
        self.seed_marketplace(&allocations)
    }

    pub fn marketplace(&self) -> &Marketplace<ML> {
        &self.marketplace
    }

    pub fn marketplace_mut(&mut self) -> &mut Marketplace<ML> {
        &mut self.marketplace
    }

    pub fn products(&self) -> &ProductRegistry<PL> {
        &self.products
    }

    pub fn products_mut(&mut self) -> &mut ProductRegistry<PL> {
        &mut self.products
    }

    pub fn recycling(&self) -> &RecyclingRewards<RL> {
        &self.recycling
    }

    pub fn recycling_mut(&mut self) -> &mut RecyclingRewards<RL> {
        &mut self.recycling
    }

    /// Per-module digests in a fixed order. Two platforms that processed the
    /// same call sequence agree on all three, whatever their backends.
    pub fn state_digests(&self) -> Result<Vec<(ModuleId, String)>, LedgerError> {
        Ok(vec![
            (ModuleId::Marketplace, self.marketplace.state_digest()?),
            (ModuleId::ProductRegistry, self.products.state_digest()?),
            (ModuleId::RecyclingRewards, self.recycling.state_digest()?),
        ])
    }
}

// ============================================================================
// TESTS
// ============================================================================
