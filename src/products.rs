// Product registry module
// Ownership records with manufacturer provenance. Only the current owner may
// transfer; everything else about a product is immutable after creation.

use crate::call::{arg_identity, arg_str, arg_u64, to_outcome_value, Call, ContractError, Identity, Outcome};
use crate::ledger::{with_unit, Ledger, LedgerError, RecordKey, RecordKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// RECORDS
// ============================================================================

/// Product lifecycle status. Creation is the only transition in this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProductStatus {
    Created,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Created => "created",
        }
    }
}

/// A registered product. `manufacturer` is fixed at creation; `owner` moves
/// only through an authorized transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub manufacturer: Identity,
    pub owner: Identity,
    pub status: ProductStatus,
}

// ============================================================================
// REQUESTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ProductRequest {
    CreateProduct { name: String },
    TransferProduct { product_id: u64, new_owner: Identity },
    GetProduct { product_id: u64 },
}

impl ProductRequest {
    pub fn decode(call: &Call) -> Result<Self, ContractError> {
        match call.method.as_str() {
            "create-product" => Ok(ProductRequest::CreateProduct {
                name: arg_str(&call.args, 0, "name")?,
            }),
            "transfer-product" => Ok(ProductRequest::TransferProduct {
                product_id: arg_u64(&call.args, 0, "product-id")?,
                new_owner: arg_identity(&call.args, 1, "new-owner")?,
            }),
            "get-product" => Ok(ProductRequest::GetProduct {
                product_id: arg_u64(&call.args, 0, "product-id")?,
            }),
            other => Err(ContractError::UnknownMethod(other.to_string())),
        }
    }
}

// ============================================================================
// MODULE
// ============================================================================

/// The product registry state machine over its own ledger.
pub struct ProductRegistry<L: Ledger<Record = Product>> {
    ledger: L,
    nonce: u64,
}

impl<L: Ledger<Record = Product>> ProductRegistry<L> {
    /// Attach to a ledger, resuming product id assignment from whatever the
    /// store already holds.
    pub fn new(ledger: L) -> Result<Self, LedgerError> {
        let nonce = ledger.max_nonce(RecordKind::Product)?;
        Ok(ProductRegistry { ledger, nonce })
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn state_digest(&self) -> Result<String, LedgerError> {
        self.ledger.state_digest()
    }

    /// Register a product. The caller becomes both manufacturer and first
    /// owner. Returns the new product id.
    pub fn create_product(&mut self, caller: &Identity, name: String) -> Result<u64, ContractError> {
        let id = self.nonce + 1;
        let product = Product {
            name,
            manufacturer: caller.clone(),
            owner: caller.clone(),
            status: ProductStatus::Created,
        };

        with_unit(&mut self.ledger, |l| {
            l.put(RecordKey::new(RecordKind::Product, id), product)?;
            Ok(())
        })?;
        self.nonce = id;

        tracing::debug!(product = id, manufacturer = %caller, "product created");

        Ok(id)
    }

    /// Hand ownership to another identity. Only the current owner may do
    /// this; the manufacturer field never moves with it.
    pub fn transfer_product(
        &mut self,
        caller: &Identity,
        product_id: u64,
        new_owner: Identity,
    ) -> Result<(), ContractError> {
        let key = RecordKey::new(RecordKind::Product, product_id);

        let product = self.ledger.get(&key)?.ok_or(ContractError::NotFound)?;

        if &product.owner != caller {
            return Err(ContractError::NotOwner);
        }

        let transferred = Product {
            owner: new_owner.clone(),
            ..product
        };

        with_unit(&mut self.ledger, |l| {
            l.put(key, transferred)?;
            Ok(())
        })?;

        tracing::debug!(product = product_id, from = %caller, to = %new_owner, "product transferred");

        Ok(())
    }

    /// Read a product. Absent ids are a successful empty read, not an error.
    pub fn get_product(&self, product_id: u64) -> Result<Option<Product>, ContractError> {
        Ok(self
            .ledger
            .get(&RecordKey::new(RecordKind::Product, product_id))?)
    }

    /// Dispatch one call against this module.
    pub fn apply(&mut self, call: &Call) -> Outcome {
        let request = match ProductRequest::decode(call) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(call_id = %call.call_id, method = %call.method, error = %e, "rejected call");
                return Outcome::err(&e);
            }
        };

        let result = match request {
            ProductRequest::CreateProduct { name } => self
                .create_product(&call.caller, name)
                .map(|id| Some(Value::from(id))),
            ProductRequest::TransferProduct {
                product_id,
                new_owner,
            } => self
                .transfer_product(&call.caller, product_id, new_owner)
                .map(|_| None),
            ProductRequest::GetProduct { product_id } => match self.get_product(product_id) {
                Ok(Some(product)) => to_outcome_value(&product),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            },
        };

        if let Err(e) = &result {
            tracing::debug!(call_id = %call.call_id, method = %call.method, error = %e, "call failed");
        }

        Outcome::from_result(result)
    }
}

// ============================================================================
// TESTS
// ============================================================================
