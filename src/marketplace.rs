// Marketplace module
// Listings with a one-shot purchase flow. Buying moves funds from buyer to
// seller inside one write unit and permanently deactivates the listing.

use crate::call::{arg_u64, to_outcome_value, Call, ContractError, Identity, Outcome};
use crate::ledger::{with_unit, Ledger, LedgerError, RecordKey, RecordKind};
use crate::policy::EnginePolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// RECORDS
// ============================================================================

/// A marketplace listing. The record key carries the listing id, so the body
/// does not repeat it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(rename = "product-id")]
    pub product_id: u64,
    pub price: u64,
    pub seller: Identity,
    /// False once bought. A listing never goes active again.
    pub active: bool,
}

// ============================================================================
// REQUESTS
// ============================================================================

/// Decoded marketplace request. Nothing that fails to decode ever reaches a
/// handler, which keeps UnknownMethod and BadRequest confined to this edge.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketplaceRequest {
    CreateListing { product_id: u64, price: u64 },
    BuyListing { listing_id: u64 },
    GetListing { listing_id: u64 },
}

impl MarketplaceRequest {
    pub fn decode(call: &Call) -> Result<Self, ContractError> {
        match call.method.as_str() {
            "create-listing" => Ok(MarketplaceRequest::CreateListing {
                product_id: arg_u64(&call.args, 0, "product-id")?,
                price: arg_u64(&call.args, 1, "price")?,
            }),
            "buy-listing" => Ok(MarketplaceRequest::BuyListing {
                listing_id: arg_u64(&call.args, 0, "listing-id")?,
            }),
            "get-listing" => Ok(MarketplaceRequest::GetListing {
                listing_id: arg_u64(&call.args, 0, "listing-id")?,
            }),
            other => Err(ContractError::UnknownMethod(other.to_string())),
        }
    }
}

// ============================================================================
// MODULE
// ============================================================================

/// The marketplace state machine over its own ledger.
///
/// Handlers check every precondition before the first write, so any error
/// return leaves both the records and the balances exactly as they were.
pub struct Marketplace<L: Ledger<Record = Listing>> {
    ledger: L,
    policy: EnginePolicy,
    nonce: u64,
}

impl<L: Ledger<Record = Listing>> Marketplace<L> {
    pub fn new(ledger: L) -> Result<Self, LedgerError> {
        Self::with_policy(ledger, EnginePolicy::default())
    }

    /// Attach to a ledger, resuming listing id assignment from whatever the
    /// store already holds.
    pub fn with_policy(ledger: L, policy: EnginePolicy) -> Result<Self, LedgerError> {
        let nonce = ledger.max_nonce(RecordKind::Listing)?;
        Ok(Marketplace {
            ledger,
            policy,
            nonce,
        })
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut L {
        &mut self.ledger
    }

    pub fn state_digest(&self) -> Result<String, LedgerError> {
        self.ledger.state_digest()
    }

    /// Credit spendable funds to an identity. This is the host funding hook,
    /// not a dispatchable method.
    pub fn fund(&mut self, id: &Identity, amount: u64) -> Result<(), LedgerError> {
        self.ledger.credit(id, amount)
    }

    pub fn balance_of(&self, id: &Identity) -> Result<u64, LedgerError> {
        self.ledger.balance_of(id)
    }

    /// Create a listing owned by the caller. Returns the new listing id.
    pub fn create_listing(
        &mut self,
        caller: &Identity,
        product_id: u64,
        price: u64,
    ) -> Result<u64, ContractError> {
        self.policy.check_amount(price, "price")?;

        let id = self.nonce + 1;
        let listing = Listing {
            product_id,
            price,
            seller: caller.clone(),
            active: true,
        };

        with_unit(&mut self.ledger, |l| {
            l.put(RecordKey::new(RecordKind::Listing, id), listing)?;
            Ok(())
        })?;
        self.nonce = id;

        tracing::debug!(listing = id, seller = %caller, price, "listing created");

        Ok(id)
    }

    /// Buy an active listing at its asked price.
    ///
    /// Error precedence is fixed: a missing listing is NotFound even when the
    /// caller is broke, and an inactive one is AlreadySold before any balance
    /// is looked at.
    pub fn buy_listing(&mut self, caller: &Identity, listing_id: u64) -> Result<(), ContractError> {
        let key = RecordKey::new(RecordKind::Listing, listing_id);

        let listing = self.ledger.get(&key)?.ok_or(ContractError::NotFound)?;

        if !listing.active {
            return Err(ContractError::AlreadySold);
        }

        if self.ledger.balance_of(caller)? < listing.price {
            return Err(ContractError::InsufficientFunds);
        }

        // seller-side overflow is checked up front; when buyer and seller are
        // the same identity the debit lands first and the credit cannot
        // overflow
        if caller != &listing.seller {
            let seller_funds = self.ledger.balance_of(&listing.seller)?;
            if seller_funds.checked_add(listing.price).is_none() {
                return Err(ContractError::InvalidAmount("balance overflow".to_string()));
            }
        }

        let seller = listing.seller.clone();
        let price = listing.price;
        let sold = Listing {
            active: false,
            ..listing
        };

        with_unit(&mut self.ledger, |l| {
            l.transfer(caller, &seller, price)?;
            l.put(key, sold)?;
            Ok(())
        })?;

        tracing::debug!(
            listing = listing_id,
            buyer = %caller,
            seller = %seller,
            price,
            "listing bought"
        );

        Ok(())
    }

    /// Read a listing. Absent ids are a successful empty read, not an error.
    pub fn get_listing(&self, listing_id: u64) -> Result<Option<Listing>, ContractError> {
        Ok(self
            .ledger
            .get(&RecordKey::new(RecordKind::Listing, listing_id))?)
    }

    /// Dispatch one call against this module.
    pub fn apply(&mut self, call: &Call) -> Outcome {
        let request = match MarketplaceRequest::decode(call) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(call_id = %call.call_id, method = %call.method, error = %e, "rejected call");
                return Outcome::err(&e);
            }
        };

        let result = match request {
            MarketplaceRequest::CreateListing { product_id, price } => self
                .create_listing(&call.caller, product_id, price)
                .map(|id| Some(Value::from(id))),
            MarketplaceRequest::BuyListing { listing_id } => {
                self.buy_listing(&call.caller, listing_id).map(|_| None)
            }
            MarketplaceRequest::GetListing { listing_id } => match self.get_listing(listing_id) {
                Ok(Some(listing)) => to_outcome_value(&listing),
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
