// Recycling rewards module
// Write-once recycling events that mint reward balance to the recycler.
// Reward balances are strictly additive; no debit operation exists here.

use crate::call::{arg_identity, arg_u64, to_outcome_value, Call, ContractError, Identity, Outcome};
use crate::ledger::{with_unit, Ledger, LedgerError, RecordKey, RecordKind};
use crate::policy::EnginePolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// RECORDS
// ============================================================================

/// One recycling drop. Immutable once recorded; its creation also credited
/// `amount` to `recycler`'s reward balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecyclingEvent {
    /// Unvalidated product reference; modules are intentionally decoupled.
    #[serde(rename = "product-id")]
    pub product_id: u64,
    pub recycler: Identity,
    pub amount: u64,
}

// ============================================================================
// REQUESTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RecyclingRequest {
    RecycleProduct { product_id: u64, amount: u64 },
    GetRecyclingEvent { event_id: u64 },
    GetRecyclingBalance { identity: Identity },
}

impl RecyclingRequest {
    pub fn decode(call: &Call) -> Result<Self, ContractError> {
        match call.method.as_str() {
            "recycle-product" => Ok(RecyclingRequest::RecycleProduct {
                product_id: arg_u64(&call.args, 0, "product-id")?,
                amount: arg_u64(&call.args, 1, "amount")?,
            }),
            "get-recycling-event" => Ok(RecyclingRequest::GetRecyclingEvent {
                event_id: arg_u64(&call.args, 0, "event-id")?,
            }),
            "get-recycling-balance" => Ok(RecyclingRequest::GetRecyclingBalance {
                identity: arg_identity(&call.args, 0, "identity")?,
            }),
            other => Err(ContractError::UnknownMethod(other.to_string())),
        }
    }
}

// ============================================================================
// MODULE
// ============================================================================

/// The recycling rewards state machine over its own ledger.
pub struct RecyclingRewards<L: Ledger<Record = RecyclingEvent>> {
    ledger: L,
    policy: EnginePolicy,
    nonce: u64,
}

impl<L: Ledger<Record = RecyclingEvent>> RecyclingRewards<L> {
    pub fn new(ledger: L) -> Result<Self, LedgerError> {
        Self::with_policy(ledger, EnginePolicy::default())
    }

    /// Attach to a ledger, resuming event id assignment from whatever the
    /// store already holds.
    pub fn with_policy(ledger: L, policy: EnginePolicy) -> Result<Self, LedgerError> {
        let nonce = ledger.max_nonce(RecordKind::RecyclingEvent)?;
        Ok(RecyclingRewards {
            ledger,
            policy,
            nonce,
        })
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn state_digest(&self) -> Result<String, LedgerError> {
        self.ledger.state_digest()
    }

    /// Record a recycling drop and mint `amount` to the caller. The event
    /// write and the credit land as one unit. Returns the new event id.
    pub fn recycle_product(
        &mut self,
        caller: &Identity,
        product_id: u64,
        amount: u64,
    ) -> Result<u64, ContractError> {
        self.policy.check_amount(amount, "amount")?;

        // additive-only balance, so overflow is the one arithmetic
        // precondition to rule out before writing
        let current = self.ledger.balance_of(caller)?;
        if current.checked_add(amount).is_none() {
            return Err(ContractError::InvalidAmount("balance overflow".to_string()));
        }

        let id = self.nonce + 1;
        let event = RecyclingEvent {
            product_id,
            recycler: caller.clone(),
            amount,
        };

        with_unit(&mut self.ledger, |l| {
            l.put(RecordKey::new(RecordKind::RecyclingEvent, id), event)?;
            l.credit(caller, amount)?;
            Ok(())
        })?;
        self.nonce = id;

        tracing::debug!(event = id, recycler = %caller, amount, "recycling event recorded");

        Ok(id)
    }

    /// Read an event. Absent ids are a successful empty read, not an error.
    pub fn get_recycling_event(&self, event_id: u64) -> Result<Option<RecyclingEvent>, ContractError> {
        Ok(self
            .ledger
            .get(&RecordKey::new(RecordKind::RecyclingEvent, event_id))?)
    }

    /// Accumulated reward balance, zero for identities that never recycled.
    pub fn get_recycling_balance(&self, identity: &Identity) -> Result<u64, ContractError> {
        Ok(self.ledger.balance_of(identity)?)
    }

    /// Dispatch one call against this module.
    pub fn apply(&mut self, call: &Call) -> Outcome {
        let request = match RecyclingRequest::decode(call) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(call_id = %call.call_id, method = %call.method, error = %e, "rejected call");
                return Outcome::err(&e);
            }
        };

        let result = match request {
            RecyclingRequest::RecycleProduct { product_id, amount } => self
                .recycle_product(&call.caller, product_id, amount)
                .map(|id| Some(Value::from(id))),
            RecyclingRequest::GetRecyclingEvent { event_id } => {
                match self.get_recycling_event(event_id) {
                    Ok(Some(event)) => to_outcome_value(&event),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            RecyclingRequest::GetRecyclingBalance { identity } => self
                .get_recycling_balance(&identity)
                .map(|balance| Some(Value::from(balance))),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use serde_json::json;

    fn rewards() -> RecyclingRewards<MemoryLedger<RecyclingEvent>> {
        RecyclingRewards::new(MemoryLedger::new()).unwrap()
    }

    fn user(name: &str) -> Identity {
        Identity::new(name)
    }

    #[test]
    fn test_recycle_assigns_sequential_ids_and_stores_the_event() {
        let mut rewards = rewards();
        let recycler = user("user1");

        assert_eq!(rewards.recycle_product(&recycler, 1, 100).unwrap(), 1);
        assert_eq!(rewards.recycle_product(&recycler, 2, 150).unwrap(), 2);

        let event = rewards.get_recycling_event(1).unwrap().unwrap();
        assert_eq!(event.product_id, 1);
        assert_eq!(event.recycler, recycler);
        assert_eq!(event.amount, 100);
    }

    #[test]
    fn test_rewards_accumulate_across_calls() {
        let mut rewards = rewards();
        let recycler = user("user1");

        rewards.recycle_product(&recycler, 1, 100).unwrap();
        rewards.recycle_product(&recycler, 2, 150).unwrap();

        assert_eq!(rewards.get_recycling_balance(&recycler).unwrap(), 250);
    }

    #[test]
    fn test_unknown_identity_has_zero_rewards() {
        let rewards = rewards();
        assert_eq!(rewards.get_recycling_balance(&user("nobody")).unwrap(), 0);
    }

    #[test]
    fn test_rewards_are_tracked_per_recycler() {
        let mut rewards = rewards();

        rewards.recycle_product(&user("user1"), 1, 100).unwrap();
        rewards.recycle_product(&user("user2"), 1, 40).unwrap();
        rewards.recycle_product(&user("user1"), 2, 5).unwrap();

        assert_eq!(rewards.get_recycling_balance(&user("user1")).unwrap(), 105);
        assert_eq!(rewards.get_recycling_balance(&user("user2")).unwrap(), 40);
    }

    #[test]
    fn test_get_absent_event_is_a_successful_empty_read() {
        let rewards = rewards();
        assert_eq!(rewards.get_recycling_event(9).unwrap(), None);
    }

    #[test]
    fn test_product_references_are_not_validated() {
        // no product registry is consulted, a drop for any id is accepted
        let mut rewards = rewards();
        assert_eq!(rewards.recycle_product(&user("user1"), 999, 10).unwrap(), 1);
    }

    #[test]
    fn test_zero_amount_accepted_under_default_policy() {
        let mut rewards = rewards();
        let recycler = user("user1");

        rewards.recycle_product(&recycler, 1, 0).unwrap();

        assert!(rewards.get_recycling_event(1).unwrap().is_some());
        assert_eq!(rewards.get_recycling_balance(&recycler).unwrap(), 0);
    }

    #[test]
    fn test_strict_policy_rejects_zero_amount() {
        let mut rewards =
            RecyclingRewards::with_policy(MemoryLedger::new(), EnginePolicy::strict()).unwrap();

        let err = rewards.recycle_product(&user("user1"), 1, 0).unwrap_err();
        assert!(matches!(err, ContractError::InvalidAmount(_)));
        assert_eq!(rewards.get_recycling_event(1).unwrap(), None);
    }

    #[test]
    fn test_overflowing_reward_writes_nothing() {
        let mut ledger: MemoryLedger<RecyclingEvent> = MemoryLedger::new();
        ledger.credit(&user("user1"), u64::MAX).unwrap();

        let mut rewards = RecyclingRewards::new(ledger).unwrap();
        let err = rewards.recycle_product(&user("user1"), 1, 1).unwrap_err();

        assert!(matches!(err, ContractError::InvalidAmount(_)));
        assert_eq!(rewards.get_recycling_event(1).unwrap(), None);
        assert_eq!(
            rewards.get_recycling_balance(&user("user1")).unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn test_apply_dispatches_recycle_and_balance_reads() {
        let mut rewards = rewards();

        let outcome = rewards.apply(&Call::new("recycle-product", vec![json!(1), json!(100)], "user1"));
        assert!(outcome.is_success());
        assert_eq!(outcome.value, Some(json!(1)));

        let outcome = rewards.apply(&Call::new("recycle-product", vec![json!(2), json!(150)], "user1"));
        assert_eq!(outcome.value, Some(json!(2)));

        let outcome = rewards.apply(&Call::new("get-recycling-balance", vec![json!("user1")], "anyone"));
        assert!(outcome.is_success());
        assert_eq!(outcome.value, Some(json!(250)));

        // unknown identities read back as a plain zero
        let outcome = rewards.apply(&Call::new("get-recycling-balance", vec![json!("user9")], "anyone"));
        assert_eq!(outcome.value, Some(json!(0)));
    }

    #[test]
    fn test_apply_returns_the_stored_event_shape() {
        let mut rewards = rewards();
        rewards.recycle_product(&user("user1"), 1, 100).unwrap();

        let outcome = rewards.apply(&Call::new("get-recycling-event", vec![json!(1)], "anyone"));
        assert!(outcome.is_success());
        assert_eq!(
            outcome.value,
            Some(json!({
                "product-id": 1,
                "recycler": "user1",
                "amount": 100
            }))
        );
    }

    #[test]
    fn test_apply_rejects_unknown_method_and_bad_args() {
        let mut rewards = rewards();

        let outcome = rewards.apply(&Call::new("melt-product", vec![], "user1"));
        assert_eq!(outcome.error.as_deref(), Some("unknown-method"));

        let outcome = rewards.apply(&Call::new("recycle-product", vec![json!(1), json!(-3)], "user1"));
        assert_eq!(outcome.error.as_deref(), Some("bad-request"));

        let outcome = rewards.apply(&Call::new("get-recycling-balance", vec![], "user1"));
        assert_eq!(outcome.error.as_deref(), Some("bad-request"));
    }

    #[test]
    fn test_id_assignment_resumes_from_existing_records() {
        let mut ledger = MemoryLedger::new();
        ledger
            .put(
                RecordKey::new(RecordKind::RecyclingEvent, 3),
                RecyclingEvent {
                    product_id: 1,
                    recycler: user("user1"),
                    amount: 10,
                },
            )
            .unwrap();

        let mut rewards = RecyclingRewards::new(ledger).unwrap();
        assert_eq!(rewards.recycle_product(&user("user1"), 1, 10).unwrap(), 4);
    }
}
