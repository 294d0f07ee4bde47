use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{self, keys, Store};
use crate::transaction::Transaction;
use crate::vm::{self, Value};
use crate::{utils, NodeError, Result, TREASURY_WALLET};

/// A deployed smart contract
///
/// Source code is immutable after deployment; only the serialized state
/// object changes, and only through successful method calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    /// Address of the form `CNT` + 20 hex characters
    pub address: String,
    /// Wallet identifier of the deployer
    pub owner: String,
    pub code: String,
    /// Persistent state as a JSON object
    pub state: serde_json::Value,
    pub created_at: f64,
}

/// Result of a successful contract call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcome {
    pub return_value: serde_json::Value,
    pub state: serde_json::Value,
}

/// Derive a fresh contract address from a random UUID
pub fn contract_address() -> String {
    format!("CNT{}", &utils::calculate_hash(Uuid::new_v4().to_string())[..20])
}

/// Deployment and dispatch of sandboxed contracts
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    store: Arc<Store>,
    /// Whether a failed call still pays the execution fee
    charge_on_failure: bool,
}

impl ContractRegistry {
    pub fn new(store: Arc<Store>, charge_on_failure: bool) -> Self {
        ContractRegistry {
            store,
            charge_on_failure,
        }
    }

    /// Deploy a contract: validate, run `init` against empty state, charge
    /// the `contract_deploy` fee atomically with the insertion
    ///
    /// # Returns
    /// * `Result<(Contract, Transaction)>` - The contract and its fee transaction
    pub fn deploy(&self, owner: &str, code: &str) -> Result<(Contract, Transaction)> {
        let outcome = vm::execute(code, "init", &[], &BTreeMap::new())?;
        let initial_state = state_to_json(&outcome.state);

        let fee = self.store.fee("contract_deploy")?;
        let contract = Contract {
            address: contract_address(),
            owner: owner.to_string(),
            code: code.to_string(),
            state: initial_state,
            created_at: utils::now_ts(),
        };
        let fee_tx = Transaction::fee(owner, fee);

        self.store.transact(|tree| {
            store::tx_debit_wallet(tree, owner, fee)?;
            store::tx_credit_wallet(tree, TREASURY_WALLET, fee)?;
            store::tx_insert_transaction(tree, &fee_tx)?;
            store::tx_put(tree, &keys::contract(&contract.address), &contract)?;
            Ok(())
        })?;

        info!("Deployed contract {} for {}", contract.address, owner);
        Ok((contract, fee_tx))
    }

    /// Invoke a contract method
    ///
    /// Runs the VM against a copy of the stored state. On success the fee is
    /// charged and the returned state persisted atomically. On a runtime
    /// failure nothing persists, but the fee is still charged when the node
    /// is configured to treat it as execution gas.
    ///
    /// # Arguments
    /// * `caller` - Wallet identifier paying the `contract_call` fee
    /// * `address` - Contract address
    /// * `method` - Method name
    /// * `args` - Raw argument strings; integers are detected, the rest stay text
    pub fn call(
        &self,
        caller: &str,
        address: &str,
        method: &str,
        args: &[String],
    ) -> Result<CallOutcome> {
        let contract = self.get(address)?;
        let fee = self.store.fee("contract_call")?;
        let values: Vec<Value> = args.iter().map(|raw| Value::parse_arg(raw)).collect();
        let state = state_from_json(&contract.state);

        match vm::execute(&contract.code, method, &values, &state) {
            Ok(invocation) => {
                let new_state = state_to_json(&invocation.state);
                let updated = Contract {
                    state: new_state.clone(),
                    ..contract
                };
                let fee_tx = Transaction::fee(caller, fee);
                self.store.transact(|tree| {
                    store::tx_debit_wallet(tree, caller, fee)?;
                    store::tx_credit_wallet(tree, TREASURY_WALLET, fee)?;
                    store::tx_insert_transaction(tree, &fee_tx)?;
                    store::tx_put(tree, &keys::contract(address), &updated)?;
                    Ok(())
                })?;
                Ok(CallOutcome {
                    return_value: invocation.return_value.to_json(),
                    state: new_state,
                })
            }
            Err(vm::VmError::Runtime(message)) => {
                warn!("Contract {} method {} raised: {}", address, method, message);
                if self.charge_on_failure {
                    let fee_tx = Transaction::fee(caller, fee);
                    self.store.transact(|tree| {
                        store::tx_debit_wallet(tree, caller, fee)?;
                        store::tx_credit_wallet(tree, TREASURY_WALLET, fee)?;
                        store::tx_insert_transaction(tree, &fee_tx)?;
                        Ok(())
                    })?;
                }
                Err(NodeError::VmRuntime(message))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a contract record
    pub fn get(&self, address: &str) -> Result<Contract> {
        self.store
            .contract(address)?
            .ok_or_else(|| NodeError::NotFound(format!("contract {}", address)))
    }

    /// All deployed contracts
    pub fn contracts(&self) -> Result<Vec<Contract>> {
        self.store.contracts()
    }
}

fn state_from_json(state: &serde_json::Value) -> BTreeMap<String, Value> {
    match Value::from_json(state) {
        Value::Map(map) => map,
        _ => BTreeMap::new(),
    }
}

fn state_to_json(state: &BTreeMap<String, Value>) -> serde_json::Value {
    Value::Map(state.clone()).to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::EXAMPLE_CONTRACT;
    use crate::wallet::{Wallet, WalletManager};
    use tempfile::tempdir;

    fn setup(charge_on_failure: bool) -> (tempfile::TempDir, Arc<Store>, ContractRegistry, String) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let wallets = WalletManager::new(Arc::clone(&store), 0.0);
        wallets.ensure_system_wallets().unwrap();
        store.seed_fee_if_absent("contract_deploy", 1.0).unwrap();
        store.seed_fee_if_absent("contract_call", 0.05).unwrap();
        let alice = wallets.register("alice", "pw").unwrap().wallet_id;
        store
            .put_wallet(&Wallet {
                wallet_id: alice.clone(),
                balance: 10.0,
                last_mined: 0.0,
            })
            .unwrap();
        let registry = ContractRegistry::new(Arc::clone(&store), charge_on_failure);
        (dir, store, registry, alice)
    }

    #[test]
    fn test_deploy_runs_init_and_charges_fee() {
        let (_dir, store, registry, alice) = setup(true);
        let (contract, fee_tx) = registry.deploy(&alice, EXAMPLE_CONTRACT).unwrap();

        assert!(contract.address.starts_with("CNT"));
        assert_eq!(contract.address.len(), 23);
        assert_eq!(
            contract.state,
            serde_json::json!({"counter": 0, "owner": "GhostNetwork"})
        );
        assert_eq!(fee_tx.amount, 1.0);
        assert_eq!(store.wallet(&alice).unwrap().unwrap().balance, 9.0);
        assert_eq!(store.wallet(TREASURY_WALLET).unwrap().unwrap().balance, 1.0);
    }

    #[test]
    fn test_deploy_matches_direct_vm_run() {
        let (_dir, _store, registry, alice) = setup(true);
        let (contract, _) = registry.deploy(&alice, EXAMPLE_CONTRACT).unwrap();
        let direct = vm::execute(EXAMPLE_CONTRACT, "init", &[], &BTreeMap::new()).unwrap();
        assert_eq!(contract.state, state_to_json(&direct.state));
    }

    #[test]
    fn test_forbidden_source_never_charges() {
        let (_dir, store, registry, alice) = setup(true);
        let err = registry
            .deploy(&alice, "fn init() { x = open; }")
            .unwrap_err();
        assert!(matches!(err, NodeError::VmValidation(_)));
        assert_eq!(store.wallet(&alice).unwrap().unwrap().balance, 10.0);
        assert!(registry.contracts().unwrap().is_empty());
    }

    #[test]
    fn test_call_updates_state_and_returns() {
        let (_dir, store, registry, alice) = setup(true);
        let (contract, _) = registry.deploy(&alice, EXAMPLE_CONTRACT).unwrap();

        let outcome = registry
            .call(&alice, &contract.address, "increment", &["5".to_string()])
            .unwrap();
        assert_eq!(outcome.return_value, serde_json::json!(5));

        let outcome = registry
            .call(&alice, &contract.address, "increment", &["2".to_string()])
            .unwrap();
        assert_eq!(outcome.return_value, serde_json::json!(7));

        let outcome = registry
            .call(&alice, &contract.address, "get_counter", &[])
            .unwrap();
        assert_eq!(outcome.return_value, serde_json::json!(7));
        assert_eq!(
            registry.get(&contract.address).unwrap().state["counter"],
            serde_json::json!(7)
        );
        // Deploy fee 1.0 plus three calls at 0.05
        let balance = store.wallet(&alice).unwrap().unwrap().balance;
        assert!((balance - 8.85).abs() < 1e-9);
    }

    #[test]
    fn test_failed_call_keeps_state_but_charges_gas() {
        let (_dir, store, registry, alice) = setup(true);
        let (contract, _) = registry.deploy(&alice, EXAMPLE_CONTRACT).unwrap();
        registry
            .call(&alice, &contract.address, "increment", &["3".to_string()])
            .unwrap();

        let err = registry
            .call(&alice, &contract.address, "increment", &["ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, NodeError::VmRuntime(_)));
        // State survived the failed call
        assert_eq!(
            registry.get(&contract.address).unwrap().state["counter"],
            serde_json::json!(3)
        );
        // Deploy 1.0 + two call fees (the failed one still billed)
        let balance = store.wallet(&alice).unwrap().unwrap().balance;
        assert!((balance - 8.9).abs() < 1e-9);
    }

    #[test]
    fn test_failed_call_refund_policy() {
        let (_dir, store, registry, alice) = setup(false);
        let (contract, _) = registry.deploy(&alice, EXAMPLE_CONTRACT).unwrap();

        let err = registry
            .call(&alice, &contract.address, "no_such_method", &[])
            .unwrap_err();
        assert!(matches!(err, NodeError::VmRuntime(_)));
        // Only the deploy fee was charged
        assert_eq!(store.wallet(&alice).unwrap().unwrap().balance, 9.0);
    }

    #[test]
    fn test_call_unknown_contract() {
        let (_dir, _store, registry, alice) = setup(true);
        assert!(matches!(
            registry.call(&alice, "CNTmissing", "init", &[]),
            Err(NodeError::NotFound(_))
        ));
    }

    #[test]
    fn test_call_requires_funds() {
        let (_dir, store, registry, alice) = setup(true);
        let (contract, _) = registry.deploy(&alice, EXAMPLE_CONTRACT).unwrap();
        store
            .put_wallet(&Wallet {
                wallet_id: alice.clone(),
                balance: 0.0,
                last_mined: 0.0,
            })
            .unwrap();
        assert!(matches!(
            registry.call(&alice, &contract.address, "get_counter", &[]),
            Err(NodeError::InsufficientFunds { .. })
        ));
        // Failed fee movement must not persist state changes either
        assert_eq!(
            registry.get(&contract.address).unwrap().state["counter"],
            serde_json::json!(0)
        );
    }

    #[test]
    fn test_addresses_are_unique() {
        let a = contract_address();
        let b = contract_address();
        assert_ne!(a, b);
        assert!(a.starts_with("CNT"));
        assert!(a[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
