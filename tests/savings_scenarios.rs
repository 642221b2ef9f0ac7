use std::{sync::Arc, thread};

use proptest::prelude::*;
use save_ledger::{AccountId, Amount, InMemoryToken, Ledger, LedgerError, LedgerEvent};

const VAULT: &str = "vault";

fn owner() -> AccountId {
    "0x70997970c51812dc3a010c7d01b50e0d17dc79c8".to_string()
}

/// Ledger over a fresh token, with `owner` funded and approving `allowance`.
fn deploy(owner: &AccountId, allowance: Amount) -> Ledger<InMemoryToken> {
    let token = InMemoryToken::new(VAULT);
    token.mint(owner, 1_000_000).unwrap();
    token.approve(owner, &VAULT.to_string(), allowance).unwrap();
    Ledger::new(VAULT, token)
}

#[test]
fn deposit_then_partial_and_full_withdrawal() {
    let owner = owner();
    let ledger = deploy(&owner, 2_000);

    ledger.deposit(&owner, 2_000).unwrap();
    assert_eq!(ledger.check_user_balance(&owner), 2_000);
    assert_eq!(ledger.check_contract_balance(), 2_000);

    ledger.withdraw(&owner, 1_000).unwrap();
    assert_eq!(ledger.check_user_balance(&owner), 1_000);
    assert_eq!(ledger.check_contract_balance(), 1_000);

    ledger.withdraw(&owner, 1_000).unwrap();
    assert_eq!(ledger.check_user_balance(&owner), 0);
    assert_eq!(ledger.check_contract_balance(), 0);
    assert_eq!(ledger.token().balance_of(&owner), 1_000_000);
}

#[test]
fn deposit_and_withdraw_emit_events() {
    let owner = owner();
    let ledger = deploy(&owner, 2_000);
    let before = ledger.check_user_balance(&owner);

    ledger.deposit(&owner, 2_000).unwrap();
    assert!(ledger.check_user_balance(&owner) > before);
    ledger.withdraw(&owner, 2_000).unwrap();

    assert_eq!(ledger.check_user_balance(&owner), before);
    assert_eq!(
        ledger.events(),
        vec![
            LedgerEvent::SavingSuccessful {
                account: owner.clone(),
                amount: 2_000,
            },
            LedgerEvent::WithdrawSuccessful {
                account: owner.clone(),
                amount: 2_000,
            },
        ]
    );
    let json = serde_json::to_value(&ledger.events()[0]).unwrap();
    assert_eq!(json["type"], "saving_successful");
    assert_eq!(json["account"], owner.as_str());
}

#[test]
fn two_deposits_accumulate_in_custody() {
    let owner = owner();
    let ledger = deploy(&owner, 4_000);

    ledger.deposit(&owner, 2_000).unwrap();
    ledger.deposit(&owner, 2_000).unwrap();

    assert_eq!(ledger.check_contract_balance(), 4_000);
    assert_eq!(ledger.check_user_balance(&owner), 4_000);
    assert_eq!(ledger.token().allowance(&owner, &VAULT.to_string()), 0);
}

#[test]
fn third_deposit_beyond_allowance_fails_cleanly() {
    let owner = owner();
    let ledger = deploy(&owner, 4_000);
    ledger.deposit(&owner, 2_000).unwrap();
    ledger.deposit(&owner, 2_000).unwrap();

    let err = ledger.deposit(&owner, 2_000).unwrap_err();

    assert!(matches!(err, LedgerError::TransferFailed(_)));
    assert_eq!(ledger.check_contract_balance(), 4_000);
    assert_eq!(ledger.events().len(), 2);
}

#[test]
fn zero_requests_fail_in_any_state() {
    let owner = owner();
    let ledger = deploy(&owner, 10_000);
    for funded in [false, true] {
        if funded {
            ledger.deposit(&owner, 10).unwrap();
        }
        assert!(matches!(
            ledger.deposit(&owner, 0),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            ledger.withdraw(&owner, 0),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }
}

#[test]
fn concurrent_callers_keep_the_pool_consistent() {
    let token = InMemoryToken::new(VAULT);
    let accounts: Vec<AccountId> = (0..8).map(|i| format!("saver-{i}")).collect();
    for account in &accounts {
        token.mint(account, 10_000).unwrap();
        token.approve(account, &VAULT.to_string(), 10_000).unwrap();
    }
    let ledger = Arc::new(Ledger::new(VAULT, token));

    let handles: Vec<_> = accounts
        .iter()
        .cloned()
        .map(|account| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for _ in 0..100 {
                    ledger.deposit(&account, 7).unwrap();
                    ledger.withdraw(&account, 3).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for account in &accounts {
        assert_eq!(ledger.check_user_balance(account), 400);
    }
    assert_eq!(ledger.pool_total(), 8 * 400);
    assert_eq!(ledger.check_contract_balance(), 8 * 400);
    assert_eq!(ledger.height(), 8 * 200);
}

#[derive(Debug, Clone)]
enum Op {
    Deposit(usize, Amount),
    Withdraw(usize, Amount),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..3usize, 0..500u64).prop_map(|(who, amount)| Op::Deposit(who, amount)),
        (0..3usize, 0..500u64).prop_map(|(who, amount)| Op::Withdraw(who, amount)),
    ]
}

proptest! {
    #[test]
    fn custody_always_equals_the_sum_of_balances(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let accounts: Vec<AccountId> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let token = InMemoryToken::new(VAULT);
        for account in &accounts {
            token.mint(account, 10_000).unwrap();
            token.approve(account, &VAULT.to_string(), 10_000).unwrap();
        }
        let ledger = Ledger::new(VAULT, token);
        let mut expected = [0u64; 3];

        for op in ops {
            match op {
                Op::Deposit(who, amount) => {
                    if ledger.deposit(&accounts[who], amount).is_ok() {
                        expected[who] += amount;
                    } else {
                        prop_assert!(amount == 0 || amount > ledger.token().allowance(&accounts[who], &VAULT.to_string()));
                    }
                }
                Op::Withdraw(who, amount) => {
                    let before = ledger.check_user_balance(&accounts[who]);
                    match ledger.withdraw(&accounts[who], amount) {
                        Ok(()) => expected[who] -= amount,
                        Err(LedgerError::InsufficientBalance { .. }) => prop_assert!(amount > before),
                        Err(LedgerError::InvalidAmount { .. }) => prop_assert_eq!(amount, 0),
                        Err(other) => prop_assert!(false, "unexpected error {other}"),
                    }
                }
            }
            let sum: Amount = accounts.iter().map(|a| ledger.check_user_balance(a)).sum();
            prop_assert_eq!(sum, ledger.pool_total());
            prop_assert_eq!(sum, ledger.check_contract_balance());
        }
        for (who, account) in accounts.iter().enumerate() {
            prop_assert_eq!(ledger.check_user_balance(account), expected[who]);
        }
    }
}
