//! Token collaborator used by the ledger to move value.
//!
//! The ledger never touches token balances itself: it asks a
//! [`TokenTransfer`] implementation to pull funds from a depositor into
//! custody, or to push funds from custody back to a user. [`InMemoryToken`]
//! is an allowance-based book with `transferFrom`/`transfer` semantics that
//! backs the CLI, the line server and the tests.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ledger::{is_null_account, AccountId, Amount};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("allowance of {owner} for {spender} is {allowance}, requested {requested}")]
    InsufficientAllowance {
        owner: AccountId,
        spender: AccountId,
        allowance: Amount,
        requested: Amount,
    },
    #[error("token balance of {account} is {available}, requested {requested}")]
    InsufficientBalance {
        account: AccountId,
        available: Amount,
        requested: Amount,
    },
    #[error("token balance of {account} would overflow")]
    Overflow { account: AccountId },
    #[error("address zero detected")]
    ZeroAddress,
    #[error("{0} is the custody account")]
    CustodyAccount(AccountId),
    #[error("transfer declined: {0}")]
    Declined(String),
}

/// Value movement between users and the ledger's custody account.
///
/// Implementations may run arbitrary code before returning, including calls
/// back into the ledger on the same thread.
pub trait TokenTransfer {
    /// Moves `amount` from `from` into custody. Requires prior authorisation.
    fn pull(&self, from: &AccountId, amount: Amount) -> Result<(), TransferError>;

    /// Moves `amount` from custody to `to`.
    fn push(&self, to: &AccountId, amount: Amount) -> Result<(), TransferError>;

    /// Amount currently held in custody.
    fn custodied(&self) -> Amount;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenSnapshot {
    pub total_supply: Amount,
    pub balances: BTreeMap<AccountId, Amount>,
    /// owner -> spender -> remaining allowance
    pub allowances: BTreeMap<AccountId, BTreeMap<AccountId, Amount>>,
}

#[derive(Default)]
struct TokenBook {
    total_supply: Amount,
    balances: BTreeMap<AccountId, Amount>,
    allowances: BTreeMap<AccountId, BTreeMap<AccountId, Amount>>,
}

impl TokenBook {
    fn balance(&self, account: &AccountId) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|grants| grants.get(spender))
            .copied()
            .unwrap_or(0)
    }

    fn move_balance(
        &mut self,
        from: &AccountId,
        to: &AccountId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        let available = self.balance(from);
        if available < amount {
            return Err(TransferError::InsufficientBalance {
                account: from.clone(),
                available,
                requested: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let credited = self
            .balance(to)
            .checked_add(amount)
            .ok_or_else(|| TransferError::Overflow { account: to.clone() })?;
        self.balances.insert(from.clone(), available - amount);
        self.balances.insert(to.clone(), credited);
        Ok(())
    }
}

/// ERC-20 style token kept in memory, with one account designated as the
/// ledger's custody.
pub struct InMemoryToken {
    custody: AccountId,
    book: Mutex<TokenBook>,
}

impl InMemoryToken {
    pub fn new(custody: impl Into<AccountId>) -> Self {
        Self {
            custody: custody.into(),
            book: Mutex::new(TokenBook::default()),
        }
    }

    pub fn from_snapshot(custody: impl Into<AccountId>, snapshot: TokenSnapshot) -> Self {
        Self {
            custody: custody.into(),
            book: Mutex::new(TokenBook {
                total_supply: snapshot.total_supply,
                balances: snapshot.balances,
                allowances: snapshot.allowances,
            }),
        }
    }

    pub fn custody(&self) -> &AccountId {
        &self.custody
    }

    /// Mints to any account except custody, whose balance only moves
    /// through `pull` and `push`.
    pub fn mint(&self, to: &AccountId, amount: Amount) -> Result<(), TransferError> {
        if is_null_account(to) {
            return Err(TransferError::ZeroAddress);
        }
        if *to == self.custody {
            return Err(TransferError::CustodyAccount(to.clone()));
        }
        let mut book = self.book.lock();
        let supply = book
            .total_supply
            .checked_add(amount)
            .ok_or_else(|| TransferError::Overflow { account: to.clone() })?;
        let balance = book
            .balance(to)
            .checked_add(amount)
            .ok_or_else(|| TransferError::Overflow { account: to.clone() })?;
        book.total_supply = supply;
        book.balances.insert(to.clone(), balance);
        Ok(())
    }

    /// Sets (not increments) the amount `spender` may pull from `owner`.
    pub fn approve(
        &self,
        owner: &AccountId,
        spender: &AccountId,
        amount: Amount,
    ) -> Result<(), TransferError> {
        if is_null_account(owner) || is_null_account(spender) {
            return Err(TransferError::ZeroAddress);
        }
        self.book
            .lock()
            .allowances
            .entry(owner.clone())
            .or_default()
            .insert(spender.clone(), amount);
        Ok(())
    }

    pub fn allowance(&self, owner: &AccountId, spender: &AccountId) -> Amount {
        self.book.lock().allowance(owner, spender)
    }

    pub fn balance_of(&self, account: &AccountId) -> Amount {
        self.book.lock().balance(account)
    }

    pub fn total_supply(&self) -> Amount {
        self.book.lock().total_supply
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        let book = self.book.lock();
        TokenSnapshot {
            total_supply: book.total_supply,
            balances: book.balances.clone(),
            allowances: book.allowances.clone(),
        }
    }
}

impl TokenTransfer for InMemoryToken {
    fn pull(&self, from: &AccountId, amount: Amount) -> Result<(), TransferError> {
        if *from == self.custody {
            return Err(TransferError::CustodyAccount(from.clone()));
        }
        let mut book = self.book.lock();
        let allowance = book.allowance(from, &self.custody);
        if allowance < amount {
            return Err(TransferError::InsufficientAllowance {
                owner: from.clone(),
                spender: self.custody.clone(),
                allowance,
                requested: amount,
            });
        }
        book.move_balance(from, &self.custody, amount)?;
        book.allowances
            .entry(from.clone())
            .or_default()
            .insert(self.custody.clone(), allowance - amount);
        Ok(())
    }

    fn push(&self, to: &AccountId, amount: Amount) -> Result<(), TransferError> {
        if is_null_account(to) {
            return Err(TransferError::ZeroAddress);
        }
        if *to == self.custody {
            return Err(TransferError::CustodyAccount(to.clone()));
        }
        self.book.lock().move_balance(&self.custody, to, amount)
    }

    fn custodied(&self) -> Amount {
        self.balance_of(&self.custody)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(owner: &str, amount: Amount) -> InMemoryToken {
        let token = InMemoryToken::new("vault");
        token.mint(&owner.to_string(), amount).unwrap();
        token
    }

    #[test]
    fn pull_consumes_allowance_and_moves_into_custody() {
        let token = funded("alice", 5_000);
        let alice = "alice".to_string();
        token.approve(&alice, &"vault".to_string(), 3_000).unwrap();

        token.pull(&alice, 2_000).unwrap();

        assert_eq!(token.balance_of(&alice), 3_000);
        assert_eq!(token.custodied(), 2_000);
        assert_eq!(token.allowance(&alice, &"vault".to_string()), 1_000);
        assert_eq!(token.total_supply(), 5_000);
    }

    #[test]
    fn pull_without_allowance_is_declined() {
        let token = funded("alice", 5_000);
        let err = token.pull(&"alice".to_string(), 1).unwrap_err();
        assert!(matches!(
            err,
            TransferError::InsufficientAllowance { allowance: 0, requested: 1, .. }
        ));
        assert_eq!(token.custodied(), 0);
    }

    #[test]
    fn pull_beyond_balance_keeps_allowance() {
        let token = funded("alice", 100);
        let alice = "alice".to_string();
        token.approve(&alice, &"vault".to_string(), 1_000).unwrap();

        let err = token.pull(&alice, 500).unwrap_err();

        assert!(matches!(err, TransferError::InsufficientBalance { available: 100, .. }));
        assert_eq!(token.allowance(&alice, &"vault".to_string()), 1_000);
        assert_eq!(token.balance_of(&alice), 100);
    }

    #[test]
    fn push_is_bounded_by_custody() {
        let token = funded("alice", 100);
        let alice = "alice".to_string();
        token.approve(&alice, &"vault".to_string(), 100).unwrap();
        token.pull(&alice, 100).unwrap();

        token.push(&"bob".to_string(), 40).unwrap();
        assert_eq!(token.balance_of(&"bob".to_string()), 40);
        assert_eq!(token.custodied(), 60);

        let err = token.push(&"bob".to_string(), 61).unwrap_err();
        assert!(matches!(err, TransferError::InsufficientBalance { .. }));
    }

    #[test]
    fn null_identities_are_rejected() {
        let token = InMemoryToken::new("vault");
        assert_eq!(token.mint(&String::new(), 1), Err(TransferError::ZeroAddress));
        let zero = format!("0x{}", "0".repeat(40));
        assert_eq!(
            token.approve(&zero, &"vault".to_string(), 1),
            Err(TransferError::ZeroAddress)
        );
    }

    #[test]
    fn custody_cannot_be_minted_to_or_move_to_itself() {
        let token = funded("alice", 100);
        let vault = "vault".to_string();

        assert_eq!(
            token.mint(&vault, 1_000),
            Err(TransferError::CustodyAccount(vault.clone()))
        );
        token.approve(&vault, &vault, 1_000).unwrap();
        assert_eq!(
            token.pull(&vault, 1),
            Err(TransferError::CustodyAccount(vault.clone()))
        );
        assert_eq!(
            token.push(&vault, 1),
            Err(TransferError::CustodyAccount(vault.clone()))
        );
        assert_eq!(token.custodied(), 0);
        assert_eq!(token.total_supply(), 100);
    }

    #[test]
    fn mint_refuses_supply_overflow() {
        let token = funded("alice", Amount::MAX);
        let err = token.mint(&"bob".to_string(), 1).unwrap_err();
        assert!(matches!(err, TransferError::Overflow { .. }));
        assert_eq!(token.balance_of(&"bob".to_string()), 0);
    }

    #[test]
    fn snapshot_restores_the_same_book() {
        let token = funded("alice", 700);
        token
            .approve(&"alice".to_string(), &"vault".to_string(), 50)
            .unwrap();
        let restored = InMemoryToken::from_snapshot("vault", token.snapshot());
        assert_eq!(restored.snapshot(), token.snapshot());
        assert_eq!(restored.allowance(&"alice".to_string(), &"vault".to_string()), 50);
    }
}
