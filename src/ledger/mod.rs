use std::collections::BTreeMap;

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::token::{TokenTransfer, TransferError};

pub type AccountId = String;
pub type Amount = u64;

pub const ZERO_DEPOSIT: &str = "Can't save zero value";
pub const ZERO_WITHDRAWAL: &str = "can't withdraw zero value";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("address zero detected")]
    ZeroAddress,
    #[error("custody account {0} cannot save or withdraw")]
    CustodyCaller(AccountId),
    #[error("{reason}")]
    InvalidAmount { reason: &'static str },
    #[error("insufficient funds in account {account}: available {available}, requested {requested}")]
    InsufficientBalance {
        account: AccountId,
        available: Amount,
        requested: Amount,
    },
    #[error("token transfer failed: {0}")]
    TransferFailed(#[from] TransferError),
    #[error("balance of {account} would overflow")]
    Overflow { account: AccountId },
    #[error("snapshot rejected: {0}")]
    SnapshotMismatch(&'static str),
}

impl LedgerError {
    /// Stable code for logs, exit paths and wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ZeroAddress => "E001_ZERO_ADDRESS",
            Self::CustodyCaller(_) => "E002_CUSTODY_CALLER",
            Self::InvalidAmount { .. } => "E010_INVALID_AMOUNT",
            Self::InsufficientBalance { .. } => "E011_INSUFFICIENT_BALANCE",
            Self::TransferFailed(_) => "E070_TRANSFER_FAILED",
            Self::Overflow { .. } => "E080_OVERFLOW",
            Self::SnapshotMismatch(_) => "E100_SNAPSHOT_MISMATCH",
        }
    }
}

/// True for the empty identity and for `0x`-prefixed all-zero identities.
/// Identities are compared byte for byte; normalising them is up to the
/// caller.
pub fn is_null_account(account: &str) -> bool {
    if account.is_empty() {
        return true;
    }
    match account
        .strip_prefix("0x")
        .or_else(|| account.strip_prefix("0X"))
    {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b == b'0'),
        None => false,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    SavingSuccessful { account: AccountId, amount: Amount },
    WithdrawSuccessful { account: AccountId, amount: Amount },
}

impl LedgerEvent {
    pub fn account(&self) -> &AccountId {
        match self {
            LedgerEvent::SavingSuccessful { account, .. }
            | LedgerEvent::WithdrawSuccessful { account, .. } => account,
        }
    }

    pub fn amount(&self) -> Amount {
        match self {
            LedgerEvent::SavingSuccessful { amount, .. }
            | LedgerEvent::WithdrawSuccessful { amount, .. } => *amount,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// Number of committed deposits and withdrawals.
    pub height: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub custody: AccountId,
    pub accounts: BTreeMap<AccountId, Amount>,
    pub pool_total: Amount,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex_root")]
    pub merkle_root: [u8; 32],
}

#[derive(Default)]
struct Book {
    height: u64,
    accounts: BTreeMap<AccountId, Amount>,
    pool_total: Amount,
    events: Vec<LedgerEvent>,
}

impl Book {
    fn balance(&self, account: &AccountId) -> Amount {
        self.accounts.get(account).copied().unwrap_or(0)
    }

    fn credit(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let overflow = || LedgerError::Overflow {
            account: account.clone(),
        };
        let balance = self.balance(account).checked_add(amount).ok_or_else(overflow)?;
        let pool_total = self.pool_total.checked_add(amount).ok_or_else(overflow)?;
        self.accounts.insert(account.clone(), balance);
        self.pool_total = pool_total;
        Ok(())
    }

    fn debit(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let available = self.balance(account);
        if available == 0 || available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: account.clone(),
                available,
                requested: amount,
            });
        }
        self.accounts.insert(account.clone(), available - amount);
        // pool_total is the sum of all balances, so it covers this one
        self.pool_total -= amount;
        Ok(())
    }

    fn commit(&mut self, event: LedgerEvent) {
        self.height += 1;
        self.events.push(event);
    }
}

/// Custodial savings ledger over a single token.
///
/// Mutating calls hold `gate` from validation to commit, so calls from
/// different threads never interleave. The gate is re-entrant: a token
/// collaborator that calls back into the ledger on the same thread gets
/// through, and observes balances already debited by the outer call. `book`
/// is only ever locked for short critical sections and never across a token
/// call.
pub struct Ledger<T> {
    custody: AccountId,
    token: T,
    gate: ReentrantMutex<()>,
    book: Mutex<Book>,
}

impl<T: TokenTransfer> Ledger<T> {
    pub fn new(custody: impl Into<AccountId>, token: T) -> Self {
        Self {
            custody: custody.into(),
            token,
            gate: ReentrantMutex::new(()),
            book: Mutex::new(Book::default()),
        }
    }

    /// Rebuilds a ledger from a snapshot, refusing one whose pool total or
    /// merkle root disagree with its account balances, or whose pool total
    /// is not what `token` holds in custody.
    pub fn from_snapshot(token: T, snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let sum = snapshot
            .accounts
            .values()
            .try_fold(0u64, |acc, balance| acc.checked_add(*balance))
            .ok_or(LedgerError::SnapshotMismatch("account balances overflow"))?;
        if sum != snapshot.pool_total {
            return Err(LedgerError::SnapshotMismatch(
                "pool total differs from the sum of balances",
            ));
        }
        if compute_merkle_root(&snapshot.accounts) != snapshot.merkle_root {
            return Err(LedgerError::SnapshotMismatch("merkle root mismatch"));
        }
        if token.custodied() != snapshot.pool_total {
            return Err(LedgerError::SnapshotMismatch(
                "custodied tokens differ from the pool total",
            ));
        }
        Ok(Self {
            custody: snapshot.custody,
            token,
            gate: ReentrantMutex::new(()),
            book: Mutex::new(Book {
                height: snapshot.meta.height,
                accounts: snapshot.accounts,
                pool_total: snapshot.pool_total,
                events: snapshot.events,
            }),
        })
    }

    pub fn custody(&self) -> &AccountId {
        &self.custody
    }

    pub fn token(&self) -> &T {
        &self.token
    }

    /// Pulls `amount` from `caller` into custody, then credits it.
    pub fn deposit(&self, caller: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let _gate = self.gate.lock();
        self.validate(caller, amount, ZERO_DEPOSIT)?;

        if let Err(err) = self.token.pull(caller, amount) {
            debug!(account = %caller, amount, error = %err, "deposit declined by token");
            return Err(err.into());
        }

        let credited = self.book.lock().credit(caller, amount);
        if let Err(err) = credited {
            // the pulled funds are not recorded anywhere, hand them back
            if let Err(refund) = self.token.push(caller, amount) {
                error!(account = %caller, amount, error = %refund, "deposit refund failed");
            }
            return Err(err);
        }

        self.book.lock().commit(LedgerEvent::SavingSuccessful {
            account: caller.clone(),
            amount,
        });
        info!(account = %caller, amount, "saving successful");
        Ok(())
    }

    /// Debits `caller` first, then pushes `amount` out of custody. A failed
    /// push restores the debit.
    pub fn withdraw(&self, caller: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let _gate = self.gate.lock();
        self.validate(caller, amount, ZERO_WITHDRAWAL)?;

        let debited = self.book.lock().debit(caller, amount);
        if let Err(err) = debited {
            debug!(account = %caller, amount, error = %err, "withdrawal rejected");
            return Err(err);
        }

        if let Err(err) = self.token.push(caller, amount) {
            warn!(account = %caller, amount, error = %err, "withdrawal rolled back");
            if let Err(restore) = self.book.lock().credit(caller, amount) {
                error!(account = %caller, amount, error = %restore, "rollback failed");
            }
            return Err(err.into());
        }

        self.book.lock().commit(LedgerEvent::WithdrawSuccessful {
            account: caller.clone(),
            amount,
        });
        info!(account = %caller, amount, "withdraw successful");
        Ok(())
    }

    pub fn check_user_balance(&self, account: &AccountId) -> Amount {
        self.book.lock().balance(account)
    }

    pub fn check_contract_balance(&self) -> Amount {
        self.token.custodied()
    }

    pub fn pool_total(&self) -> Amount {
        self.book.lock().pool_total
    }

    pub fn height(&self) -> u64 {
        self.book.lock().height
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.book.lock().events.clone()
    }

    /// Events committed at or after position `cursor` of the event log.
    pub fn events_since(&self, cursor: usize) -> Vec<LedgerEvent> {
        let book = self.book.lock();
        book.events.get(cursor..).map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Runs `f` while holding the operation gate, so no deposit or withdraw
    /// can commit in between reads made inside it.
    pub fn with_gate<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let _gate = self.gate.lock();
        f(self)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let _gate = self.gate.lock();
        let book = self.book.lock();
        LedgerSnapshot {
            meta: SnapshotMetadata {
                height: book.height,
            },
            custody: self.custody.clone(),
            accounts: book.accounts.clone(),
            pool_total: book.pool_total,
            events: book.events.clone(),
            merkle_root: compute_merkle_root(&book.accounts),
        }
    }

    /// Rejects the null address, the custody account and zero amounts.
    fn validate(
        &self,
        caller: &AccountId,
        amount: Amount,
        zero_reason: &'static str,
    ) -> Result<(), LedgerError> {
        if is_null_account(caller) {
            debug!(amount, "request from null address");
            return Err(LedgerError::ZeroAddress);
        }
        if *caller == self.custody {
            debug!(account = %caller, amount, "request from custody account");
            return Err(LedgerError::CustodyCaller(caller.clone()));
        }
        if amount == 0 {
            debug!(account = %caller, "zero amount request");
            return Err(LedgerError::InvalidAmount {
                reason: zero_reason,
            });
        }
        Ok(())
    }
}

pub fn compute_merkle_root(accounts: &BTreeMap<AccountId, Amount>) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = accounts
        .iter()
        .map(|(account, balance)| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update((account.len() as u64).to_le_bytes());
            hasher.update(account.as_bytes());
            hasher.update(balance.to_le_bytes());
            hasher.finalize().into()
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"save-ledger-empty").into();
    }
    while leaves.len() > 1 {
        leaves = leaves
            .chunks(2)
            .map(|pair| -> [u8; 32] {
                let mut hasher = Sha256::new();
                hasher.update(b"node");
                hasher.update(pair[0]);
                hasher.update(pair.get(1).unwrap_or(&pair[0]));
                hasher.finalize().into()
            })
            .collect();
    }
    leaves[0]
}

pub(crate) mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("merkle root must be 32 bytes"))
    }
}
