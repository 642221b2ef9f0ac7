//! Line-delimited JSON protocol spoken by `save-ledger-serve`.
//!
//! One request object per line, tagged by `op`; one reply object per line,
//! tagged by `status`. Identities are trimmed on the way in, so `" alice"`
//! and `"alice"` name the same account.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ledger::{AccountId, Amount, Ledger, LedgerError, LedgerEvent, LedgerSnapshot};
use crate::token::{InMemoryToken, TransferError};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Deposit { caller: AccountId, amount: Amount },
    Withdraw { caller: AccountId, amount: Amount },
    Balance { account: AccountId },
    ContractBalance,
    Events {
        #[serde(default)]
        since: usize,
    },
    Snapshot,
    /// Faucet on the in-memory token.
    Mint { to: AccountId, amount: Amount },
    /// Sets the caller's allowance for the ledger's custody account.
    Approve { caller: AccountId, amount: Amount },
}

impl Request {
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Request::Deposit { .. }
                | Request::Withdraw { .. }
                | Request::Mint { .. }
                | Request::Approve { .. }
        )
    }

    fn normalized(self) -> Self {
        match self {
            Request::Deposit { caller, amount } => Request::Deposit {
                caller: identity(caller),
                amount,
            },
            Request::Withdraw { caller, amount } => Request::Withdraw {
                caller: identity(caller),
                amount,
            },
            Request::Balance { account } => Request::Balance {
                account: identity(account),
            },
            Request::Mint { to, amount } => Request::Mint {
                to: identity(to),
                amount,
            },
            Request::Approve { caller, amount } => Request::Approve {
                caller: identity(caller),
                amount,
            },
            other => other,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Done,
    Balance {
        account: AccountId,
        balance: Amount,
    },
    ContractBalance {
        balance: Amount,
        pool_total: Amount,
    },
    Events {
        events: Vec<LedgerEvent>,
        next: usize,
    },
    Snapshot {
        snapshot: LedgerSnapshot,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Failure {
    Error { code: String, message: String },
}

/// One line written back to the client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Reply {
    Ok(Response),
    Failed(Failure),
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("token rejected request: {0}")]
    Token(#[from] TransferError),
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Malformed(_) => "E090_MALFORMED_REQUEST",
            RpcError::Ledger(err) => err.code(),
            RpcError::Token(_) => "E070_TRANSFER_FAILED",
        }
    }
}

impl From<RpcError> for Failure {
    fn from(err: RpcError) -> Self {
        Failure::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn identity(raw: AccountId) -> AccountId {
    raw.trim().to_string()
}

pub fn dispatch(ledger: &Ledger<InMemoryToken>, request: Request) -> Result<Response, RpcError> {
    let response = match request.normalized() {
        Request::Deposit { caller, amount } => {
            ledger.deposit(&caller, amount)?;
            Response::Done
        }
        Request::Withdraw { caller, amount } => {
            ledger.withdraw(&caller, amount)?;
            Response::Done
        }
        Request::Balance { account } => Response::Balance {
            balance: ledger.check_user_balance(&account),
            account,
        },
        Request::ContractBalance => Response::ContractBalance {
            balance: ledger.check_contract_balance(),
            pool_total: ledger.pool_total(),
        },
        Request::Events { since } => {
            let events = ledger.events_since(since);
            Response::Events {
                next: since.saturating_add(events.len()),
                events,
            }
        }
        Request::Snapshot => Response::Snapshot {
            snapshot: ledger.snapshot(),
        },
        Request::Mint { to, amount } => {
            ledger.token().mint(&to, amount)?;
            Response::Done
        }
        Request::Approve { caller, amount } => {
            ledger.token().approve(&caller, ledger.custody(), amount)?;
            Response::Done
        }
    };
    Ok(response)
}

/// Decodes one request line and returns the encoded response line, without
/// the trailing newline. The flag reports whether state changed.
pub fn handle_line(ledger: &Ledger<InMemoryToken>, line: &str) -> (String, bool) {
    let outcome = serde_json::from_str::<Request>(line)
        .map_err(RpcError::from)
        .and_then(|request| {
            let mutating = request.is_mutating();
            dispatch(ledger, request).map(|response| (response, mutating))
        });
    let (reply, changed) = match outcome {
        Ok((response, changed)) => (Reply::Ok(response), changed),
        Err(err) => {
            debug!(code = err.code(), error = %err, "request failed");
            (Reply::Failed(err.into()), false)
        }
    };
    let encoded = serde_json::to_string(&reply).unwrap_or_else(|err| {
        debug!(error = %err, "response encoding failed");
        r#"{"status":"error","code":"E091_ENCODE","message":"response encoding failed"}"#.to_string()
    });
    (encoded, changed)
}
