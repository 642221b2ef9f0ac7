//! Custodial savings ledger.
//!
//! Users deposit a fungible token into custody and may withdraw up to what
//! they have deposited. The crate is organised as:
//!
//! * [`ledger`] — per-account balances, the pool total, events and the
//!   deposit/withdraw state transitions.
//! * [`token`] — the transfer collaborator the ledger delegates value
//!   movement to, plus an in-memory ERC-20 style implementation.
//! * [`store`] — JSON state file persistence with atomic replacement.
//! * [`config`] — file/environment configuration and tracing setup.
//! * [`rpc`] — the line-delimited JSON protocol of `save-ledger-serve`.
//! * [`sim`] — a seeded random workload that checks the pool invariant.

pub mod config;
pub mod ledger;
pub mod rpc;
pub mod sim;
pub mod store;
pub mod token;

pub use ledger::{AccountId, Amount, Ledger, LedgerError, LedgerEvent, LedgerSnapshot};
pub use token::{InMemoryToken, TokenTransfer, TransferError};
