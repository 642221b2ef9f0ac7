use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ledger::{compute_merkle_root, Ledger, LedgerError, LedgerSnapshot, SnapshotMetadata};
use crate::token::{InMemoryToken, TokenSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Everything needed to rebuild a ledger and its token between runs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateFile {
    pub ledger: LedgerSnapshot,
    pub token: TokenSnapshot,
}

impl StateFile {
    pub fn empty(custody: &str) -> Self {
        Self {
            ledger: LedgerSnapshot {
                meta: SnapshotMetadata::default(),
                custody: custody.to_string(),
                accounts: Default::default(),
                pool_total: 0,
                events: Vec::new(),
                merkle_root: compute_merkle_root(&Default::default()),
            },
            token: TokenSnapshot::default(),
        }
    }

    /// Snapshots the ledger and its token as one consistent state.
    pub fn capture(ledger: &Ledger<InMemoryToken>) -> Self {
        ledger.with_gate(|ledger| Self {
            ledger: ledger.snapshot(),
            token: ledger.token().snapshot(),
        })
    }

    pub fn into_ledger(self) -> Result<Ledger<InMemoryToken>, LedgerError> {
        let token = InMemoryToken::from_snapshot(self.ledger.custody.clone(), self.token);
        Ledger::from_snapshot(token, self.ledger)
    }

    /// Reads `path`, or starts from an empty state when it does not exist.
    pub fn load_or_empty(path: &Path, custody: &str) -> Result<Self, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file yet, starting empty");
                return Ok(Self::empty(custody));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the state at `path`, runs `op` against the rebuilt ledger and,
    /// when `save` is set and `op` succeeded, writes the state back. A failed
    /// `op` leaves the file as it was.
    pub fn transact<R, E>(
        path: &Path,
        custody: &str,
        save: bool,
        op: impl FnOnce(&Ledger<InMemoryToken>) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let state = Self::load_or_empty(path, custody)?;
        if state.ledger.custody != custody {
            warn!(
                stored = %state.ledger.custody,
                configured = %custody,
                "state file custody differs from config, keeping the stored one"
            );
        }
        let ledger = state.into_ledger().map_err(StoreError::from)?;
        let out = op(&ledger)?;
        if save {
            Self::capture(&ledger).save(path)?;
        }
        Ok(out)
    }

    /// Writes a sibling temp file and renames it over `path`.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let encoded = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = temp_path(path);
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&encoded).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, path).map_err(io_err)?;
        debug!(path = %path.display(), bytes = encoded.len(), "state saved");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".tmp");
    path.with_file_name(name)
}
