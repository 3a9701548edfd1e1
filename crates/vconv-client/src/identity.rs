//! Persisted runner identity.
//!
//! A single `config.json` next to the binary holds the machine id, the
//! auth token handed out at registration, and the reported name. The file
//! is overwritten whenever the control plane re-issues any of them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ClientError, ClientResult};

const IDENTITY_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerIdentity {
    pub id: String,
    pub token: String,
    pub name: String,
}

impl RunnerIdentity {
    /// Fresh identity with a generated machine id and a bootstrap token.
    pub fn generate(name: impl Into<String>, bootstrap_token: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            token: bootstrap_token.into(),
            name: name.into(),
        }
    }

    /// Default identity file location: next to the running binary.
    pub fn default_path() -> ClientResult<PathBuf> {
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .ok_or_else(|| ClientError::config("cannot resolve binary directory"))?;
        Ok(dir.join(IDENTITY_FILE))
    }

    /// Load a previously persisted identity, if one exists and parses.
    ///
    /// A malformed file is treated as absent so a re-registration can
    /// overwrite it.
    pub fn load(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };

        match serde_json::from_str::<RunnerIdentity>(&raw) {
            Ok(identity) => {
                debug!(id = %identity.id, "Loaded runner identity from {}", path.display());
                Some(identity)
            }
            Err(e) => {
                warn!(
                    "Identity file {} is malformed ({}), re-registering",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    /// Persist the identity, replacing any existing file.
    pub fn save(&self, path: impl AsRef<Path>) -> ClientResult<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        debug!(id = %self.id, "Persisted runner identity to {}", path.display());
        Ok(())
    }
}
