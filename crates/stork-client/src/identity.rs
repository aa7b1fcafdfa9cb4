use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use stork_shared::PeerId;

use crate::error::{ClientError, Result};

/// Source of this installation's persistent identity.
pub trait IdentityStore {
    /// Return the stored identity, generating and persisting one on first use.
    fn load_or_create(&self) -> Result<PeerId>;
}

/// Keeps the identity in a small text file.
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The identity file in the platform data directory:
    /// - Linux:   `~/.local/share/stork/peer_id`
    /// - macOS:   `~/Library/Application Support/com.stork.stork/peer_id`
    /// - Windows: `{FOLDERID_RoamingAppData}\stork\stork\data\peer_id`
    pub fn default_location() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "stork", "stork").ok_or(ClientError::NoDataDir)?;
        Ok(Self::new(project_dirs.data_dir().join("peer_id")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStore for FileIdentityStore {
    fn load_or_create(&self) -> Result<PeerId> {
        if self.path.exists() {
            let raw = fs::read_to_string(&self.path)?;
            let id = raw.trim();
            if id.is_empty() {
                return Err(ClientError::Identity(format!(
                    "{} is empty",
                    self.path.display()
                )));
            }
            tracing::debug!(path = %self.path.display(), "Loaded identity");
            return Ok(PeerId::new(id));
        }

        let peer_id = PeerId::generate();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, peer_id.as_str())?;
        tracing::info!(path = %self.path.display(), peer = %peer_id, "Generated new identity");
        Ok(peer_id)
    }
}
