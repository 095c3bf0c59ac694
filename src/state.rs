//! Persisted organization and session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::orchestration::Organization;
use crate::session::SessionRecord;
use crate::util::blocking;
use crate::{plog_debug, plog_warn, Result};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub organization: Organization,
    #[serde(default)]
    pub sessions: Vec<SessionRecord>,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl Default for OrganizationState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            organization: Organization::default(),
            sessions: Vec::new(),
            saved_at: Utc::now(),
        }
    }
}

impl OrganizationState {
    pub fn new(organization: Organization, sessions: Vec<SessionRecord>) -> Self {
        Self {
            organization,
            sessions,
            ..Self::default()
        }
    }

    pub async fn load() -> Result<Self> {
        let path = Config::state_path()?;
        blocking(move || Self::load_from(&path)).await
    }

    pub async fn save(&self) -> Result<()> {
        let path = Config::state_path()?;
        let state = self.clone();
        blocking(move || state.save_to(&path)).await
    }

    /// Load from `path`, falling back to the backup if the main file is
    /// unreadable, and to an empty state if neither exists.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            plog_debug!("No state file at {}, starting empty", path.display());
            return Ok(Self::default());
        }
        match Self::read(path) {
            Ok(state) => Ok(state),
            Err(e) => {
                let backup = backup_path(path);
                if !backup.exists() {
                    return Err(e);
                }
                plog_warn!(
                    "State file {} unreadable ({}), loading backup",
                    path.display(),
                    e
                );
                Self::read(&backup)
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&contents)?;
        plog_debug!(
            "State loaded: version={} groups={} sessions={}",
            state.version,
            state.organization.groups.len(),
            state.sessions.len()
        );
        Ok(state)
    }

    /// Write atomically: back up the old file, write a temp file, rename.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut state = self.clone();
        state.saved_at = Utc::now();
        let contents = serde_json::to_string_pretty(&state)?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        if path.exists() {
            fs::copy(path, backup_path(path))?;
        }
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, path)?;
        plog_debug!("State saved: {}", path.display());
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.bak")
}
