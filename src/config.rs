//! Gatekeeper configuration.

use crate::error::{GateError, Result};
use crate::lifecycle::{RenewalPolicy, SweepConfig};
use crate::store::StoreConfig;
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Who may run admin commands and who receives operator alerts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Users allowed to request reports.
    pub admin_ids: Vec<UserId>,

    /// Receives support requests and failure alerts; also an admin.
    pub support_user_id: Option<UserId>,
}

impl AdminConfig {
    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.support_user_id == Some(user_id) || self.admin_ids.contains(&user_id)
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    pub store: StoreConfig,
    pub sweep: SweepConfig,
    pub renewal: RenewalPolicy,
    pub admin: AdminConfig,

    /// Threads handling inbound events.
    /// Default: 4
    pub dispatch_workers: usize,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            sweep: SweepConfig::default(),
            renewal: RenewalPolicy::default(),
            admin: AdminConfig::default(),
            dispatch_workers: 4,
        }
    }
}

impl GatekeeperConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject settings that would make the gatekeeper misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.sweep.interval_secs == 0 {
            return Err(GateError::Config("sweep.interval_secs must be positive".into()));
        }
        if self.sweep.max_reminder_attempts == 0 {
            return Err(GateError::Config(
                "sweep.max_reminder_attempts must be at least 1".into(),
            ));
        }
        if self.sweep.transport_timeout_ms == 0 {
            return Err(GateError::Config(
                "sweep.transport_timeout_ms must be positive".into(),
            ));
        }
        if self.sweep.reminder_window_days < 0 {
            return Err(GateError::Config(
                "sweep.reminder_window_days must not be negative".into(),
            ));
        }
        if self.dispatch_workers == 0 {
            return Err(GateError::Config("dispatch_workers must be at least 1".into()));
        }
        Ok(())
    }
}
