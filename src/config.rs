//! Engine configuration loaded from TOML
//!
//! Every section has defaults, so an empty file (or no file) gives the
//! standard workflow: KPLT approval by Branch Manager and Regional Manager,
//! cancelled stages unlocking their successors and the default document table.
use super::authority::Role;
use super::documents::FileRequirementChecker;
use super::error::ConfigError;
use super::stage::{DependencyPolicy, StageName};
use super::types::DocumentKey;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub storage: StorageConfig,
    pub approval: ApprovalConfig,
    pub stages: StageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Discard the database when it is dropped.
    pub temporary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("site-opening.db"),
            temporary: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub kplt_required_roles: Vec<Role>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            kplt_required_roles: vec![Role::BranchManager, Role::RegionalManager],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub dependency_policy: DependencyPolicy,
    /// Replaces the default document list of the named stages.
    pub required_documents: BTreeMap<StageName, Vec<DocumentKey>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl WorkflowConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: WorkflowConfig = toml::from_str(input).context("invalid workflow config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// In-memory database, for demos and tests.
    pub fn temporary() -> Self {
        let mut config = Self::default();
        config.storage.temporary = true;
        config
    }

    /// Reject approval settings under which no KPLT could ever be approved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let roles = &self.approval.kplt_required_roles;
        if roles.is_empty() {
            return Err(ConfigError::NoApprovers);
        }
        // only roles holding ApproveCase can ever fill a slot
        let approver = |r: &Role| {
            matches!(
                r,
                Role::BranchManager | Role::RegionalManager | Role::GeneralManager
            )
        };
        if let Some(role) = roles.iter().find(|r| !approver(r)) {
            return Err(ConfigError::NotAnApprover(*role));
        }
        Ok(())
    }

    pub fn document_checker(&self) -> FileRequirementChecker {
        FileRequirementChecker::with_overrides(&self.stages.required_documents)
    }

    pub fn open_db(&self) -> anyhow::Result<sled::Db> {
        let db = sled::Config::new()
            .path(&self.storage.path)
            .temporary(self.storage.temporary)
            .open()
            .with_context(|| format!("opening sled at {}", self.storage.path.display()))?;
        Ok(db)
    }
}
