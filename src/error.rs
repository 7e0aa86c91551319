use super::authority::{Action, Role};
use super::case::CaseStatus;
use super::stage::StageName;
use super::types::DocumentKey;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("Unknown role label '{0}'")]
    UnknownRole(String),
    #[error("Unknown stage name '{0}'")]
    UnknownStage(String),
}

/// Why [`crate::authority::RoleAuthority`] refused an action.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    #[error("{role} is not permitted to {action:?}")]
    RoleNotPermitted { role: Role, action: Action },
    #[error("Intip data must be submitted before the proposal can be decided")]
    IntipDataMissing,
    #[error("Proposal is locked for editing")]
    ProposalLocked,
    #[error("Actor neither created nor is assigned to this proposal")]
    NotOwner,
    #[error("Action is not valid for this kind of case")]
    WrongCaseKind,
    #[error("Case is not in a state that accepts this action")]
    WrongCaseStatus,
    #[error("Only externally sourced proposals can be assigned")]
    NotExternal,
    #[error("A branch must be assigned before a specialist")]
    BranchNotAssigned,
    #[error("External proposal has no assigned specialist yet")]
    SpecialistNotAssigned,
}

/// A workflow configuration the engine cannot run with.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("approval.kplt_required_roles must name at least one role")]
    NoApprovers,
    #[error("{0} cannot approve KPLT cases")]
    NotAnApprover(Role),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Storage failure: {0}")]
    Sled(#[from] sled::Error),
    #[error("Failed to decode stored record: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("Failed to encode record: {0}")]
    Encode(String),
    #[error("Record '{0}' changed since it was read")]
    Conflict(String),
}

#[derive(thiserror::Error, Debug)]
pub enum FinalizeError {
    #[error("{role} may not finalize {stage}")]
    Unauthorized { role: Role, stage: StageName },
    #[error("Predecessor stages are not complete: {0:?}")]
    PredecessorIncomplete(Vec<StageName>),
    #[error("Required documents are missing: {0:?}")]
    MissingDocuments(Vec<DocumentKey>),
    #[error("Stage was modified concurrently, reload and retry")]
    ConcurrentModification,
    #[error("Case '{0}' not found")]
    CaseNotFound(String),
    #[error("Case '{0}' is not an approved KPLT")]
    CaseNotApproved(String),
    #[error(transparent)]
    Storage(StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum ApprovalError {
    #[error("Unauthorized: {0}")]
    Unauthorized(Denial),
    #[error("{0} has already decided in this approval round")]
    AlreadyDecided(Role),
    #[error("Case is no longer in progress (status: {0})")]
    CaseNotInProgress(CaseStatus),
    #[error("Intip data must be submitted before the proposal can be decided")]
    IntipDataMissing,
    #[error("Case '{0}' not found")]
    CaseNotFound(String),
    #[error("Case was modified concurrently, reload and retry")]
    ConcurrentModification,
    #[error(transparent)]
    Storage(StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Unauthorized: {0}")]
    Unauthorized(Denial),
    #[error("Stage is locked until these stages are resolved: {0:?}")]
    StageLocked(Vec<StageName>),
    #[error("Case is no longer in progress (status: {0})")]
    CaseNotInProgress(CaseStatus),
    #[error("Case '{0}' not found")]
    CaseNotFound(String),
    #[error("Case '{0}' is not an approved KPLT")]
    CaseNotApproved(String),
    #[error("Case '{0}' is not an approved ULOK")]
    UlokNotApproved(String),
    #[error("ULOK already has a KPLT: '{0}'")]
    AlreadyLinked(String),
    #[error("Failed to mint case identifier: {0}")]
    Identifier(String),
    #[error("Case was modified concurrently, reload and retry")]
    ConcurrentModification,
    #[error(transparent)]
    Storage(StoreError),
}

#[derive(thiserror::Error, Debug)]
pub enum ViewError {
    #[error("Case '{0}' not found")]
    CaseNotFound(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<StoreError> for FinalizeError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(_) => FinalizeError::ConcurrentModification,
            other => FinalizeError::Storage(other),
        }
    }
}

impl From<StoreError> for ApprovalError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(_) => ApprovalError::ConcurrentModification,
            other => ApprovalError::Storage(other),
        }
    }
}

impl From<StoreError> for ValidationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(_) => ValidationError::ConcurrentModification,
            other => ValidationError::Storage(other),
        }
    }
}

impl From<Denial> for ApprovalError {
    fn from(value: Denial) -> Self {
        match value {
            Denial::IntipDataMissing => ApprovalError::IntipDataMissing,
            other => ApprovalError::Unauthorized(other),
        }
    }
}

impl From<Denial> for ValidationError {
    fn from(value: Denial) -> Self {
        ValidationError::Unauthorized(value)
    }
}
