//! Service layer API for the site opening workflow
//!
//! Every command follows the same shape: load the versioned records it
//! needs, run the pure state machine against them, then hand the result to
//! [`WorkflowStore::commit`] together with guards on everything the decision
//! was based on. A guard that fails surfaces as `ConcurrentModification`.
use super::authority::RoleAuthority;
use super::case::{Case, CaseApprovalStateMachine, CaseKind, CaseStatus};
use super::config::WorkflowConfig;
use super::error::{ApprovalError, FinalizeError, StoreError, ValidationError, ViewError};
use super::ledger::Decision;
use super::stage::{
    FinalizeOutcome, FinalizeRequest, SnapshotDiff, StageBoard, StageName,
    StageProgressStateMachine, StageRecord, StageSnapshot, history_diffs,
};
use super::store::{Commit, WorkflowStore};
use super::types::{Actor, DocumentSet, Fields, Submission, TimeStamp};
use super::utils::new_case_id;
use super::view::CaseView;
use std::sync::Arc;

pub struct WorkflowOrchestrator {
    store: WorkflowStore,
    cases: CaseApprovalStateMachine,
    stages: StageProgressStateMachine,
}

// Why a stage command could not reach the stage pipeline of a case.
enum PipelineGate {
    NotFound(String),
    NotApproved(String),
    Store(StoreError),
}

impl From<StoreError> for PipelineGate {
    fn from(value: StoreError) -> Self {
        PipelineGate::Store(value)
    }
}

impl From<PipelineGate> for ValidationError {
    fn from(value: PipelineGate) -> Self {
        match value {
            PipelineGate::NotFound(id) => ValidationError::CaseNotFound(id),
            PipelineGate::NotApproved(id) => ValidationError::CaseNotApproved(id),
            PipelineGate::Store(err) => err.into(),
        }
    }
}

impl From<PipelineGate> for FinalizeError {
    fn from(value: PipelineGate) -> Self {
        match value {
            PipelineGate::NotFound(id) => FinalizeError::CaseNotFound(id),
            PipelineGate::NotApproved(id) => FinalizeError::CaseNotApproved(id),
            PipelineGate::Store(err) => err.into(),
        }
    }
}

impl WorkflowOrchestrator {
    /// Orchestrator with the default workflow rules.
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Self::with_config(instance, &WorkflowConfig::default())
    }

    /// Fails on a config that [`WorkflowConfig::validate`] rejects, whether it
    /// came from TOML or was built in code.
    pub fn with_config(instance: Arc<sled::Db>, config: &WorkflowConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let authority = RoleAuthority::new();
        Ok(Self {
            store: WorkflowStore::new(instance)?,
            cases: CaseApprovalStateMachine::new(
                authority,
                config.approval.kplt_required_roles.clone(),
            ),
            stages: StageProgressStateMachine::new(
                authority,
                config.document_checker(),
                config.stages.dependency_policy,
            ),
        })
    }

    /// Open the database named by `config.storage` and build on it.
    pub fn open(config: &WorkflowConfig) -> anyhow::Result<Self> {
        let db = config.open_db()?;
        Self::with_config(Arc::new(db), config)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.store.flush()
    }

    fn mint_id(kind: &CaseKind) -> Result<String, ValidationError> {
        new_case_id(kind).map_err(|e| ValidationError::Identifier(e.to_string()))
    }

    fn case_for_edit(&self, case_id: &str) -> Result<Case, ValidationError> {
        self.store
            .load_case(case_id)?
            .ok_or_else(|| ValidationError::CaseNotFound(case_id.to_string()))
    }

    fn case_for_decision(&self, case_id: &str) -> Result<Case, ApprovalError> {
        self.store
            .load_case(case_id)?
            .ok_or_else(|| ApprovalError::CaseNotFound(case_id.to_string()))
    }

    // stage work is only open on an approved KPLT
    fn load_pipeline(&self, case_id: &str) -> Result<(Case, StageBoard), PipelineGate> {
        let case = self
            .store
            .load_case(case_id)?
            .ok_or_else(|| PipelineGate::NotFound(case_id.to_string()))?;
        if !case.is_kplt() || case.status != CaseStatus::Ok {
            return Err(PipelineGate::NotApproved(case_id.to_string()));
        }
        let board = self.store.load_board(case_id)?;
        Ok((case, board))
    }

    /// Location Specialist submits a new ULOK.
    pub fn create_proposal(
        &self,
        actor: &Actor,
        proposal: Fields,
    ) -> Result<Case, ValidationError> {
        let id = Self::mint_id(&CaseKind::Ulok)?;
        let mut case = self.cases.propose(id, actor, proposal, TimeStamp::new())?;

        self.store.commit(Commit::new().case(&mut case))?;

        tracing::info!(case_id = %case.id, user = %actor.user_id, "ulok proposed");
        Ok(case)
    }

    /// Register a ULOK that came in from outside; it waits for assignment.
    /// No role check applies to `submitted_by`.
    pub fn intake_external_proposal(
        &self,
        submitted_by: &Actor,
        proposal: Fields,
    ) -> Result<Case, ValidationError> {
        let id = Self::mint_id(&CaseKind::Ulok)?;
        let mut case = self
            .cases
            .intake_external(id, submitted_by, proposal, TimeStamp::new());

        self.store.commit(Commit::new().case(&mut case))?;

        tracing::info!(
            case_id = %case.id,
            user = %submitted_by.user_id,
            "external ulok received"
        );
        Ok(case)
    }

    pub fn assign_branch(
        &self,
        case_id: &str,
        actor: &Actor,
        branch: &str,
    ) -> Result<Case, ValidationError> {
        let mut case = self.case_for_edit(case_id)?;
        self.cases
            .assign_branch(&mut case, actor, branch.to_string(), TimeStamp::new())?;

        self.store.commit(Commit::new().case(&mut case))?;

        tracing::info!(case_id, branch, "branch assigned");
        Ok(case)
    }

    pub fn assign_specialist(
        &self,
        case_id: &str,
        actor: &Actor,
        specialist_id: &str,
    ) -> Result<Case, ValidationError> {
        let mut case = self.case_for_edit(case_id)?;
        self.cases.assign_specialist(
            &mut case,
            actor,
            specialist_id.to_string(),
            TimeStamp::new(),
        )?;

        self.store.commit(Commit::new().case(&mut case))?;

        tracing::info!(case_id, specialist = specialist_id, "specialist assigned");
        Ok(case)
    }

    /// Merge `fields` into the proposal while it is still editable.
    pub fn edit_proposal(
        &self,
        case_id: &str,
        actor: &Actor,
        fields: Fields,
    ) -> Result<Case, ValidationError> {
        let mut case = self.case_for_edit(case_id)?;
        self.cases
            .edit_proposal(&mut case, actor, fields, TimeStamp::new())?;

        self.store.commit(Commit::new().case(&mut case))?;

        tracing::info!(case_id, user = %actor.user_id, "proposal edited");
        Ok(case)
    }

    pub fn submit_intip(
        &self,
        case_id: &str,
        actor: &Actor,
        intip: Submission,
    ) -> Result<Case, ValidationError> {
        let mut case = self.case_for_edit(case_id)?;
        self.cases
            .submit_intip(&mut case, actor, intip, TimeStamp::new())?;

        self.store.commit(Commit::new().case(&mut case))?;

        tracing::info!(case_id, user = %actor.user_id, "intip data submitted");
        Ok(case)
    }

    /// Open the KPLT of an approved ULOK. Both cases are written together so
    /// two racing requests cannot each link a KPLT.
    pub fn open_kplt(
        &self,
        ulok_id: &str,
        actor: &Actor,
        proposal: Fields,
    ) -> Result<Case, ValidationError> {
        let mut ulok = self.case_for_edit(ulok_id)?;
        let id = Self::mint_id(&CaseKind::Kplt {
            ulok_id: ulok_id.to_string(),
        })?;
        let mut kplt = self
            .cases
            .open_kplt(id, &mut ulok, actor, proposal, TimeStamp::new())?;

        self.store
            .commit(Commit::new().case(&mut ulok).case(&mut kplt))?;

        tracing::info!(case_id = %kplt.id, ulok_id, "kplt opened");
        Ok(kplt)
    }

    /// Record an approval decision and return the case status afterwards.
    pub fn approve_case(
        &self,
        case_id: &str,
        actor: &Actor,
        decision: Decision,
    ) -> Result<CaseStatus, ApprovalError> {
        let mut case = self.case_for_decision(case_id)?;
        let mut ledger = self.store.load_ledger(case_id)?;

        let outcome = self
            .cases
            .decide(&mut case, &mut ledger, actor, decision, TimeStamp::new())?;

        // the case write bumps its version, so a racing decision on the same
        // read fails instead of being lost
        self.store
            .commit(Commit::new().case(&mut case).entry(&outcome.entry))?;

        if outcome.resolved {
            tracing::info!(case_id, role = %actor.role, status = %outcome.status, "case decided");
        } else {
            tracing::info!(
                case_id,
                role = %actor.role,
                ?decision,
                "decision recorded, awaiting other roles"
            );
        }
        Ok(outcome.status)
    }

    pub fn escalate_to_forum(
        &self,
        case_id: &str,
        actor: &Actor,
    ) -> Result<CaseStatus, ApprovalError> {
        let mut case = self.case_for_decision(case_id)?;
        let status = self
            .cases
            .escalate_to_forum(&mut case, actor, TimeStamp::new())?;

        self.store.commit(Commit::new().case(&mut case))?;

        tracing::info!(case_id, round = case.approval_round, "case escalated to forum");
        Ok(status)
    }

    /// Save payload fields and uploaded document keys for a stage.
    pub fn submit_stage_data(
        &self,
        case_id: &str,
        stage: StageName,
        actor: &Actor,
        payload: Fields,
        files: DocumentSet,
    ) -> Result<StageRecord, ValidationError> {
        let (case, mut board) = self.load_pipeline(case_id)?;
        let was_resolved = board.status(stage).is_resolved();

        let mut change = self.stages.submit(
            &mut board,
            stage,
            actor,
            Submission {
                fields: payload,
                documents: files,
            },
            TimeStamp::new(),
        )?;

        if was_resolved && change.snapshot.is_none() {
            tracing::debug!(
                case_id,
                %stage,
                "edit matches the latest snapshot, nothing written"
            );
            return Ok(change.record);
        }

        self.store.commit(
            Commit::new()
                .guard_case(&case)
                .guard_board(&board)
                .stage(&mut change.record)
                .snapshot(change.snapshot.as_ref()),
        )?;

        if was_resolved {
            tracing::info!(case_id, %stage, user = %actor.user_id, "resolved stage edited");
        } else {
            tracing::info!(case_id, %stage, user = %actor.user_id, "stage data saved");
        }
        Ok(change.record)
    }

    /// Mark a stage `Done`.
    pub fn request_finalize(
        &self,
        case_id: &str,
        stage: StageName,
        actor: &Actor,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        self.resolve_stage(case_id, FinalizeRequest::complete(stage), actor)
    }

    /// Mark a stage `Done` only if it is still at `expected_version`.
    pub fn request_finalize_at(
        &self,
        case_id: &str,
        stage: StageName,
        actor: &Actor,
        expected_version: u64,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        self.resolve_stage(
            case_id,
            FinalizeRequest::complete(stage).at_version(expected_version),
            actor,
        )
    }

    /// Mark a stage `Cancelled`. No documents are required.
    pub fn request_cancel(
        &self,
        case_id: &str,
        stage: StageName,
        actor: &Actor,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        self.resolve_stage(case_id, FinalizeRequest::cancel(stage), actor)
    }

    fn resolve_stage(
        &self,
        case_id: &str,
        request: FinalizeRequest,
        actor: &Actor,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        let (case, mut board) = self.load_pipeline(case_id)?;

        let mut outcome = match self
            .stages
            .request_finalize(&mut board, request, actor, TimeStamp::new())
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    case_id,
                    stage = %request.stage,
                    user = %actor.user_id,
                    %err,
                    "finalize refused"
                );
                return Err(err);
            }
        };

        if outcome.already_resolved {
            tracing::debug!(
                case_id,
                stage = %outcome.stage,
                status = %outcome.status,
                "stage already resolved"
            );
            return Ok(outcome);
        }

        // guard the whole board: the unlock decision read every predecessor
        self.store.commit(
            Commit::new()
                .guard_case(&case)
                .guard_board(&board)
                .stage(&mut outcome.record)
                .snapshot(outcome.snapshot.as_ref()),
        )?;

        tracing::info!(
            case_id,
            stage = %outcome.stage,
            status = %outcome.status,
            newly_unlocked = ?outcome.newly_unlocked,
            "stage resolved"
        );
        Ok(outcome)
    }

    pub fn get_case_view(&self, case_id: &str) -> Result<CaseView, ViewError> {
        let case = self
            .store
            .load_case(case_id)?
            .ok_or_else(|| ViewError::CaseNotFound(case_id.to_string()))?;
        let ledger = self.store.load_ledger(case_id)?;
        let board = self.store.load_board(case_id)?;

        Ok(CaseView::build(
            &case,
            &ledger,
            &board,
            &self.stages,
            self.cases.kplt_required(),
        ))
    }

    /// Snapshots of a stage in the order they were taken.
    pub fn stage_history(
        &self,
        case_id: &str,
        stage: StageName,
    ) -> Result<Vec<StageSnapshot>, ViewError> {
        if self.store.load_case(case_id)?.is_none() {
            return Err(ViewError::CaseNotFound(case_id.to_string()));
        }
        Ok(self.store.load_history(case_id, stage)?)
    }

    /// What changed between each pair of consecutive snapshots.
    pub fn stage_history_diffs(
        &self,
        case_id: &str,
        stage: StageName,
    ) -> Result<Vec<SnapshotDiff>, ViewError> {
        let history = self.stage_history(case_id, stage)?;
        Ok(history_diffs(&history))
    }

    pub fn list_cases(&self) -> Result<Vec<Case>, StoreError> {
        self.store.list_cases()
    }
}
