//! Location proposals (ULOK) and store-feasibility cases (KPLT) and their approval state machine
use super::authority::{Action, ActionContext, Role, RoleAuthority};
use super::error::{ApprovalError, Denial, ValidationError};
use super::ledger::{ApprovalEntry, ApprovalLedger, Decision, Outcome};
use super::types::{Actor, Fields, Submission, TimeStamp};
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum CaseStatus {
    #[n(0)]
    InProgress,
    #[n(1)]
    Ok,
    #[n(2)]
    Nok,
    #[n(3)]
    WaitingForForum,
}

impl CaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CaseStatus::Ok | CaseStatus::Nok)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaseStatus::InProgress => "In Progress",
            CaseStatus::Ok => "OK",
            CaseStatus::Nok => "NOK",
            CaseStatus::WaitingForForum => "Waiting for Forum",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum CaseKind {
    #[n(0)]
    Ulok,
    #[n(1)]
    Kplt {
        #[n(0)]
        ulok_id: String,
    },
}

impl CaseKind {
    /// Human readable part of the bech32 case id.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            CaseKind::Ulok => "ulok",
            CaseKind::Kplt { .. } => "kplt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ProposalSource {
    #[n(0)]
    Internal,
    #[n(1)]
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Case {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub kind: CaseKind,
    #[n(2)]
    pub status: CaseStatus,
    #[n(3)]
    pub proposal: Fields,
    #[n(4)]
    pub intip: Option<Submission>,
    #[n(5)]
    pub source: ProposalSource,
    #[n(6)]
    pub assigned_branch: Option<String>,
    #[n(7)]
    pub assigned_specialist: Option<String>,
    #[n(8)]
    pub created_by: Actor,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub modified_by: String,
    #[n(11)]
    pub modified_at: TimeStamp<Utc>,
    #[n(12)]
    pub approved_by: Option<String>,
    #[n(13)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(14)]
    pub approval_round: u32,
    #[n(15)]
    pub decision_count: u64,
    #[n(16)]
    pub linked_kplt: Option<String>,
    // bumped by the store on every committed write
    #[n(17)]
    pub version: u64,
}

impl Case {
    pub fn new(
        id: String,
        kind: CaseKind,
        source: ProposalSource,
        created_by: Actor,
        proposal: Fields,
        now: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            status: CaseStatus::InProgress,
            proposal,
            intip: None,
            source,
            assigned_branch: None,
            assigned_specialist: None,
            modified_by: created_by.user_id.clone(),
            created_by,
            created_at: now.clone(),
            modified_at: now,
            approved_by: None,
            approved_at: None,
            approval_round: 0,
            decision_count: 0,
            linked_kplt: None,
            version: 0,
        }
    }

    pub fn is_kplt(&self) -> bool {
        matches!(self.kind, CaseKind::Kplt { .. })
    }

    fn touch(&mut self, actor: &Actor, now: TimeStamp<Utc>) {
        self.modified_by = actor.user_id.clone();
        self.modified_at = now;
    }
}

/// Result of a recorded decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub entry: ApprovalEntry,
    pub status: CaseStatus,
    pub resolved: bool,
}

#[derive(Debug, Clone)]
pub struct CaseApprovalStateMachine {
    authority: RoleAuthority,
    kplt_required: Vec<Role>,
}

impl CaseApprovalStateMachine {
    pub fn new(authority: RoleAuthority, kplt_required: Vec<Role>) -> Self {
        Self {
            authority,
            kplt_required,
        }
    }

    pub fn kplt_required(&self) -> &[Role] {
        &self.kplt_required
    }

    /// Start a ULOK proposal authored by a Location Specialist.
    pub fn propose(
        &self,
        id: String,
        actor: &Actor,
        proposal: Fields,
        now: TimeStamp<Utc>,
    ) -> Result<Case, ValidationError> {
        self.authority.authorize(
            actor.role,
            Action::SubmitProposal,
            &ActionContext::default(),
        )?;

        Ok(Case::new(
            id,
            CaseKind::Ulok,
            ProposalSource::Internal,
            actor.clone(),
            proposal,
            now,
        ))
    }

    /// Register a ULOK that arrived from outside the specialist team. It waits
    /// for a branch and then a specialist to be assigned.
    ///
    /// Intake is deliberately not role-checked: the submitter is not staff.
    /// Nothing else happens to the case until a specialist is assigned.
    pub fn intake_external(
        &self,
        id: String,
        submitted_by: &Actor,
        proposal: Fields,
        now: TimeStamp<Utc>,
    ) -> Case {
        Case::new(
            id,
            CaseKind::Ulok,
            ProposalSource::External,
            submitted_by.clone(),
            proposal,
            now,
        )
    }

    /// Open the KPLT that follows an approved ULOK. Mutates the ULOK to link it.
    pub fn open_kplt(
        &self,
        id: String,
        ulok: &mut Case,
        actor: &Actor,
        proposal: Fields,
        now: TimeStamp<Utc>,
    ) -> Result<Case, ValidationError> {
        self.authority.authorize(
            actor.role,
            Action::SubmitProposal,
            &ActionContext::default(),
        )?;

        if ulok.kind != CaseKind::Ulok || ulok.status != CaseStatus::Ok {
            return Err(ValidationError::UlokNotApproved(ulok.id.clone()));
        }
        if let Some(existing) = &ulok.linked_kplt {
            return Err(ValidationError::AlreadyLinked(existing.clone()));
        }

        let kplt = Case::new(
            id,
            CaseKind::Kplt {
                ulok_id: ulok.id.clone(),
            },
            ulok.source,
            actor.clone(),
            proposal,
            now.clone(),
        );
        ulok.linked_kplt = Some(kplt.id.clone());
        ulok.touch(actor, now);

        Ok(kplt)
    }

    pub fn edit_proposal(
        &self,
        case: &mut Case,
        actor: &Actor,
        fields: Fields,
        now: TimeStamp<Utc>,
    ) -> Result<(), ValidationError> {
        if case.status.is_terminal() {
            return Err(ValidationError::CaseNotInProgress(case.status));
        }
        self.authority.authorize(
            actor.role,
            Action::EditProposal,
            &ActionContext::for_case(case, actor),
        )?;

        case.proposal.extend(fields);
        case.touch(actor, now);
        Ok(())
    }

    pub fn submit_intip(
        &self,
        case: &mut Case,
        actor: &Actor,
        intip: Submission,
        now: TimeStamp<Utc>,
    ) -> Result<(), ValidationError> {
        if case.status.is_terminal() {
            return Err(ValidationError::CaseNotInProgress(case.status));
        }
        self.authority.authorize(
            actor.role,
            Action::SubmitIntipData,
            &ActionContext::for_case(case, actor),
        )?;

        case.intip = Some(intip);
        case.touch(actor, now);
        Ok(())
    }

    pub fn assign_branch(
        &self,
        case: &mut Case,
        actor: &Actor,
        branch: String,
        now: TimeStamp<Utc>,
    ) -> Result<(), ValidationError> {
        self.authority.authorize(
            actor.role,
            Action::AssignBranch,
            &ActionContext::for_case(case, actor),
        )?;

        case.assigned_branch = Some(branch);
        case.touch(actor, now);
        Ok(())
    }

    pub fn assign_specialist(
        &self,
        case: &mut Case,
        actor: &Actor,
        specialist_id: String,
        now: TimeStamp<Utc>,
    ) -> Result<(), ValidationError> {
        self.authority.authorize(
            actor.role,
            Action::AssignSpecialist,
            &ActionContext::for_case(case, actor),
        )?;

        case.assigned_specialist = Some(specialist_id);
        case.touch(actor, now);
        Ok(())
    }

    /// Move an undecided KPLT to the forum. Opens a fresh approval round.
    pub fn escalate_to_forum(
        &self,
        case: &mut Case,
        actor: &Actor,
        now: TimeStamp<Utc>,
    ) -> Result<CaseStatus, ApprovalError> {
        if case.status != CaseStatus::InProgress {
            return Err(ApprovalError::CaseNotInProgress(case.status));
        }
        self.authority.authorize(
            actor.role,
            Action::EscalateToForum,
            &ActionContext::for_case(case, actor),
        )?;

        case.status = CaseStatus::WaitingForForum;
        case.approval_round += 1;
        case.touch(actor, now);
        Ok(case.status)
    }

    /// Record `decision` for `actor` and move the case if the round resolves.
    ///
    /// ULOKs and forum rounds resolve on the first decision. Regular KPLT
    /// rounds defer to [`ApprovalLedger::resolve_round`].
    pub fn decide(
        &self,
        case: &mut Case,
        ledger: &mut ApprovalLedger,
        actor: &Actor,
        decision: Decision,
        now: TimeStamp<Utc>,
    ) -> Result<DecisionOutcome, ApprovalError> {
        if case.status.is_terminal() {
            return Err(ApprovalError::CaseNotInProgress(case.status));
        }

        let action = match (&case.kind, case.status) {
            (CaseKind::Ulok, _) => Action::ApproveProposal,
            (CaseKind::Kplt { .. }, CaseStatus::WaitingForForum) => Action::DecideForum,
            (CaseKind::Kplt { .. }, _) => Action::ApproveCase,
        };
        self.authority
            .authorize(actor.role, action, &ActionContext::for_case(case, actor))?;

        if action == Action::ApproveCase
            && !self.kplt_required.iter().any(|r| actor.role.covers(*r))
        {
            return Err(ApprovalError::Unauthorized(Denial::RoleNotPermitted {
                role: actor.role,
                action,
            }));
        }

        // a General Manager standing in for the Regional Manager uses up that slot
        let taken = match action {
            Action::ApproveCase => ledger.slot_taken_in(
                &case.id,
                case.approval_round,
                actor.role,
                &self.kplt_required,
            ),
            _ => ledger.has_decided_in(&case.id, case.approval_round, actor.role),
        };
        if taken {
            return Err(ApprovalError::AlreadyDecided(actor.role));
        }

        let entry = ledger.record(
            &case.id,
            case.approval_round,
            actor.clone(),
            decision,
            now.clone(),
        );
        case.decision_count += 1;

        let outcome = match action {
            Action::ApproveCase => {
                ledger.resolve_round(&case.id, case.approval_round, &self.kplt_required)
            }
            _ => match decision {
                Decision::Approve => Outcome::Ok,
                Decision::Reject => Outcome::Nok,
            },
        };

        let resolved = match outcome {
            Outcome::Ok => Some(CaseStatus::Ok),
            Outcome::Nok => Some(CaseStatus::Nok),
            Outcome::Pending => None,
        };
        if let Some(status) = resolved {
            case.status = status;
            case.approved_by = Some(actor.user_id.clone());
            case.approved_at = Some(now.clone());
        }
        case.touch(actor, now);

        Ok(DecisionOutcome {
            entry,
            status: case.status,
            resolved: resolved.is_some(),
        })
    }
}
