//! Role policy: the single place that decides who may do what to a case.
//!
//! Every screen and handler asks [`RoleAuthority`] instead of comparing position
//! labels itself. The table in [`RoleAuthority::permits`] is role-only; the
//! [`ActionContext`] adds the lifecycle conditions some rows carry.
use super::case::{Case, CaseKind, CaseStatus, ProposalSource};
use super::error::{AuthorityError, Denial};
use super::stage::StageName;
use super::types::Actor;
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    minicbor::Encode,
    minicbor::Decode,
    serde::Deserialize,
)]
#[serde(try_from = "String")]
pub enum Role {
    #[n(0)]
    LocationSpecialist,
    #[n(1)]
    LocationManager,
    #[n(2)]
    BranchManager,
    #[n(3)]
    RegionalManager,
    #[n(4)]
    GeneralManager,
    #[n(5)]
    Admin,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::LocationSpecialist,
        Role::LocationManager,
        Role::BranchManager,
        Role::RegionalManager,
        Role::GeneralManager,
        Role::Admin,
    ];

    /// Whether a decision by `self` fills the approval slot reserved for `required`.
    /// A General Manager stands in for a Regional Manager.
    pub fn covers(self, required: Role) -> bool {
        self == required || (self == Role::GeneralManager && required == Role::RegionalManager)
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::LocationSpecialist => "Location Specialist",
            Role::LocationManager => "Location Manager",
            Role::BranchManager => "Branch Manager",
            Role::RegionalManager => "Regional Manager",
            Role::GeneralManager => "General Manager",
            Role::Admin => "Admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Role {
    type Err = AuthorityError;

    // position labels arrive in whatever casing the HR system uses
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s
            .split(|c: char| c.is_whitespace() || c == '_' || c == '-')
            .filter(|part| !part.is_empty())
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");

        match normalised.as_str() {
            "location specialist" => Ok(Role::LocationSpecialist),
            "location manager" => Ok(Role::LocationManager),
            "branch manager" => Ok(Role::BranchManager),
            "regional manager" => Ok(Role::RegionalManager),
            "general manager" => Ok(Role::GeneralManager),
            "admin" | "admin branch" | "branch admin" => Ok(Role::Admin),
            _ => Err(AuthorityError::UnknownRole(s.to_string())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = AuthorityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SubmitProposal,
    EditProposal,
    SubmitIntipData,
    /// Single-approver decision on a ULOK.
    ApproveProposal,
    /// Multi-party decision on a KPLT.
    ApproveCase,
    EscalateToForum,
    DecideForum,
    AssignBranch,
    AssignSpecialist,
    SubmitStageData(StageName),
    FinalizeStage(StageName),
    EditResolvedStage(StageName),
}

/// Lifecycle facts about the case an action targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionContext {
    pub status: Option<CaseStatus>,
    pub is_ulok: bool,
    pub is_kplt: bool,
    pub intip_present: bool,
    pub under_approval: bool,
    pub owns_case: bool,
    pub external: bool,
    pub branch_assigned: bool,
    pub specialist_assigned: bool,
}

impl ActionContext {
    pub fn for_case(case: &Case, actor: &Actor) -> Self {
        Self {
            status: Some(case.status),
            is_ulok: matches!(case.kind, CaseKind::Ulok),
            is_kplt: matches!(case.kind, CaseKind::Kplt { .. }),
            intip_present: case.intip.is_some(),
            under_approval: case.intip.is_some() || case.decision_count > 0,
            owns_case: case.created_by.user_id == actor.user_id
                || case.assigned_specialist.as_deref() == Some(actor.user_id.as_str()),
            external: case.source == ProposalSource::External,
            branch_assigned: case.assigned_branch.is_some(),
            specialist_assigned: case.assigned_specialist.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoleAuthority;

impl RoleAuthority {
    pub fn new() -> Self {
        Self
    }

    /// The role-only policy table.
    pub fn permits(&self, role: Role, action: Action) -> bool {
        use Action::*;
        use Role::*;

        match (role, action) {
            (LocationSpecialist, SubmitProposal | EditProposal) => true,
            (LocationManager, SubmitIntipData | ApproveProposal) => true,
            (LocationManager, SubmitStageData(stage) | FinalizeStage(stage)) => {
                stage.is_branch_level()
            }
            (BranchManager, ApproveCase | EscalateToForum | AssignSpecialist) => true,
            (
                RegionalManager | GeneralManager,
                ApproveCase | EscalateToForum | AssignBranch | DecideForum,
            ) => true,
            (BranchManager | RegionalManager | GeneralManager, EditResolvedStage(_)) => true,
            (Admin, SubmitStageData(stage) | FinalizeStage(stage)) => {
                stage == StageName::GrandOpening
            }
            _ => false,
        }
    }

    /// Check the policy table and then the lifecycle conditions attached to the action.
    pub fn authorize(&self, role: Role, action: Action, ctx: &ActionContext) -> Result<(), Denial> {
        if !self.permits(role, action) {
            return Err(Denial::RoleNotPermitted { role, action });
        }

        let in_progress = ctx.status == Some(CaseStatus::InProgress);

        match action {
            Action::EditProposal => {
                if !in_progress || ctx.under_approval {
                    return Err(Denial::ProposalLocked);
                }
                if !ctx.owns_case {
                    return Err(Denial::NotOwner);
                }
            }
            Action::SubmitIntipData => {
                if !ctx.is_ulok {
                    return Err(Denial::WrongCaseKind);
                }
                if !in_progress {
                    return Err(Denial::WrongCaseStatus);
                }
                if ctx.external && !ctx.specialist_assigned {
                    return Err(Denial::SpecialistNotAssigned);
                }
            }
            Action::ApproveProposal => {
                if !ctx.is_ulok {
                    return Err(Denial::WrongCaseKind);
                }
                if ctx.external && !ctx.specialist_assigned {
                    return Err(Denial::SpecialistNotAssigned);
                }
                if !ctx.intip_present {
                    return Err(Denial::IntipDataMissing);
                }
            }
            Action::ApproveCase | Action::EscalateToForum => {
                if !ctx.is_kplt {
                    return Err(Denial::WrongCaseKind);
                }
                if !in_progress {
                    return Err(Denial::WrongCaseStatus);
                }
            }
            Action::DecideForum => {
                if !ctx.is_kplt {
                    return Err(Denial::WrongCaseKind);
                }
                if ctx.status != Some(CaseStatus::WaitingForForum) {
                    return Err(Denial::WrongCaseStatus);
                }
            }
            Action::AssignBranch | Action::AssignSpecialist => {
                if !ctx.external {
                    return Err(Denial::NotExternal);
                }
                if !in_progress {
                    return Err(Denial::WrongCaseStatus);
                }
                if action == Action::AssignSpecialist && !ctx.branch_assigned {
                    return Err(Denial::BranchNotAssigned);
                }
            }
            Action::SubmitProposal
            | Action::SubmitStageData(_)
            | Action::FinalizeStage(_)
            | Action::EditResolvedStage(_) => {}
        }

        Ok(())
    }

    pub fn can_act(&self, role: Role, action: Action, ctx: &ActionContext) -> bool {
        self.authorize(role, action, ctx).is_ok()
    }
}
