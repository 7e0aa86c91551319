//! Read models for the case timeline
use super::authority::Role;
use super::case::{Case, CaseKind, CaseStatus};
use super::ledger::{ApprovalEntry, ApprovalLedger};
use super::stage::{StageBoard, StageName, StageProgressStateMachine, StageStatus};
use super::types::DocumentKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageView {
    pub name: StageName,
    pub status: StageStatus,
    pub unlockable: bool,
    pub missing_docs: Vec<DocumentKey>,
    /// Stages that must resolve before this one opens.
    pub unlocked_by: Vec<StageName>,
    /// The subset of `unlocked_by` still outstanding.
    pub blocked_by: Vec<StageName>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseView {
    pub case_id: String,
    pub kind: CaseKind,
    pub case_status: CaseStatus,
    pub current_stage: Option<StageName>,
    /// Empty until the case is an approved KPLT.
    pub stages: Vec<StageView>,
    pub approval_history: Vec<ApprovalEntry>,
    /// Required roles with no decision yet in the open KPLT round.
    pub awaiting: Vec<Role>,
    pub version: u64,
}

impl CaseView {
    pub fn build(
        case: &Case,
        ledger: &ApprovalLedger,
        board: &StageBoard,
        machine: &StageProgressStateMachine,
        required: &[Role],
    ) -> Self {
        let pipeline_open = case.is_kplt() && case.status == CaseStatus::Ok;

        let stages = if pipeline_open {
            StageName::ALL
                .into_iter()
                .map(|name| {
                    let record = board.record(name);
                    StageView {
                        name,
                        status: record.status,
                        unlockable: machine.is_unlockable(board, name),
                        missing_docs: machine
                            .missing_documents(board, name)
                            .into_iter()
                            .collect(),
                        unlocked_by: name.predecessors().to_vec(),
                        blocked_by: machine.unmet_predecessors(board, name),
                        version: record.version,
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let awaiting = if case.is_kplt() && case.status == CaseStatus::InProgress {
            required
                .iter()
                .copied()
                .filter(|slot| {
                    !ledger
                        .decisions_for(&case.id)
                        .any(|e| e.round == case.approval_round && e.actor.role.covers(*slot))
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            case_id: case.id.clone(),
            kind: case.kind.clone(),
            case_status: case.status,
            current_stage: if pipeline_open {
                machine.current_stage(board)
            } else {
                None
            },
            stages,
            approval_history: ledger.decisions_for(&case.id).cloned().collect(),
            awaiting,
            version: case.version,
        }
    }

    pub fn stage(&self, name: StageName) -> Option<&StageView> {
        self.stages.iter().find(|s| s.name == name)
    }
}
