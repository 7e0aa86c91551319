//! Append-only approval ledger
//!
//! Entries are only ever appended and outcomes are derived by reading them
//! back. A new approval round starts with a higher round number; the
//! entries of earlier rounds stay as history.
use super::authority::Role;
use super::types::{Actor, TimeStamp};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Decision {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalEntry {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub round: u32,
    #[n(2)]
    pub actor: Actor,
    #[n(3)]
    pub decision: Decision,
    #[n(4)]
    pub decided_at: TimeStamp<Utc>,
    // position in the case's ledger, used for the storage key
    #[n(5)]
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Nok,
    Pending,
}

#[derive(Debug, Default, Clone)]
pub struct ApprovalLedger {
    entries: Vec<ApprovalEntry>,
}

impl ApprovalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(mut entries: Vec<ApprovalEntry>) -> Self {
        entries.sort_by_key(|e| (e.case_id.clone(), e.seq));
        Self { entries }
    }

    /// Append a decision and hand back the stored entry.
    pub fn record(
        &mut self,
        case_id: &str,
        round: u32,
        actor: Actor,
        decision: Decision,
        decided_at: TimeStamp<Utc>,
    ) -> ApprovalEntry {
        let seq = self.decisions_for(case_id).count() as u64;
        let entry = ApprovalEntry {
            case_id: case_id.to_string(),
            round,
            actor,
            decision,
            decided_at,
            seq,
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn decisions_for<'a>(
        &'a self,
        case_id: &'a str,
    ) -> impl Iterator<Item = &'a ApprovalEntry> + 'a {
        self.entries.iter().filter(move |e| e.case_id == case_id)
    }

    pub fn latest_round(&self, case_id: &str) -> Option<u32> {
        self.decisions_for(case_id).map(|e| e.round).max()
    }

    /// Whether `role` has a decision in the latest round of the case.
    pub fn has_decided(&self, case_id: &str, role: Role) -> bool {
        self.latest_round(case_id)
            .is_some_and(|round| self.has_decided_in(case_id, round, role))
    }

    pub fn has_decided_in(&self, case_id: &str, round: u32, role: Role) -> bool {
        self.decisions_for(case_id)
            .any(|e| e.round == round && e.actor.role == role)
    }

    /// Whether every required slot `role` could fill already holds a decision
    /// in `round`, from `role` itself or from a role standing in for it.
    pub fn slot_taken_in(&self, case_id: &str, round: u32, role: Role, required: &[Role]) -> bool {
        let mut slots = required
            .iter()
            .filter(|slot| role.covers(**slot))
            .peekable();
        if slots.peek().is_none() {
            return self.has_decided_in(case_id, round, role);
        }
        slots.all(|slot| {
            self.decisions_for(case_id)
                .any(|e| e.round == round && e.actor.role.covers(*slot))
        })
    }

    /// Outcome of the latest round.
    pub fn resolve(&self, case_id: &str, required: &[Role]) -> Outcome {
        match self.latest_round(case_id) {
            Some(round) => self.resolve_round(case_id, round, required),
            None => Outcome::Pending,
        }
    }

    /// A single rejection by any required role ends the round as `Nok`, however
    /// many approvals it already holds. `Ok` needs every required role covered
    /// by an approval.
    pub fn resolve_round(&self, case_id: &str, round: u32, required: &[Role]) -> Outcome {
        let round_entries = || {
            self.decisions_for(case_id)
                .filter(move |e| e.round == round)
        };

        let rejected = round_entries().any(|e| {
            e.decision == Decision::Reject && required.iter().any(|r| e.actor.role.covers(*r))
        });
        if rejected {
            return Outcome::Nok;
        }

        let approved_all = !required.is_empty()
            && required.iter().all(|r| {
                round_entries().any(|e| e.decision == Decision::Approve && e.actor.role.covers(*r))
            });

        if approved_all {
            Outcome::Ok
        } else {
            Outcome::Pending
        }
    }

    pub fn entries(&self) -> &[ApprovalEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KPLT: [Role; 2] = [Role::BranchManager, Role::RegionalManager];

    fn actor(role: Role) -> Actor {
        Actor::new(format!("user_{role:?}"), role)
    }

    fn approve(
        ledger: &mut ApprovalLedger,
        case_id: &str,
        round: u32,
        role: Role,
    ) -> ApprovalEntry {
        let now = TimeStamp::new();
        ledger.record(case_id, round, actor(role), Decision::Approve, now)
    }

    fn reject(
        ledger: &mut ApprovalLedger,
        case_id: &str,
        round: u32,
        role: Role,
    ) -> ApprovalEntry {
        let now = TimeStamp::new();
        ledger.record(case_id, round, actor(role), Decision::Reject, now)
    }

    #[test]
    fn both_required_roles_must_approve() {
        let mut ledger = ApprovalLedger::new();
        approve(&mut ledger, "kplt_a", 0, Role::BranchManager);
        assert_eq!(ledger.resolve("kplt_a", &KPLT), Outcome::Pending);

        approve(&mut ledger, "kplt_a", 0, Role::RegionalManager);
        assert_eq!(ledger.resolve("kplt_a", &KPLT), Outcome::Ok);
    }

    #[test]
    fn rejection_short_circuits() {
        let mut ledger = ApprovalLedger::new();
        reject(&mut ledger, "kplt_a", 0, Role::BranchManager);
        assert_eq!(ledger.resolve("kplt_a", &KPLT), Outcome::Nok);

        approve(&mut ledger, "kplt_a", 0, Role::RegionalManager);
        assert_eq!(ledger.resolve("kplt_a", &KPLT), Outcome::Nok);
    }

    #[test]
    fn general_manager_fills_regional_slot() {
        let mut ledger = ApprovalLedger::new();
        approve(&mut ledger, "kplt_a", 0, Role::BranchManager);
        approve(&mut ledger, "kplt_a", 0, Role::GeneralManager);
        assert_eq!(ledger.resolve("kplt_a", &KPLT), Outcome::Ok);
    }

    #[test]
    fn decisions_are_scoped_per_case_and_round() {
        let mut ledger = ApprovalLedger::new();
        approve(&mut ledger, "kplt_a", 0, Role::BranchManager);
        reject(&mut ledger, "kplt_b", 0, Role::BranchManager);

        assert!(ledger.has_decided("kplt_a", Role::BranchManager));
        assert!(!ledger.has_decided("kplt_a", Role::RegionalManager));
        assert_eq!(ledger.resolve("kplt_a", &KPLT), Outcome::Pending);
        assert_eq!(ledger.decisions_for("kplt_a").count(), 1);

        // a later round starts clean
        approve(&mut ledger, "kplt_a", 1, Role::RegionalManager);
        assert!(!ledger.has_decided("kplt_a", Role::BranchManager));
        assert!(ledger.has_decided_in("kplt_a", 0, Role::BranchManager));
    }

    #[test]
    fn stand_in_and_regular_holder_share_one_slot() {
        let mut ledger = ApprovalLedger::new();
        approve(&mut ledger, "kplt_a", 0, Role::GeneralManager);

        assert!(ledger.slot_taken_in("kplt_a", 0, Role::RegionalManager, &KPLT));
        assert!(ledger.slot_taken_in("kplt_a", 0, Role::GeneralManager, &KPLT));
        assert!(!ledger.slot_taken_in("kplt_a", 0, Role::BranchManager, &KPLT));

        let mut ledger = ApprovalLedger::new();
        approve(&mut ledger, "kplt_b", 0, Role::RegionalManager);
        assert!(ledger.slot_taken_in("kplt_b", 0, Role::GeneralManager, &KPLT));
        // a new round frees the slot
        assert!(!ledger.slot_taken_in("kplt_b", 1, Role::GeneralManager, &KPLT));
    }

    #[test]
    fn empty_requirement_never_resolves_ok() {
        let mut ledger = ApprovalLedger::new();
        approve(&mut ledger, "kplt_a", 0, Role::BranchManager);
        assert_eq!(ledger.resolve("kplt_a", &[]), Outcome::Pending);
    }

    #[test]
    fn entry_encoding() {
        let mut ledger = ApprovalLedger::new();
        let entry = reject(&mut ledger, "kplt_a", 2, Role::BranchManager);

        let encoded = minicbor::to_vec(&entry).unwrap();
        let decoded: ApprovalEntry = minicbor::decode(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }
}
