//! Smoke Screen Unit tests for the site opening workflow components
//!
//! These tests span the public API of each module in isolation from the
//! storage-backed scenarios. They mostly cover the happy path.
//!

use chrono::{Datelike, Timelike, Utc};
use site_opening::{
    authority::{Role, RoleAuthority},
    case::{CaseApprovalStateMachine, CaseKind, CaseStatus},
    ledger::{ApprovalLedger, Decision},
    stage::{StageName, StageStatus},
    types::{Actor, Fields, TimeStamp},
    utils::{new_case_id, new_uuid_to_bech32},
};

// UTILS MODULE TESTS
mod utils_tests {
    use super::*;

    /// Test that new_uuid_to_bech32 generates valid bech32-encoded strings
    /// with the correct human-readable prefix
    #[test]
    fn generates_valid_bech32_with_hrp() {
        let encoded = new_uuid_to_bech32("user").unwrap();
        assert!(encoded.starts_with("user1"));
        assert!(encoded.len() > 10);
    }

    #[test]
    fn handles_empty_hrp() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    #[test]
    fn generates_unique_ids() {
        let a = new_case_id(&CaseKind::Ulok).unwrap();
        let b = new_case_id(&CaseKind::Ulok).unwrap();
        assert_ne!(a, b);
    }
}

// TYPES MODULE TESTS
mod types_tests {
    use super::*;

    #[test]
    fn timestamp_new_creates_current_time() {
        let before = Utc::now();
        let ts = TimeStamp::new().to_datetime_utc();
        assert!(ts >= before);
        assert!(ts <= Utc::now());
    }

    #[test]
    fn timestamp_new_with_creates_specific_time() {
        let ts = TimeStamp::new_with(2024, 8, 17, 9, 30, 0)
            .unwrap()
            .to_datetime_utc();
        assert_eq!(ts.year(), 2024);
        assert_eq!(ts.month(), 8);
        assert_eq!(ts.day(), 17);
        assert_eq!(ts.hour(), 9);
        assert_eq!(ts.minute(), 30);
    }

    #[test]
    fn actor_cbor_roundtrip() {
        let actor = Actor::new("user_bm", Role::BranchManager);
        let encoded = minicbor::to_vec(&actor).unwrap();
        let decoded: Actor = minicbor::decode(&encoded).unwrap();
        assert_eq!(actor, decoded);
    }

    #[test]
    fn actor_from_position_label() {
        let actor = Actor::from_label("user_rm", "REGIONAL MANAGER").unwrap();
        assert_eq!(actor.role, Role::RegionalManager);
        assert!(Actor::from_label("user_x", "Intern").is_err());
    }
}

// STAGE MODULE TESTS
mod stage_tests {
    use super::*;

    #[test]
    fn stage_names_parse_from_slug_and_label() {
        assert_eq!(
            "perizinan".parse::<StageName>().unwrap(),
            StageName::Licensing
        );
        assert_eq!(
            "Neighbor Permit".parse::<StageName>().unwrap(),
            StageName::NeighborPermit
        );
        assert_eq!(
            "grand-opening".parse::<StageName>().unwrap(),
            StageName::GrandOpening
        );
        assert!("demolition".parse::<StageName>().is_err());
    }

    #[test]
    fn dag_fans_out_after_mou_and_joins_at_notarization() {
        assert_eq!(
            StageName::Mou.successors(),
            vec![StageName::NeighborPermit, StageName::Licensing]
        );
        assert_eq!(
            StageName::Notarization.predecessors(),
            &[StageName::NeighborPermit, StageName::Licensing]
        );
        assert!(StageName::GrandOpening.successors().is_empty());
    }

    #[test]
    fn status_labels_match_the_timeline() {
        assert_eq!(StageStatus::Done.to_string(), "Selesai");
        assert_eq!(StageStatus::Cancelled.to_string(), "Batal");
        assert!(StageStatus::Cancelled.is_resolved());
        assert!(!StageStatus::InProgress.is_resolved());
    }
}

// CASE MODULE TESTS
mod case_tests {
    use super::*;

    #[test]
    fn ulok_is_decided_by_one_location_manager() {
        let machine = CaseApprovalStateMachine::new(
            RoleAuthority::new(),
            vec![Role::BranchManager, Role::RegionalManager],
        );
        let specialist = Actor::new("user_ls", Role::LocationSpecialist);
        let manager = Actor::new("user_lm", Role::LocationManager);

        let mut ulok = machine
            .propose(
                "ulok_smoke".to_string(),
                &specialist,
                Fields::new(),
                TimeStamp::new(),
            )
            .unwrap();
        machine
            .submit_intip(&mut ulok, &manager, Default::default(), TimeStamp::new())
            .unwrap();

        let mut ledger = ApprovalLedger::new();
        let outcome = machine
            .decide(
                &mut ulok,
                &mut ledger,
                &manager,
                Decision::Approve,
                TimeStamp::new(),
            )
            .unwrap();

        assert!(outcome.resolved);
        assert_eq!(ulok.status, CaseStatus::Ok);
        assert_eq!(ulok.approved_by.as_deref(), Some("user_lm"));
        assert_eq!(CaseStatus::WaitingForForum.to_string(), "Waiting for Forum");
    }
}
