//! Walk one location from ULOK proposal to grand opening.
//!
//! Run with `RUST_LOG=site_opening=debug` to see store commits as well.

use site_opening::{
    authority::Role,
    config::WorkflowConfig,
    ledger::Decision,
    service::WorkflowOrchestrator,
    stage::StageName,
    telemetry,
    types::{Actor, DocumentSet, Fields, Submission},
};

fn docs(keys: &[&str]) -> DocumentSet {
    keys.iter().map(|k| k.to_string()).collect()
}

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => WorkflowConfig::load(path)?,
        None => WorkflowConfig::temporary(),
    };
    telemetry::init(&config.logging.filter)?;

    let service = WorkflowOrchestrator::open(&config)?;

    let specialist = Actor::new("user_ls", Role::LocationSpecialist);
    let manager = Actor::new("user_lm", Role::LocationManager);
    let admin = Actor::new("user_admin", Role::Admin);

    let proposal = Fields::from([
        ("alamat".to_string(), "Jl. Asia Afrika 21, Bandung".to_string()),
        ("luas_tanah".to_string(), "240".to_string()),
    ]);
    let ulok = service.create_proposal(&specialist, proposal)?;
    service.submit_intip(
        &ulok.id,
        &manager,
        Submission {
            fields: Fields::from([("omzet_harian".to_string(), "5200000".to_string())]),
            documents: docs(&["file_intip"]),
        },
    )?;
    service.approve_case(&ulok.id, &manager, Decision::Approve)?;

    let kplt = service.open_kplt(&ulok.id, &specialist, Fields::new())?;
    for approver in [
        Actor::new("user_bm", Role::BranchManager),
        Actor::new("user_rm", Role::RegionalManager),
    ] {
        service.approve_case(&kplt.id, &approver, Decision::Approve)?;
    }

    let plan: [(StageName, &Actor, &[&str]); 6] = [
        (StageName::Mou, &manager, &[]),
        (
            StageName::NeighborPermit,
            &manager,
            &["file_izin_tetangga", "file_bukti_pembayaran"],
        ),
        (
            StageName::Licensing,
            &manager,
            &[
                "file_sph",
                "file_bukti_st",
                "file_denah",
                "file_spk",
                "file_rekom_notaris",
            ],
        ),
        (StageName::Notarization, &manager, &["file_par", "file_akta"]),
        (StageName::Renovation, &manager, &["file_rab", "file_spk_renovasi"]),
        (StageName::GrandOpening, &admin, &[]),
    ];

    for (stage, actor, keys) in plan {
        service.submit_stage_data(&kplt.id, stage, actor, Fields::new(), docs(keys))?;
        let outcome = service.request_finalize(&kplt.id, stage, actor)?;
        println!(
            "{stage}: {} -> unlocked {:?}",
            outcome.status, outcome.newly_unlocked
        );
    }

    let view = service.get_case_view(&kplt.id)?;
    println!(
        "{} is {} with {} decisions on record",
        view.case_id,
        view.case_status,
        view.approval_history.len()
    );
    for stage in &view.stages {
        println!("  {:<15} {}", stage.name.label(), stage.status);
    }

    service.flush()?;
    Ok(())
}
