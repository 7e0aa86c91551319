//! Required evidentiary documents per stage
use super::stage::StageName;
use super::types::{DocumentKey, DocumentSet};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequirementChecker {
    required: BTreeMap<StageName, DocumentSet>,
}

impl FileRequirementChecker {
    pub fn new(required: BTreeMap<StageName, DocumentSet>) -> Self {
        Self { required }
    }

    /// Default table with per-stage overrides applied on top.
    pub fn with_overrides(overrides: &BTreeMap<StageName, Vec<DocumentKey>>) -> Self {
        let mut checker = Self::default();
        for (stage, keys) in overrides {
            checker
                .required
                .insert(*stage, keys.iter().cloned().collect());
        }
        checker
    }

    pub fn required_documents(&self, stage: StageName) -> DocumentSet {
        self.required.get(&stage).cloned().unwrap_or_default()
    }

    /// `required \ uploaded`. Empty means the stage is eligible on document grounds.
    pub fn missing_documents(&self, stage: StageName, uploaded: &DocumentSet) -> DocumentSet {
        match self.required.get(&stage) {
            Some(required) => required.difference(uploaded).cloned().collect(),
            None => DocumentSet::new(),
        }
    }
}

impl Default for FileRequirementChecker {
    fn default() -> Self {
        let table: [(StageName, &[&str]); 6] = [
            (StageName::Mou, &[]),
            (
                StageName::NeighborPermit,
                &["file_izin_tetangga", "file_bukti_pembayaran"],
            ),
            (
                StageName::Licensing,
                &[
                    "file_sph",
                    "file_bukti_st",
                    "file_denah",
                    "file_spk",
                    "file_rekom_notaris",
                ],
            ),
            (StageName::Notarization, &["file_par", "file_akta"]),
            (StageName::Renovation, &["file_rab", "file_spk_renovasi"]),
            (StageName::GrandOpening, &[]),
        ];

        let required = table
            .into_iter()
            .map(|(stage, keys)| (stage, keys.iter().map(|k| k.to_string()).collect()))
            .collect();

        Self { required }
    }
}
