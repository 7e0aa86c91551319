//! The six-stage construction pipeline of a KPLT
//!
//! Stages form a small DAG rather than a list: Notarization waits on both
//! Neighbor Permit and Licensing, which open together once MOU is resolved.
//! [`StageBoard`] holds one [`StageRecord`] per stage of a case and
//! [`StageProgressStateMachine`] evaluates every guard against it in memory.
//! Persisting the result is the store's job.
use super::authority::{Action, ActionContext, RoleAuthority};
use super::documents::FileRequirementChecker;
use super::error::{AuthorityError, FinalizeError, StoreError, ValidationError};
use super::types::{Actor, DocumentKey, DocumentSet, Fields, Submission, TimeStamp};
use chrono::Utc;
use std::collections::BTreeMap;
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
pub enum StageName {
    #[n(0)]
    Mou,
    #[n(1)]
    NeighborPermit,
    #[n(2)]
    Licensing,
    #[n(3)]
    Notarization,
    #[n(4)]
    Renovation,
    #[n(5)]
    GrandOpening,
}

impl StageName {
    /// Pipeline order. Also the `Ord` order.
    pub const ALL: [StageName; 6] = [
        StageName::Mou,
        StageName::NeighborPermit,
        StageName::Licensing,
        StageName::Notarization,
        StageName::Renovation,
        StageName::GrandOpening,
    ];

    pub fn predecessors(self) -> &'static [StageName] {
        match self {
            StageName::Mou => &[],
            StageName::NeighborPermit | StageName::Licensing => &[StageName::Mou],
            StageName::Notarization => &[StageName::NeighborPermit, StageName::Licensing],
            StageName::Renovation => &[StageName::Notarization],
            StageName::GrandOpening => &[StageName::Renovation],
        }
    }

    pub fn successors(self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|s| s.predecessors().contains(&self))
            .collect()
    }

    /// Stages run by the branch location team; Grand Opening belongs to the branch admin.
    pub fn is_branch_level(self) -> bool {
        self != StageName::GrandOpening
    }

    pub fn slug(self) -> &'static str {
        match self {
            StageName::Mou => "mou",
            StageName::NeighborPermit => "izin_tetangga",
            StageName::Licensing => "perizinan",
            StageName::Notarization => "notaris",
            StageName::Renovation => "renovasi",
            StageName::GrandOpening => "grand_opening",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StageName::Mou => "MOU",
            StageName::NeighborPermit => "Neighbor Permit",
            StageName::Licensing => "Licensing",
            StageName::Notarization => "Notarization",
            StageName::Renovation => "Renovation",
            StageName::GrandOpening => "Grand Opening",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for StageName {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase().replace([' ', '-'], "_");
        StageName::ALL
            .into_iter()
            .find(|stage| {
                stage.slug() == key || stage.label().to_lowercase().replace(' ', "_") == key
            })
            .ok_or_else(|| AuthorityError::UnknownStage(s.to_string()))
    }
}

impl TryFrom<String> for StageName {
    type Error = AuthorityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum StageStatus {
    #[n(0)]
    NotStarted,
    /// `Belum`
    #[n(1)]
    InProgress,
    /// `Selesai`
    #[n(2)]
    Done,
    /// `Batal`
    #[n(3)]
    Cancelled,
}

impl StageStatus {
    pub fn is_resolved(self) -> bool {
        matches!(self, StageStatus::Done | StageStatus::Cancelled)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageStatus::NotStarted => "Not Started",
            StageStatus::InProgress => "Belum",
            StageStatus::Done => "Selesai",
            StageStatus::Cancelled => "Batal",
        })
    }
}

/// Which predecessor statuses unlock a successor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Done or Cancelled both unlock.
    #[default]
    Resolved,
    DoneOnly,
}

impl DependencyPolicy {
    pub fn satisfied_by(self, status: StageStatus) -> bool {
        match self {
            DependencyPolicy::Resolved => status.is_resolved(),
            DependencyPolicy::DoneOnly => status == StageStatus::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Complete,
    Cancel,
}

impl Resolution {
    fn status(self) -> StageStatus {
        match self {
            Resolution::Complete => StageStatus::Done,
            Resolution::Cancel => StageStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StageRecord {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub stage: StageName,
    #[n(2)]
    pub status: StageStatus,
    #[n(3)]
    pub fields: Fields,
    #[n(4)]
    pub documents: DocumentSet,
    #[n(5)]
    pub created_at: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub finalized_at: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub updated_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub updated_by: Option<String>,
    #[n(9)]
    pub snapshot_count: u64,
    #[n(10)]
    pub last_digest: Option<String>,
    // 0 means never stored
    #[n(11)]
    pub version: u64,
}

impl StageRecord {
    pub fn not_started(case_id: &str, stage: StageName) -> Self {
        Self {
            case_id: case_id.to_string(),
            stage,
            status: StageStatus::NotStarted,
            fields: Fields::new(),
            documents: DocumentSet::new(),
            created_at: None,
            finalized_at: None,
            updated_at: None,
            updated_by: None,
            snapshot_count: 0,
            last_digest: None,
            version: 0,
        }
    }

    fn touch(&mut self, actor: &Actor, now: &TimeStamp<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(now.clone());
        }
        self.updated_at = Some(now.clone());
        self.updated_by = Some(actor.user_id.clone());
    }

    /// Append a history snapshot of the record as it is now.
    fn snapshot(
        &mut self,
        actor: &Actor,
        now: &TimeStamp<Utc>,
    ) -> Result<StageSnapshot, StoreError> {
        let digest = content_digest(self.status, &self.fields, &self.documents)?;
        let snapshot = StageSnapshot {
            case_id: self.case_id.clone(),
            stage: self.stage,
            seq: self.snapshot_count,
            taken_at: now.clone(),
            actor: actor.clone(),
            status: self.status,
            fields: self.fields.clone(),
            documents: self.documents.clone(),
            digest: digest.clone(),
        };
        self.snapshot_count += 1;
        self.last_digest = Some(digest);
        Ok(snapshot)
    }
}

/// Immutable copy of a stage record taken at finalization and at each later edit.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StageSnapshot {
    #[n(0)]
    pub case_id: String,
    #[n(1)]
    pub stage: StageName,
    #[n(2)]
    pub seq: u64,
    #[n(3)]
    pub taken_at: TimeStamp<Utc>,
    #[n(4)]
    pub actor: Actor,
    #[n(5)]
    pub status: StageStatus,
    #[n(6)]
    pub fields: Fields,
    #[n(7)]
    pub documents: DocumentSet,
    #[n(8)]
    pub digest: String,
}

#[derive(minicbor::Encode)]
struct SnapshotContent<'a> {
    #[n(0)]
    status: StageStatus,
    #[n(1)]
    fields: &'a Fields,
    #[n(2)]
    documents: &'a DocumentSet,
}

fn content_digest(
    status: StageStatus,
    fields: &Fields,
    documents: &DocumentSet,
) -> Result<String, StoreError> {
    let content = SnapshotContent {
        status,
        fields,
        documents,
    };
    let cbor = minicbor::to_vec(&content)
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    Ok(sha256::digest(&cbor))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub key: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// What changed between two consecutive snapshots of a stage. Audit display only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub from_seq: u64,
    pub to_seq: u64,
    pub status_change: Option<(StageStatus, StageStatus)>,
    pub changed_fields: Vec<FieldChange>,
    pub added_documents: DocumentSet,
    pub removed_documents: DocumentSet,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.status_change.is_none()
            && self.changed_fields.is_empty()
            && self.added_documents.is_empty()
            && self.removed_documents.is_empty()
    }
}

pub fn diff(prev: &StageSnapshot, next: &StageSnapshot) -> SnapshotDiff {
    let mut changed_fields = Vec::new();
    let keys: std::collections::BTreeSet<&String> =
        prev.fields.keys().chain(next.fields.keys()).collect();
    for key in keys {
        let before = prev.fields.get(key);
        let after = next.fields.get(key);
        if before != after {
            changed_fields.push(FieldChange {
                key: key.clone(),
                before: before.cloned(),
                after: after.cloned(),
            });
        }
    }

    SnapshotDiff {
        from_seq: prev.seq,
        to_seq: next.seq,
        status_change: (prev.status != next.status).then_some((prev.status, next.status)),
        changed_fields,
        added_documents: &next.documents - &prev.documents,
        removed_documents: &prev.documents - &next.documents,
    }
}

/// Diffs of each snapshot against the one immediately before it.
pub fn history_diffs(history: &[StageSnapshot]) -> Vec<SnapshotDiff> {
    history.windows(2).map(|w| diff(&w[0], &w[1])).collect()
}

/// Every stage record of one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageBoard {
    case_id: String,
    records: BTreeMap<StageName, StageRecord>,
}

impl StageBoard {
    pub fn new(case_id: &str) -> Self {
        Self::from_records(case_id, Vec::new())
    }

    /// Stages without a stored record are filled in as `NotStarted`.
    pub fn from_records(case_id: &str, stored: Vec<StageRecord>) -> Self {
        let mut records: BTreeMap<StageName, StageRecord> = StageName::ALL
            .into_iter()
            .map(|stage| (stage, StageRecord::not_started(case_id, stage)))
            .collect();
        for record in stored {
            records.insert(record.stage, record);
        }

        Self {
            case_id: case_id.to_string(),
            records,
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    pub fn record(&self, stage: StageName) -> &StageRecord {
        // from_records seeds every stage
        &self.records[&stage]
    }

    fn record_mut(&mut self, stage: StageName) -> &mut StageRecord {
        self.records
            .entry(stage)
            .or_insert_with(|| StageRecord::not_started(&self.case_id, stage))
    }

    pub fn records(&self) -> impl Iterator<Item = &StageRecord> {
        self.records.values()
    }

    pub fn status(&self, stage: StageName) -> StageStatus {
        self.record(stage).status
    }
}

/// A finalize-style command. `expected_version` makes the command fail on a
/// stale read instead of acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeRequest {
    pub stage: StageName,
    pub resolution: Resolution,
    pub expected_version: Option<u64>,
}

impl FinalizeRequest {
    pub fn complete(stage: StageName) -> Self {
        Self {
            stage,
            resolution: Resolution::Complete,
            expected_version: None,
        }
    }

    pub fn cancel(stage: StageName) -> Self {
        Self {
            stage,
            resolution: Resolution::Cancel,
            expected_version: None,
        }
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub stage: StageName,
    pub status: StageStatus,
    pub newly_unlocked: Vec<StageName>,
    pub record: StageRecord,
    pub snapshot: Option<StageSnapshot>,
    /// The stage was already resolved; nothing was written.
    pub already_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageChange {
    pub record: StageRecord,
    pub snapshot: Option<StageSnapshot>,
}

#[derive(Debug, Clone)]
pub struct StageProgressStateMachine {
    authority: RoleAuthority,
    documents: FileRequirementChecker,
    policy: DependencyPolicy,
}

impl StageProgressStateMachine {
    pub fn new(
        authority: RoleAuthority,
        documents: FileRequirementChecker,
        policy: DependencyPolicy,
    ) -> Self {
        Self {
            authority,
            documents,
            policy,
        }
    }

    pub fn documents(&self) -> &FileRequirementChecker {
        &self.documents
    }

    pub fn policy(&self) -> DependencyPolicy {
        self.policy
    }

    pub fn unmet_predecessors(&self, board: &StageBoard, stage: StageName) -> Vec<StageName> {
        stage
            .predecessors()
            .iter()
            .copied()
            .filter(|p| !self.policy.satisfied_by(board.status(*p)))
            .collect()
    }

    pub fn is_unlockable(&self, board: &StageBoard, stage: StageName) -> bool {
        self.unmet_predecessors(board, stage).is_empty()
    }

    /// Unlocked stages that are not yet resolved. After MOU this holds both
    /// Neighbor Permit and Licensing.
    pub fn open_stages(&self, board: &StageBoard) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|s| self.is_unlockable(board, *s) && !board.status(*s).is_resolved())
            .collect()
    }

    /// The earliest open stage, surfaced as "current" on the timeline.
    pub fn current_stage(&self, board: &StageBoard) -> Option<StageName> {
        self.open_stages(board).into_iter().next()
    }

    pub fn missing_documents(&self, board: &StageBoard, stage: StageName) -> DocumentSet {
        self.documents
            .missing_documents(stage, &board.record(stage).documents)
    }

    /// Save a partial submission. Opening a stage for the first time creates its
    /// record; writes to a resolved stage need elevated authority and are journaled.
    pub fn submit(
        &self,
        board: &mut StageBoard,
        stage: StageName,
        actor: &Actor,
        submission: Submission,
        now: TimeStamp<Utc>,
    ) -> Result<StageChange, ValidationError> {
        let unmet = self.unmet_predecessors(board, stage);
        if !unmet.is_empty() {
            return Err(ValidationError::StageLocked(unmet));
        }

        let resolved = board.status(stage).is_resolved();
        let action = if resolved {
            Action::EditResolvedStage(stage)
        } else {
            Action::SubmitStageData(stage)
        };
        self.authority
            .authorize(actor.role, action, &ActionContext::default())?;

        let record = board.record_mut(stage);
        let mut fields = record.fields.clone();
        fields.extend(submission.fields);
        let mut documents = record.documents.clone();
        documents.extend(submission.documents);

        if resolved {
            let digest = content_digest(record.status, &fields, &documents)?;
            if record.last_digest.as_deref() == Some(digest.as_str()) {
                return Ok(StageChange {
                    record: record.clone(),
                    snapshot: None,
                });
            }
        }

        record.fields = fields;
        record.documents = documents;
        if record.status == StageStatus::NotStarted {
            record.status = StageStatus::InProgress;
        }
        record.touch(actor, &now);

        let snapshot = if resolved {
            Some(record.snapshot(actor, &now)?)
        } else {
            None
        };

        Ok(StageChange {
            record: record.clone(),
            snapshot,
        })
    }

    /// Drive a stage to `Done` or `Cancelled`.
    ///
    /// Guards run in order: predecessors, authority, already-resolved (a
    /// deterministic no-op), version, then documents for completion.
    pub fn request_finalize(
        &self,
        board: &mut StageBoard,
        request: FinalizeRequest,
        actor: &Actor,
        now: TimeStamp<Utc>,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        let stage = request.stage;

        let unmet = self.unmet_predecessors(board, stage);
        if !unmet.is_empty() {
            return Err(FinalizeError::PredecessorIncomplete(unmet));
        }

        let action = Action::FinalizeStage(stage);
        if !self
            .authority
            .can_act(actor.role, action, &ActionContext::default())
        {
            return Err(FinalizeError::Unauthorized {
                role: actor.role,
                stage,
            });
        }

        let current = board.record(stage);
        if current.status.is_resolved() {
            return Ok(FinalizeOutcome {
                stage,
                status: current.status,
                newly_unlocked: Vec::new(),
                record: current.clone(),
                snapshot: None,
                already_resolved: true,
            });
        }

        if let Some(expected) = request.expected_version {
            if expected != current.version {
                return Err(FinalizeError::ConcurrentModification);
            }
        }

        if request.resolution == Resolution::Complete {
            let missing = self.missing_documents(board, stage);
            if !missing.is_empty() {
                return Err(FinalizeError::MissingDocuments(
                    missing.into_iter().collect::<Vec<DocumentKey>>(),
                ));
            }
        }

        let before = self.open_stages(board);

        let record = board.record_mut(stage);
        record.status = request.resolution.status();
        record.finalized_at = Some(now.clone());
        record.touch(actor, &now);
        let snapshot = record.snapshot(actor, &now)?;
        let record = record.clone();

        let newly_unlocked = self
            .open_stages(board)
            .into_iter()
            .filter(|s| !before.contains(s))
            .collect();

        Ok(FinalizeOutcome {
            stage,
            status: record.status,
            newly_unlocked,
            record,
            snapshot: Some(snapshot),
            already_resolved: false,
        })
    }
}
