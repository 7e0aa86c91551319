//! sled-backed persistence for cases, stage records, approval entries and history
//!
//! Writes go through [`WorkflowStore::commit`], a single multi-tree
//! transaction. Every record carries the version it was read at; the
//! transaction re-reads each one and aborts with [`StoreError::Conflict`] if
//! another writer got there first. Ledger entries and snapshots are
//! insert-only.
use super::case::Case;
use super::error::StoreError;
use super::ledger::{ApprovalEntry, ApprovalLedger};
use super::stage::{StageBoard, StageName, StageRecord, StageSnapshot};
use sled::Tree;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, Transactional, TransactionalTree,
};
use std::sync::Arc;

const CASES: &str = "cases";
const STAGES: &str = "stages";
const APPROVALS: &str = "approvals";
const HISTORY: &str = "history";

trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for Case {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for StageRecord {
    fn version(&self) -> u64 {
        self.version
    }
}

pub fn stage_key(case_id: &str, stage: StageName) -> String {
    format!("{case_id}/{}", stage.slug())
}

// big-endian hex keeps sled's lexicographic order equal to numeric order
fn seq_key(prefix: &str, seq: u64) -> String {
    format!("{prefix}/{}", hex::encode(seq.to_be_bytes()))
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, StoreError> {
    minicbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

/// The writes of one command plus the reads its guards depended on.
///
/// Records are borrowed mutably so a successful commit can leave them at
/// their stored version.
#[derive(Debug, Default)]
pub struct Commit<'a> {
    cases: Vec<&'a mut Case>,
    stages: Vec<&'a mut StageRecord>,
    entries: Vec<&'a ApprovalEntry>,
    snapshots: Vec<&'a StageSnapshot>,
    guards: Vec<(String, u64)>,
}

impl<'a> Commit<'a> {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn case(mut self, case: &'a mut Case) -> Self {
        self.cases.push(case);
        self
    }
    pub fn stage(mut self, record: &'a mut StageRecord) -> Self {
        self.stages.push(record);
        self
    }
    pub fn entry(mut self, entry: &'a ApprovalEntry) -> Self {
        self.entries.push(entry);
        self
    }
    pub fn snapshot(mut self, snapshot: Option<&'a StageSnapshot>) -> Self {
        self.snapshots.extend(snapshot);
        self
    }
    /// Require every stage record of `board` to be unchanged at commit time.
    pub fn guard_board(mut self, board: &StageBoard) -> Self {
        for record in board.records() {
            self.guards
                .push((stage_key(board.case_id(), record.stage), record.version));
        }
        self
    }
    /// Require the case to be unchanged at commit time without rewriting it.
    pub fn guard_case(mut self, case: &Case) -> Self {
        self.guards.push((case.id.clone(), case.version));
        self
    }
}

struct Prepared {
    key: String,
    expected: u64,
    bytes: Vec<u8>,
}

fn decode_all<T>(iter: sled::Iter) -> Result<Vec<T>, StoreError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    let mut out = Vec::new();
    for item in iter {
        let (_, bytes) = item?;
        out.push(minicbor::decode(&bytes)?);
    }
    Ok(out)
}

fn abort<T>(err: StoreError) -> ConflictableTransactionResult<T, StoreError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn check_version<T>(
    tree: &TransactionalTree,
    key: &str,
    expected: u64,
) -> ConflictableTransactionResult<(), StoreError>
where
    T: Versioned + for<'b> minicbor::Decode<'b, ()>,
{
    let stored = match tree.get(key.as_bytes())? {
        Some(bytes) => match minicbor::decode::<T>(&bytes) {
            Ok(record) => record.version(),
            Err(e) => return abort(StoreError::Decode(e)),
        },
        None => 0,
    };

    if stored != expected {
        return abort(StoreError::Conflict(key.to_string()));
    }
    Ok(())
}

fn insert_new(
    tree: &TransactionalTree,
    key: &str,
    bytes: &[u8],
) -> ConflictableTransactionResult<(), StoreError> {
    if tree.get(key.as_bytes())?.is_some() {
        return abort(StoreError::Conflict(key.to_string()));
    }
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

#[derive(Clone)]
pub struct WorkflowStore {
    db: Arc<sled::Db>,
    cases: Tree,
    stages: Tree,
    approvals: Tree,
    history: Tree,
}

impl WorkflowStore {
    pub fn new(db: Arc<sled::Db>) -> Result<Self, StoreError> {
        Ok(Self {
            cases: db.open_tree(CASES)?,
            stages: db.open_tree(STAGES)?,
            approvals: db.open_tree(APPROVALS)?,
            history: db.open_tree(HISTORY)?,
            db,
        })
    }

    pub fn load_case(&self, case_id: &str) -> Result<Option<Case>, StoreError> {
        match self.cases.get(case_id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_cases(&self) -> Result<Vec<Case>, StoreError> {
        decode_all(self.cases.iter())
    }

    pub fn load_ledger(&self, case_id: &str) -> Result<ApprovalLedger, StoreError> {
        let prefix = format!("{case_id}/");
        let entries = decode_all(self.approvals.scan_prefix(prefix.as_bytes()))?;

        Ok(ApprovalLedger::from_entries(entries))
    }

    pub fn load_board(&self, case_id: &str) -> Result<StageBoard, StoreError> {
        let prefix = format!("{case_id}/");
        let records = decode_all(self.stages.scan_prefix(prefix.as_bytes()))?;

        Ok(StageBoard::from_records(case_id, records))
    }

    pub fn load_history(
        &self,
        case_id: &str,
        stage: StageName,
    ) -> Result<Vec<StageSnapshot>, StoreError> {
        let prefix = format!("{}/", stage_key(case_id, stage));
        decode_all(self.history.scan_prefix(prefix.as_bytes()))
    }

    /// Apply `commit` atomically. On success every written case and stage
    /// record carries its new version.
    pub fn commit(&self, commit: Commit<'_>) -> Result<(), StoreError> {
        let Commit {
            mut cases,
            mut stages,
            entries,
            snapshots,
            guards,
        } = commit;

        let mut case_writes = Vec::with_capacity(cases.len());
        for case in &cases {
            let mut next = (**case).clone();
            next.version += 1;
            case_writes.push(Prepared {
                key: case.id.clone(),
                expected: case.version,
                bytes: encode(&next)?,
            });
        }

        let mut stage_writes = Vec::with_capacity(stages.len());
        for record in &stages {
            let mut next = (**record).clone();
            next.version += 1;
            stage_writes.push(Prepared {
                key: stage_key(&record.case_id, record.stage),
                expected: record.version,
                bytes: encode(&next)?,
            });
        }

        let mut entry_writes = Vec::with_capacity(entries.len());
        for entry in &entries {
            entry_writes.push((seq_key(&entry.case_id, entry.seq), encode(*entry)?));
        }

        let mut snapshot_writes = Vec::with_capacity(snapshots.len());
        for snapshot in &snapshots {
            let key = seq_key(&stage_key(&snapshot.case_id, snapshot.stage), snapshot.seq);
            snapshot_writes.push((key, encode(*snapshot)?));
        }

        let (case_guards, stage_guards): (Vec<_>, Vec<_>) =
            guards.iter().partition(|(key, _)| !key.contains('/'));

        let trees = (&self.cases, &self.stages, &self.approvals, &self.history);
        let result: TransactionResult<(), StoreError> =
            trees.transaction(|(tx_cases, tx_stages, tx_approvals, tx_history)| {
                for (key, expected) in &case_guards {
                    check_version::<Case>(tx_cases, key, *expected)?;
                }
                for (key, expected) in &stage_guards {
                    check_version::<StageRecord>(tx_stages, key, *expected)?;
                }
                for p in &case_writes {
                    check_version::<Case>(tx_cases, &p.key, p.expected)?;
                    tx_cases.insert(p.key.as_bytes(), p.bytes.as_slice())?;
                }
                for p in &stage_writes {
                    check_version::<StageRecord>(tx_stages, &p.key, p.expected)?;
                    tx_stages.insert(p.key.as_bytes(), p.bytes.as_slice())?;
                }
                for (key, bytes) in &entry_writes {
                    insert_new(tx_approvals, key, bytes)?;
                }
                for (key, bytes) in &snapshot_writes {
                    insert_new(tx_history, key, bytes)?;
                }
                Ok(())
            });

        match result {
            Ok(()) => {
                for case in cases.iter_mut() {
                    case.version += 1;
                }
                for record in stages.iter_mut() {
                    record.version += 1;
                }
                tracing::debug!(
                    cases = case_writes.len(),
                    stages = stage_writes.len(),
                    entries = entry_writes.len(),
                    snapshots = snapshot_writes.len(),
                    "commit applied"
                );
                Ok(())
            }
            Err(TransactionError::Abort(err)) => {
                if let StoreError::Conflict(key) = &err {
                    tracing::warn!(%key, "commit rejected, record changed since read");
                }
                Err(err)
            }
            Err(TransactionError::Storage(err)) => Err(StoreError::Sled(err)),
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
