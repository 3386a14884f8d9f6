use crate::sync::types::{DeltaBatch, PriceRecord, PriceTable, Snapshot, SnapshotOrigin};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: usize,
    pub stale: usize,
    pub removed: usize,
    pub ignored: usize,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        self.applied > 0 || self.removed > 0
    }
}

// Ties go to the incoming record.
fn upsert(table: &mut PriceTable, record: PriceRecord, report: &mut MergeReport) {
    match table.get(&record.code) {
        Some(held) if record.updated_at < held.updated_at => report.stale += 1,
        _ => {
            table.insert(record.code.clone(), record);
            report.applied += 1;
        }
    }
}

pub fn merge_snapshot(table: &mut PriceTable, snapshot: Snapshot) -> MergeReport {
    match snapshot.origin {
        SnapshotOrigin::Poll => merge_full_snapshot(table, snapshot),
        SnapshotOrigin::Push | SnapshotOrigin::Cache => merge_partial_snapshot(table, snapshot),
    }
}

/// Replaces the codes the snapshot carries and leaves every other code alone.
pub fn merge_partial_snapshot(table: &mut PriceTable, snapshot: Snapshot) -> MergeReport {
    let mut report = MergeReport::default();
    for (_, record) in snapshot.records {
        upsert(table, record, &mut report);
    }
    report
}

/// Authoritative for the whole table: codes absent from the snapshot are removed.
pub fn merge_full_snapshot(table: &mut PriceTable, snapshot: Snapshot) -> MergeReport {
    let mut report = MergeReport::default();

    let before = table.len();
    table.retain(|code, _| snapshot.records.contains_key(code));
    report.removed = before - table.len();

    for (_, record) in snapshot.records {
        upsert(table, record, &mut report);
    }
    report
}

pub fn merge_deltas(table: &mut PriceTable, batch: &DeltaBatch) -> MergeReport {
    let mut report = MergeReport::default();

    for change in &batch.changes {
        let updated_at = change.updated_at.unwrap_or(batch.timestamp);
        match table.get_mut(&change.code) {
            Some(held) if updated_at < held.updated_at => report.stale += 1,
            Some(held) => {
                change.patch(held, updated_at);
                report.applied += 1;
            }
            None => match change.to_record(updated_at) {
                Some(record) => {
                    table.insert(record.code.clone(), record);
                    report.applied += 1;
                }
                None => report.ignored += 1,
            },
        }
    }

    report
}
