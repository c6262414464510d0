//! Identity + recency merge of a snapshot into the master dataset.
//!
//! The merge is a pure function of `(prior master, snapshot)`: no I/O, no
//! mutation of its inputs. Per identifier the retained version is the one with
//! the greatest `last_updated`; on equal `last_updated` the later `fetched_at`
//! wins, and on a full tie the incoming record wins.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use apev_core::{IncompatibleSchemaError, MasterDataset, MergeReport, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Newer,
    Tie,
    Stale,
}

fn judge(existing: &Record, incoming: &Record) -> Verdict {
    match incoming.last_updated.cmp(&existing.last_updated) {
        Ordering::Greater => Verdict::Newer,
        Ordering::Less => Verdict::Stale,
        Ordering::Equal if incoming.fetched_at >= existing.fetched_at => Verdict::Tie,
        Ordering::Equal => Verdict::Stale,
    }
}

/// Reduce a snapshot to one record per identifier (latest `recency_key` wins,
/// later input position breaks exact ties). Returns the survivors in identifier
/// order and the number of records dropped.
pub fn collapse_snapshot(snapshot: &[Record]) -> (Vec<Record>, usize) {
    let mut latest: BTreeMap<&str, &Record> = BTreeMap::new();
    let mut collapsed = 0;
    for record in snapshot {
        match latest.entry(record.id.as_str()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                collapsed += 1;
                if record.recency_key() >= slot.get().recency_key() {
                    slot.insert(record);
                }
            }
        }
    }
    (latest.into_values().cloned().collect(), collapsed)
}

fn validate(prior: &MasterDataset, snapshot: &[Record]) -> Result<(), IncompatibleSchemaError> {
    for (key, record) in &prior.records {
        if key.trim().is_empty() || key != &record.id {
            return Err(IncompatibleSchemaError::new(format!(
                "master entry keyed {key:?} holds record {:?}",
                record.id
            )));
        }
    }
    if let Some(position) = snapshot.iter().position(|r| r.id.trim().is_empty()) {
        return Err(IncompatibleSchemaError::new(format!(
            "snapshot record at position {position} has an empty identifier"
        )));
    }
    Ok(())
}

pub fn merge(
    prior: &MasterDataset,
    snapshot: &[Record],
) -> Result<(MasterDataset, MergeReport), IncompatibleSchemaError> {
    validate(prior, snapshot)?;

    let (incoming, collapsed_duplicates) = collapse_snapshot(snapshot);
    let mut working = prior.clone();
    let mut report = MergeReport {
        collapsed_duplicates,
        ..MergeReport::default()
    };

    for record in incoming {
        match working.records.entry(record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                report.added += 1;
            }
            Entry::Occupied(mut slot) => match judge(slot.get(), &record) {
                Verdict::Newer => {
                    slot.insert(record);
                    report.updated += 1;
                }
                Verdict::Tie => {
                    slot.insert(record);
                    report.reconciled += 1;
                }
                Verdict::Stale => report.ignored_stale += 1,
            },
        }
    }

    report.total_master_size = working.len();
    Ok((working, report))
}
