use std::collections::BTreeMap;

use crate::models::Record;

/// Ordered, deduplicating collection of retrieved records keyed by sequence
/// number. Cleared at the start of every retrieval command; live-streaming
/// updates only ever add or overwrite.
#[derive(Clone, Debug, Default)]
pub struct RecordStore {
    records: BTreeMap<u16, Record>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any earlier record with the same sequence
    /// number. The latest decode is authoritative.
    pub fn upsert(&mut self, record: Record) {
        self.records.insert(record.sequence_number, record);
    }

    pub fn get(&self, sequence_number: u16) -> Option<&Record> {
        self.records.get(&sequence_number)
    }

    pub fn max_sequence(&self) -> Option<u16> {
        self.records.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Records in ascending sequence-number order.
    pub fn to_vec(&self) -> Vec<Record> {
        self.records.values().cloned().collect()
    }
}
