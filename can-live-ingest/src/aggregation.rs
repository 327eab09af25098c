//! Per-message aggregation table
//!
//! Coalesces repeated frames into one row per message identity holding the
//! latest frame, its timestamp and how many times the identity was seen.
//!
//! All mergers and readers share one table-wide lock. Rows are replaced as a
//! whole inside the critical section, so a snapshot never observes a row with
//! the frame of one merge and the count or timestamp of another.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{Frame, HwTimestamp, MessageIdentity};

/// Latest observation of one message identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationRow {
    /// Most recently merged frame
    pub frame: Frame,
    /// Timestamp of the most recent merge (None when timestamps are off)
    pub timestamp: Option<HwTimestamp>,
    /// Number of merges for this identity (always >= 1)
    pub count: u64,
    /// Insertion sequence, used to keep snapshots in first-seen order
    pub first_seen: u64,
}

/// Display-ready copy of one row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSnapshot {
    pub identity: MessageIdentity,
    /// `classic` or `fd`
    pub kind: &'static str,
    /// Decoded type flags (e.g. `EXT [ FD BRS ]`)
    pub type_label: String,
    /// Payload length in bytes
    pub length: usize,
    /// Numeric CAN ID
    pub id: u32,
    /// Raw type flag byte
    pub msg_type: u8,
    /// Payload bytes (exactly `length` of them)
    pub data: Vec<u8>,
    /// `millis.micros` for classic timestamps, raw tick for FD timestamps
    pub timestamp: Option<String>,
    pub count: u64,
}

impl RowSnapshot {
    fn from_row(identity: MessageIdentity, row: &AggregationRow) -> Self {
        Self {
            identity,
            kind: if row.frame.is_fd() { "fd" } else { "classic" },
            type_label: row.frame.type_label(),
            length: row.frame.length(),
            id: row.frame.id(),
            msg_type: row.frame.msg_type().bits(),
            data: row.frame.payload().to_vec(),
            timestamp: row.timestamp.map(|ts| ts.to_string()),
            count: row.count,
        }
    }

    /// True if the row carries the RTR flag
    pub fn is_rtr(&self) -> bool {
        crate::types::MessageType(self.msg_type).is_rtr()
    }

    /// True if the row carries the extended-ID flag
    pub fn is_extended(&self) -> bool {
        crate::types::MessageType(self.msg_type).is_extended()
    }
}

#[derive(Debug, Default)]
struct TableState {
    rows: HashMap<MessageIdentity, AggregationRow>,
    next_sequence: u64,
}

/// Shared identity -> latest-frame table
#[derive(Debug, Default)]
pub struct AggregationTable {
    state: Mutex<TableState>,
}

impl AggregationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        // Rows are written whole, a poisoned guard still holds consistent rows
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge one observation
    ///
    /// Inserts a row with count 1 for an unseen identity, otherwise overwrites
    /// the frame and timestamp and increments the count by one. The whole
    /// read-modify-write happens under the table lock.
    pub fn merge(&self, identity: MessageIdentity, frame: Frame, timestamp: Option<HwTimestamp>) {
        let mut state = self.lock();
        let sequence = state.next_sequence;

        match state.rows.get_mut(&identity) {
            Some(row) => {
                row.frame = frame;
                row.timestamp = timestamp;
                row.count += 1;
            }
            None => {
                state.rows.insert(
                    identity,
                    AggregationRow {
                        frame,
                        timestamp,
                        count: 1,
                        first_seen: sequence,
                    },
                );
                state.next_sequence += 1;
            }
        }
    }

    /// Merge one frame under its own identity
    pub fn merge_frame(&self, frame: Frame, timestamp: Option<HwTimestamp>) {
        self.merge(frame.identity(), frame, timestamp);
    }

    /// Copy of one row
    pub fn get(&self, identity: MessageIdentity) -> Option<AggregationRow> {
        self.lock().rows.get(&identity).copied()
    }

    /// Display-ready copy of every row, in first-seen order
    pub fn snapshot(&self) -> Vec<RowSnapshot> {
        let mut rows: Vec<(MessageIdentity, AggregationRow)> = {
            let state = self.lock();
            state.rows.iter().map(|(identity, row)| (*identity, *row)).collect()
        };
        rows.sort_by_key(|(_, row)| row.first_seen);

        rows.iter()
            .map(|(identity, row)| RowSnapshot::from_row(*identity, row))
            .collect()
    }

    /// Number of distinct identities
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().rows.is_empty()
    }

    /// Sum of all row counts (frames merged since the last clear)
    pub fn total_count(&self) -> u64 {
        self.lock().rows.values().map(|row| row.count).sum()
    }

    /// Drop every row (a display-layer action, never done by the engine)
    pub fn clear(&self) {
        let mut state = self.lock();
        state.rows.clear();
        state.next_sequence = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassicFrame, FdFrame, MessageType};

    fn classic(id: u32, payload: &[u8]) -> Frame {
        Frame::from(ClassicFrame::new(id, MessageType::STANDARD, payload))
    }

    #[test]
    fn test_count_and_last_frame() {
        let table = AggregationTable::new();
        let identity = MessageIdentity::new(0x200, MessageType::STANDARD);

        for i in 0..10u8 {
            table.merge(identity, classic(0x200, &[i]), None);
        }

        let row = table.get(identity).unwrap();
        assert_eq!(row.count, 10);
        assert_eq!(row.frame, classic(0x200, &[9]));
        assert_eq!(table.len(), 1);
        assert_eq!(table.total_count(), 10);
    }

    #[test]
    fn test_same_id_and_flags_collide() {
        let table = AggregationTable::new();
        table.merge_frame(classic(0x100, &[0xAA, 0xBB]), None);
        table.merge_frame(classic(0x100, &[0x11, 0x22, 0x33]), None);

        let rows = table.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 2);
        assert_eq!(rows[0].data, vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_flags_split_rows() {
        let table = AggregationTable::new();
        table.merge_frame(classic(0x100, &[1]), None);
        table.merge_frame(Frame::from(ClassicFrame::new(0x100, MessageType::EXTENDED, &[1])), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_timestamp_overwritten_and_cleared() {
        let table = AggregationTable::new();
        let frame = classic(0x42, &[1]);
        let ts = HwTimestamp::Classic {
            millis: 10,
            millis_overflow: 0,
            micros: 250,
        };

        table.merge_frame(frame, Some(ts));
        assert_eq!(table.snapshot()[0].timestamp.as_deref(), Some("10.250"));

        table.merge_frame(frame, None);
        let row = table.get(frame.identity()).unwrap();
        assert_eq!(row.timestamp, None);
        assert_eq!(row.count, 2);
    }

    #[test]
    fn test_snapshot_order_and_fields() {
        let table = AggregationTable::new();
        table.merge_frame(classic(0x300, &[3]), None);
        let fd = Frame::from(FdFrame::new(
            0x18FF_0001,
            MessageType::EXTENDED | MessageType::FD,
            9,
            &[7; 12],
        ));
        table.merge_frame(fd, Some(HwTimestamp::Fd(123_456)));
        table.merge_frame(classic(0x300, &[4]), None);

        let rows = table.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 0x300);
        assert_eq!(rows[0].kind, "classic");
        assert_eq!(rows[0].count, 2);

        assert_eq!(rows[1].kind, "fd");
        assert_eq!(rows[1].type_label, "EXT [ FD ]");
        assert_eq!(rows[1].length, 12);
        assert_eq!(rows[1].data, vec![7; 12]);
        assert_eq!(rows[1].timestamp.as_deref(), Some("123456"));
        assert!(rows[1].is_extended());
    }

    #[test]
    fn test_clear() {
        let table = AggregationTable::new();
        table.merge_frame(classic(1, &[]), None);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.total_count(), 0);
    }
}
