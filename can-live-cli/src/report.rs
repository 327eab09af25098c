//! Snapshot rendering
//!
//! Renders the aggregation table as a text table or as JSON.

use anyhow::{Context, Result};
use can_live_ingest::{RowSnapshot, StatsSnapshot};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

/// ID column: 3 hex digits for standard IDs, 8 for extended
pub fn format_id(row: &RowSnapshot) -> String {
    if row.is_extended() {
        format!("{:08X}h", row.id)
    } else {
        format!("{:03X}h", row.id)
    }
}

/// Data column: space-separated hex bytes
pub fn format_data(row: &RowSnapshot) -> String {
    if row.is_rtr() {
        return "Remote Request".to_string();
    }
    row.data
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render the rows as a text table
///
/// # Arguments
/// * `rows` - Snapshot in first-sighting order
/// * `stats` - Engine counters shown in the footer
/// * `now` - Wall-clock time shown in the header
pub fn render_table(rows: &[RowSnapshot], stats: &StatsSnapshot, now: DateTime<Local>) -> String {
    TableReport { rows, stats, now }.to_string()
}

/// Text table layout, written to any formatter
struct TableReport<'a> {
    rows: &'a [RowSnapshot],
    stats: &'a StatsSnapshot,
    now: DateTime<Local>,
}

impl fmt::Display for TableReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "═══════════════════════════════════════════════")?;
        writeln!(
            f,
            "  CAN Live Monitor - {} ({} message(s))",
            self.now.format("%H:%M:%S%.3f"),
            self.rows.len()
        )?;
        writeln!(f, "═══════════════════════════════════════════════")?;
        writeln!(
            f,
            "{:<22} {:>10} {:>4} {:>8} {:>14}  {}",
            "Type", "ID", "Len", "Count", "Rcv Time", "Data"
        )?;

        for row in self.rows {
            writeln!(
                f,
                "{:<22} {:>10} {:>4} {:>8} {:>14}  {}",
                row.type_label,
                format_id(row),
                row.length,
                row.count,
                row.timestamp.as_deref().unwrap_or("-"),
                format_data(row)
            )?;
        }

        let stats = self.stats;
        writeln!(f, "───────────────────────────────────────────────")?;
        writeln!(
            f,
            "frames={} ticks={} events={} bus_errors={} overruns={} queue_overruns={}",
            stats.frames,
            stats.ticks,
            stats.events,
            stats.bus_error_reads,
            stats.overrun_reads,
            stats.queue_overrun_reads
        )
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    time: String,
    stats: &'a StatsSnapshot,
    messages: &'a [RowSnapshot],
}

/// Render the rows and counters as one JSON document
pub fn render_json(rows: &[RowSnapshot], stats: &StatsSnapshot, now: DateTime<Local>) -> Result<String> {
    let report = JsonReport {
        time: now.to_rfc3339(),
        stats,
        messages: rows,
    };
    serde_json::to_string(&report).context("Failed to serialize snapshot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_live_ingest::{AggregationTable, ClassicFrame, FdFrame, Frame, HwTimestamp, MessageType};

    fn rows() -> Vec<RowSnapshot> {
        let table = AggregationTable::new();
        table.merge_frame(
            Frame::from(ClassicFrame::new(0x7E8, MessageType::STANDARD, &[0x02, 0x10, 0xAB])),
            Some(HwTimestamp::Classic {
                millis: 100,
                millis_overflow: 0,
                micros: 42,
            }),
        );
        table.merge_frame(
            Frame::from(ClassicFrame::new(0x18DAF110, MessageType::EXTENDED | MessageType::RTR, &[])),
            None,
        );
        table.merge_frame(
            Frame::from(FdFrame::new(0x123, MessageType::FD | MessageType::BRS, 9, &[1; 12])),
            None,
        );
        table.snapshot()
    }

    #[test]
    fn test_id_and_data_columns() {
        let rows = rows();
        assert_eq!(format_id(&rows[0]), "7E8h");
        assert_eq!(format_data(&rows[0]), "02 10 AB");

        assert_eq!(format_id(&rows[1]), "18DAF110h");
        assert_eq!(format_data(&rows[1]), "Remote Request");

        assert_eq!(format_data(&rows[2]).split(' ').count(), 12);
    }

    #[test]
    fn test_render_table() {
        let rows = rows();
        let out = render_table(&rows, &StatsSnapshot::default(), Local::now());

        assert!(out.contains("3 message(s)"));
        assert!(out.contains("100.42"));
        assert!(out.contains("STD [ FD BRS ]"));
    }

    #[test]
    fn test_table_layout_and_footer() {
        let rows = rows();
        let stats = StatsSnapshot {
            frames: 3,
            ticks: 7,
            bus_error_reads: 1,
            ..StatsSnapshot::default()
        };
        let out = render_table(&rows, &stats, Local::now());
        let lines: Vec<&str> = out.lines().collect();

        // Two banner lines, title, column header, one line per row, rule, footer
        assert_eq!(lines.len(), 4 + rows.len() + 2);
        assert!(lines[3].starts_with("Type"));
        assert!(lines[4].contains("7E8h"));
        assert_eq!(
            lines.last().copied(),
            Some("frames=3 ticks=7 events=0 bus_errors=1 overruns=0 queue_overruns=0")
        );
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_render_json() {
        let rows = rows();
        let json = render_json(&rows, &StatsSnapshot::default(), Local::now()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["messages"].as_array().unwrap().len(), 3);
        assert_eq!(value["messages"][0]["id"], 0x7E8);
        assert_eq!(value["messages"][0]["timestamp"], "100.42");
        assert_eq!(value["messages"][2]["kind"], "fd");
        assert_eq!(value["stats"]["frames"], 0);
    }
}
