//! Integration tests for device stats parsing.
//!
//! These tests verify that:
//! 1. Field spellings from different firmware versions are accepted
//! 2. Report ids normalize to strings whether they arrive as strings or ints
//! 3. The manifest fallback selects the newest analysis entry
//! 4. Report warning totals come from known keys or severity markers

use cellwatch_bridge::poller::{
    count_report_warnings, entry_warning_total, newest_manifest_entry, parse_system_stats,
};
use serde_json::Value;

/// Current firmware: camelCase stats document.
const STATS_CURRENT: &str = r#"{
    "uptimeSecs": 86471,
    "queueSize": 0,
    "warningCount": 2,
    "lastReportId": "report-0042"
}"#;

/// Older firmware: snake_case spellings and an integer report id.
const STATS_LEGACY: &str = r#"{
    "uptime": 120,
    "warnings": "3",
    "last_id": 17
}"#;

/// Firmware that predates the stats fields entirely.
const STATS_SPARSE: &str = r#"{
    "uptime": 15,
    "battery_pct": 81
}"#;

/// Capture manifest with entries out of id order.
const MANIFEST: &str = r#"[
    {"id": 3, "warnings": 1, "started": "2025-06-01T10:00:00Z"},
    {"id": 11, "warnings": 0, "started": "2025-06-03T09:30:00Z"},
    {"id": 7, "warnings": 2, "started": "2025-06-02T14:45:00Z"}
]"#;

/// Manifest whose entries only carry opaque uids.
const MANIFEST_OPAQUE_IDS: &str = r#"[
    {"uid": "cap-a", "warnings": 1},
    {"uid": "cap-b"}
]"#;

/// Full analysis report without a top-level total; the walk has to count
/// severity markers.
const REPORT: &str = r#"{
    "report_id": 11,
    "analysis": [
        {"severity": "Warning", "detail": "paging without response"},
        {"severity": "informational", "detail": "neighbor cell update"},
        {"checks": [{"level": "critical", "detail": "downgrade attempt"}]}
    ]
}"#;

fn parse(body: &str) -> Value {
    serde_json::from_str(body).expect("fixture is valid JSON")
}

#[test]
fn current_firmware_stats_parse() {
    let fields = parse_system_stats(&parse(STATS_CURRENT));
    assert_eq!(fields.warning_count, Some(2));
    assert_eq!(fields.report_id.as_deref(), Some("report-0042"));
}

#[test]
fn legacy_firmware_stats_parse() {
    let fields = parse_system_stats(&parse(STATS_LEGACY));
    assert_eq!(fields.warning_count, Some(3));
    assert_eq!(fields.report_id.as_deref(), Some("17"));
}

#[test]
fn sparse_stats_yield_no_fields() {
    let fields = parse_system_stats(&parse(STATS_SPARSE));
    assert_eq!(fields.warning_count, None);
    assert_eq!(fields.report_id, None);
}

#[test]
fn manifest_fallback_selects_newest_entry() {
    let manifest = parse(MANIFEST);
    let (entry, id) = newest_manifest_entry(&manifest).expect("manifest has entries");
    assert_eq!(id.as_deref(), Some("11"));
    assert_eq!(entry_warning_total(entry), Some(0));
}

#[test]
fn manifest_without_numeric_ids_uses_last_entry() {
    let manifest = parse(MANIFEST_OPAQUE_IDS);
    let (entry, id) = newest_manifest_entry(&manifest).expect("manifest has entries");
    assert_eq!(id.as_deref(), Some("cap-b"));
    assert_eq!(entry_warning_total(entry), None);
}

#[test]
fn report_warnings_counted_from_severity_markers() {
    // One "Warning" and one "critical"; "informational" does not count.
    assert_eq!(count_report_warnings(&parse(REPORT)), 2);
}

#[test]
fn report_with_explicit_total_prefers_it() {
    let report = parse(r#"{"warnings": 5, "analysis": [{"severity": "warn"}]}"#);
    assert_eq!(count_report_warnings(&report), 5);
}
