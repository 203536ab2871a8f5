//! Decision journal writer tests.

use agent_shepherd::audit::{AuditEntry, AuditEventType, AuditLogger, JsonlAuditWriter};
use chrono::{NaiveDate, Utc};

fn read_entries(writer: &JsonlAuditWriter) -> Vec<AuditEntry> {
    let path = writer.path_for(Utc::now().date_naive());
    let raw = std::fs::read_to_string(path).expect("journal file");
    raw.lines()
        .map(|line| serde_json::from_str(line).expect("journal line"))
        .collect()
}

#[test]
fn creates_directory_and_daily_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal_dir = dir.path().join("journal");
    let writer = JsonlAuditWriter::new(journal_dir.clone()).expect("writer");
    assert!(journal_dir.is_dir());

    let date = NaiveDate::from_ymd_opt(2026, 3, 9).expect("date");
    assert_eq!(writer.path_for(date), journal_dir.join("journal-2026-03-09.jsonl"));
}

#[test]
fn appends_one_line_per_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");

    writer
        .log_entry(
            AuditEntry::new(AuditEventType::Assignment)
                .with_session("dev-1")
                .with_task("t-1")
                .with_detail("fix login"),
        )
        .expect("first entry");
    writer
        .log_entry(
            AuditEntry::new(AuditEventType::ValidationFailed)
                .with_session("dev-1")
                .with_task("t-1")
                .with_errors(vec!["missing required field `summary`".into()]),
        )
        .expect("second entry");

    let entries = read_entries(&writer);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].event_type, AuditEventType::Assignment);
    assert_eq!(entries[0].detail.as_deref(), Some("fix login"));
    assert!(entries[0].errors.is_empty());
    assert_eq!(entries[1].event_type, AuditEventType::ValidationFailed);
    assert_eq!(entries[1].errors, ["missing required field `summary`"]);
}

#[test]
fn event_types_serialize_snake_case() {
    let line = serde_json::to_string(
        &AuditEntry::new(AuditEventType::SessionExit).with_category("idle/shell-prompt"),
    )
    .expect("serialize");
    assert!(line.contains("\"event_type\":\"session_exit\""), "{line}");
    assert!(line.contains("\"category\":\"idle/shell-prompt\""), "{line}");
    assert!(!line.contains("errors"), "{line}");
}

#[test]
fn reopening_appends_to_existing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");
        writer
            .log_entry(AuditEntry::new(AuditEventType::Nudge))
            .expect("entry");
    }
    let writer = JsonlAuditWriter::new(dir.path().to_path_buf()).expect("writer");
    writer
        .log_entry(AuditEntry::new(AuditEventType::Escalation))
        .expect("entry");

    let kinds: Vec<_> = read_entries(&writer).into_iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, [AuditEventType::Nudge, AuditEventType::Escalation]);
}
