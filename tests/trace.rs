// LOADGEN TRACE LOADER TESTS
// FILE-LEVEL LOADING, FAIL-FAST VALIDATION, DEADLINE DERIVATION.
// NO CHILD PROCESSES.

use std::fs;

use loadgen::error::ReplayError;
use loadgen::pacer::target_times;
use loadgen::trace::{load_trace, parse_trace, trace_span_ns, WorkloadItem};

fn write_trace(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.txt");
    fs::write(&path, content).unwrap();
    (dir, path)
}

// === LOADING ===

#[test]
fn load_is_idempotent() {
    let (_dir, path) = write_trace("0 A\n0.01 B\n0.02 C\n");
    let first = load_trace(&path).unwrap();
    let second = load_trace(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
    assert_eq!(first[2].argument, "C");
    assert_eq!(first[2].sequence_index, 2);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    match load_trace(&dir.path().join("absent.txt")) {
        Err(ReplayError::Io { path, .. }) => assert!(path.ends_with("absent.txt")),
        other => panic!("expected Io error, got {:?}", other),
    }
}

#[test]
fn no_trailing_newline_still_loads() {
    let (_dir, path) = write_trace("0.5 40\n1.25 38");
    let items = load_trace(&path).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].inter_arrival_secs, 1.25);
    assert_eq!(items[1].argument, "38");
}

// === FAIL-FAST ===

#[test]
fn non_numeric_iat_rejects_whole_trace() {
    match parse_trace("abc xyz\n") {
        Err(ReplayError::TraceFormat { line, content, .. }) => {
            assert_eq!(line, 1);
            assert_eq!(content, "abc xyz");
        }
        other => panic!("expected TraceFormat, got {:?}", other),
    }
}

#[test]
fn bad_line_reports_its_line_number() {
    let (_dir, path) = write_trace("0 A\n0.1 B\n-0.5 C\n0 D\n");
    match load_trace(&path) {
        Err(ReplayError::TraceFormat { line, .. }) => assert_eq!(line, 3),
        other => panic!("expected TraceFormat, got {:?}", other),
    }
}

#[test]
fn wrong_field_count_rejected() {
    assert!(matches!(parse_trace("0.1\n"), Err(ReplayError::TraceFormat { .. })));
    assert!(matches!(parse_trace("0.1 A B\n"), Err(ReplayError::TraceFormat { .. })));
}

#[test]
fn non_finite_iat_rejected() {
    assert!(parse_trace("inf A\n").is_err());
    assert!(parse_trace("NaN A\n").is_err());
}

#[test]
fn huge_iat_rejected_on_its_own_line() {
    match parse_trace("1e10 A\n1e10 B\n") {
        Err(ReplayError::TraceFormat { line, content, reason }) => {
            assert_eq!(line, 1);
            assert_eq!(content, "1e10 A");
            assert_eq!(reason, "inter-arrival time too large");
        }
        other => panic!("expected TraceFormat, got {:?}", other),
    }
    assert!(parse_trace("1e300 A\n").is_err());
}

#[test]
fn cumulative_span_overflow_rejected() {
    // EACH RECORD FITS, THEIR SUM DOES NOT
    let (_dir, path) = write_trace("0 A\n5e9 B\n5e9 C\n");
    match load_trace(&path) {
        Err(ReplayError::TraceFormat { line, reason, .. }) => {
            assert_eq!(line, 3);
            assert_eq!(reason, "cumulative trace time too large");
        }
        other => panic!("expected TraceFormat, got {:?}", other),
    }
}

// === DEADLINES ===

#[test]
fn span_and_targets_agree() {
    let items = parse_trace("0 A\n0 B\n0.25 C\n0.5 D\n").unwrap();
    let targets = target_times(0, &items);
    assert_eq!(targets, vec![0, 0, 250_000_000, 750_000_000]);
    assert_eq!(trace_span_ns(&items), *targets.last().unwrap());
    assert!(targets.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn unparsed_items_saturate_instead_of_overflowing() {
    let items: Vec<WorkloadItem> = (0..2)
        .map(|i| WorkloadItem {
            sequence_index: i,
            inter_arrival_secs: 1e10,
            argument: format!("{}", i),
        })
        .collect();
    assert_eq!(trace_span_ns(&items), u64::MAX);
    let targets = target_times(1_000, &items);
    assert_eq!(targets, vec![10_000_000_000_000_001_000, u64::MAX]);
}
