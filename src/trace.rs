// LOADGEN TRACE LOADER
// ONE RECORD PER LINE: "<inter-arrival seconds> <argument>"
// THE WHOLE FILE IS VALIDATED BEFORE ANYTHING IS LAUNCHED. ONE BAD LINE
// REJECTS THE TRACE.

use std::path::Path;

use crate::clock;
use crate::error::{ReplayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadItem {
    pub sequence_index: usize,
    pub inter_arrival_secs: f64,
    pub argument: String,
}

impl WorkloadItem {
    pub fn inter_arrival_ns(&self) -> u64 {
        clock::secs_to_ns(self.inter_arrival_secs)
    }
}

pub fn load_trace(path: &Path) -> Result<Vec<WorkloadItem>> {
    let raw = std::fs::read_to_string(path).map_err(|e| ReplayError::io(path, e))?;
    parse_trace(&raw)
}

// LONGEST SCHEDULABLE TRACE, PER RECORD AND CUMULATIVE. KEEPS EVERY
// start + OFFSET DEADLINE INSIDE u64.
pub const MAX_TRACE_SPAN_NS: u64 = i64::MAX as u64;

// BLANK LINES ARE SKIPPED. SEQUENCE INDICES COUNT RECORDS, NOT LINES.
pub fn parse_trace(raw: &str) -> Result<Vec<WorkloadItem>> {
    let mut items = Vec::new();
    let mut span_ns: u64 = 0;
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let reject = |reason| ReplayError::TraceFormat {
            line: lineno + 1,
            content: line.to_string(),
            reason,
        };
        let (iat, argument) = parse_line(line).map_err(reject)?;
        span_ns = span_ns
            .checked_add(clock::secs_to_ns(iat))
            .filter(|&total| total <= MAX_TRACE_SPAN_NS)
            .ok_or_else(|| reject("cumulative trace time too large"))?;
        items.push(WorkloadItem {
            sequence_index: items.len(),
            inter_arrival_secs: iat,
            argument,
        });
    }
    Ok(items)
}

fn parse_line(line: &str) -> std::result::Result<(f64, String), &'static str> {
    let mut fields = line.split_whitespace();
    let iat_tok = fields.next().ok_or("empty record")?;
    let arg_tok = fields.next().ok_or("missing argument")?;
    if fields.next().is_some() {
        return Err("trailing fields");
    }

    let iat: f64 = iat_tok.parse().map_err(|_| "inter-arrival time is not a number")?;
    if !iat.is_finite() {
        return Err("inter-arrival time is not finite");
    }
    if iat < 0.0 {
        return Err("inter-arrival time is negative");
    }
    if iat * clock::NSEC_PER_SEC as f64 > MAX_TRACE_SPAN_NS as f64 {
        return Err("inter-arrival time too large");
    }
    Ok((iat, arg_tok.to_string()))
}

// TOTAL SCHEDULED SPAN OF THE TRACE (SUM OF ALL IATS)
pub fn trace_span_ns(items: &[WorkloadItem]) -> u64 {
    items
        .iter()
        .fold(0u64, |span, item| span.saturating_add(item.inter_arrival_ns()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_in_order() {
        let items = parse_trace("0 A\n0.01 B\n0.02 C\n").unwrap();
        assert_eq!(items.len(), 3);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.sequence_index, i);
        }
        assert_eq!(items[1].argument, "B");
        assert_eq!(items[2].inter_arrival_secs, 0.02);
    }

    #[test]
    fn tabs_and_runs_of_spaces() {
        let items = parse_trace("0.5\t\t36\n  1   40  \n").unwrap();
        assert_eq!(items[0].argument, "36");
        assert_eq!(items[1].inter_arrival_secs, 1.0);
    }

    #[test]
    fn blank_lines_do_not_consume_indices() {
        let items = parse_trace("0 A\n\n   \n0 B\n").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].sequence_index, 1);
    }

    #[test]
    fn rejects_non_numeric_iat() {
        match parse_trace("0 A\nabc xyz\n") {
            Err(ReplayError::TraceFormat { line, content, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(content, "abc xyz");
            }
            other => panic!("expected TraceFormat, got {:?}", other),
        }
    }

    #[test]
    fn rejects_negative_and_non_finite() {
        assert!(parse_trace("-0.1 A\n").is_err());
        assert!(parse_trace("NaN A\n").is_err());
        assert!(parse_trace("inf A\n").is_err());
    }

    #[test]
    fn rejects_missing_or_extra_fields() {
        assert!(parse_trace("0.1\n").is_err());
        assert!(parse_trace("0.1 A B\n").is_err());
    }

    #[test]
    fn rejects_iat_beyond_schedulable_range() {
        match parse_trace("0 A\n1e10 B\n") {
            Err(ReplayError::TraceFormat { line, reason, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(reason, "inter-arrival time too large");
            }
            other => panic!("expected TraceFormat, got {:?}", other),
        }
    }

    #[test]
    fn span_sums_iats() {
        let items = parse_trace("0 A\n0.01 B\n0.02 C\n").unwrap();
        assert_eq!(trace_span_ns(&items), 30_000_000);
    }
}
