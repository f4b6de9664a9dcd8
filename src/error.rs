// LOADGEN ERROR TAXONOMY
// STRUCTURAL FAILURES ARE FATAL. PER-ITEM FAILURES ARE CARRIED IN THE
// ITEM'S COMPLETION RECORD AND NEVER SURFACE HERE DURING A RUN.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    // MALFORMED TRACE LINE. FATAL, RAISED BEFORE ANY PROCESS IS LAUNCHED.
    #[error("trace line {line}: {reason}: {content:?}")]
    TraceFormat {
        line: usize,
        content: String,
        reason: &'static str,
    },

    // ONE ITEM FAILED TO LAUNCH. RECORDED, THE RUN CONTINUES.
    #[error("spawn failed for item {index} ({argument}): {source}")]
    ProcessSpawn {
        index: usize,
        argument: String,
        #[source]
        source: io::Error,
    },

    // A CHILD EXITED THAT NO LAUNCHER REGISTERED. LEFT UNREAPED AND LOGGED, THE RUN CONTINUES.
    #[error("exited pid {pid} (status {status}) not found in active-task table")]
    Reaper { pid: i32, status: i32 },

    // RESULTS HAVE UNFILLED SLOTS AT SHUTDOWN. FATAL.
    #[error("run incomplete: {} of {total} completions missing (first missing index {})",
            .missing.len(), .missing.first().copied().unwrap_or_default())]
    IncompleteRun { missing: Vec<usize>, total: usize },

    // AFFINITY / CGROUP / SCHEDULING SETUP FAILED. FATAL: ISOLATION IS GONE.
    #[error("resource setup failed ({what}): {source}")]
    ResourceSetup {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("wildcard wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ReplayError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn setup(what: impl Into<String>, source: io::Error) -> Self {
        Self::ResourceSetup { what: what.into(), source }
    }

    // TRUE FOR ERRORS THAT ABORT A RUN (AS OPPOSED TO PER-ITEM FAILURES)
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ProcessSpawn { .. } | Self::Reaper { .. })
    }
}

pub type Result<T> = std::result::Result<T, ReplayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_run_names_first_missing_index() {
        let e = ReplayError::IncompleteRun { missing: vec![4, 9], total: 10 };
        let msg = e.to_string();
        assert!(msg.contains("2 of 10"));
        assert!(msg.contains("first missing index 4"));
        assert!(e.is_fatal());
    }

    #[test]
    fn per_item_errors_are_not_fatal() {
        let spawn = ReplayError::ProcessSpawn {
            index: 3,
            argument: "36".to_string(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(!spawn.is_fatal());
        assert!(!ReplayError::Reaper { pid: 42, status: 0 }.is_fatal());
    }

    #[test]
    fn trace_format_carries_line_content() {
        let e = ReplayError::TraceFormat { line: 7, content: "abc xyz".to_string(), reason: "bad iat" };
        assert_eq!(e.to_string(), "trace line 7: bad iat: \"abc xyz\"");
    }
}
