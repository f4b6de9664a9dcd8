// LOADGEN OUTPUT FILES
// EVERYTHING THE ANALYSIS SCRIPTS CONSUME, WRITTEN ONCE FROM THE ASSEMBLED RUN:
//   <label>_pids.txt       "<pid> <argument>" PER ITEM, SEQUENCE ORDER
//   <label>_times.csv      pid,argument,request_time,return_time,duration
//   total_time.txt         "<label>: <seconds> s" (APPENDED)
//   <label>_output.txt     CAPTURED STDOUT PER ITEM
//   <label>_IAT_diff.txt   "<argument>: <percent>%" ACTUAL VS TRACE GAP

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::clock;
use crate::error::{ReplayError, Result};
use crate::results::RunResults;
use crate::trace::WorkloadItem;

// PID COLUMN FOR ITEMS THAT NEVER BECAME A PROCESS
pub const NO_PID: i32 = -1;

#[derive(Debug, Clone)]
pub struct OutputPlan {
    pub dir: PathBuf,
    pub label: String,
    pub timing: bool,
    pub full_output: bool,
    pub iat_diff: bool,
}

impl OutputPlan {
    pub fn new(dir: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            label: label.into(),
            timing: true,
            full_output: true,
            iat_diff: false,
        }
    }

    pub fn pid_map_path(&self) -> PathBuf {
        self.dir.join(format!("{}_pids.txt", self.label))
    }

    pub fn timings_path(&self) -> PathBuf {
        self.dir.join(format!("{}_times.csv", self.label))
    }

    pub fn total_time_path(&self) -> PathBuf {
        self.dir.join("total_time.txt")
    }

    pub fn outputs_path(&self) -> PathBuf {
        self.dir.join(format!("{}_output.txt", self.label))
    }

    pub fn iat_diff_path(&self) -> PathBuf {
        self.dir.join(format!("{}_IAT_diff.txt", self.label))
    }

    /// Write every enabled output for one assembled run. Returns the paths
    /// written, in the order above.
    pub fn write(&self, results: &RunResults, items: &[WorkloadItem]) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir).map_err(|e| ReplayError::io(&self.dir, e))?;
        let mut written = Vec::new();

        let path = self.pid_map_path();
        with_file(&path, |w| write_pid_map(w, results))?;
        written.push(path);

        if self.timing {
            let path = self.timings_path();
            with_file(&path, |w| write_timings(w, results))?;
            written.push(path);

            let path = self.total_time_path();
            append_line(&path, &total_time_line(&self.label, results.window().elapsed_secs()))?;
            written.push(path);
        }

        if self.full_output {
            let path = self.outputs_path();
            with_file(&path, |w| write_outputs(w, results))?;
            written.push(path);
        }

        if self.iat_diff {
            let path = self.iat_diff_path();
            with_file(&path, |w| write_iat_diff(w, results, items))?;
            written.push(path);
        }

        Ok(written)
    }
}

fn with_file(path: &Path, f: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>) -> Result<()> {
    let file = File::create(path).map_err(|e| ReplayError::io(path, e))?;
    let mut w = BufWriter::new(file);
    f(&mut w).and_then(|_| w.flush()).map_err(|e| ReplayError::io(path, e))
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ReplayError::io(path, e))?;
    writeln!(file, "{}", line).map_err(|e| ReplayError::io(path, e))
}

pub fn write_pid_map<W: Write>(w: &mut W, results: &RunResults) -> io::Result<()> {
    for r in results.records() {
        writeln!(w, "{} {}", r.pid.unwrap_or(NO_PID), r.argument)?;
    }
    Ok(())
}

// TIMES ARE SECONDS SINCE RUN START
pub fn write_timings<W: Write>(w: &mut W, results: &RunResults) -> io::Result<()> {
    let window = results.window();
    let mut csv = csv::Writer::from_writer(w);
    csv.write_record(["pid", "argument", "request_time", "return_time", "duration"])?;
    for r in results.records() {
        csv.write_record([
            r.pid.unwrap_or(NO_PID).to_string(),
            r.argument.clone(),
            format!("{:.6}", window.offset_secs(r.request_ns)),
            format!("{:.6}", window.offset_secs(r.return_ns)),
            format!("{:.6}", clock::ns_to_secs(r.duration_ns())),
        ])?;
    }
    csv.flush()
}

pub fn total_time_line(label: &str, secs: f64) -> String {
    format!("{}: {:.2} s", label, secs)
}

pub fn write_outputs<W: Write>(w: &mut W, results: &RunResults) -> io::Result<()> {
    for r in results.records() {
        writeln!(
            w,
            "# {} {} pid={} exit={}",
            r.sequence_index,
            r.argument,
            r.pid.unwrap_or(NO_PID),
            r.outcome.exit_code()
        )?;
        let out = r.stdout.trim_end();
        if !out.is_empty() {
            writeln!(w, "{}", out)?;
        }
    }
    Ok(())
}

// RELATIVE DEVIATION OF EACH ACTUAL INTER-LAUNCH GAP FROM THE TRACE IAT.
// ITEMS WITH A ZERO TRACE IAT HAVE NO MEANINGFUL RATIO AND ARE SKIPPED.
pub fn write_iat_diff<W: Write>(w: &mut W, results: &RunResults, items: &[WorkloadItem]) -> io::Result<()> {
    let mut prev_ns = results.window().start_ns;
    for (r, item) in results.records().iter().zip(items) {
        let actual_ns = r.request_ns.saturating_sub(prev_ns);
        prev_ns = r.request_ns;
        let iat_ns = item.inter_arrival_ns();
        if iat_ns == 0 {
            continue;
        }
        let pct = (actual_ns as f64 - iat_ns as f64) / iat_ns as f64 * 100.0;
        writeln!(w, "{}: {:.2}%", r.argument, pct)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{CompletionRecord, Outcome, RunWindow};
    use crate::trace::parse_trace;

    fn results() -> RunResults {
        let window = RunWindow { start_ns: 1_000_000_000, end_ns: 1_500_000_000, ..Default::default() };
        let mk = |i: usize, arg: &str, pid: Option<i32>, req_ms: u64, ret_ms: u64, outcome| CompletionRecord {
            sequence_index: i,
            argument: arg.to_string(),
            pid,
            target_ns: window.start_ns + req_ms * 1_000_000,
            request_ns: window.start_ns + req_ms * 1_000_000,
            return_ns: window.start_ns + ret_ms * 1_000_000,
            outcome,
            stdout: pid.map(|p| format!("pid: {}\n", p)).unwrap_or_default(),
        };
        let slots = vec![
            Some(mk(0, "A", Some(11), 0, 5, Outcome::Exited(0))),
            Some(mk(1, "B", Some(12), 10, 40, Outcome::Exited(0))),
            Some(mk(2, "C", None, 40, 40, Outcome::SpawnFailed("ENOENT".into()))),
        ];
        RunResults::assemble(slots, window).unwrap()
    }

    #[test]
    fn pid_map_lines_in_order() {
        let mut buf = Vec::new();
        write_pid_map(&mut buf, &results()).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "11 A\n12 B\n-1 C\n");
    }

    #[test]
    fn timing_table_columns() {
        let mut buf = Vec::new();
        write_timings(&mut buf, &results()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "pid,argument,request_time,return_time,duration");
        assert_eq!(lines[2], "12,B,0.010000,0.040000,0.030000");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn total_time_format() {
        assert_eq!(total_time_line("burst", 12.3456), "burst: 12.35 s");
    }

    #[test]
    fn iat_diff_skips_zero_gaps() {
        let items = parse_trace("0 A\n0.01 B\n0.02 C\n").unwrap();
        let mut buf = Vec::new();
        write_iat_diff(&mut buf, &results(), &items).unwrap();
        // B: 10MS ACTUAL VS 10MS TRACE; C: 30MS ACTUAL VS 20MS TRACE
        assert_eq!(String::from_utf8(buf).unwrap(), "B: 0.00%\nC: 50.00%\n");
    }

    #[test]
    fn plan_writes_enabled_files() {
        let dir = tempfile::tempdir().unwrap();
        let items = parse_trace("0 A\n0.01 B\n0.02 C\n").unwrap();
        let mut plan = OutputPlan::new(dir.path(), "unit");
        plan.full_output = false;

        let written = plan.write(&results(), &items).unwrap();
        assert_eq!(written, vec![plan.pid_map_path(), plan.timings_path(), plan.total_time_path()]);
        assert!(!plan.outputs_path().exists());

        // total_time.txt ACCUMULATES ACROSS RUNS
        plan.write(&results(), &items).unwrap();
        let total = fs::read_to_string(plan.total_time_path()).unwrap();
        assert_eq!(total, "unit: 0.50 s\nunit: 0.50 s\n");
    }
}
