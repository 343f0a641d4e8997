//! Run artifacts: one directory per run with per-iteration snapshots, a
//! JSON-lines iteration log and the final status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::error::SinkError;
use crate::profile::Masker;
use crate::types::{CandidateOutcome, FlaggedField, FlowState, RunResult, Snapshot};

pub const ITERATIONS_FILE: &str = "iterations.jsonl";
pub const STATUS_FILE: &str = "status.json";
pub const RUN_FILE: &str = "run.json";
pub const SNAPSHOT_DIR: &str = "snapshots";

/// One line of `iterations.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub at: DateTime<Utc>,
    pub url: String,
    pub state: FlowState,
    pub evidence: String,
    /// Every candidate executed this iteration, in order.
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub flagged: Vec<FlaggedField>,
}

impl IterationRecord {
    pub fn succeeded(&self) -> bool {
        self.actions.last().is_some_and(|a| a.outcome.success())
    }
}

/// One executed candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Description of the candidate, already redacted.
    pub action: String,
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStart {
    pub run_id: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
}

/// Shared by every run in the process. Each run brings its own masker since
/// runs may use different profiles.
pub trait ArtifactSink: Send + Sync {
    fn start_run(&self, start: &RunStart, masker: &Masker) -> Result<(), SinkError>;
    fn record_iteration(&self, run_id: &str, record: &IterationRecord, snapshot: &Snapshot) -> Result<(), SinkError>;
    fn finish_run(&self, result: &RunResult) -> Result<(), SinkError>;
}

#[derive(Clone)]
struct RunFiles {
    dir: PathBuf,
    masker: Masker,
}

pub struct FsSink {
    root: PathBuf,
    save_snapshots: bool,
    runs: Mutex<HashMap<String, RunFiles>>,
}

impl FsSink {
    pub fn new(root: impl Into<PathBuf>, save_snapshots: bool) -> Self {
        Self {
            root: root.into(),
            save_snapshots,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> Option<PathBuf> {
        self.files(run_id).map(|f| f.dir)
    }

    fn files(&self, run_id: &str) -> Option<RunFiles> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    fn run(&self, run_id: &str) -> Result<RunFiles, SinkError> {
        self.files(run_id).ok_or_else(|| SinkError::UnknownRun(run_id.to_string()))
    }
}

fn write_json<T: Serialize>(masker: &Masker, path: &Path, value: &T) -> Result<(), SinkError> {
    let mut doc = serde_json::to_value(value)?;
    masker.mask_json(&mut doc);
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &doc)?;
    Ok(())
}

impl ArtifactSink for FsSink {
    fn start_run(&self, start: &RunStart, masker: &Masker) -> Result<(), SinkError> {
        let short = start.run_id.get(..8).unwrap_or(&start.run_id);
        let dir = self
            .root
            .join(format!("{}-{short}", start.started_at.format("%Y%m%d-%H%M%S")));
        fs::create_dir_all(dir.join(SNAPSHOT_DIR))?;
        write_json(masker, &dir.join(RUN_FILE), start)?;
        debug!(run_id = %start.run_id, dir = %dir.display(), "artifact directory created");
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).insert(
            start.run_id.clone(),
            RunFiles {
                dir,
                masker: masker.clone(),
            },
        );
        Ok(())
    }

    fn record_iteration(&self, run_id: &str, record: &IterationRecord, snapshot: &Snapshot) -> Result<(), SinkError> {
        let run = self.run(run_id)?;
        if self.save_snapshots {
            let path = run.dir.join(SNAPSHOT_DIR).join(format!("iter_{:03}.json", record.iteration));
            write_json(&run.masker, &path, snapshot)?;
        }
        let mut line = serde_json::to_value(record)?;
        run.masker.mask_json(&mut line);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run.dir.join(ITERATIONS_FILE))?;
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
        Ok(())
    }

    fn finish_run(&self, result: &RunResult) -> Result<(), SinkError> {
        let run = self.run(&result.run_id)?;
        write_json(&run.masker, &run.dir.join(STATUS_FILE), result)
    }
}

/// Everything persisted for one run, as read back by `agent report`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub start: Option<RunStart>,
    pub result: Option<RunResult>,
    pub iterations: Vec<IterationRecord>,
    pub snapshots: usize,
}

impl RunReport {
    pub fn load(dir: &Path) -> Result<Self, SinkError> {
        let start = read_optional(&dir.join(RUN_FILE))?;
        let result = read_optional(&dir.join(STATUS_FILE))?;
        let mut iterations = Vec::new();
        let log = dir.join(ITERATIONS_FILE);
        if log.exists() {
            for line in BufReader::new(File::open(&log)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                iterations.push(serde_json::from_str(&line)?);
            }
        }
        let snapshots = match fs::read_dir(dir.join(SNAPSHOT_DIR)) {
            Ok(entries) => entries.filter_map(Result::ok).count(),
            Err(_) => 0,
        };
        if start.is_none() && result.is_none() && iterations.is_empty() {
            return Err(SinkError::UnknownRun(dir.display().to_string()));
        }
        Ok(Self {
            start,
            result,
            iterations,
            snapshots,
        })
    }

    /// States visited, collapsing consecutive repeats.
    pub fn state_path(&self) -> Vec<FlowState> {
        let mut path: Vec<FlowState> = Vec::new();
        for record in &self.iterations {
            if path.last() != Some(&record.state) {
                path.push(record.state);
            }
        }
        path
    }

    pub fn failed_actions(&self) -> usize {
        self.iterations
            .iter()
            .flat_map(|r| &r.actions)
            .filter(|a| !a.outcome.success())
            .count()
    }
}

fn read_optional<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, SinkError> {
    if !path.exists() {
        return Ok(None);
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(Some(serde_json::from_reader(reader)?))
}

/// Keeps everything in memory. Used by tests and by the server for runs
/// started without an artifact directory.
#[derive(Default)]
pub struct MemorySink {
    inner: Mutex<MemoryRuns>,
}

#[derive(Default)]
struct MemoryRuns {
    started: Vec<RunStart>,
    iterations: HashMap<String, Vec<IterationRecord>>,
    results: HashMap<String, RunResult>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iterations(&self, run_id: &str) -> Vec<IterationRecord> {
        let runs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        runs.iterations.get(run_id).cloned().unwrap_or_default()
    }

    pub fn result(&self, run_id: &str) -> Option<RunResult> {
        let runs = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        runs.results.get(run_id).cloned()
    }

    pub fn started(&self) -> Vec<RunStart> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).started.clone()
    }
}

impl ArtifactSink for MemorySink {
    fn start_run(&self, start: &RunStart, _masker: &Masker) -> Result<(), SinkError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .started
            .push(start.clone());
        Ok(())
    }

    fn record_iteration(&self, run_id: &str, record: &IterationRecord, _snapshot: &Snapshot) -> Result<(), SinkError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iterations
            .entry(run_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn finish_run(&self, result: &RunResult) -> Result<(), SinkError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .results
            .insert(result.run_id.clone(), result.clone());
        Ok(())
    }
}
