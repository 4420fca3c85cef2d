//! Fixtures shared by the unit tests of the crate.
//!
use crate::executor::{DatumExecutor, ExecutionOutcome, ExecutorError, Invocation};
use crate::model::*;
use crate::objects::ObjectStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub(crate) fn job_info(pipeline: &str) -> JobInfo {
    JobInfo {
        id: JobId::next(),
        pipeline: pipeline.to_string(),
        pipeline_version: 1,
        inputs: vec![],
        output_commit: CommitId::next(),
        state: JobState::Starting,
        reason: None,
        created: Utc::now(),
        started: None,
        finished: None,
        data_total: 0,
        data_processed: 0,
        data_skipped: 0,
        data_failed: 0,
        retries: 0,
        workers: 1,
        worker_status: vec![],
        stats: JobStats::default(),
    }
}

/// Store `content` and wrap it in a single-file datum read through `input`.
pub(crate) async fn datum(
    objects: &dyn ObjectStore,
    input: &str,
    path: &str,
    content: &[u8],
) -> Datum {
    let object = objects.put(content).await.unwrap();
    Datum::from_files(vec![DatumFile {
        input: input.to_string(),
        repo: input.to_string(),
        commit: CommitId::default(),
        path: path.to_string(),
        entry: FileEntry::single(object),
    }])
}

/// What a [ScriptedExecutor] does for one invocation.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Write these files into the output directory.
    Write(Vec<(String, Vec<u8>)>),
    Fail(String),
    Sleep(Duration),
}

type ScriptFn = dyn Fn(&Invocation) -> Script + Send + Sync;

/// A datum executor that follows a script instead of spawning processes.
pub(crate) struct ScriptedExecutor {
    script: Box<ScriptFn>,
    pub(crate) calls: AtomicUsize,
    running: AtomicUsize,
    pub(crate) max_running: AtomicUsize,
}

impl ScriptedExecutor {
    pub(crate) fn new<F>(script: F) -> Self
    where
        F: Fn(&Invocation) -> Script + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Copy every input file of the datum into the output directory.
    pub(crate) fn copy() -> Self {
        Self::new(|invocation| {
            let mut files = vec![];
            for input in &invocation.inputs {
                let dir = invocation.root.join(input);
                for entry in walk(&dir) {
                    let relative = entry.strip_prefix(&dir).unwrap().to_string_lossy().to_string();
                    files.push((relative, std::fs::read(&entry).unwrap()));
                }
            }
            Script::Write(files)
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = vec![];
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk(&path));
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[async_trait]
impl DatumExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let started = Instant::now();
        let outcome = match (self.script)(invocation) {
            Script::Write(files) => {
                for (path, data) in files {
                    let dest = invocation.out_dir().join(path.trim_start_matches('/'));
                    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
                    std::fs::write(dest, data).unwrap();
                }
                ExecutionOutcome::Succeeded {
                    elapsed: started.elapsed(),
                    output: vec![format!("processed {}", invocation.datum)],
                }
            }
            Script::Fail(error) => ExecutionOutcome::Failed {
                elapsed: started.elapsed(),
                error,
                output: vec![],
            },
            Script::Sleep(duration) => {
                let limit = invocation.timeout.unwrap_or(duration).min(duration);
                tokio::select! {
                    _ = tokio::time::sleep(limit) => match invocation.timeout {
                        Some(timeout) if timeout < duration => ExecutionOutcome::TimedOut {
                            timeout,
                            output: vec![],
                        },
                        _ => ExecutionOutcome::Succeeded {
                            elapsed: started.elapsed(),
                            output: vec![],
                        },
                    },
                    _ = cancel.cancelled() => ExecutionOutcome::Cancelled,
                }
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}
