use indicatif::{ProgressBar, ProgressStyle};
use sluice_core::events::event::*;
use sluice_core::events::{EventChannel, EventConsumer};
use sluice_core::{DatumState, JobState, PipelineState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

trait Reporter {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Noop => (),
            Event::CommitEvent(e) => self.on_commit_event(e),
            Event::PipelineEvent(e) => self.on_pipeline_event(e),
            Event::JobEvent(e) => self.on_job_event(e),
            Event::DatumEvent(e) => self.on_datum_event(e),
            Event::WorkflowEvent(e) => self.on_workflow_event(e),
        }
    }

    fn on_commit_event(&mut self, _event: CommitEvent) {}
    fn on_pipeline_event(&mut self, _event: PipelineEvent) {}
    fn on_job_event(&mut self, _event: JobEvent) {}
    fn on_datum_event(&mut self, _event: DatumEvent) {}
    fn on_workflow_event(&mut self, _event: WorkflowEvent) {}
}

/// Prints job progress as events come in over the drive's event channel.
pub struct StatusReporter {
    should_stop: bool,
    started: Instant,
    event_consumer: EventConsumer,
    pb: ProgressBar,
    jobs: HashSet<String>,
    finished_jobs: HashSet<String>,
    failed_jobs: u32,
    datums_skipped: u64,
    datums_processed: u64,
}

/// A reporter running on its own thread.
pub struct RunningReporter {
    handle: std::thread::JoinHandle<()>,
}

impl RunningReporter {
    /// Wait for the reporter to see the drive shut down.
    pub async fn wait(self) {
        while !self.handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl StatusReporter {
    pub fn new(event_channel: Arc<EventChannel>) -> StatusReporter {
        let style = ProgressStyle::default_bar()
            .template("{prefix:>12.cyan.bold} [{bar:25}] {pos}/{len} {wide_msg}")
            .progress_chars("=> ");

        let pb = ProgressBar::new(0);
        pb.set_style(style);
        pb.set_prefix("Running");

        StatusReporter {
            should_stop: false,
            started: Instant::now(),
            event_consumer: event_channel.consumer(),
            pb,
            jobs: HashSet::default(),
            finished_jobs: HashSet::default(),
            failed_jobs: 0,
            datums_skipped: 0,
            datums_processed: 0,
        }
    }

    pub fn start(mut self) -> RunningReporter {
        let handle = std::thread::spawn(move || loop {
            self.event_consumer.fetch();
            match self.event_consumer.pop() {
                Some(event) => {
                    debug!("{:#?}", event);
                    self.handle_event(event);
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
            if self.should_stop {
                break;
            }
        });
        RunningReporter { handle }
    }

    fn print_summary(&self) {
        let elapsed = humantime::format_duration(Duration::from_millis(
            self.started.elapsed().as_millis() as u64,
        ));
        let line = if self.failed_jobs > 0 {
            format!(
                "{:>12} {} of {} jobs in {} ({} datums processed, {} skipped)",
                console::style("Failed").red().bold(),
                self.failed_jobs,
                self.finished_jobs.len(),
                elapsed,
                self.datums_processed,
                self.datums_skipped,
            )
        } else {
            format!(
                "{:>12} {} jobs in {} ({} datums processed, {} skipped)",
                console::style("Finished").green().bold(),
                self.finished_jobs.len(),
                elapsed,
                self.datums_processed,
                self.datums_skipped,
            )
        };
        self.pb.println(line);
    }
}

impl Reporter for StatusReporter {
    fn on_commit_event(&mut self, event: CommitEvent) {
        if let CommitEvent::CommitsDeleted { repo, commits } = event {
            let line = format!(
                "{:>12} {} commits of {}",
                console::style("Deleted").yellow(),
                commits.len(),
                repo
            );
            self.pb.println(line);
        }
    }

    fn on_pipeline_event(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::PipelineCreated { pipeline, version } => {
                let line = format!(
                    "{:>12} {} (v{})",
                    console::style("Created").blue(),
                    pipeline,
                    version
                );
                self.pb.println(line);
            }
            PipelineEvent::PipelineStateChanged {
                pipeline,
                to: PipelineState::Failure,
                reason,
                ..
            } => {
                let line = format!(
                    "{:>12} {} {}",
                    console::style("Failed").red().bold(),
                    pipeline,
                    reason.unwrap_or_default()
                );
                self.pb.println(line);
            }
            _ => (),
        }
    }

    fn on_job_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::JobCreated { job, .. } => {
                if self.jobs.insert(job) {
                    self.pb.set_length(self.jobs.len() as u64);
                }
            }
            JobEvent::JobStateChanged {
                pipeline,
                job,
                state,
                reason,
            } if state.is_terminal() => {
                if !self.finished_jobs.insert(job.clone()) {
                    return;
                }
                let status = match state {
                    JobState::Success => console::style("Succeeded").green().bold(),
                    JobState::Killed => console::style("Killed").yellow().bold(),
                    _ => {
                        self.failed_jobs += 1;
                        console::style("Failed").red().bold()
                    }
                };
                let line = format!(
                    "{:>12} {} {} {}",
                    status,
                    pipeline,
                    console::style(&job).dim(),
                    reason.unwrap_or_default()
                );
                self.pb.println(line);
                self.pb.inc(1);
            }
            JobEvent::JobStateChanged { pipeline, .. } => {
                self.pb.set_message(pipeline);
            }
        }
    }

    fn on_datum_event(&mut self, event: DatumEvent) {
        match event {
            DatumEvent::DatumAttemptFailed {
                datum,
                attempt,
                error,
                ..
            } => {
                let line = format!(
                    "{:>12} datum {} (attempt {}): {}",
                    console::style("Retrying").yellow(),
                    datum,
                    attempt,
                    error
                );
                self.pb.println(line);
            }
            DatumEvent::DatumCompleted { state, .. } => match state {
                DatumState::Skipped => self.datums_skipped += 1,
                DatumState::Success | DatumState::Failed => self.datums_processed += 1,
                DatumState::Pending => (),
            },
            DatumEvent::DatumStarted { .. } => (),
        }
    }

    fn on_workflow_event(&mut self, event: WorkflowEvent) {
        if let WorkflowEvent::Shutdown = event {
            self.pb.finish_and_clear();
            self.print_summary();
            self.should_stop = true;
        }
    }
}
