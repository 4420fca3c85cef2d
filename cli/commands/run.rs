use super::{create_pipelines, load_specs};
use crate::flags::Flags;
use crate::reporter::StatusReporter;
use anyhow::{anyhow, bail, Context};
use futures::StreamExt;
use sluice_core::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use structopt::StructOpt;
use tracing::{debug, info};

/// A local directory to commit into a repo, written as `repo=path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDir {
    repo: String,
    path: PathBuf,
}

impl FromStr for InputDir {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((repo, path)) if !repo.is_empty() && !path.is_empty() => Ok(Self {
                repo: repo.to_string(),
                path: PathBuf::from(path),
            }),
            _ => Err(anyhow!("Expected an input like `repo=path`, got {:?}", s)),
        }
    }
}

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "run",
    setting = structopt::clap::AppSettings::ColoredHelp,
    about = "Runs pipelines over local directories until every output is sealed"
)]
pub struct RunCommand {
    #[structopt(help = r"The pipeline spec files to create.

Specs are JSON documents. They can be given in any order, pipelines reading
the output of other pipelines are created after them.
")]
    pipelines: Vec<PathBuf>,

    #[structopt(
        help = r"A directory to commit into a repo, as `repo=path`.

Every file under the directory is committed with its path relative to it.
Can be given more than once.
",
        short = "i",
        long = "input"
    )]
    inputs: Vec<InputDir>,

    #[structopt(
        help = r"Copy every pipeline's output into <out>/<pipeline>.",
        short = "o",
        long = "out"
    )]
    out: Option<PathBuf>,

    #[structopt(
        help = r"Give up if the outputs are not all sealed after this long, e.g. 10m.",
        long = "deadline",
        parse(try_from_str = humantime::parse_duration)
    )]
    deadline: Option<Duration>,

    #[structopt(help = r"Print what user code wrote once the run is over.", long = "logs")]
    print_logs: bool,

    #[structopt(flatten)]
    flags: Flags,
}

impl RunCommand {
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let config = self.flags.config()?;
        let drive = SluiceDrive::with_memory(config).await?;
        let reporter = StatusReporter::new(drive.event_channel()).start();

        let result = self.execute(&drive).await;

        drive.shutdown().await;
        reporter.wait().await;
        result
    }

    async fn execute(&self, drive: &SluiceDrive) -> Result<(), anyhow::Error> {
        let specs = load_specs(&self.pipelines)?;

        for input in &self.inputs {
            drive.create_repo(&input.repo).await?;
        }
        create_pipelines(drive, specs).await?;

        let mut commits = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let commit = commit_dir(drive, &input.repo, &input.path).await?;
            info!("Committed {:?} into {} as {}", input.path, input.repo, commit.id);
            commits.push(commit.id);
        }

        let jobs = drive.flush_job_all(commits, None, self.deadline).await?;

        if let Some(out) = &self.out {
            for pipeline in drive.list_pipeline() {
                export_output(drive, pipeline.name(), &out.join(pipeline.name())).await?;
            }
        }

        if self.print_logs {
            let filter = LogFilter::default();
            let mut lines = drive.get_logs(filter, false);
            while let Some(line) = lines.next().await {
                println!("{} {}", console::style(&line.pipeline).dim(), line.message);
            }
        }

        let failed: Vec<&JobInfo> = jobs
            .iter()
            .filter(|job| job.state != JobState::Success)
            .collect();
        if !failed.is_empty() {
            for job in &failed {
                eprintln!(
                    "{} {} {}",
                    console::style(&job.pipeline).red().bold(),
                    job.state,
                    job.reason.as_deref().unwrap_or_default()
                );
            }
            bail!("{} of {} jobs did not succeed", failed.len(), jobs.len());
        }
        Ok(())
    }
}

/// Commit every file under `dir` into `repo` in a single commit.
async fn commit_dir(drive: &SluiceDrive, repo: &str, dir: &Path) -> Result<CommitInfo, anyhow::Error> {
    let commit = drive.start_commit(repo, DEFAULT_BRANCH).await?;
    let walker = ignore::WalkBuilder::new(dir)
        .hidden(false)
        .git_ignore(false)
        .build();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("{:?} is not under {:?}", entry.path(), dir))?;
        let data = tokio::fs::read(entry.path()).await?;
        let path = format!("/{}", relative.to_string_lossy());
        debug!("Putting {} into {}", path, repo);
        drive.put_file(commit.id, &path, &data).await?;
    }
    Ok(drive.finish_commit(commit.id).await?)
}

/// Write the newest output commit of a pipeline out to `dest`.
async fn export_output(drive: &SluiceDrive, pipeline: &str, dest: &Path) -> Result<(), anyhow::Error> {
    let head = match drive.list_commit(pipeline).await?.into_iter().next() {
        Some(head) => head,
        None => return Ok(()),
    };
    for (path, _) in head.tree.iter() {
        let data = drive.get_file(head.id, path).await?;
        let target = dest.join(path.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_are_split_on_the_first_equals_sign() {
        let input: InputDir = "data=./some=dir".parse().unwrap();
        assert_eq!(input.repo, "data");
        assert_eq!(input.path, PathBuf::from("./some=dir"));
    }

    #[test]
    fn inputs_need_both_a_repo_and_a_path() {
        assert!("data".parse::<InputDir>().is_err());
        assert!("=./dir".parse::<InputDir>().is_err());
        assert!("data=".parse::<InputDir>().is_err());
    }
}
