use super::{create_pipelines, load_specs};
use crate::flags::Flags;
use sluice_core::*;
use std::collections::BTreeSet;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "validate",
    setting = structopt::clap::AppSettings::ColoredHelp,
    about = "Checks that a set of pipeline specs can be created together"
)]
pub struct ValidateCommand {
    #[structopt(help = r"The pipeline spec files to check.

Repos read by a spec that no other spec produces are assumed to exist.
")]
    pipelines: Vec<PathBuf>,

    #[structopt(flatten)]
    flags: Flags,
}

impl ValidateCommand {
    pub async fn run(self) -> Result<(), anyhow::Error> {
        let specs = load_specs(&self.pipelines)?;
        let drive = SluiceDrive::with_memory(self.flags.config()?).await?;

        for repo in source_repos(&specs) {
            drive.create_repo(&repo).await?;
        }
        let result = create_pipelines(&drive, specs).await;
        drive.shutdown().await;

        let green_bold = console::Style::new().green().bold();
        for info in result? {
            println!(
                "{:>12} {} ({} workers on {} nodes)",
                green_bold.apply_to("Valid"),
                info.name(),
                ParallelismSpec::worker_count(
                    info.spec.parallelism_spec.as_ref(),
                    drive.config().cluster_nodes()
                ),
                drive.config().cluster_nodes(),
            );
        }
        Ok(())
    }
}

/// Atom inputs that none of the specs write to.
fn source_repos(specs: &[PipelineSpec]) -> BTreeSet<String> {
    let outputs: BTreeSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    specs
        .iter()
        .flat_map(|spec| atom_repos(&spec.input))
        .filter(|repo| !outputs.contains(repo.as_str()))
        .collect()
}

fn atom_repos(input: &Input) -> Vec<String> {
    match input {
        Input::Atom(atom) => vec![atom.repo.clone()],
        Input::Cross(inputs) | Input::Union(inputs) => inputs.iter().flat_map(atom_repos).collect(),
        Input::Cron(_) | Input::Git(_) => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_repos_no_spec_produces_are_sources() {
        let edges = PipelineSpec::new(
            "edges",
            Transform::shell(["true"]),
            Input::Cross(vec![Input::atom("images", "/*"), Input::atom("labels", "/")]),
        );
        let montage = PipelineSpec::new(
            "montage",
            Transform::shell(["true"]),
            Input::Union(vec![Input::atom("edges", "/"), Input::atom("images", "/")]),
        );
        let sources: Vec<String> = source_repos(&[montage, edges]).into_iter().collect();
        assert_eq!(sources, vec!["images", "labels"]);
    }
}
