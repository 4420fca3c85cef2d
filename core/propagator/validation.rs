use super::pipeline_graph::PipelineGraph;
use crate::cron;
use crate::graph::is_valid_repo_name;
use crate::model::{Input, PipelineSpec};
use crate::planner::{validate_glob, PlannerError};
use std::collections::{BTreeSet, HashSet};
use thiserror::*;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{pipeline:?} is not a valid pipeline name, only letters, numbers, `-` and `_` are allowed")]
    InvalidName { pipeline: String },

    #[error("Pipeline {pipeline} already exists, create it with update to change it")]
    AlreadyExists { pipeline: String },

    #[error("Pipeline {pipeline} has an empty transform command")]
    EmptyCommand { pipeline: String },

    #[error("Pipeline {pipeline} cannot read its own output repo")]
    SelfReference { pipeline: String },

    #[error("Pipeline {pipeline} would make the pipeline graph cyclic")]
    Cycle { pipeline: String },

    #[error("Pipeline {pipeline} reads repo {repo}, which does not exist")]
    UnknownRepo { pipeline: String, repo: String },

    #[error("Pipeline {pipeline} uses the input name {name:?} more than once under the same cross or union, give them distinct names")]
    DuplicateInputName { pipeline: String, name: String },

    #[error("Pipeline {pipeline} has more than one git input named {name:?}")]
    DuplicateGitName { pipeline: String, name: String },

    #[error("Pipeline {pipeline} has git input {url:?}, but clone urls must begin with https:// and end with .git")]
    InvalidGitUrl { pipeline: String, url: String },

    #[error("Pipeline {pipeline} has an invalid cron input: {err}")]
    InvalidCron {
        pipeline: String,
        err: cron::CronError,
    },

    #[error("Pipeline {pipeline} has an invalid glob: {err}")]
    InvalidGlob { pipeline: String, err: PlannerError },

    #[error("Incremental pipeline {pipeline} has inputs that share the upstream repo {ancestor}")]
    NonLinearIncremental { pipeline: String, ancestor: String },
}

/// Check a pipeline spec against the pipelines and repos that already exist.
///
/// `existing` holds every current pipeline spec, and `repos` every repo in the commit graph.
pub fn validate(
    spec: &PipelineSpec,
    update: bool,
    existing: &[PipelineSpec],
    repos: &BTreeSet<String>,
) -> Result<(), ValidationError> {
    let pipeline = spec.name.clone();

    if !is_valid_repo_name(&spec.name) {
        return Err(ValidationError::InvalidName { pipeline });
    }

    if !update && existing.iter().any(|p| p.name == spec.name) {
        return Err(ValidationError::AlreadyExists { pipeline });
    }

    if spec.transform.cmd.is_empty() || spec.transform.cmd[0].trim().is_empty() {
        return Err(ValidationError::EmptyCommand { pipeline });
    }

    let mut git_names = HashSet::new();
    for git in spec.input.gits() {
        if !git.url.starts_with("https://") || !git.url.ends_with(".git") {
            return Err(ValidationError::InvalidGitUrl {
                pipeline,
                url: git.url.clone(),
            });
        }
        if !git_names.insert(git.effective_name()) {
            return Err(ValidationError::DuplicateGitName {
                pipeline,
                name: git.effective_name(),
            });
        }
    }

    for cron_input in spec.input.crons() {
        cron::parse_schedule(&cron_input.spec).map_err(|err| ValidationError::InvalidCron {
            pipeline: pipeline.clone(),
            err,
        })?;
    }

    check_distinct_names(&spec.input, &spec.name)?;

    let leaves = spec.input.leaves(&spec.name);
    for leaf in &leaves {
        validate_glob(&leaf.glob).map_err(|err| ValidationError::InvalidGlob {
            pipeline: pipeline.clone(),
            err,
        })?;
    }

    if leaves.iter().any(|leaf| leaf.repo == spec.name) {
        return Err(ValidationError::SelfReference { pipeline });
    }

    // Cron and git inputs get their backing repos created along with the pipeline.
    let others: Vec<&PipelineSpec> = existing.iter().filter(|p| p.name != spec.name).collect();
    for atom in atom_repos(&spec.input) {
        let known = repos.contains(&atom) || others.iter().any(|p| p.name == atom);
        if !known {
            return Err(ValidationError::UnknownRepo {
                pipeline,
                repo: atom,
            });
        }
    }

    let mut graph = PipelineGraph::build(others.iter().copied())
        .map_err(|_| ValidationError::Cycle {
            pipeline: pipeline.clone(),
        })?;
    graph.add(spec).map_err(|_| ValidationError::Cycle {
        pipeline: pipeline.clone(),
    })?;

    if spec.incremental {
        check_linear_provenance(spec, &graph)?;
    }

    Ok(())
}

fn atom_repos(input: &Input) -> Vec<String> {
    match input {
        Input::Atom(atom) => vec![atom.repo.clone()],
        Input::Cron(_) | Input::Git(_) => vec![],
        Input::Cross(inputs) | Input::Union(inputs) => inputs.iter().flat_map(atom_repos).collect(),
    }
}

/// Every leaf under a cross or a union is mounted next to its siblings, so their names have to
/// be distinct.
fn check_distinct_names(input: &Input, pipeline: &str) -> Result<(), ValidationError> {
    if let Input::Cross(inputs) | Input::Union(inputs) = input {
        let mut seen = HashSet::new();
        for name in input.names(pipeline) {
            if !seen.insert(name.clone()) {
                return Err(ValidationError::DuplicateInputName {
                    pipeline: pipeline.to_string(),
                    name,
                });
            }
        }
        for input in inputs {
            check_distinct_names(input, pipeline)?;
        }
    }
    Ok(())
}

/// An incremental pipeline seeds every job from its previous output, which only makes sense when
/// its inputs do not reach the same data through different paths.
fn check_linear_provenance(
    spec: &PipelineSpec,
    graph: &PipelineGraph,
) -> Result<(), ValidationError> {
    let children = match &spec.input {
        Input::Cross(inputs) | Input::Union(inputs) => inputs,
        _ => return Ok(()),
    };

    // Direct reads are told apart by branch, since two branches of one repo share no history
    // the propagator follows. Repos reached through pipelines are compared by name.
    let mut seen_reads: BTreeSet<(String, String)> = BTreeSet::new();
    let mut seen_upstream: BTreeSet<String> = BTreeSet::new();
    for child in children {
        let mut reads = BTreeSet::new();
        let mut upstream = BTreeSet::new();
        for leaf in child.leaves(&spec.name) {
            upstream.extend(graph.upstream_repos(&leaf.repo));
            reads.insert((leaf.repo, leaf.branch));
        }

        let read_repos = |reads: &BTreeSet<(String, String)>| -> BTreeSet<String> {
            reads.iter().map(|(repo, _)| repo.clone()).collect()
        };
        let ancestor = reads
            .intersection(&seen_reads)
            .map(|(repo, _)| repo.clone())
            .chain(upstream.intersection(&seen_upstream).cloned())
            .chain(upstream.intersection(&read_repos(&seen_reads)).cloned())
            .chain(read_repos(&reads).intersection(&seen_upstream).cloned())
            .next();
        if let Some(ancestor) = ancestor {
            return Err(ValidationError::NonLinearIncremental {
                pipeline: spec.name.clone(),
                ancestor,
            });
        }
        seen_reads.extend(reads);
        seen_upstream.extend(upstream);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AtomInput, Transform};

    fn pipeline(name: &str, input: Input) -> PipelineSpec {
        PipelineSpec::new(name, Transform::shell(["true"]), input)
    }

    fn repos(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn plain_pipelines_are_accepted() {
        let spec = pipeline("edges", Input::atom("images", "/*"));
        validate(&spec, false, &[], &repos(&["images"])).unwrap();
    }

    #[test]
    fn pipelines_cannot_read_their_own_output() {
        let spec = pipeline("edges", Input::atom("edges", "/*"));
        let err = validate(&spec, false, &[], &repos(&["edges"])).unwrap_err();
        assert_matches!(err, ValidationError::SelfReference { .. });
    }

    #[test]
    fn existing_names_need_an_update() {
        let spec = pipeline("edges", Input::atom("images", "/*"));
        let existing = vec![spec.clone()];
        let err = validate(&spec, false, &existing, &repos(&["images", "edges"])).unwrap_err();
        assert_matches!(err, ValidationError::AlreadyExists { .. });
        validate(&spec, true, &existing, &repos(&["images", "edges"])).unwrap();
    }

    #[test]
    fn unknown_repos_are_rejected() {
        let spec = pipeline("edges", Input::atom("nope", "/*"));
        let err = validate(&spec, false, &[], &repos(&[])).unwrap_err();
        assert_matches!(err, ValidationError::UnknownRepo { ref repo, .. } if repo == "nope");
    }

    #[test]
    fn empty_commands_are_rejected() {
        let mut spec = pipeline("edges", Input::atom("images", "/*"));
        spec.transform.cmd.clear();
        let err = validate(&spec, false, &[], &repos(&["images"])).unwrap_err();
        assert_matches!(err, ValidationError::EmptyCommand { .. });
    }

    #[test]
    fn crosses_need_distinct_names() {
        let same = pipeline(
            "edges",
            Input::Cross(vec![Input::atom("images", "/*"), Input::atom("images", "/")]),
        );
        let err = validate(&same, false, &[], &repos(&["images"])).unwrap_err();
        assert_matches!(err, ValidationError::DuplicateInputName { ref name, .. } if name == "images");

        let aliased = pipeline(
            "edges",
            Input::Cross(vec![
                Input::named_atom("left", "images", "/*"),
                Input::named_atom("right", "images", "/"),
            ]),
        );
        validate(&aliased, false, &[], &repos(&["images"])).unwrap();
    }

    #[test]
    fn git_inputs_need_https_urls_and_distinct_names() {
        let bad_url = pipeline("edges", Input::git("git@github.com:foo/bar.git", None));
        assert_matches!(
            validate(&bad_url, false, &[], &repos(&[])).unwrap_err(),
            ValidationError::InvalidGitUrl { .. }
        );

        let url = "https://github.com/pachyderm/test-artifacts.git";
        let twice = pipeline(
            "edges",
            Input::Union(vec![Input::git(url, None), Input::git(url, None)]),
        );
        assert_matches!(
            validate(&twice, false, &[], &repos(&[])).unwrap_err(),
            ValidationError::DuplicateGitName { .. }
        );

        let renamed = pipeline(
            "edges",
            Input::Union(vec![Input::git(url, Some("one")), Input::git(url, Some("two"))]),
        );
        validate(&renamed, false, &[], &repos(&[])).unwrap();
    }

    #[test]
    fn only_every_cron_schedules_are_accepted() {
        let spec = pipeline("edges", Input::cron("tick", "0 * * * *"));
        assert_matches!(
            validate(&spec, false, &[], &repos(&[])).unwrap_err(),
            ValidationError::InvalidCron { .. }
        );
        let spec = pipeline("edges", Input::cron("tick", "@every 1m"));
        validate(&spec, false, &[], &repos(&[])).unwrap();
    }

    #[test]
    fn bad_globs_are_rejected() {
        let spec = pipeline("edges", Input::atom("images", "/[a"));
        assert_matches!(
            validate(&spec, false, &[], &repos(&["images"])).unwrap_err(),
            ValidationError::InvalidGlob { .. }
        );
    }

    #[test]
    fn updates_that_close_a_loop_are_rejected() {
        let b = pipeline("b", Input::atom("a", "/*"));
        let c = pipeline("c", Input::atom("b", "/*"));
        let looped = pipeline("b", Input::atom("c", "/*"));
        let err = validate(&looped, true, &[b, c], &repos(&["a", "b", "c"])).unwrap_err();
        assert_matches!(err, ValidationError::Cycle { .. });
    }

    #[test]
    fn incremental_pipelines_cannot_join_a_diamond() {
        let existing = vec![
            pipeline("b", Input::atom("a", "/*")),
            pipeline("c", Input::atom("a", "/*")),
        ];
        let all = repos(&["a", "b", "c"]);
        let mut d = pipeline(
            "d",
            Input::Cross(vec![Input::atom("b", "/*"), Input::atom("c", "/*")]),
        );
        validate(&d, false, &existing, &all).unwrap();

        d.incremental = true;
        let err = validate(&d, false, &existing, &all).unwrap_err();
        assert_matches!(err, ValidationError::NonLinearIncremental { ref ancestor, .. } if ancestor == "a");
    }

    #[test]
    fn incremental_pipelines_can_read_two_branches_of_one_repo() {
        let branch = |name: &str, branch: &str| {
            let mut atom = AtomInput::named(name, "data", "/*");
            atom.branch = branch.to_string();
            Input::Atom(atom)
        };
        let mut spec = pipeline(
            "joined",
            Input::Cross(vec![branch("branch-a", "branchA"), branch("branch-b", "branchB")]),
        );
        spec.incremental = true;
        validate(&spec, false, &[], &repos(&["data"])).unwrap();

        let mut same = pipeline(
            "joined",
            Input::Cross(vec![branch("branch-a", "branchA"), branch("branch-b", "branchA")]),
        );
        same.incremental = true;
        let err = validate(&same, false, &[], &repos(&["data"])).unwrap_err();
        assert_matches!(err, ValidationError::NonLinearIncremental { ref ancestor, .. } if ancestor == "data");
    }
}
