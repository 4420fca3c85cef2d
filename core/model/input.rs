use crate::config::DEFAULT_BRANCH;
use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

/// Reads a repo, splitting its content into datums with a glob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomInput {
    /// The alias under which this input is mounted. Defaults to the repo name.
    #[serde(default)]
    pub name: Option<String>,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub glob: String,
}

impl AtomInput {
    pub fn new(repo: impl Into<String>, glob: impl Into<String>) -> Self {
        Self {
            name: None,
            repo: repo.into(),
            branch: default_branch(),
            glob: glob.into(),
        }
    }

    pub fn named(name: impl Into<String>, repo: impl Into<String>, glob: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(repo, glob)
        }
    }
}

/// Ticks on a schedule, committing the tick time into a backing repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronInput {
    pub name: String,
    /// Only `@every <duration>` schedules are understood.
    pub spec: String,
    #[serde(default, with = "crate::util::serde::option_iso8601")]
    pub start: Option<DateTime<Utc>>,
}

/// Reads a git repository. Pushes are ingested into a backing repo by an external hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitInput {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl GitInput {
    /// The name this input is mounted under, which is also the name of its backing repo. Defaults
    /// to the last path segment of the url, without `.git`.
    pub fn effective_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let last = self
            .url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default();
        last.trim_end_matches(".git").to_string()
    }
}

/// The input expression of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    Atom(AtomInput),
    Cross(Vec<Input>),
    Union(Vec<Input>),
    Cron(CronInput),
    Git(GitInput),
}

/// A leaf of an input expression, resolved to the repo and branch that back it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputLeaf {
    pub name: String,
    pub repo: String,
    pub branch: String,
    pub glob: String,
}

impl Input {
    pub fn atom(repo: impl Into<String>, glob: impl Into<String>) -> Self {
        Input::Atom(AtomInput::new(repo, glob))
    }

    pub fn named_atom(
        name: impl Into<String>,
        repo: impl Into<String>,
        glob: impl Into<String>,
    ) -> Self {
        Input::Atom(AtomInput::named(name, repo, glob))
    }

    pub fn cron(name: impl Into<String>, spec: impl Into<String>) -> Self {
        Input::Cron(CronInput {
            name: name.into(),
            spec: spec.into(),
            start: None,
        })
    }

    pub fn git(url: impl Into<String>, name: Option<&str>) -> Self {
        Input::Git(GitInput {
            url: url.into(),
            name: name.map(str::to_string),
            branch: default_branch(),
        })
    }

    /// The repo that backs a cron input of a pipeline.
    pub fn cron_repo(pipeline: &str, cron_name: &str) -> String {
        format!("{}_{}", pipeline, cron_name)
    }

    /// Every leaf of this expression in depth-first order. The order is the one used to line up
    /// a job's input commits with the expression.
    pub fn leaves(&self, pipeline: &str) -> Vec<InputLeaf> {
        let mut leaves = vec![];
        self.collect_leaves(pipeline, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, pipeline: &str, leaves: &mut Vec<InputLeaf>) {
        match self {
            Input::Atom(atom) => leaves.push(InputLeaf {
                name: atom.name.clone().unwrap_or_else(|| atom.repo.clone()),
                repo: atom.repo.clone(),
                branch: atom.branch.clone(),
                glob: atom.glob.clone(),
            }),
            Input::Cron(cron) => leaves.push(InputLeaf {
                name: cron.name.clone(),
                repo: Self::cron_repo(pipeline, &cron.name),
                branch: default_branch(),
                glob: "/".to_string(),
            }),
            Input::Git(git) => leaves.push(InputLeaf {
                name: git.effective_name(),
                repo: git.effective_name(),
                branch: git.branch.clone(),
                glob: "/".to_string(),
            }),
            Input::Cross(inputs) | Input::Union(inputs) => {
                for input in inputs {
                    input.collect_leaves(pipeline, leaves);
                }
            }
        }
    }

    /// The names this expression mounts, with duplicates.
    pub fn names(&self, pipeline: &str) -> Vec<String> {
        self.leaves(pipeline).into_iter().map(|l| l.name).collect()
    }

    /// How many leaves this expression has.
    pub fn leaf_count(&self) -> usize {
        match self {
            Input::Atom(_) | Input::Cron(_) | Input::Git(_) => 1,
            Input::Cross(inputs) | Input::Union(inputs) => {
                inputs.iter().map(|i| i.leaf_count()).sum()
            }
        }
    }

    pub fn crons(&self) -> Vec<&CronInput> {
        match self {
            Input::Cron(cron) => vec![cron],
            Input::Atom(_) | Input::Git(_) => vec![],
            Input::Cross(inputs) | Input::Union(inputs) => {
                inputs.iter().flat_map(|i| i.crons()).collect()
            }
        }
    }

    pub fn gits(&self) -> Vec<&GitInput> {
        match self {
            Input::Git(git) => vec![git],
            Input::Atom(_) | Input::Cron(_) => vec![],
            Input::Cross(inputs) | Input::Union(inputs) => {
                inputs.iter().flat_map(|i| i.gits()).collect()
            }
        }
    }

    /// Whether this expression can be evaluated, given which of its leaves (in depth-first order)
    /// have a head commit. Cross needs every child, Union needs at least one.
    pub fn is_ready(&self, leaf_ready: &[bool]) -> bool {
        let mut cursor = 0;
        self.ready_from(leaf_ready, &mut cursor)
    }

    pub(crate) fn ready_from(&self, leaf_ready: &[bool], cursor: &mut usize) -> bool {
        match self {
            Input::Atom(_) | Input::Cron(_) | Input::Git(_) => {
                let ready = leaf_ready.get(*cursor).copied().unwrap_or(false);
                *cursor += 1;
                ready
            }
            Input::Cross(inputs) => {
                let children: Vec<bool> = inputs
                    .iter()
                    .map(|i| i.ready_from(leaf_ready, cursor))
                    .collect();
                !children.is_empty() && children.into_iter().all(|r| r)
            }
            Input::Union(inputs) => {
                let children: Vec<bool> = inputs
                    .iter()
                    .map(|i| i.ready_from(leaf_ready, cursor))
                    .collect();
                children.into_iter().any(|r| r)
            }
        }
    }

    /// Which leaves actually contribute to an evaluation: leaves under unready union branches are
    /// left out.
    pub fn contributing_leaves(&self, leaf_ready: &[bool]) -> Vec<bool> {
        let mut out = vec![false; self.leaf_count()];
        let mut cursor = 0;
        self.mark_contributing(leaf_ready, &mut cursor, true, &mut out);
        out
    }

    fn mark_contributing(
        &self,
        leaf_ready: &[bool],
        cursor: &mut usize,
        enabled: bool,
        out: &mut Vec<bool>,
    ) {
        match self {
            Input::Atom(_) | Input::Cron(_) | Input::Git(_) => {
                let ready = leaf_ready.get(*cursor).copied().unwrap_or(false);
                out[*cursor] = enabled && ready;
                *cursor += 1;
            }
            Input::Cross(inputs) | Input::Union(inputs) => {
                for input in inputs {
                    let mut probe = *cursor;
                    let ready = input.ready_from(leaf_ready, &mut probe);
                    input.mark_contributing(leaf_ready, cursor, enabled && ready, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Input {
        Input::Union(vec![
            Input::Cross(vec![Input::atom("a", "/*"), Input::atom("b", "/*")]),
            Input::atom("c", "/"),
        ])
    }

    #[test]
    fn leaves_are_listed_depth_first() {
        let names: Vec<String> = diamond().leaves("p").into_iter().map(|l| l.repo).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn cron_leaves_are_backed_by_a_pipeline_scoped_repo() {
        let input = Input::cron("tick", "@every 10s");
        let leaves = input.leaves("edges");
        assert_eq!(leaves[0].repo, "edges_tick");
        assert_eq!(leaves[0].name, "tick");
        assert_eq!(leaves[0].glob, "/");
    }

    #[test]
    fn git_inputs_are_named_after_the_repository() {
        let git = GitInput {
            url: "https://github.com/pachyderm/test-artifacts.git".into(),
            name: None,
            branch: "master".into(),
        };
        assert_eq!(git.effective_name(), "test-artifacts");
    }

    #[test]
    fn cross_needs_every_child_and_union_needs_one() {
        let input = diamond();
        assert!(input.is_ready(&[true, true, false]));
        assert!(input.is_ready(&[false, false, true]));
        assert!(!input.is_ready(&[true, false, false]));
    }

    #[test]
    fn unready_union_branches_do_not_contribute() {
        let input = diamond();
        assert_eq!(
            input.contributing_leaves(&[true, false, true]),
            vec![false, false, true]
        );
        assert_eq!(
            input.contributing_leaves(&[true, true, true]),
            vec![true, true, true]
        );
    }

    #[test]
    fn inputs_deserialize_from_tagged_json() {
        let input: Input = serde_json::from_str(
            r#"{"cross": [{"atom": {"repo": "images", "glob": "/*"}}, {"cron": {"name": "tick", "spec": "@every 1m"}}]}"#,
        )
        .unwrap();
        assert_matches!(input, Input::Cross(ref children) if children.len() == 2);
        let leaves = input.leaves("p");
        assert_eq!(leaves[0].branch, "master");
        assert_eq!(leaves[1].repo, "p_tick");
    }
}
