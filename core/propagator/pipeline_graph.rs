use crate::model::PipelineSpec;
use daggy::{Dag, NodeIndex};
use fxhash::*;
use petgraph::visit::{Bfs, Reversed};
use std::collections::{BTreeMap, BTreeSet};

/// The data flow between repos: every input repo of a pipeline points at the pipeline's output
/// repo. Pipelines are nodes under the name of their output repo.
///
#[derive(Debug, Default, Clone)]
pub struct PipelineGraph {
    dag: Dag<String, (), u32>,
    nodes: FxHashMap<String, NodeIndex>,
    /// The input repos of every pipeline.
    inputs: BTreeMap<String, BTreeSet<String>>,
}

/// Adding a pipeline would have closed a loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub pipeline: String,
}

impl PipelineGraph {
    pub fn build<'a, I>(specs: I) -> Result<Self, Cycle>
    where
        I: IntoIterator<Item = &'a PipelineSpec>,
    {
        let mut graph = Self::default();
        for spec in specs {
            graph.add(spec)?;
        }
        Ok(graph)
    }

    fn node(&mut self, repo: &str) -> NodeIndex {
        if let Some(node) = self.nodes.get(repo) {
            return *node;
        }
        let node = self.dag.add_node(repo.to_string());
        self.nodes.insert(repo.to_string(), node);
        node
    }

    pub fn add(&mut self, spec: &PipelineSpec) -> Result<(), Cycle> {
        let repos: BTreeSet<String> = spec
            .input
            .leaves(&spec.name)
            .into_iter()
            .map(|leaf| leaf.repo)
            .collect();

        let output = self.node(&spec.name);
        for repo in &repos {
            let input = self.node(repo);
            self.dag
                .add_edge(input, output, ())
                .map_err(|_| Cycle {
                    pipeline: spec.name.clone(),
                })?;
        }
        self.inputs.insert(spec.name.clone(), repos);
        Ok(())
    }

    pub fn is_pipeline(&self, repo: &str) -> bool {
        self.inputs.contains_key(repo)
    }

    /// The repos a pipeline reads directly.
    pub fn input_repos(&self, pipeline: &str) -> BTreeSet<String> {
        self.inputs.get(pipeline).cloned().unwrap_or_default()
    }

    /// Every repo that `repo` reads from, directly or not.
    pub fn upstream_repos(&self, repo: &str) -> BTreeSet<String> {
        let start = match self.nodes.get(repo) {
            Some(node) => *node,
            None => return BTreeSet::new(),
        };
        let reversed = Reversed(self.dag.graph());
        let mut bfs = Bfs::new(reversed, start);
        let mut repos = BTreeSet::new();
        while let Some(node) = bfs.next(reversed) {
            if node != start {
                repos.insert(self.dag[node].clone());
            }
        }
        repos
    }

    /// Every repo that reads from `repo`, directly or not.
    pub fn downstream_repos(&self, repo: &str) -> BTreeSet<String> {
        let start = match self.nodes.get(repo) {
            Some(node) => *node,
            None => return BTreeSet::new(),
        };
        let graph = self.dag.graph();
        let mut bfs = Bfs::new(graph, start);
        let mut repos = BTreeSet::new();
        while let Some(node) = bfs.next(graph) {
            if node != start {
                repos.insert(self.dag[node].clone());
            }
        }
        repos
    }

    /// Every pipeline in topological order, upstream pipelines first.
    pub fn pipelines(&self) -> Vec<String> {
        // A daggy graph never has cycles, so sorting cannot fail.
        petgraph::algo::toposort(self.dag.graph(), None)
            .unwrap_or_default()
            .into_iter()
            .map(|node| self.dag[node].clone())
            .filter(|repo| self.is_pipeline(repo))
            .collect()
    }

    /// The pipelines downstream of any of `repos`, in topological order.
    pub fn downstream_pipelines<'a, I>(&self, repos: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut downstream = BTreeSet::new();
        for repo in repos {
            downstream.extend(self.downstream_repos(repo));
        }
        self.pipelines()
            .into_iter()
            .filter(|p| downstream.contains(p))
            .collect()
    }

    /// The pipelines that read a repo directly.
    pub fn dependents(&self, repo: &str) -> Vec<String> {
        self.inputs
            .iter()
            .filter(|(_, inputs)| inputs.contains(repo))
            .map(|(pipeline, _)| pipeline.clone())
            .collect()
    }
}
