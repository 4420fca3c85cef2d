use anyhow::Context;
use sluice_core::Config;
use std::collections::HashMap;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Default, Debug, Clone, StructOpt)]
pub struct Flags {
    #[structopt(
        help = r"The number of nodes to size coefficient parallelism specs against.
Defaults to the number of CPUs on this machine.",
        short = "n",
        long = "cluster-nodes"
    )]
    pub(crate) cluster_nodes: Option<usize>,

    #[structopt(
        help = r"Where datums get materialized for user code to read.",
        long = "scratch-root"
    )]
    pub(crate) scratch_root: Option<PathBuf>,

    #[structopt(
        help = r"Keep objects on disk under this directory instead of in memory.",
        long = "object-root"
    )]
    pub(crate) object_root: Option<PathBuf>,

    #[structopt(
        help = r"How many times a datum is attempted when its pipeline does not say.",
        long = "datum-tries"
    )]
    pub(crate) datum_tries: Option<u32>,

    #[structopt(
        help = r"How many propagators follow the commit graph.",
        long = "propagators"
    )]
    pub(crate) propagators: Option<usize>,

    #[structopt(
        help = r"A JSON file of secrets, shaped like {name: {key: value}}.",
        long = "secrets"
    )]
    pub(crate) secrets: Option<PathBuf>,
}

impl Flags {
    pub fn config(&self) -> Result<Config, anyhow::Error> {
        let mut config = Config::builder();

        config.cluster_nodes(self.cluster_nodes.unwrap_or_else(num_cpus::get));

        if let Some(root) = &self.scratch_root {
            config.scratch_root(root.clone());
        }
        if let Some(root) = &self.object_root {
            config.object_root(root.clone());
        }
        if let Some(tries) = self.datum_tries {
            config.default_datum_tries(tries);
        }
        if let Some(propagators) = self.propagators {
            config.propagator_replicas(propagators);
        }
        if let Some(path) = &self.secrets {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Could not read secrets from {:?}", path))?;
            let secrets: HashMap<String, HashMap<String, String>> = serde_json::from_str(&json)
                .with_context(|| format!("Secrets file {:?} is not valid", path))?;
            config.secrets(secrets);
        }

        Ok(config.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn flags_end_up_in_the_config() {
        let secrets = assert_fs::NamedTempFile::new("secrets.json").unwrap();
        secrets
            .write_str(r#"{"db": {"password": "hunter2"}}"#)
            .unwrap();

        let flags = Flags::from_iter_safe([
            "sluice",
            "--cluster-nodes",
            "4",
            "--datum-tries",
            "7",
            "--secrets",
            secrets.path().to_str().unwrap(),
        ])
        .unwrap();
        let config = flags.config().unwrap();

        assert_eq!(config.cluster_nodes(), 4);
        assert_eq!(config.default_datum_tries(), 7);
        assert_eq!(config.secret("db", "password").unwrap(), "hunter2");
        assert!(config.object_root().is_none());
    }

    #[test]
    fn unreadable_secrets_are_reported() {
        let flags = Flags {
            secrets: Some(PathBuf::from("/nonexistent/secrets.json")),
            ..Flags::default()
        };
        let err = flags.config().unwrap_err();
        assert!(err.to_string().contains("Could not read secrets"));
    }
}
