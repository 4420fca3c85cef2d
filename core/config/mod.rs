use crate::events::EventChannel;
use crate::sync::Arc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::*;

/// The default number of attempts a datum gets before it is marked as failed.
pub const DEFAULT_DATUM_TRIES: u32 = 3;

/// The default number of chunks that can be waiting in a worker's queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1;

/// The default branch that pipelines read from and write to.
pub const DEFAULT_BRANCH: &str = "master";

/// A collection of flags and options that affect how Sluice runs. This is not specific to a
/// pipeline, it relates to the service itself.
///
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(error = "ConfigError"))]
pub struct Config {
    /// The number of nodes in the cluster. Used to resolve coefficient parallelism specs.
    #[builder(default = "self.default_cluster_nodes()")]
    cluster_nodes: usize,

    /// The directory under which every datum gets its materialized view.
    #[builder(default = "self.default_scratch_root()")]
    scratch_root: PathBuf,

    /// Where the local object store keeps its blobs. `None` keeps objects in memory.
    #[builder(setter(into, strip_option), default = "None")]
    object_root: Option<PathBuf>,

    #[builder(default = "DEFAULT_DATUM_TRIES")]
    default_datum_tries: u32,

    #[builder(default = "DEFAULT_MAX_QUEUE_SIZE")]
    default_max_queue_size: usize,

    /// How many propagator instances watch the commit graph.
    #[builder(default = "1")]
    propagator_replicas: usize,

    /// How many consecutive internal errors a pipeline controller tolerates before it marks its
    /// pipeline as failed.
    #[builder(default = "3")]
    max_controller_restarts: u32,

    /// How long a Standby pipeline waits without work before scaling back down.
    #[builder(default = "self.default_standby_grace()")]
    standby_grace: Duration,

    /// Named secrets that transforms can pull into their environment.
    #[builder(default)]
    secrets: HashMap<String, HashMap<String, String>>,

    /// The time at which this configuration was created.
    #[builder(default = "self.default_created_at()")]
    created_at: Instant,

    /// The environment at the time this config was created. This is separated to assist with
    /// testing.
    #[builder(default = "self.default_env()?")]
    env: HashMap<String, String>,

    /// The Event Channel be used across the application.
    /// NOTE: this is safe to clone since it is really an [Arc] to the underlying queue.
    #[builder(default = "self.default_event_channel()")]
    event_channel: Arc<EventChannel>,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build().unwrap()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn cluster_nodes(&self) -> usize {
        self.cluster_nodes
    }

    pub fn scratch_root(&self) -> &PathBuf {
        &self.scratch_root
    }

    pub fn object_root(&self) -> Option<&PathBuf> {
        self.object_root.as_ref()
    }

    pub fn default_datum_tries(&self) -> u32 {
        self.default_datum_tries
    }

    pub fn default_max_queue_size(&self) -> usize {
        self.default_max_queue_size
    }

    pub fn propagator_replicas(&self) -> usize {
        self.propagator_replicas.max(1)
    }

    pub fn max_controller_restarts(&self) -> u32 {
        self.max_controller_restarts
    }

    pub fn standby_grace(&self) -> Duration {
        self.standby_grace
    }

    pub fn secrets(&self) -> &HashMap<String, HashMap<String, String>> {
        &self.secrets
    }

    pub fn secret(&self, name: &str, key: &str) -> Option<&String> {
        self.secrets.get(name).and_then(|s| s.get(key))
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn event_channel(&self) -> Arc<EventChannel> {
        self.event_channel.clone()
    }
}

impl ConfigBuilder {
    fn default_cluster_nodes(&self) -> usize {
        num_cpus::get()
    }

    fn default_scratch_root(&self) -> PathBuf {
        std::env::temp_dir().join("sluice")
    }

    fn default_standby_grace(&self) -> Duration {
        Duration::from_millis(200)
    }

    fn default_created_at(&self) -> Instant {
        Instant::now()
    }

    fn default_event_channel(&self) -> Arc<EventChannel> {
        EventChannel::new().into()
    }

    fn default_env(&self) -> Result<HashMap<String, String>, ConfigError> {
        let env = std::env::vars_os()
            .filter_map(|(k, v)| match (k.into_string(), v.into_string()) {
                (Ok(k), Ok(v)) => Some((k, v)),
                _ => None,
            })
            .collect();
        Ok(env)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Attempted to build a Config struct while missing fields: {0:?}")]
    BuilderError(derive_builder::UninitializedFieldError),
}

impl From<derive_builder::UninitializedFieldError> for ConfigError {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Self::BuilderError(err)
    }
}
