use super::*;
use crate::events::event::PipelineEvent;
use crate::events::EventChannel;
use crate::model::{PipelineInfo, PipelineSpec, PipelineState};
use crate::sync::{Arc, Mutex, RwLock};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::*;

struct PipelineSlot {
    /// Every version of the spec, oldest first. Superseded versions are never changed.
    versions: RwLock<Vec<PipelineSpec>>,
    info: watch::Sender<PipelineInfo>,
    wake: Arc<Notify>,
    pause: Mutex<CancellationToken>,
}

/// Keeps every pipeline, their versions, and their state machine.
///
pub struct PipelineRegistry {
    pipelines: DashMap<String, Arc<PipelineSlot>>,
    events: Arc<EventChannel>,
}

fn new_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl PipelineRegistry {
    pub fn new(events: Arc<EventChannel>) -> Self {
        Self {
            pipelines: DashMap::new(),
            events,
        }
    }

    fn slot(&self, pipeline: &str) -> Result<Arc<PipelineSlot>, LifecycleError> {
        self.pipelines
            .get(pipeline)
            .map(|s| s.value().clone())
            .ok_or_else(|| LifecycleError::PipelineNotFound {
                pipeline: pipeline.to_string(),
            })
    }

    #[instrument(name = "PipelineRegistry::create", skip(self, spec), fields(pipeline = %spec.name))]
    pub fn create(&self, spec: PipelineSpec) -> Result<PipelineInfo, LifecycleError> {
        let name = spec.name.clone();
        let info = PipelineInfo {
            spec: spec.clone(),
            version: 1,
            state: PipelineState::Starting,
            reason: None,
            salt: new_salt(),
            stopped: false,
            job_counts: BTreeMap::new(),
            created_at: Utc::now(),
        };

        match self.pipelines.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(LifecycleError::PipelineAlreadyExists { pipeline: name })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _) = watch::channel(info.clone());
                entry.insert(Arc::new(PipelineSlot {
                    versions: RwLock::new(vec![spec]),
                    info: tx,
                    wake: Arc::new(Notify::new()),
                    pause: Mutex::new(CancellationToken::new()),
                }));
            }
        }

        self.events.send(PipelineEvent::PipelineCreated {
            pipeline: name,
            version: 1,
        });
        Ok(info)
    }

    /// Store a new version of a pipeline. A failed pipeline gets another chance, and
    /// `reprocess` picks a new dedup salt so nothing from earlier versions is reused.
    #[instrument(name = "PipelineRegistry::update", skip(self, spec), fields(pipeline = %spec.name))]
    pub fn update(&self, spec: PipelineSpec, reprocess: bool) -> Result<PipelineInfo, LifecycleError> {
        let slot = self.slot(&spec.name)?;
        {
            let mut versions = slot.versions.write().unwrap_or_else(|p| p.into_inner());
            versions.push(spec.clone());
        }

        let mut from = None;
        slot.info.send_modify(|info| {
            info.spec = spec.clone();
            info.version += 1;
            if reprocess {
                info.salt = new_salt();
            }
            if info.state == PipelineState::Failure {
                from = Some(info.state);
                info.state = PipelineState::Starting;
                info.reason = None;
            }
        });

        let info = slot.info.borrow().clone();
        self.events.send(PipelineEvent::PipelineCreated {
            pipeline: spec.name.clone(),
            version: info.version,
        });
        if let Some(from) = from {
            self.events.send(PipelineEvent::PipelineStateChanged {
                pipeline: spec.name.clone(),
                from,
                to: info.state,
                reason: None,
            });
        }
        slot.wake.notify_one();
        Ok(info)
    }

    pub fn get(&self, pipeline: &str) -> Result<PipelineInfo, LifecycleError> {
        let slot = self.slot(pipeline)?;
        let info = slot.info.borrow().clone();
        Ok(info)
    }

    pub fn contains(&self, pipeline: &str) -> bool {
        self.pipelines.contains_key(pipeline)
    }

    /// The spec a pipeline had at some version.
    pub fn get_version(&self, pipeline: &str, version: u64) -> Result<PipelineSpec, LifecycleError> {
        let slot = self.slot(pipeline)?;
        let versions = slot.versions.read().unwrap_or_else(|p| p.into_inner());
        version
            .checked_sub(1)
            .and_then(|i| versions.get(i as usize))
            .cloned()
            .ok_or_else(|| LifecycleError::PipelineVersionNotFound {
                pipeline: pipeline.to_string(),
                version,
            })
    }

    /// The current version of every pipeline, sorted by name.
    pub fn list(&self) -> Vec<PipelineInfo> {
        let mut pipelines: Vec<PipelineInfo> = self
            .pipelines
            .iter()
            .map(|slot| slot.info.borrow().clone())
            .collect();
        pipelines.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        pipelines
    }

    /// Move a pipeline to a new state. Moving to the state it is already in is a no-op.
    #[instrument(name = "PipelineRegistry::set_state", skip(self))]
    pub fn set_state(
        &self,
        pipeline: &str,
        to: PipelineState,
        reason: Option<String>,
    ) -> Result<PipelineInfo, LifecycleError> {
        let slot = self.slot(pipeline)?;
        let mut result = Ok(None);
        slot.info.send_if_modified(|info| {
            if info.state == to && to != PipelineState::Failure {
                return false;
            }
            if !info.state.can_transition_to(to) {
                result = Err(LifecycleError::InvalidPipelineTransition {
                    pipeline: pipeline.to_string(),
                    from: info.state,
                    to,
                });
                return false;
            }
            result = Ok(Some(info.state));
            info.state = to;
            info.reason = reason.clone();
            info.stopped = to == PipelineState::Paused;
            true
        });

        let info = slot.info.borrow().clone();
        if let Some(from) = result? {
            info!("Pipeline {} went from {} to {}", pipeline, from, to);
            self.events.send(PipelineEvent::PipelineStateChanged {
                pipeline: pipeline.to_string(),
                from,
                to,
                reason: info.reason.clone(),
            });
        }
        Ok(info)
    }

    pub fn subscribe(&self, pipeline: &str) -> Result<watch::Receiver<PipelineInfo>, LifecycleError> {
        Ok(self.slot(pipeline)?.info.subscribe())
    }

    /// Tell a pipeline's controller that there might be work for it.
    pub fn wake(&self, pipeline: &str) {
        if let Ok(slot) = self.slot(pipeline) {
            slot.wake.notify_one();
        }
    }

    pub fn waker(&self, pipeline: &str) -> Result<Arc<Notify>, LifecycleError> {
        Ok(self.slot(pipeline)?.wake.clone())
    }

    /// The token that is cancelled when the pipeline is paused.
    pub fn pause_token(&self, pipeline: &str) -> Result<CancellationToken, LifecycleError> {
        let slot = self.slot(pipeline)?;
        let token = slot.pause.lock().unwrap_or_else(|p| p.into_inner());
        Ok(token.clone())
    }

    /// Pause a pipeline, cancelling anything it is running.
    pub fn pause(&self, pipeline: &str) -> Result<PipelineInfo, LifecycleError> {
        let info = self.set_state(pipeline, PipelineState::Paused, None)?;
        self.pause_token(pipeline)?.cancel();
        Ok(info)
    }

    /// Resume a paused pipeline.
    pub fn resume(&self, pipeline: &str) -> Result<PipelineInfo, LifecycleError> {
        let slot = self.slot(pipeline)?;
        {
            let mut token = slot.pause.lock().unwrap_or_else(|p| p.into_inner());
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        let state = slot.info.borrow().state;
        let info = match state {
            PipelineState::Paused => self.set_state(pipeline, PipelineState::Running, None)?,
            _ => self.get(pipeline)?,
        };
        slot.wake.notify_one();
        Ok(info)
    }

    #[instrument(name = "PipelineRegistry::remove", skip(self))]
    pub fn remove(&self, pipeline: &str) -> Result<PipelineInfo, LifecycleError> {
        let (_, slot) =
            self.pipelines
                .remove(pipeline)
                .ok_or_else(|| LifecycleError::PipelineNotFound {
                    pipeline: pipeline.to_string(),
                })?;
        slot.pause.lock().unwrap_or_else(|p| p.into_inner()).cancel();
        self.events.send(PipelineEvent::PipelineDeleted {
            pipeline: pipeline.to_string(),
        });
        let info = slot.info.borrow().clone();
        Ok(info)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
