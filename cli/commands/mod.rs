mod run;
mod validate;

pub use run::*;
pub use validate::*;

use anyhow::{bail, Context};
use sluice_core::*;
use std::path::PathBuf;
use tracing::debug;

/// Read every pipeline spec file, in the order given.
pub(crate) fn load_specs(paths: &[PathBuf]) -> Result<Vec<PipelineSpec>, anyhow::Error> {
    if paths.is_empty() {
        bail!("No pipeline specs given");
    }
    paths
        .iter()
        .map(|path| {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Could not read pipeline spec {:?}", path))?;
            PipelineSpec::from_json(&json)
                .with_context(|| format!("Pipeline spec {:?} is not valid", path))
        })
        .collect()
}

/// Create pipelines in whatever order lets each one find the repos it reads. Specs can be given
/// in any order, so a spec reading a repo that does not exist yet is retried once the others
/// have been created.
pub(crate) async fn create_pipelines(
    drive: &SluiceDrive,
    specs: Vec<PipelineSpec>,
) -> Result<Vec<PipelineInfo>, anyhow::Error> {
    let mut created = vec![];
    let mut pending = specs;
    while !pending.is_empty() {
        let before = pending.len();
        let mut waiting = vec![];
        let mut last_err = None;
        for spec in pending {
            match drive.create_pipeline(spec.clone(), false, false).await {
                Ok(info) => created.push(info),
                Err(SluiceDriveError::ValidationError(err @ ValidationError::UnknownRepo { .. })) => {
                    debug!("Holding back pipeline {}: {}", spec.name, err);
                    last_err = Some(err);
                    waiting.push(spec);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Could not create pipeline {}", spec.name))
                }
            }
        }
        if waiting.len() == before {
            if let Some(err) = last_err {
                return Err(err.into());
            }
        }
        pending = waiting;
    }
    Ok(created)
}
