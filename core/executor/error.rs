use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("The transform has no command to run")]
    EmptyCommand,

    #[error(
        r#"

Could not start user code

  {cmd}

in

  {}

due to:

  {err:?}

  "#, .cwd.to_string_lossy()
    )]
    SpawnFailed {
        cmd: String,
        cwd: PathBuf,
        err: std::io::Error,
    },

    #[error("Lost track of user code {cmd} due to: {err:?}")]
    WaitFailed { cmd: String, err: std::io::Error },
}
