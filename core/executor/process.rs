use super::*;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::*;

/// Runs transforms as local processes.
///
/// Every process gets its own process group, so killing a datum also kills whatever the user's
/// command spawned.
///
#[derive(Default, Debug, Clone)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Point `/pfs` paths in a command or script at the datum's view.
pub(crate) fn rewrite_pfs(arg: &str, root: &Path) -> String {
    let root = root.to_string_lossy();
    let rewritten = arg.replace("/pfs/", &format!("{}/", root));
    if rewritten == "/pfs" {
        return root.to_string();
    }
    match rewritten.strip_suffix(" /pfs") {
        Some(prefix) => format!("{} {}", prefix, root),
        None => rewritten,
    }
}

fn forward_lines<R>(reader: R, lines: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send(line).is_err() {
                break;
            }
        }
    })
}

fn signal_group(pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        if let Err(err) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            debug!("Could not kill process group {}: {:?}", pgid, err);
        }
    }
}

fn kill_group(child: &mut Child) {
    signal_group(child.id());
    let _ = child.start_kill();
}

enum Exit {
    Status(std::process::ExitStatus),
    TimedOut(Duration),
    Cancelled,
}

#[async_trait]
impl DatumExecutor for ProcessExecutor {
    #[instrument(name = "ProcessExecutor::execute", skip(self, invocation, cancel), fields(datum = %invocation.datum))]
    async fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let transform = &invocation.transform;
        let (program, args) = transform
            .cmd
            .split_first()
            .ok_or(ExecutorError::EmptyCommand)?;

        let root = &invocation.root;
        let cwd = transform
            .working_dir
            .as_ref()
            .map(|dir| PathBuf::from(rewrite_pfs(&dir.to_string_lossy(), root)))
            .unwrap_or_else(|| root.clone());

        let mut cmd = Command::new(rewrite_pfs(program, root));
        cmd.args(args.iter().map(|arg| rewrite_pfs(arg, root)))
            .current_dir(&cwd)
            .env_clear()
            .envs(invocation.env.iter())
            .envs(transform.env.iter())
            .env("PFS_ROOT", root)
            .env("PFS_OUT", invocation.out_dir())
            .env("PPS_JOB_ID", invocation.job.to_string())
            .env("PPS_DATUM_ID", invocation.datum.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        for input in &invocation.inputs {
            cmd.env(input, root.join(input));
        }

        trace!("Running {:?}", cmd);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|err| ExecutorError::SpawnFailed {
            cmd: program.clone(),
            cwd: cwd.clone(),
            err,
        })?;
        // The id is gone once the child has been reaped, but its group may outlive it.
        let pgid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let mut script = transform
                .stdin
                .iter()
                .map(|line| rewrite_pfs(line, root))
                .collect::<Vec<String>>()
                .join("\n");
            script.push('\n');
            tokio::spawn(async move {
                // User code that does not read its stdin closes the pipe early.
                let _ = stdin.write_all(script.as_bytes()).await;
            });
        }

        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
        let mut readers = vec![];
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, lines_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, lines_tx.clone()));
        }
        drop(lines_tx);

        let timeout = async {
            match invocation.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status.map_err(|err| ExecutorError::WaitFailed {
                cmd: program.clone(),
                err,
            })?),
            _ = timeout => Exit::TimedOut(invocation.timeout.unwrap_or_default()),
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        let elapsed = started.elapsed();

        match exit {
            Exit::Status(status) => {
                // Anything the command left running in the background holds the pipes open.
                signal_group(pgid);
                for reader in readers {
                    let _ = reader.await;
                }
                let mut output = vec![];
                while let Ok(line) = lines_rx.try_recv() {
                    output.push(line);
                }

                let code = status.code();
                let accepted = code
                    .map(|c| c == 0 || transform.accept_return_code.contains(&c))
                    .unwrap_or(false);
                if accepted {
                    Ok(ExecutionOutcome::Succeeded { elapsed, output })
                } else {
                    let error = match code {
                        Some(code) => format!("exit code {}", code),
                        None => format!("terminated by a signal ({})", status),
                    };
                    Ok(ExecutionOutcome::Failed {
                        elapsed,
                        error,
                        output,
                    })
                }
            }

            Exit::TimedOut(timeout) => {
                kill_group(&mut child);
                let _ = child.wait().await;
                for reader in readers {
                    reader.abort();
                }
                let mut output = vec![];
                while let Ok(line) = lines_rx.try_recv() {
                    output.push(line);
                }
                warn!("Datum {} timed out after {:?}", invocation.datum, timeout);
                Ok(ExecutionOutcome::TimedOut { timeout, output })
            }

            Exit::Cancelled => {
                kill_group(&mut child);
                let _ = child.wait().await;
                for reader in readers {
                    reader.abort();
                }
                Ok(ExecutionOutcome::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentHash;
    use assert_fs::prelude::*;

    fn invocation(root: &Path, transform: Transform) -> Invocation {
        Invocation {
            job: JobId::next(),
            datum: DatumId::from_files([("/a.png", &ContentHash::of(b"pixels"))]),
            transform,
            root: root.to_path_buf(),
            inputs: vec!["images".to_string()],
            env: std::env::vars().collect(),
            timeout: None,
        }
    }

    #[test]
    fn pfs_paths_point_into_the_view() {
        let root = Path::new("/tmp/sluice/job/0");
        assert_eq!(
            rewrite_pfs("cp /pfs/images/* /pfs/out/", root),
            "cp /tmp/sluice/job/0/images/* /tmp/sluice/job/0/out/"
        );
        assert_eq!(rewrite_pfs("/pfs", root), "/tmp/sluice/job/0");
        assert_eq!(rewrite_pfs("ls /pfs", root), "ls /tmp/sluice/job/0");
        assert_eq!(rewrite_pfs("echo pfs", root), "echo pfs");
    }

    #[tokio::test]
    async fn scripts_run_against_the_view() {
        let root = assert_fs::TempDir::new().unwrap();
        root.child("images/a.png").write_str("pixels").unwrap();
        root.child("out").create_dir_all().unwrap();

        let transform = Transform::shell(["cp /pfs/images/* /pfs/out/", "echo done"]);
        let outcome = ProcessExecutor::new()
            .execute(&invocation(root.path(), transform), &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(outcome, ExecutionOutcome::Succeeded { ref output, .. } if output == &vec!["done".to_string()]);
        root.child("out/a.png").assert("pixels");
    }

    #[tokio::test]
    async fn rejected_exit_codes_fail() {
        let root = assert_fs::TempDir::new().unwrap();
        let outcome = ProcessExecutor::new()
            .execute(
                &invocation(root.path(), Transform::shell(["exit 3"])),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_matches!(outcome, ExecutionOutcome::Failed { ref error, .. } if error == "exit code 3");
    }

    #[tokio::test]
    async fn accepted_exit_codes_succeed() {
        let root = assert_fs::TempDir::new().unwrap();
        let mut transform = Transform::shell(["exit 3"]);
        transform.accept_return_code = vec![3];
        let outcome = ProcessExecutor::new()
            .execute(&invocation(root.path(), transform), &CancellationToken::new())
            .await
            .unwrap();
        assert_matches!(outcome, ExecutionOutcome::Succeeded { .. });
    }

    #[tokio::test]
    async fn slow_datums_are_killed_at_the_timeout() {
        let root = assert_fs::TempDir::new().unwrap();
        let mut invocation = invocation(root.path(), Transform::shell(["sleep 10"]));
        invocation.timeout = Some(Duration::from_millis(100));

        let started = Instant::now();
        let outcome = ProcessExecutor::new()
            .execute(&invocation, &CancellationToken::new())
            .await
            .unwrap();

        assert_matches!(outcome, ExecutionOutcome::TimedOut { timeout, .. } if timeout == Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelling_kills_the_process() {
        let root = assert_fs::TempDir::new().unwrap();
        let invocation = invocation(root.path(), Transform::shell(["sleep 10"]));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let outcome = ProcessExecutor::new()
            .execute(&invocation, &cancel)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_commands_fail_to_spawn() {
        let root = assert_fs::TempDir::new().unwrap();
        let transform = Transform::new(["/definitely/not/a/command"], Vec::<String>::new());
        let result = ProcessExecutor::new()
            .execute(&invocation(root.path(), transform), &CancellationToken::new())
            .await;
        assert_matches!(result, Err(ExecutorError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn background_processes_do_not_outlive_the_datum() {
        let root = assert_fs::TempDir::new().unwrap();
        let transform = Transform::shell(["sleep 300 &", "echo done"]);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            ProcessExecutor::new().execute(&invocation(root.path(), transform), &CancellationToken::new()),
        )
        .await
        .expect("the datum should finish once the shell exits")
        .unwrap();

        assert_matches!(outcome, ExecutionOutcome::Succeeded { ref output, .. } if output == &vec!["done".to_string()]);
    }
}
