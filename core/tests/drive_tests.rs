use assert_fs::prelude::*;
use futures::StreamExt;
use sluice_core::*;
use std::time::Duration;

const DEADLINE: Option<Duration> = Some(Duration::from_secs(30));

async fn drive() -> (assert_fs::TempDir, SluiceDrive) {
    drive_with(Config::builder()).await
}

async fn drive_with(mut builder: ConfigBuilder) -> (assert_fs::TempDir, SluiceDrive) {
    let root = assert_fs::TempDir::new().unwrap();
    let config = builder
        .scratch_root(root.path().join("scratch"))
        .build()
        .unwrap();
    let drive = SluiceDrive::with_memory(config).await.unwrap();
    (root, drive)
}

async fn commit(drive: &SluiceDrive, repo: &str, files: &[(&str, &str)]) -> CommitInfo {
    let commit = drive.start_commit(repo, "master").await.unwrap();
    for (path, data) in files {
        drive
            .put_file(commit.id, path, data.as_bytes())
            .await
            .unwrap();
    }
    drive.finish_commit(commit.id).await.unwrap()
}

fn shell(name: &str, input: Input, script: &[&str]) -> PipelineSpec {
    PipelineSpec::new(name, Transform::shell(script.iter().copied()), input)
}

async fn flush(drive: &SluiceDrive, commit: &CommitInfo) -> Vec<CommitInfo> {
    drive
        .flush_commit_all(vec![commit.id], None, DEADLINE)
        .await
        .unwrap()
}

async fn read(drive: &SluiceDrive, commit: &CommitInfo, path: &str) -> String {
    String::from_utf8(drive.get_file(commit.id, path).await.unwrap()).unwrap()
}

#[tokio::test]
async fn output_follows_the_latest_input() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    drive
        .create_pipeline(
            shell("copy", Input::atom("data", "/*"), &["cp /pfs/data/* /pfs/out/"]),
            false,
            false,
        )
        .await
        .unwrap();

    let first = commit(&drive, "data", &[("/file", "foo")]).await;
    let outputs = flush(&drive, &first).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(read(&drive, &outputs[0], "/file").await, "foo");

    let second = commit(&drive, "data", &[("/file", "bar")]).await;
    let outputs = flush(&drive, &second).await;
    assert_eq!(outputs.len(), 1);
    assert_eq!(read(&drive, &outputs[0], "/file").await, "bar");
}

#[tokio::test]
async fn replayed_content_is_skipped_without_running_user_code() {
    let (root, drive) = drive().await;
    let marker = root.child("slow");
    drive.create_repo("data").await.unwrap();
    let sleep_when_marked = format!("if [ -e {} ]; then sleep 30; fi", marker.path().display());
    drive
        .create_pipeline(
            shell(
                "copy",
                Input::atom("data", "/*"),
                &["cp /pfs/data/* /pfs/out/", &sleep_when_marked],
            ),
            false,
            false,
        )
        .await
        .unwrap();

    let first = commit(&drive, "data", &[("/file", "foo")]).await;
    flush(&drive, &first).await;

    marker.touch().unwrap();
    let replay = commit(&drive, "data", &[("/file", "foo")]).await;
    let jobs = drive
        .flush_job_all(vec![replay.id], None, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Success);
    assert_eq!(jobs[0].data_total, 1);
    assert_eq!(jobs[0].data_skipped, 1);
    assert_eq!(jobs[0].data_processed, 0);

    let datums = drive.list_datum(jobs[0].id, 0, 0).unwrap();
    assert_eq!(datums.items[0].state, DatumState::Skipped);

    let output = drive.inspect_commit(jobs[0].output_commit).await.unwrap();
    assert_eq!(read(&drive, &output, "/file").await, "foo");
}

#[tokio::test]
async fn reverted_content_is_skipped_without_running_user_code() {
    let (root, drive) = drive().await;
    let marker = root.child("slow");
    drive.create_repo("data").await.unwrap();
    let sleep_when_marked = format!("if [ -e {} ]; then sleep 30; fi", marker.path().display());
    drive
        .create_pipeline(
            shell(
                "copy",
                Input::atom("data", "/*"),
                &["cp /pfs/data/* /pfs/out/", &sleep_when_marked],
            ),
            false,
            false,
        )
        .await
        .unwrap();

    let first = commit(&drive, "data", &[("/file", "foo")]).await;
    flush(&drive, &first).await;
    let second = commit(&drive, "data", &[("/file", "bar")]).await;
    let outputs = flush(&drive, &second).await;
    assert_eq!(read(&drive, &outputs[0], "/file").await, "bar");

    marker.touch().unwrap();
    let reverted = commit(&drive, "data", &[("/file", "foo")]).await;
    let jobs = drive
        .flush_job_all(vec![reverted.id], None, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Success);
    assert_eq!(jobs[0].data_total, 1);
    assert_eq!(jobs[0].data_skipped, 1);
    assert_eq!(jobs[0].data_processed, 0);

    let output = drive.inspect_commit(jobs[0].output_commit).await.unwrap();
    assert_eq!(read(&drive, &output, "/file").await, "foo");
}

#[tokio::test]
async fn shortcut_edges_produce_a_single_commit() {
    let (_root, drive) = drive().await;
    drive.create_repo("a").await.unwrap();
    drive
        .create_pipeline(
            shell("b", Input::atom("a", "/*"), &["cp /pfs/a/* /pfs/out/"]),
            false,
            false,
        )
        .await
        .unwrap();
    drive
        .create_pipeline(
            shell(
                "c",
                Input::Cross(vec![Input::atom("a", "/*"), Input::atom("b", "/*")]),
                &["cat /pfs/a/* /pfs/b/* > /pfs/out/joined"],
            ),
            false,
            false,
        )
        .await
        .unwrap();

    let commit = commit(&drive, "a", &[("/file", "foo")]).await;
    let outputs = flush(&drive, &commit).await;
    assert_eq!(outputs.len(), 2);
    assert_eq!(drive.list_commit("c").await.unwrap().len(), 1);

    let c = outputs.iter().find(|o| o.repo == "c").unwrap();
    assert_eq!(read(&drive, c, "/joined").await, "foofoo");
}

#[tokio::test]
async fn diamonds_flush_one_commit_per_downstream_repo() {
    let (_root, drive) = drive().await;
    drive.create_repo("a").await.unwrap();
    for name in ["b", "c"] {
        drive
            .create_pipeline(
                shell(name, Input::atom("a", "/*"), &["cp /pfs/a/* /pfs/out/"]),
                false,
                false,
            )
            .await
            .unwrap();
    }
    drive
        .create_pipeline(
            shell(
                "d",
                Input::Cross(vec![Input::atom("b", "/*"), Input::atom("c", "/*")]),
                &["cp /pfs/b/* /pfs/out/"],
            ),
            false,
            false,
        )
        .await
        .unwrap();

    let commit = commit(&drive, "a", &[("/file", "foo")]).await;
    let outputs = flush(&drive, &commit).await;
    let mut repos: Vec<String> = outputs.iter().map(|o| o.repo.clone()).collect();
    repos.sort();
    assert_eq!(repos, vec!["b", "c", "d"]);
}

#[tokio::test]
async fn parallelism_follows_the_cluster_size() {
    let mut builder = Config::builder();
    builder.cluster_nodes(4);
    let (_root, drive) = drive_with(builder).await;
    drive.create_repo("data").await.unwrap();

    let cases = [
        ("all", Some(ParallelismSpec::coefficient(1.0)), 4),
        ("none", Some(ParallelismSpec::constant(0)), 1),
        ("unset", None, 1),
        ("tiny", Some(ParallelismSpec::coefficient(0.01)), 1),
    ];
    for (name, parallelism, _) in &cases {
        let mut spec = shell(name, Input::atom("data", "/*"), &["true"]);
        spec.parallelism_spec = *parallelism;
        drive.create_pipeline(spec, false, false).await.unwrap();
    }

    let commit = commit(&drive, "data", &[("/a", "1"), ("/b", "2")]).await;
    let jobs = drive
        .flush_job_all(vec![commit.id], None, DEADLINE)
        .await
        .unwrap();
    for (name, _, workers) in &cases {
        let job = jobs.iter().find(|j| j.pipeline == *name).unwrap();
        assert_eq!(job.workers, *workers, "workers of {}", name);
    }
}

#[tokio::test]
async fn deleting_the_head_kills_its_job_and_falls_back_to_the_parent() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    drive
        .create_pipeline(
            shell(
                "copy",
                Input::atom("data", "/*"),
                &[
                    "if grep -q slow /pfs/data/file; then sleep 30; fi",
                    "cp /pfs/data/* /pfs/out/",
                ],
            ),
            false,
            false,
        )
        .await
        .unwrap();

    let parent = commit(&drive, "data", &[("/file", "foo")]).await;
    let expected = flush(&drive, &parent).await.remove(0);

    let head = commit(&drive, "data", &[("/file", "slow")]).await;
    let job = drive.list_job(Some("copy"), Some(head.id)).remove(0);
    loop {
        if drive.inspect_job(job.id, false).await.unwrap().state == JobState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drive.delete_commit(head.id).await.unwrap();
    let killed = drive.inspect_job(job.id, true).await.unwrap();
    assert_eq!(killed.state, JobState::Killed);

    let outputs = flush(&drive, &parent).await;
    assert_eq!(outputs.len(), 1);
    let current = drive.list_commit("copy").await.unwrap().remove(0);
    assert_eq!(current.id, expected.id);
    assert_eq!(read(&drive, &current, "/file").await, "foo");
}

#[tokio::test]
async fn every_failed_attempt_is_logged() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    let mut spec = shell("broken", Input::atom("data", "/*"), &["exit 1"]);
    spec.datum_tries = Some(5);
    drive.create_pipeline(spec, false, false).await.unwrap();

    let commit = commit(&drive, "data", &[("/file", "foo")]).await;
    let jobs = drive
        .flush_job_all(vec![commit.id], None, DEADLINE)
        .await
        .unwrap();
    assert_eq!(jobs[0].state, JobState::Failure);
    assert!(jobs[0].reason.as_ref().unwrap().contains("datum"));

    let filter = LogFilter {
        pipeline: Some("broken".into()),
        master: true,
        ..Default::default()
    };
    let retries = drive
        .get_logs(filter, false)
        .filter(|line| {
            futures::future::ready(line.message.contains("errored running user code after"))
        })
        .count()
        .await;
    assert_eq!(retries, 5);
}

#[tokio::test]
async fn datum_timeouts_record_the_timeout() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    let mut spec = shell("slow", Input::atom("data", "/*"), &["sleep 30"]);
    spec.datum_timeout = Some(Duration::from_millis(200));
    drive.create_pipeline(spec, false, false).await.unwrap();

    let commit = commit(&drive, "data", &[("/file", "foo")]).await;
    let jobs = drive
        .flush_job_all(vec![commit.id], None, DEADLINE)
        .await
        .unwrap();
    assert_eq!(jobs[0].state, JobState::Failure);

    let datums = drive.list_datum(jobs[0].id, 0, 0).unwrap();
    assert_eq!(datums.items[0].state, DatumState::Failed);
    assert_eq!(
        datums.items[0].stats.process_time,
        Duration::from_millis(200)
    );
}

#[tokio::test]
async fn job_timeouts_kill_the_job() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    let mut spec = shell("slow", Input::atom("data", "/*"), &["sleep 30"]);
    spec.job_timeout = Some(Duration::from_millis(300));
    drive.create_pipeline(spec, false, false).await.unwrap();

    let commit = commit(&drive, "data", &[("/file", "foo")]).await;
    let jobs = drive
        .flush_job_all(vec![commit.id], None, DEADLINE)
        .await
        .unwrap();
    let job = &jobs[0];
    assert_eq!(job.state, JobState::Killed);
    let elapsed = job.finished.unwrap() - job.started.unwrap();
    assert_eq!(elapsed, chrono::Duration::milliseconds(300));
}

#[tokio::test]
async fn egress_copies_output_out_and_fails_jobs_when_it_cannot() {
    let (root, drive) = drive().await;
    let target = root.child("egress");
    target.create_dir_all().unwrap();
    drive.create_repo("data").await.unwrap();

    let mut good = shell("good", Input::atom("data", "/*"), &["cp /pfs/data/* /pfs/out/"]);
    good.egress = Some(Egress {
        url: format!("file://{}", target.path().display()),
    });
    drive.create_pipeline(good, false, false).await.unwrap();

    let mut bad = shell("bad", Input::atom("data", "/*"), &["cp /pfs/data/* /pfs/out/"]);
    bad.egress = Some(Egress {
        url: "s3://bucket/prefix".into(),
    });
    drive.create_pipeline(bad, false, false).await.unwrap();

    let commit = commit(&drive, "data", &[("/file", "foo")]).await;
    let jobs = drive
        .flush_job_all(vec![commit.id], None, DEADLINE)
        .await
        .unwrap();

    let good = jobs.iter().find(|j| j.pipeline == "good").unwrap();
    assert_eq!(good.state, JobState::Success);
    target.child("file").assert("foo");

    let bad = jobs.iter().find(|j| j.pipeline == "bad").unwrap();
    assert_eq!(bad.state, JobState::Failure);
    assert!(bad.reason.as_ref().unwrap().contains("egress"));
}

#[tokio::test]
async fn reprocessing_updates_run_every_datum_again() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    drive
        .create_pipeline(
            shell("copy", Input::atom("data", "/*"), &["cp /pfs/data/* /pfs/out/"]),
            false,
            false,
        )
        .await
        .unwrap();
    let first = commit(&drive, "data", &[("/a", "1"), ("/b", "2")]).await;
    flush(&drive, &first).await;

    let updated = shell(
        "copy",
        Input::atom("data", "/*"),
        &["cp /pfs/data/* /pfs/out/", "echo updated"],
    );
    let info = drive.create_pipeline(updated, true, true).await.unwrap();
    assert_eq!(info.version, 2);
    assert_eq!(
        drive.inspect_pipeline_version("copy", 1).unwrap().transform.stdin,
        vec!["cp /pfs/data/* /pfs/out/".to_string()]
    );

    let jobs = drive
        .flush_job_all(vec![first.id], None, DEADLINE)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    let newest = drive.list_job(Some("copy"), None).remove(0);
    let newest = drive.inspect_job(newest.id, true).await.unwrap();
    assert_eq!(newest.pipeline_version, 2);
    assert_eq!(newest.data_processed, 2);
    assert_eq!(newest.data_skipped, 0);

    let info = drive.inspect_pipeline("copy").unwrap();
    assert_eq!(info.job_counts.get(&JobState::Success), Some(&2));
}

#[tokio::test]
async fn logs_can_be_followed_until_the_job_ends() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    drive
        .create_pipeline(
            shell("echo", Input::atom("data", "/*"), &["echo hello from $PPS_DATUM_ID"]),
            false,
            false,
        )
        .await
        .unwrap();

    commit(&drive, "data", &[("/file", "foo")]).await;
    let job = drive.list_job(Some("echo"), None).remove(0);
    let filter = LogFilter {
        job: Some(job.id),
        ..Default::default()
    };
    let lines: Vec<LogLine> = drive.get_logs(filter, true).collect().await;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].message.starts_with("hello from "));
    assert!(!lines[0].master);
}

#[tokio::test]
async fn invalid_specs_are_rejected_up_front() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    drive
        .create_pipeline(shell("b", Input::atom("data", "/*"), &["true"]), false, false)
        .await
        .unwrap();
    drive
        .create_pipeline(shell("c", Input::atom("b", "/*"), &["true"]), false, false)
        .await
        .unwrap();

    let looped = shell("b", Input::atom("c", "/*"), &["true"]);
    let err = drive.create_pipeline(looped, true, false).await.unwrap_err();
    assert!(matches!(
        err,
        SluiceDriveError::ValidationError(ValidationError::Cycle { .. })
    ));

    let mut incremental = shell(
        "d",
        Input::Cross(vec![Input::atom("b", "/*"), Input::atom("c", "/*")]),
        &["true"],
    );
    incremental.incremental = true;
    let err = drive
        .create_pipeline(incremental, false, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SluiceDriveError::ValidationError(ValidationError::NonLinearIncremental { .. })
    ));
    assert_eq!(drive.list_pipeline().len(), 2);
}

#[tokio::test]
async fn delete_all_leaves_an_empty_drive() {
    let (_root, drive) = drive().await;
    drive.create_repo("data").await.unwrap();
    drive
        .create_pipeline(shell("copy", Input::atom("data", "/*"), &["true"]), false, false)
        .await
        .unwrap();
    let commit = commit(&drive, "data", &[("/file", "foo")]).await;
    flush(&drive, &commit).await;

    drive.delete_all().await.unwrap();
    assert!(drive.list_pipeline().is_empty());
    assert!(drive.list_repo().await.unwrap().is_empty());
    assert!(drive.list_job(None, None).is_empty());
    drive.shutdown().await;
}
