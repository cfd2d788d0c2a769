//! End-to-end runs of planned scripts against the in-memory file system.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hauler_core::{EngineConfig, ScriptSettings};
use hauler_ops::fs::{VolumeKind, VolumeSpec};
use hauler_ops::{
    plan_script, start_script, Clock, Decision, ErrorCategory, FileSystem, Job, MemFs, PlanKind,
    PlanRequest, ScriptOutcome,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn copy_request(source: &str, destination: &str) -> PlanRequest {
    PlanRequest::new(PlanKind::Copy, vec![PathBuf::from(source)]).with_destination(destination)
}

/// Clock following tokio's (possibly paused) time.
#[derive(Debug)]
struct TokioClock {
    origin: tokio::time::Instant,
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[tokio::test]
async fn test_large_local_copy_is_identical() {
    let fs = MemFs::new();
    let data = pattern(10 * 1024 * 1024);
    fs.add_file("/s/big", data.clone());
    fs.add_dir("/t");

    let script = plan_script(&fs, &copy_request("/s/big", "/t")).unwrap();
    assert!(!script.operations[0].flags.prefers_pipelined());
    let total = script.totals.total_size;

    let handle = start_script(Job::new(script, Arc::new(fs.clone())));
    let status = Arc::clone(&handle.status);
    let report = handle.run_with(|_| Decision::Cancel).await.unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(fs.get_data(Path::new("/t/big")), Some(data));
    assert_eq!(status.transferred_and_progress(), (10 * 1024 * 1024, total));
}

#[tokio::test]
async fn test_network_copy_is_pipelined() {
    let fs = MemFs::new();
    fs.set_inline_completion(false);
    fs.add_volume(VolumeSpec::new("/net1", VolumeKind::Network));
    fs.add_volume(VolumeSpec::new("/net2", VolumeKind::Network));
    let len = 2 * 1024 * 1024;
    let data = pattern(len);
    fs.add_file("/net1/file", data.clone());
    fs.add_dir("/net2");

    assert_eq!(EngineConfig::default().async_buffer_for(len as u64), 256 * 1024);
    let script = plan_script(&fs, &copy_request("/net1/file", "/net2")).unwrap();
    assert!(script.operations[0].flags.prefers_pipelined());

    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|_| Decision::Cancel)
        .await
        .unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.bytes_transferred, len as u64);
    assert_eq!(fs.get_data(Path::new("/net2/file")), Some(data));
}

#[tokio::test]
async fn test_move_on_one_volume_renames_tree() {
    let fs = MemFs::new();
    fs.add_file("/s/d/a", pattern(5000));
    fs.add_file("/s/d/sub/b", pattern(300));
    fs.add_dir("/t");
    let before = fs.metadata(Path::new("/s/d")).unwrap().modified;

    let request = PlanRequest::new(PlanKind::Move, vec!["/s/d".into()]).with_destination("/t");
    let script = plan_script(&fs, &request).unwrap();
    assert_eq!(script.len(), 1);

    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|_| Decision::Cancel)
        .await
        .unwrap();
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.bytes_transferred, 0);
    assert!(!fs.exists(Path::new("/s/d")));
    assert_eq!(fs.get_data(Path::new("/t/d/sub/b")), Some(pattern(300)));
    assert_eq!(fs.metadata(Path::new("/t/d")).unwrap().modified, before);
}

async fn disk_full_then_retry(use_async_copy: bool) {
    let fs = MemFs::new();
    fs.add_volume(VolumeSpec::new("/net", VolumeKind::Network).capacity(600_000));
    fs.add_dir("/net/t");
    let data = pattern(1_000_000);
    fs.add_file("/s/file", data.clone());

    let script = plan_script(&fs, &copy_request("/s/file", "/net/t")).unwrap();
    let config = EngineConfig {
        use_async_copy,
        ..Default::default()
    };

    let mut asked = Vec::new();
    let answers = fs.clone();
    let report = start_script(Job::new(script, Arc::new(fs.clone())).with_config(config))
        .run_with(|request| {
            asked.push(request.category);
            match request.category {
                ErrorCategory::InsufficientSpace => Decision::Ignore,
                ErrorCategory::Write => {
                    answers.set_capacity("/net", None);
                    Decision::Retry
                }
                _ => Decision::Cancel,
            }
        })
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(asked, [ErrorCategory::InsufficientSpace, ErrorCategory::Write]);
    assert_eq!(report.bytes_transferred, 1_000_000);
    assert_eq!(fs.get_data(Path::new("/net/t/file")), Some(data));
}

#[tokio::test]
async fn test_disk_full_resumes_pipelined_copy() {
    disk_full_then_retry(true).await;
}

#[tokio::test]
async fn test_disk_full_restarts_simple_copy() {
    disk_full_then_retry(false).await;
}

#[tokio::test(start_paused = true)]
async fn test_speed_limit_holds_rate() {
    const LIMIT: u64 = 64 * 1024;
    let fs = MemFs::new();
    fs.add_file("/s/file", pattern(1024 * 1024));
    fs.add_dir("/t");

    let settings = ScriptSettings {
        speed_limit: Some(LIMIT),
        ..Default::default()
    };
    let request = copy_request("/s/file", "/t").with_settings(settings);
    let script = plan_script(&fs, &request).unwrap();
    let clock = Arc::new(TokioClock {
        origin: tokio::time::Instant::now(),
    });

    let handle = start_script(Job::new(script, Arc::new(fs.clone())).with_clock(clock));
    tokio::time::sleep(Duration::from_secs(5)).await;
    let (transferred, _) = handle.status.transferred_and_progress();
    assert!(
        (4 * LIMIT..=6 * LIMIT).contains(&transferred),
        "{transferred} bytes after 5 s"
    );

    handle.control.cancel();
    let report = handle.run_with(|_| Decision::Cancel).await.unwrap();
    assert_eq!(report.outcome, ScriptOutcome::Cancelled);
    assert!(!fs.exists(Path::new("/t/file")));
}

#[tokio::test]
async fn test_skipped_overwrite_changes_nothing() {
    let fs = MemFs::new();
    fs.add_file("/s/a", b"new content".to_vec());
    fs.add_file("/t/a", b"old".to_vec());
    fs.add_file("/t/b", b"kept".to_vec());

    let request = copy_request("/s/a", "/t");
    let mut snapshots = Vec::new();
    for _ in 0..2 {
        let script = plan_script(&fs, &request).unwrap();
        let report = start_script(Job::new(script, Arc::new(fs.clone())))
            .run_with(|request| match request.category {
                ErrorCategory::Overwrite => Decision::Skip,
                _ => Decision::Cancel,
            })
            .await
            .unwrap();
        assert_eq!(report.outcome, ScriptOutcome::Finished);
        assert_eq!(report.skipped, 1);
        snapshots.push((
            fs.paths(),
            fs.get_data(Path::new("/t/a")),
            fs.get_data(Path::new("/t/b")),
        ));
    }
    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(snapshots[0].1.as_deref(), Some(&b"old"[..]));
    assert_eq!(snapshots[0].2.as_deref(), Some(&b"kept"[..]));
}

#[tokio::test]
async fn test_skip_all_answers_once() {
    let fs = MemFs::new();
    for name in ["a", "b", "c"] {
        fs.add_file(format!("/s/{name}"), b"new".to_vec());
        fs.add_file(format!("/t/{name}"), b"old".to_vec());
    }
    let request = PlanRequest::new(
        PlanKind::Copy,
        vec!["/s/a".into(), "/s/b".into(), "/s/c".into()],
    )
    .with_destination("/t");
    let script = plan_script(&fs, &request).unwrap();

    let mut questions = 0;
    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|_| {
            questions += 1;
            Decision::SkipAll
        })
        .await
        .unwrap();
    assert_eq!(questions, 1);
    assert_eq!(report.skipped, 3);
    assert_eq!(fs.get_data(Path::new("/t/c")), Some(b"old".to_vec()));
}
