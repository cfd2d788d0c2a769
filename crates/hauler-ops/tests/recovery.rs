//! Error recovery paths of file copies and moves, driven through the
//! in-memory file system.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hauler_core::{BufferTier, EngineConfig, Operation, OperationFlags, Script, ScriptSettings};
use hauler_ops::fs::{Fault, FaultOp, FileHandle, OpenMode, VolumeKind, VolumeSpec};
use hauler_ops::{
    plan_script, start_script, Clock, Decision, ErrorCategory, FileSystem, Job, MemFs, PlanKind,
    PlanRequest, ScriptOutcome,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 % 241) as u8).collect()
}

fn fast() -> OperationFlags {
    OperationFlags {
        source_is_fast: true,
        target_is_fast: true,
        ..Default::default()
    }
}

/// Two network volumes with `data` at /net1/file and an empty /net2.
fn network_pair(data: &[u8]) -> MemFs {
    let fs = MemFs::new();
    fs.set_inline_completion(false);
    fs.add_volume(VolumeSpec::new("/net1", VolumeKind::Network));
    fs.add_volume(VolumeSpec::new("/net2", VolumeKind::Network));
    fs.add_file("/net1/file", data.to_vec());
    fs.add_dir("/net2");
    fs
}

fn network_copy(fs: &MemFs) -> Script {
    let request = PlanRequest::new(PlanKind::Copy, vec![PathBuf::from("/net1/file")])
        .with_destination("/net2");
    let script = plan_script(fs, &request).unwrap();
    assert!(script.operations[0].flags.prefers_pipelined());
    script
}

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
async fn test_changed_target_restarts_pipelined_copy() {
    let data = pattern(1024 * 1024);
    let fs = network_pair(&data);
    fs.inject(Fault::new(FaultOp::Write, "/net2/file").at_offset(600_000));
    let script = network_copy(&fs);

    let mut asked = Vec::new();
    let tamper = fs.clone();
    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|request| {
            asked.push(request.category);
            if request.category != ErrorCategory::Write {
                return Decision::Cancel;
            }
            // Someone else scribbles over what was already written.
            let target = tamper
                .open_write(Path::new("/net2/file"), OpenMode::Existing)
                .unwrap();
            let len = target.size().unwrap() as usize;
            target.write_at(&vec![0; len], 0).unwrap();
            Decision::Retry
        })
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(asked, [ErrorCategory::Write]);
    assert_eq!(fs.get_data(Path::new("/net2/file")), Some(data));
    assert_eq!(report.bytes_transferred, 1024 * 1024);
}

#[tokio::test]
async fn test_pipeline_without_buffers_copies_synchronously() {
    let data = pattern(700_000);
    let fs = network_pair(&data);
    let script = network_copy(&fs);
    let config = EngineConfig {
        async_tiers: vec![BufferTier {
            max_file_size: u64::MAX,
            buffer_size: usize::MAX,
        }],
        ..Default::default()
    };

    let report = start_script(Job::new(script, Arc::new(fs.clone())).with_config(config))
        .run_with(|_| Decision::Cancel)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.bytes_transferred, 700_000);
    assert_eq!(fs.get_data(Path::new("/net2/file")), Some(data));
}

#[tokio::test]
async fn test_failed_preallocation_is_not_tried_again() {
    let len = 3 * 1024 * 1024 / 2;
    let fs = MemFs::new();
    fs.add_file("/s/a", pattern(len));
    fs.add_file("/s/b", pattern(len + 1));
    fs.add_dir("/t");
    for target in ["/t/a", "/t/b"] {
        fs.inject(Fault::new(FaultOp::SetLen, target).kind(std::io::ErrorKind::Unsupported));
    }
    let mut script = Script::default();
    script.push(Operation::copy_file("/s/a", "/t/a", len as u64).with_flags(fast()));
    script.push(Operation::copy_file("/s/b", "/t/b", len as u64 + 1).with_flags(fast()));

    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|_| Decision::Cancel)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(fs.get_data(Path::new("/t/a")), Some(pattern(len)));
    assert_eq!(fs.get_data(Path::new("/t/b")), Some(pattern(len + 1)));
    // The second target was never preallocated, so its fault is still armed.
    let second = fs.open_write(Path::new("/t/b"), OpenMode::Existing).unwrap();
    assert!(second.set_len(1).is_err());
    let first = fs.open_write(Path::new("/t/a"), OpenMode::Existing).unwrap();
    assert!(first.set_len(1).is_ok());
}

fn compressed_source() -> (MemFs, Script) {
    let fs = MemFs::new();
    fs.add_volume(VolumeSpec::new("/c", VolumeKind::Fast).compression(true));
    fs.add_file("/c/f", pattern(5000));
    fs.set_compressed(Path::new("/c/f"), true).unwrap();
    fs.add_dir("/t");

    let settings = ScriptSettings {
        preserve_attrs: true,
        ..Default::default()
    };
    let mut script = Script::new(settings);
    script.push(Operation::copy_file("/c/f", "/t/f", 5000).with_flags(fast()));
    (fs, script)
}

#[tokio::test]
async fn test_compression_loss_accepted() {
    let (fs, script) = compressed_source();
    let mut asked = Vec::new();
    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|request| {
            asked.push(request.category);
            Decision::Ignore
        })
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(asked, [ErrorCategory::CompressionLoss]);
    assert_eq!(fs.get_data(Path::new("/t/f")), Some(pattern(5000)));
    assert!(!fs.metadata(Path::new("/t/f")).unwrap().compressed);
}

#[tokio::test]
async fn test_compression_loss_refused_removes_target() {
    let (fs, script) = compressed_source();
    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|request| match request.category {
            ErrorCategory::CompressionLoss => Decision::Skip,
            _ => Decision::Cancel,
        })
        .await
        .unwrap();

    assert_eq!(report.outcome, ScriptOutcome::Finished);
    assert_eq!(report.skipped, 1);
    assert!(!fs.exists(Path::new("/t/f")));
    assert!(fs.exists(Path::new("/c/f")));
}

#[tokio::test]
async fn test_move_across_volumes_copies_then_deletes() {
    let fs = MemFs::new();
    fs.add_volume(VolumeSpec::new("/b", VolumeKind::Fast));
    fs.add_file("/s/f", pattern(80_000));
    fs.add_dir("/b");
    let mut script = Script::default();
    script.push(Operation::move_file("/s/f", "/b/f", 80_000, false).with_flags(fast()));

    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|_| Decision::Cancel)
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.bytes_transferred, 80_000);
    assert_eq!(fs.get_data(Path::new("/b/f")), Some(pattern(80_000)));
    assert!(!fs.exists(Path::new("/s/f")));
}

#[tokio::test]
async fn test_move_of_readonly_file_renames_without_asking() {
    let fs = MemFs::new();
    fs.add_file("/s/f", pattern(100));
    fs.add_dir("/t");
    fs.set_readonly(Path::new("/s/f"), true).unwrap();
    let mut script = Script::default();
    script.push(Operation::move_file("/s/f", "/t/f", 100, true));

    let mut asked = Vec::new();
    let report = start_script(Job::new(script, Arc::new(fs.clone())))
        .run_with(|request| {
            asked.push(request.category);
            Decision::Cancel
        })
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.summary());
    assert!(asked.is_empty(), "asked {asked:?}");
    assert_eq!(report.bytes_transferred, 0);
    assert!(!fs.exists(Path::new("/s/f")));
    assert!(fs.metadata(Path::new("/t/f")).unwrap().readonly);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_pipelined_copy_removes_target() {
    let len = 2 * 1024 * 1024;
    let fs = network_pair(&pattern(len));
    // Paused time cannot wait on the blocking pool.
    fs.set_inline_completion(true);
    let settings = ScriptSettings {
        speed_limit: Some(64 * 1024),
        ..Default::default()
    };
    let request = PlanRequest::new(PlanKind::Copy, vec![PathBuf::from("/net1/file")])
        .with_destination("/net2")
        .with_settings(settings);
    let script = plan_script(&fs, &request).unwrap();
    assert!(script.operations[0].flags.prefers_pipelined());
    let clock = Arc::new(TokioClock {
        origin: tokio::time::Instant::now(),
    });

    let handle = start_script(Job::new(script, Arc::new(fs.clone())).with_clock(clock));
    tokio::time::sleep(Duration::from_secs(3)).await;
    let (transferred, _) = handle.status.transferred_and_progress();
    assert!(transferred < len as u64, "{transferred} bytes after 3 s");
    assert!(fs.exists(Path::new("/net2/file")));

    handle.control.cancel();
    let report = handle.run_with(|_| Decision::Cancel).await.unwrap();
    assert_eq!(report.outcome, ScriptOutcome::Cancelled);
    assert!(!fs.exists(Path::new("/net2/file")));
}
