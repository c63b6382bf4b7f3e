use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use watchpost::config::{CameraConfig, SecondaryProviderConfig};
use watchpost::detect::{Capability, GearKind};
use watchpost::fusion::AttributeState;
use watchpost::ingest::{Pacer, SyntheticSource};
use watchpost::stats::CollectingStatsSink;
use watchpost::storage::{RecordId, WorkerConfig};
use watchpost::{
    CameraContext, FanOut, LoopCoordinator, SettingsHandle, SqliteRecordStore,
};

const PERSON: &str = r#"{
    "name": "person-replay",
    "capability": "presence",
    "default": [ { "bbox": [20, 20, 100, 110], "confidence": 0.9, "track_id": 7 } ]
}"#;

const BARE_FACE: &str = r#"{
    "name": "mask-replay",
    "capability": "gear:mask",
    "default": [
        { "bbox": [22, 18, 98, 112], "confidence": 0.85, "attributes": { "compliant": false } }
    ]
}"#;

fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn camera(dir: &Path, id: &str) -> CameraConfig {
    let mut camera = CameraConfig::new(id);
    camera.width = 160;
    camera.height = 120;
    camera.providers.primary = Some(write(dir, "person.json", PERSON));
    camera.providers.secondaries.push(SecondaryProviderConfig {
        path: write(dir, "mask.json", BARE_FACE),
        min_iou: Some(0.3),
    });
    camera
}

fn run_camera(db: &str, camera: &CameraConfig, frames: u64) {
    let store = SqliteRecordStore::open(db, &camera.id).unwrap();
    let mut ctx = CameraContext::from_config(
        camera,
        SettingsHandle::new(camera.settings.clone()),
        Box::new(store),
        WorkerConfig::default(),
        Arc::new(FanOut::default()),
        Arc::new(CollectingStatsSink::new()),
    )
    .unwrap();
    ctx.source = Box::new(SyntheticSource::new(&camera.id, camera.width, camera.height).with_limit(frames));
    ctx.pacer = Pacer::unpaced();
    let report = LoopCoordinator::new(ctx).run().unwrap();
    assert_eq!(report.frames_read, frames);
    assert_eq!(report.persistence.persisted, frames);
    assert_eq!(report.persistence.failed, 0);
}

#[test]
fn violations_survive_reopen_with_verified_snapshots() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("watchpost.db");
    let db = db.to_str().unwrap();
    let prep = camera(dir.path(), "prep-1");

    run_camera(db, &prep, 12);

    let store = SqliteRecordStore::open(db, "prep-1").unwrap();
    assert_eq!(store.record_count().unwrap(), 12);
    assert_eq!(store.persisted_sequences().unwrap(), (1..=12).collect::<Vec<_>>());

    let first = store.load_result(RecordId(1)).unwrap().unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(first.subjects.len(), 1);
    assert_eq!(first.subjects[0].detection.track_id, Some(7));
    assert!(matches!(
        first.subjects[0].attribute(Capability::Gear(GearKind::Mask)),
        AttributeState::Present { value: false, .. }
    ));

    let snapshot = store.snapshot_for(RecordId(12)).unwrap().unwrap();
    assert_eq!((snapshot.width, snapshot.height), (160, 120));
    assert!(snapshot.verify());
    assert_eq!(&snapshot.jpeg[..2], &[0xff, 0xd8]);
}

#[test]
fn cameras_share_one_database_without_mixing_records() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("shared.db");
    let db = db.to_str().unwrap();

    run_camera(db, &camera(dir.path(), "prep-1"), 5);
    run_camera(db, &camera(dir.path(), "wash-2"), 3);

    let prep = SqliteRecordStore::open(db, "prep-1").unwrap();
    let wash = SqliteRecordStore::open(db, "wash-2").unwrap();
    assert_eq!(prep.record_count().unwrap(), 5);
    assert_eq!(wash.record_count().unwrap(), 3);
    assert_eq!(wash.persisted_sequences().unwrap(), vec![1, 2, 3]);
}

#[test]
fn missing_recording_fails_camera_setup() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("setup.db");
    let mut broken = camera(dir.path(), "prep-1");
    broken.providers.primary = Some(dir.path().join("absent.json"));

    let store = SqliteRecordStore::open(db.to_str().unwrap(), "prep-1").unwrap();
    let ctx = CameraContext::from_config(
        &broken,
        SettingsHandle::new(broken.settings.clone()),
        Box::new(store),
        WorkerConfig::default(),
        Arc::new(FanOut::default()),
        Arc::new(CollectingStatsSink::new()),
    );
    assert!(ctx.is_err());
}
