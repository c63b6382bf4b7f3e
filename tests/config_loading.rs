use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use watchpost::config::{CameraSettings, ConfigWatcher, PipelineConfig, SettingsHandle};
use watchpost::policy::PolicyMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "WATCHPOST_CONFIG",
        "WATCHPOST_DB_PATH",
        "WATCHPOST_MQTT_ADDR",
        "WATCHPOST_TOPIC_PREFIX",
        "WATCHPOST_MQTT_PASSWORD",
        "WATCHPOST_DETECTION_INTERVAL",
        "WATCHPOST_POLICY_MODE",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file.flush().expect("flush config");
    file
}

const JSON_CONFIG: &str = r#"{
    "db_path": "line.db",
    "mqtt": {
        "addr": "broker.local:1883",
        "topic_prefix": "plant-a",
        "username": "daemon"
    },
    "persistence": { "queue_capacity": 32 },
    "retention": { "seconds": 3600, "sweep_seconds": 60 },
    "cameras": [
        {
            "id": "prep-1",
            "source": "stub://prep",
            "width": 320,
            "height": 240,
            "target_fps": 5,
            "settings": {
                "detection_interval": 3,
                "policy": { "mode": "violations_only" }
            }
        },
        {
            "id": "wash-2",
            "rules": [
                { "violation": "missed_behavior:hand_washing", "severity": 0.9 }
            ]
        }
    ]
}"#;

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".json", JSON_CONFIG);
    std::env::set_var("WATCHPOST_CONFIG", file.path());
    std::env::set_var("WATCHPOST_MQTT_ADDR", "mqtts://broker.example:8883");
    std::env::set_var("WATCHPOST_MQTT_PASSWORD", "hunter2");
    std::env::set_var("WATCHPOST_TOPIC_PREFIX", "plant-b/");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "line.db");
    assert_eq!(cfg.mqtt.addr, "mqtts://broker.example:8883");
    assert_eq!(cfg.mqtt.topic_prefix, "plant-b");
    assert_eq!(cfg.mqtt.username.as_deref(), Some("daemon"));
    assert_eq!(cfg.mqtt.password.as_deref(), Some("hunter2"));
    assert_eq!(cfg.persistence.queue_capacity, 32);
    let retention = cfg.persistence.retention.unwrap();
    assert_eq!(retention.max_age, Duration::from_secs(3600));
    assert_eq!(retention.every, Duration::from_secs(60));
    assert_eq!(cfg.source_path.as_deref(), Some(file.path()));

    let prep = cfg.camera("prep-1").unwrap();
    assert_eq!(prep.source, "stub://prep");
    assert_eq!((prep.width, prep.height, prep.target_fps), (320, 240, 5));
    assert_eq!(prep.settings.detection_interval, 3);
    assert_eq!(prep.settings.policy.mode, PolicyMode::ViolationsOnly);
    assert_eq!(prep.settings.stream_interval, 1);

    let wash = cfg.camera("wash-2").unwrap();
    assert_eq!(wash.source, "stub://wash-2");
    assert_eq!(wash.rules.rules.len(), 1);
    assert_eq!(wash.settings, CameraSettings::default());

    clear_env();
}

#[test]
fn env_overrides_apply_to_every_camera() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".json", JSON_CONFIG);
    std::env::set_var("WATCHPOST_DETECTION_INTERVAL", "6");
    std::env::set_var("WATCHPOST_POLICY_MODE", "all");

    let cfg = PipelineConfig::load_from_path(file.path()).expect("load config");
    for camera in &cfg.cameras {
        assert_eq!(camera.settings.detection_interval, 6);
        assert_eq!(camera.settings.policy.mode, PolicyMode::All);
    }

    std::env::set_var("WATCHPOST_POLICY_MODE", "sometimes");
    assert!(PipelineConfig::load_from_path(file.path()).is_err());

    clear_env();
}

#[test]
fn loads_toml_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
db_path = "toml.db"

[mqtt]
enabled = false

[retention]
seconds = 0

[[cameras]]
id = "cold-room"
source = "file:///var/lib/watchpost/cold.rgb"

[cameras.settings]
stream_interval = 2
min_iou = 0.4
"#,
    );

    let cfg = PipelineConfig::load_from_path(file.path()).expect("load toml");
    assert_eq!(cfg.db_path, "toml.db");
    assert!(!cfg.mqtt.enabled);
    assert!(cfg.persistence.retention.is_none());
    assert_eq!(cfg.cameras.len(), 1);
    let camera = &cfg.cameras[0];
    assert_eq!(camera.id, "cold-room");
    assert_eq!(camera.settings.stream_interval, 2);
    assert!((camera.settings.min_iou - 0.4).abs() < f32::EPSILON);

    clear_env();
}

#[test]
fn rejects_invalid_configs() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cases = [
        r#"{ "cameras": [] }"#,
        r#"{ "cameras": [ { "id": "a" }, { "id": "a" } ] }"#,
        r#"{ "cameras": [ { "id": "bad id" } ] }"#,
        r#"{ "cameras": [ { "id": "a", "width": 0 } ] }"#,
        r#"{ "cameras": [ { "id": "a", "settings": { "detection_interval": 0 } } ] }"#,
        r#"{ "mqtt": { "topic_prefix": "plant/#" } }"#,
        r#"{ "persistence": { "queue_capacity": 0 } }"#,
        r#"{ "cameras": [ { "id": "a", "rules": [ { "violation": "missing_gear:cape", "severity": 0.5 } ] } ] }"#,
        r#"{ "db_path": 7 }"#,
    ];
    for body in cases {
        let file = config_file(".json", body);
        assert!(
            PipelineConfig::load_from_path(file.path()).is_err(),
            "accepted {}",
            body
        );
    }

    clear_env();
}

#[test]
fn watcher_reloads_changed_settings_and_ignores_bad_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = config_file(".json", JSON_CONFIG);
    let cfg = PipelineConfig::load_from_path(file.path()).expect("load config");
    let mut handles = BTreeMap::new();
    for camera in &cfg.cameras {
        handles.insert(camera.id.clone(), SettingsHandle::new(camera.settings.clone()));
    }
    let prep = handles["prep-1"].clone();
    let wash = handles["wash-2"].clone();
    let mut watcher = ConfigWatcher::new(file.path(), handles);

    assert_eq!(watcher.poll_once().unwrap(), 0);

    let rewrite = |file: &mut NamedTempFile, body: &str, bump: u64| {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        std::io::Seek::rewind(f).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f.flush().unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(bump))
            .unwrap();
    };

    let updated = JSON_CONFIG.replace(r#""detection_interval": 3"#, r#""detection_interval": 9"#);
    rewrite(&mut file, &updated, 10);
    assert_eq!(watcher.poll_once().unwrap(), 1);
    assert_eq!(prep.snapshot().1.detection_interval, 9);
    assert_eq!(prep.version(), 1);
    assert_eq!(wash.version(), 0);

    rewrite(&mut file, "{ not json", 20);
    assert!(watcher.poll_once().is_err());
    assert_eq!(prep.snapshot().1.detection_interval, 9);
    assert_eq!(prep.version(), 1);

    clear_env();
}
