use std::sync::Mutex;

use tempfile::NamedTempFile;

use spotter::config::SpotterConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SPOTTER_CONFIG",
        "SPOTTER_DB_PATH",
        "SPOTTER_API_ADDR",
        "SPOTTER_S3_ENDPOINT",
        "SPOTTER_S3_REGION",
        "SPOTTER_S3_BUCKET",
        "SPOTTER_S3_ACCESS_KEY_ID",
        "SPOTTER_S3_SECRET_ACCESS_KEY",
        "SPOTTER_MAX_RUNTIME_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "spotter_prod.db",
        "api": {
            "addr": "0.0.0.0:9100"
        },
        "object_store": {
            "endpoint": "http://minio.local:9000",
            "region": "eu-central-1",
            "bucket": "clips",
            "access_key_id": "AKID",
            "secret_access_key": "shh"
        },
        "pipeline": {
            "max_runtime_secs": 1200
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SPOTTER_API_ADDR", "127.0.0.1:9200");
    std::env::set_var("SPOTTER_MAX_RUNTIME_SECS", "600");

    let cfg = SpotterConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.db_path, "spotter_prod.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:9200");
    assert_eq!(cfg.object_store.endpoint, "http://minio.local:9000");
    assert_eq!(cfg.object_store.region, "eu-central-1");
    assert_eq!(cfg.object_store.bucket, "clips");
    assert_eq!(cfg.object_store.access_key_id, "AKID");
    assert_eq!(cfg.object_store.secret_access_key, "shh");
    assert_eq!(cfg.pipeline.max_runtime.as_secs(), 600);

    clear_env();
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SpotterConfig::load_from(None).expect("load config");

    assert_eq!(cfg.db_path, "spotter.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:8711");
    assert_eq!(cfg.object_store.bucket, "spotter-files");
    assert_eq!(cfg.pipeline.max_runtime.as_secs(), 3600);

    clear_env();
}

#[test]
fn rejects_a_zero_watchdog() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SPOTTER_MAX_RUNTIME_SECS", "0");
    let err = SpotterConfig::load_from(None).unwrap_err();
    assert!(err.to_string().contains("max_runtime_secs"));

    clear_env();
}
