use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "spotter.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8711";
const DEFAULT_S3_ENDPOINT: &str = "http://127.0.0.1:9000";
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_S3_BUCKET: &str = "spotter-files";
const DEFAULT_MAX_RUNTIME_SECS: u64 = 60 * 60;

#[derive(Debug, Deserialize, Default)]
struct SpotterConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    object_store: Option<ObjectStoreConfigFile>,
    pipeline: Option<PipelineConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ObjectStoreConfigFile {
    endpoint: Option<String>,
    region: Option<String>,
    bucket: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    max_runtime_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SpotterConfig {
    pub db_path: String,
    pub api_addr: String,
    pub object_store: ObjectStoreSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Watchdog for a single run. Decode can block indefinitely on a stalled
    /// live source; a run past this budget drains and terminates.
    pub max_runtime: Duration,
}

impl SpotterConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SPOTTER_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SpotterConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let object_store = {
            let os = file.object_store.unwrap_or_default();
            ObjectStoreSettings {
                endpoint: os
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_S3_ENDPOINT.to_string()),
                region: os.region.unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
                bucket: os.bucket.unwrap_or_else(|| DEFAULT_S3_BUCKET.to_string()),
                access_key_id: os.access_key_id.unwrap_or_default(),
                secret_access_key: os.secret_access_key.unwrap_or_default(),
            }
        };
        let pipeline = PipelineSettings {
            max_runtime: Duration::from_secs(
                file.pipeline
                    .and_then(|pipeline| pipeline.max_runtime_secs)
                    .unwrap_or(DEFAULT_MAX_RUNTIME_SECS),
            ),
        };
        Self {
            db_path,
            api_addr,
            object_store,
            pipeline,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SPOTTER_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("SPOTTER_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(endpoint) = std::env::var("SPOTTER_S3_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.object_store.endpoint = endpoint;
            }
        }
        if let Ok(region) = std::env::var("SPOTTER_S3_REGION") {
            if !region.trim().is_empty() {
                self.object_store.region = region;
            }
        }
        if let Ok(bucket) = std::env::var("SPOTTER_S3_BUCKET") {
            if !bucket.trim().is_empty() {
                self.object_store.bucket = bucket;
            }
        }
        if let Ok(key_id) = std::env::var("SPOTTER_S3_ACCESS_KEY_ID") {
            self.object_store.access_key_id = key_id;
        }
        if let Ok(secret) = std::env::var("SPOTTER_S3_SECRET_ACCESS_KEY") {
            self.object_store.secret_access_key = secret;
        }
        if let Ok(secs) = std::env::var("SPOTTER_MAX_RUNTIME_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("SPOTTER_MAX_RUNTIME_SECS must be an integer number of seconds")
            })?;
            self.pipeline.max_runtime = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.object_store.bucket.trim().is_empty() {
            return Err(anyhow!("object_store.bucket must not be empty"));
        }
        url::Url::parse(&self.object_store.endpoint)
            .map_err(|e| anyhow!("invalid object_store.endpoint: {}", e))?;
        if self.pipeline.max_runtime.as_secs() == 0 {
            return Err(anyhow!("pipeline.max_runtime_secs must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SpotterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
