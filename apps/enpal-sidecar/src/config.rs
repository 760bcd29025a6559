use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/enpal-sidecar/config.json";

fn setup_config_path() -> PathBuf {
    if let Some(path) = env_optional("ENPAL_SETUP_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    if let Some(state_dir) = env_optional("ENPAL_STATE_DIR") {
        return PathBuf::from(state_dir).join("config.json");
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

/// Values a setup UI may have written. Env vars always win.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    enpal_host_ip: Option<String>,
    #[serde(default)]
    enpal_host_port: Option<u16>,
    #[serde(default)]
    enpal_token: Option<String>,
    #[serde(default)]
    battery_max_capacity_kwh: Option<f64>,
    #[serde(default)]
    poll_interval_secs: Option<u64>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "enpal-sidecar failed to read setup config; using env only"
            );
            return None;
        }
    };
    parse_setup_config(contents).or_else(|| {
        tracing::warn!(
            path = %path.display(),
            "enpal-sidecar failed to parse setup config; using env only"
        );
        None
    })
}

fn parse_setup_config(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).ok()
}

#[derive(Clone, Debug)]
pub struct Config {
    pub enpal_host: String,
    pub enpal_port: u16,
    pub enpal_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub installation_name: String,
    pub poll_interval_secs: u64,
    pub query_window_secs: u64,
    pub query_bucket_secs: u64,
    pub query_timeout_secs: u64,
    pub discovery_retry_secs: u64,
    pub battery_max_capacity: f64,
    pub http_bind: String,
    pub enable_mqtt: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_discovery_prefix: String,
    pub mqtt_topic_prefix: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_config_overrides().unwrap_or_default();
        Self::resolve(&overrides)
    }

    fn resolve(overrides: &SetupConfigOverrides) -> Result<Self> {
        let enpal_host = env_optional("ENPAL_HOST_IP")
            .or_else(|| non_empty(overrides.enpal_host_ip.as_deref()))
            .context("ENPAL_HOST_IP is required (or enpal_host_ip in the setup config)")?;
        let enpal_port = env_parse::<u16>("ENPAL_HOST_PORT")
            .or(overrides.enpal_host_port.filter(|v| *v != 0))
            .unwrap_or(8086);
        let enpal_token = env_optional("ENPAL_TOKEN")
            .or_else(|| non_empty(overrides.enpal_token.as_deref()))
            .context("ENPAL_TOKEN is required (or enpal_token in the setup config)")?;

        let influx_org =
            env_optional("ENPAL_INFLUX_ORG").unwrap_or_else(|| "my-new-org".to_string());
        let influx_bucket =
            env_optional("ENPAL_INFLUX_BUCKET").unwrap_or_else(|| "my-new-bucket".to_string());
        let installation_name = env_optional("ENPAL_INSTALLATION_NAME")
            .unwrap_or_else(|| "Enpal Solar Installation".to_string());

        let poll_interval_secs = env_parse::<u64>("ENPAL_POLL_INTERVAL_SECS")
            .or(overrides.poll_interval_secs)
            .filter(|v| *v != 0)
            .unwrap_or(120);
        let query_window_secs = env_parse::<u64>("ENPAL_QUERY_WINDOW_SECS")
            .filter(|v| *v != 0)
            .unwrap_or(300);
        let query_bucket_secs = env_parse::<u64>("ENPAL_QUERY_BUCKET_SECS")
            .filter(|v| *v != 0)
            .unwrap_or(120);
        let query_timeout_secs = env_parse::<u64>("ENPAL_QUERY_TIMEOUT_SECS")
            .filter(|v| *v != 0)
            .unwrap_or(30);
        let discovery_retry_secs = env_parse::<u64>("ENPAL_DISCOVERY_RETRY_SECS")
            .filter(|v| *v != 0)
            .unwrap_or(30);
        let battery_max_capacity = env_parse::<f64>("ENPAL_BATTERY_MAX_CAPACITY_KWH")
            .or(overrides.battery_max_capacity_kwh)
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(10.0);

        let http_bind =
            env_optional("ENPAL_HTTP_BIND").unwrap_or_else(|| "127.0.0.1:9102".to_string());

        let enable_mqtt = env_optional("ENPAL_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let mqtt_host = env_optional("ENPAL_MQTT_HOST")
            .or_else(|| non_empty(overrides.mqtt_host.as_deref()))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let mqtt_port = env_parse::<u16>("ENPAL_MQTT_PORT")
            .or(overrides.mqtt_port.filter(|v| *v != 0))
            .unwrap_or(1883);
        let mqtt_username = env_optional("ENPAL_MQTT_USERNAME")
            .or_else(|| non_empty(overrides.mqtt_username.as_deref()));
        let mqtt_password = env_optional("ENPAL_MQTT_PASSWORD")
            .or_else(|| non_empty(overrides.mqtt_password.as_deref()));
        let mqtt_client_id = env_optional("ENPAL_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("enpal-sidecar-{}", std::process::id()));
        let mqtt_discovery_prefix = env_optional("ENPAL_MQTT_DISCOVERY_PREFIX")
            .unwrap_or_else(|| "homeassistant".to_string());
        let mqtt_topic_prefix =
            env_optional("ENPAL_MQTT_TOPIC_PREFIX").unwrap_or_else(|| "enpal".to_string());

        let otlp_endpoint = env_optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            enpal_host,
            enpal_port,
            enpal_token,
            influx_org,
            influx_bucket,
            installation_name,
            poll_interval_secs,
            query_window_secs,
            query_bucket_secs,
            query_timeout_secs,
            discovery_retry_secs,
            battery_max_capacity,
            http_bind,
            enable_mqtt,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_discovery_prefix,
            mqtt_topic_prefix,
            otlp_endpoint,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn query_window(&self) -> Duration {
        Duration::from_secs(self.query_window_secs)
    }

    pub fn query_bucket(&self) -> Duration {
        Duration::from_secs(self.query_bucket_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn discovery_retry(&self) -> Duration {
        Duration::from_secs(self.discovery_retry_secs)
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_optional(key).and_then(|value| value.parse::<T>().ok())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}
