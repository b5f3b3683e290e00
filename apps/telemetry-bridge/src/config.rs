use crate::flatten::{ArrayPolicy, FlattenOptions};
use crate::mqtt::topic_matches_filter;
use crate::pipeline::PipelineSettings;
use crate::point::is_valid_key;
use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Optional JSON file whose keys fill in settings the environment leaves
/// unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    status_topic: Option<String>,
    #[serde(default)]
    influxdb_url: Option<String>,
    #[serde(default)]
    influxdb_org: Option<String>,
    #[serde(default)]
    influxdb_bucket: Option<String>,
    #[serde(default)]
    influxdb_token: Option<String>,
    #[serde(default)]
    buffer_capacity: Option<usize>,
    #[serde(default)]
    flush_interval_ms: Option<u64>,
    #[serde(default)]
    status_interval_ms: Option<u64>,
}

fn load_overrides(path: &Path) -> Option<ConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-bridge failed to read config overrides; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "telemetry-bridge failed to parse config overrides; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub status_topic: String,
    pub influx_url: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub influx_token: Option<String>,
    pub influx_timeout_ms: u64,
    pub measurement: String,
    pub log_measurement: String,
    pub buffer_capacity: usize,
    pub flush_interval_ms: u64,
    pub status_interval_ms: u64,
    pub rate_window_secs: u64,
    pub publish_device_rates: bool,
    pub array_policy: ArrayPolicy,
    pub flatten_separator: String,
    pub log_write_timeout_ms: u64,
    pub http_bind: String,
    pub enable_http: bool,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let mqtt_host = vars.string("BRIDGE_MQTT_HOST", "127.0.0.1");
        let mqtt_port = vars.parse("BRIDGE_MQTT_PORT", 1883u16)?;
        let mqtt_username = vars.optional("BRIDGE_MQTT_USERNAME");
        let mqtt_password = vars.optional("BRIDGE_MQTT_PASSWORD");
        let mqtt_topic_prefix = vars.string("BRIDGE_MQTT_TOPIC_PREFIX", "rgbww");
        let mqtt_keepalive_secs = vars.parse("BRIDGE_MQTT_KEEPALIVE_SECS", 30u64)?;
        let mqtt_client_id = vars.string(
            "BRIDGE_MQTT_CLIENT_ID",
            &format!("telemetry-bridge-{}", std::process::id()),
        );
        let status_topic = vars.string("BRIDGE_STATUS_TOPIC", "bridge/status");

        let influx_url = vars.string("BRIDGE_INFLUXDB_URL", "http://influxdb:8086");
        let influx_org = vars.string("BRIDGE_INFLUXDB_ORG", "default");
        let influx_bucket = vars.string("BRIDGE_INFLUXDB_BUCKET", "rgbww");
        let influx_token = vars
            .optional("BRIDGE_INFLUXDB_TOKEN")
            .or_else(|| vars.optional("RGBWW_TOKEN"));
        let influx_timeout_ms = vars.parse("BRIDGE_INFLUXDB_TIMEOUT_MS", 10_000u64)?;

        let measurement = vars.string("BRIDGE_MEASUREMENT", "rgbww_metrics");
        let log_measurement = vars.string("BRIDGE_LOG_MEASUREMENT", "rgbww_log");

        // 10 messages for each of ~100 devices.
        let buffer_capacity = vars.parse("BRIDGE_BUFFER_CAPACITY", 1000usize)?;
        let flush_interval_ms = vars.parse("BRIDGE_FLUSH_INTERVAL_MS", 5_000u64)?;
        let status_interval_ms = vars.parse("BRIDGE_STATUS_INTERVAL_MS", 10_000u64)?;
        let rate_window_secs = vars.parse("BRIDGE_RATE_WINDOW_SECS", 600u64)?;
        let publish_device_rates = vars.flag("BRIDGE_PUBLISH_DEVICE_RATES", true);
        let array_policy = vars.parse("BRIDGE_ARRAY_POLICY", ArrayPolicy::Drop)?;
        let flatten_separator = vars
            .raw("BRIDGE_FLATTEN_SEPARATOR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "_".to_string());
        let log_write_timeout_ms = vars.parse("BRIDGE_LOG_WRITE_TIMEOUT_MS", 2_000u64)?;

        let http_bind = vars.string("BRIDGE_HTTP_BIND", "0.0.0.0:8001");
        let enable_http = vars.flag("BRIDGE_ENABLE_HTTP", true);
        let otlp_endpoint = vars.optional("OTEL_EXPORTER_OTLP_ENDPOINT");

        let mut config = Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            status_topic,
            influx_url,
            influx_org,
            influx_bucket,
            influx_token,
            influx_timeout_ms,
            measurement,
            log_measurement,
            buffer_capacity,
            flush_interval_ms,
            status_interval_ms,
            rate_window_secs,
            publish_device_rates,
            array_policy,
            flatten_separator,
            log_write_timeout_ms,
            http_bind,
            enable_http,
            otlp_endpoint,
        };

        if let Some(path) = vars.optional("BRIDGE_CONFIG_PATH").map(PathBuf::from) {
            if let Some(overrides) = load_overrides(&path) {
                config.apply_overrides(&overrides, &vars);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides, vars: &Vars<'_>) {
        let unset = |key: &str| vars.optional(key).is_none();
        let text = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        if unset("BRIDGE_MQTT_HOST") {
            if let Some(host) = text(&overrides.mqtt_host) {
                self.mqtt_host = host;
            }
        }
        if unset("BRIDGE_MQTT_PORT") {
            if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
                self.mqtt_port = port;
            }
        }
        if unset("BRIDGE_MQTT_USERNAME") && overrides.mqtt_username.is_some() {
            self.mqtt_username = text(&overrides.mqtt_username);
        }
        if unset("BRIDGE_MQTT_PASSWORD") && overrides.mqtt_password.is_some() {
            self.mqtt_password = text(&overrides.mqtt_password);
        }
        if unset("BRIDGE_MQTT_TOPIC_PREFIX") {
            if let Some(prefix) = text(&overrides.mqtt_topic_prefix) {
                self.mqtt_topic_prefix = prefix;
            }
        }
        if unset("BRIDGE_STATUS_TOPIC") {
            if let Some(topic) = text(&overrides.status_topic) {
                self.status_topic = topic;
            }
        }
        if unset("BRIDGE_INFLUXDB_URL") {
            if let Some(url) = text(&overrides.influxdb_url) {
                self.influx_url = url;
            }
        }
        if unset("BRIDGE_INFLUXDB_ORG") {
            if let Some(org) = text(&overrides.influxdb_org) {
                self.influx_org = org;
            }
        }
        if unset("BRIDGE_INFLUXDB_BUCKET") {
            if let Some(bucket) = text(&overrides.influxdb_bucket) {
                self.influx_bucket = bucket;
            }
        }
        if self.influx_token.is_none() {
            self.influx_token = text(&overrides.influxdb_token);
        }
        if unset("BRIDGE_BUFFER_CAPACITY") {
            if let Some(value) = overrides.buffer_capacity.filter(|v| *v != 0) {
                self.buffer_capacity = value;
            }
        }
        if unset("BRIDGE_FLUSH_INTERVAL_MS") {
            if let Some(value) = overrides.flush_interval_ms.filter(|v| *v != 0) {
                self.flush_interval_ms = value;
            }
        }
        if unset("BRIDGE_STATUS_INTERVAL_MS") {
            if let Some(value) = overrides.status_interval_ms.filter(|v| *v != 0) {
                self.status_interval_ms = value;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            bail!("BRIDGE_BUFFER_CAPACITY must be at least 1");
        }
        if self.flush_interval_ms == 0 || self.status_interval_ms == 0 {
            bail!("flush and status intervals must be greater than zero");
        }
        if self.mqtt_topic_prefix.is_empty() || self.mqtt_topic_prefix.contains(['+', '#']) {
            bail!("invalid MQTT topic prefix {:?}", self.mqtt_topic_prefix);
        }
        if self.status_topic.is_empty() || self.status_topic.contains(['+', '#']) {
            bail!("invalid status topic {:?}", self.status_topic);
        }
        for measurement in [&self.measurement, &self.log_measurement] {
            if !is_valid_key(measurement) {
                bail!("invalid measurement name {measurement:?}");
            }
        }
        for filter in self.inbound_filters() {
            if topic_matches_filter(&filter, &self.status_topic) {
                return Err(anyhow!(
                    "status topic {} matches inbound subscription {filter}; it would feed back into the bridge",
                    self.status_topic
                ));
            }
        }
        if self.status_topic.starts_with(&self.bridge_topic_root()) {
            bail!(
                "status topic {} must not live under {}",
                self.status_topic,
                self.bridge_topic_root()
            );
        }
        Ok(())
    }

    pub fn status_report_filter(&self) -> String {
        format!("{}/+/monitor", self.mqtt_topic_prefix)
    }

    pub fn log_filter(&self) -> String {
        format!("{}/+/log", self.mqtt_topic_prefix)
    }

    pub fn inbound_filters(&self) -> [String; 2] {
        [self.status_report_filter(), self.log_filter()]
    }

    /// Topics under this root belong to bridges and are never ingested.
    pub fn bridge_topic_root(&self) -> String {
        format!("{}/bridge", self.mqtt_topic_prefix)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn influx_timeout(&self) -> Duration {
        Duration::from_millis(self.influx_timeout_ms)
    }

    pub fn log_write_timeout(&self) -> Duration {
        Duration::from_millis(self.log_write_timeout_ms)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            measurement: self.measurement.clone(),
            log_measurement: self.log_measurement.clone(),
            flatten: FlattenOptions {
                separator: self.flatten_separator.clone(),
                arrays: self.array_policy,
            },
            rate_window: Duration::from_secs(self.rate_window_secs),
            publish_device_rates: self.publish_device_rates,
        }
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|err| anyhow!("{err}"))
                .with_context(|| format!("invalid {key}")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.optional(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(default)
    }
}
