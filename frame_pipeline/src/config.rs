use serde::Deserialize;
use std::{collections::HashSet, path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub overlay: OverlayConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        for model in &self.models {
            model.validate()?;
            if !names.insert(model.name.as_str()) {
                return Err(format!("Duplicate model name: {}", model.name));
            }
        }
        if !(1..=100).contains(&self.sink.jpeg_quality) {
            return Err(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.sink.jpeg_quality
            ));
        }
        if self.overlay.scale == 0 {
            return Err("overlay scale must be at least 1".into());
        }
        if self.sink.kind == SinkKind::Republish && self.broker.output_topic.is_none() {
            return Err("republish sink requires broker.output_topic".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub brokers: String,
    pub group_id: String,
    pub input_topic: String,
    #[serde(default)]
    pub output_topic: Option<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_message_max_bytes")]
    pub message_max_bytes: u64,
}

fn default_compression() -> String {
    "none".into()
}

fn default_session_timeout_ms() -> u64 {
    6000
}

fn default_auto_offset_reset() -> String {
    "earliest".into()
}

fn default_message_max_bytes() -> u64 {
    100_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_reseek_min_gap")]
    pub reseek_min_gap: i64,
    #[serde(default = "default_watermark_timeout_ms")]
    pub watermark_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            reseek_min_gap: default_reseek_min_gap(),
            watermark_timeout_ms: default_watermark_timeout_ms(),
        }
    }
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_reseek_min_gap() -> i64 {
    100
}

fn default_watermark_timeout_ms() -> u64 {
    100
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn watermark_timeout(&self) -> Duration {
        Duration::from_millis(self.watermark_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub url: String,
    pub labels: PathBuf,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl ModelConfig {
    /// Explicit `family`, or the name prefix before the first `_`.
    pub fn family(&self) -> &str {
        match &self.family {
            Some(family) => family,
            None => self.name.split('_').next().unwrap_or_default(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Model name must not be empty".into());
        }
        reqwest::Url::parse(&self.url)
            .map_err(|e| format!("Invalid url for model {}: {}", self.name, e))?;
        ModelFamily::try_from(self.family())
            .map_err(|e| format!("Model {}: {}", self.name, e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Imagenet,
}

impl TryFrom<&str> for ModelFamily {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "imagenet" => Ok(Self::Imagenet),
            other => Err(format!("{} is not a recognised model family.", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OverlayConfig {
    #[serde(default = "default_overlay_x")]
    pub x: i32,
    #[serde(default = "default_base_offset")]
    pub base_offset: i32,
    #[serde(default = "default_line_height")]
    pub line_height: i32,
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default = "default_color")]
    pub color: [u8; 3],
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            x: default_overlay_x(),
            base_offset: default_base_offset(),
            line_height: default_line_height(),
            scale: default_scale(),
            color: default_color(),
        }
    }
}

fn default_overlay_x() -> i32 {
    10
}

fn default_base_offset() -> i32 {
    20
}

fn default_line_height() -> i32 {
    20
}

fn default_scale() -> u32 {
    1
}

fn default_color() -> [u8; 3] {
    [200, 150, 50]
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Stream,
    Republish,
    Display,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    pub kind: SinkKind,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_window_name")]
    pub window_name: String,
}

fn default_window_name() -> String {
    "frame_pipeline".into()
}

fn default_key() -> String {
    "video".into()
}

fn default_frame_interval_ms() -> u64 {
    50
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

impl SinkConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_restart_delay_ms")]
    pub max_restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_delay_ms: default_max_restart_delay_ms(),
        }
    }
}

fn default_restart_delay_ms() -> u64 {
    100
}

fn default_max_restart_delay_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default)]
    pub device: i32,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: 0,
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("Failed to read cwd: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("FP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const BASE: &str = r#"
log_level: info
server:
  host: 127.0.0.1
  port: 8080
broker:
  brokers: localhost:9092
  group_id: pipeline
  input_topic: frames
sink:
  kind: stream
models:
  - name: imagenet
    url: http://localhost:8501/v1/models/imagenet:predict
    labels: labels/imagenet.json
  - name: objectnet_v2
    family: imagenet
    url: http://localhost:8502/v1/models/objectnet:predict
    labels: labels/objectnet.json
"#;

    pub(crate) fn parse(yaml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize::<Config>()
            .unwrap()
    }

    #[test]
    fn test_defaults_follow_deployment() {
        let config = parse(BASE);

        assert_eq!(config.consumer.reseek_min_gap, 100);
        assert_eq!(config.broker.session_timeout_ms, 6000);
        assert_eq!(config.broker.auto_offset_reset, "earliest");
        assert_eq!(config.sink.key, "video");
        assert_eq!(config.sink.flush_timeout(), Duration::from_secs(10));
        assert_eq!(config.overlay.color, [200, 150, 50]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_order_is_preserved() {
        let config = parse(BASE);
        let names: Vec<&str> = config.models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["imagenet", "objectnet_v2"]);
    }

    #[test]
    fn test_family_from_name_prefix() {
        let config = parse(BASE);
        assert_eq!(config.models[0].family(), "imagenet");
        assert_eq!(config.models[1].family(), "imagenet");

        let model = ModelConfig {
            name: "imagenet_large".into(),
            url: "http://localhost".into(),
            labels: PathBuf::new(),
            family: None,
            request_timeout_ms: 10,
        };
        assert_eq!(model.family(), "imagenet");
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = parse(BASE);
        config.models[1].name = "imagenet".into();
        let err = config.validate().unwrap_err();
        assert!(err.contains("Duplicate model name"));
    }

    #[test]
    fn test_validate_rejects_unknown_family() {
        let mut config = parse(BASE);
        config.models[0].name = "yolo_v8".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_output_topic_for_republish() {
        let mut config = parse(BASE);
        config.sink.kind = SinkKind::Republish;
        assert!(config.validate().is_err());

        config.broker.output_topic = Some("annotated".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_display_sink_names_its_window() {
        let config = parse(&BASE.replace("kind: stream", "kind: display"));

        assert_eq!(config.sink.kind, SinkKind::Display);
        assert_eq!(config.sink.window_name, "frame_pipeline");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_parsing() {
        let level: Result<LogLevel, _> = "DEBUG".to_string().try_into();
        assert!(matches!(level, Ok(LogLevel::Debug)));
        let level: Result<LogLevel, _> = "trace".to_string().try_into();
        assert!(level.is_err());
    }
}
