use chrono::Duration as ChronoDuration;
use garrison_core::{GeoPoint, LivenessPolicy, PipelineConfig, ThermalThresholds};
use garrison_hw::{Feed, ProducerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/garrison/kiosk.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then the optional TOML file, then
/// `GARRISON_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device of the visual camera.
    pub visual_device: String,
    /// V4L2 device of the thermal camera; `None` runs visual-only.
    pub thermal_device: Option<String>,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Pause between recognition iterations.
    pub poll_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub retry_delay_secs: u64,
    /// Wait for a live thermal frame before recognizing anyone.
    pub require_thermal: bool,

    pub enrollment_dir: PathBuf,
    pub cache_path: PathBuf,
    pub watch_interval_secs: u64,
    pub db_path: PathBuf,
    pub photo_dir: PathBuf,
    pub photo_url_prefix: String,
    /// Face-analysis sidecar: program followed by its arguments.
    pub analyzer_command: Vec<String>,
    /// Text-to-speech program; the phrase is appended as the last argument.
    pub speech_command: Option<Vec<String>>,

    pub match_tolerance: f32,
    pub thermal_mean_threshold: f32,
    pub thermal_variance_threshold: f32,
    pub thermal_max_threshold: f32,
    pub ear_threshold: f32,
    pub motion_threshold: u64,
    pub liveness_policy: LivenessPolicy,
    pub punch_cooldown_secs: i64,
    pub lockout_threshold: u32,
    pub lockout_secs: i64,
    pub unknown_notice_secs: i64,

    pub device_id: i64,
    pub longitude: f64,
    pub latitude: f64,

    /// Serve D-Bus on the session bus instead of the system bus.
    pub dbus_session: bool,
}

impl Default for Config {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            visual_device: "/dev/video0".into(),
            thermal_device: Some("/dev/video2".into()),
            frame_width: 640,
            frame_height: 480,
            poll_interval_ms: 100,
            connect_timeout_secs: 10,
            retry_delay_secs: 5,
            require_thermal: true,

            enrollment_dir: PathBuf::from("/var/lib/garrison/enrollment"),
            cache_path: PathBuf::from("/var/lib/garrison/encodings.json"),
            watch_interval_secs: 2,
            db_path: PathBuf::from("/var/lib/garrison/attendance.db"),
            photo_dir: PathBuf::from("/var/lib/garrison/uploads"),
            photo_url_prefix: "/uploads".into(),
            analyzer_command: vec!["/usr/lib/garrison/face-sidecar".into()],
            speech_command: None,

            match_tolerance: pipeline.match_tolerance,
            thermal_mean_threshold: pipeline.thermal.mean,
            thermal_variance_threshold: pipeline.thermal.variance,
            thermal_max_threshold: pipeline.thermal.max,
            ear_threshold: pipeline.ear_threshold,
            motion_threshold: pipeline.motion_threshold,
            liveness_policy: pipeline.liveness_policy,
            punch_cooldown_secs: pipeline.punch_cooldown.num_seconds(),
            lockout_threshold: pipeline.lockout_threshold,
            lockout_secs: pipeline.lockout_duration.num_seconds(),
            unknown_notice_secs: pipeline.unknown_notice_interval.num_seconds(),

            device_id: pipeline.device_id,
            longitude: pipeline.location.longitude,
            latitude: pipeline.location.latitude,

            dbus_session: false,
        }
    }
}

impl Config {
    /// Load `$GARRISON_CONFIG` (or the default path, if present) and apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("GARRISON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `GARRISON_*` overrides. Unparseable values keep the current setting.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = env("GARRISON_VISUAL_DEVICE") {
            self.visual_device = v;
        }
        if let Some(v) = env("GARRISON_THERMAL_DEVICE") {
            self.thermal_device = (v != "none").then_some(v);
        }
        self.frame_width = env_parse(&env, "GARRISON_FRAME_WIDTH", self.frame_width);
        self.frame_height = env_parse(&env, "GARRISON_FRAME_HEIGHT", self.frame_height);
        self.poll_interval_ms = env_parse(&env, "GARRISON_POLL_INTERVAL_MS", self.poll_interval_ms);
        self.connect_timeout_secs =
            env_parse(&env, "GARRISON_CONNECT_TIMEOUT_SECS", self.connect_timeout_secs);
        self.retry_delay_secs = env_parse(&env, "GARRISON_RETRY_DELAY_SECS", self.retry_delay_secs);
        self.require_thermal = env_bool(&env, "GARRISON_REQUIRE_THERMAL", self.require_thermal);

        if let Some(v) = env("GARRISON_ENROLLMENT_DIR") {
            self.enrollment_dir = PathBuf::from(v);
        }
        if let Some(v) = env("GARRISON_CACHE_PATH") {
            self.cache_path = PathBuf::from(v);
        }
        self.watch_interval_secs =
            env_parse(&env, "GARRISON_WATCH_INTERVAL_SECS", self.watch_interval_secs);
        if let Some(v) = env("GARRISON_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("GARRISON_PHOTO_DIR") {
            self.photo_dir = PathBuf::from(v);
        }
        if let Some(v) = env("GARRISON_PHOTO_URL_PREFIX") {
            self.photo_url_prefix = v;
        }
        if let Some(v) = env("GARRISON_ANALYZER_COMMAND") {
            self.analyzer_command = v.split_whitespace().map(String::from).collect();
        }
        if let Some(v) = env("GARRISON_SPEECH_COMMAND") {
            self.speech_command = Some(v.split_whitespace().map(String::from).collect());
        }

        self.match_tolerance = env_parse(&env, "GARRISON_MATCH_TOLERANCE", self.match_tolerance);
        self.thermal_mean_threshold =
            env_parse(&env, "GARRISON_THERMAL_MEAN", self.thermal_mean_threshold);
        self.thermal_variance_threshold =
            env_parse(&env, "GARRISON_THERMAL_VARIANCE", self.thermal_variance_threshold);
        self.thermal_max_threshold = env_parse(&env, "GARRISON_THERMAL_MAX", self.thermal_max_threshold);
        self.ear_threshold = env_parse(&env, "GARRISON_EAR_THRESHOLD", self.ear_threshold);
        self.motion_threshold = env_parse(&env, "GARRISON_MOTION_THRESHOLD", self.motion_threshold);
        self.liveness_policy = env_parse(&env, "GARRISON_LIVENESS_POLICY", self.liveness_policy);
        self.punch_cooldown_secs =
            env_parse(&env, "GARRISON_PUNCH_COOLDOWN_SECS", self.punch_cooldown_secs);
        self.lockout_threshold = env_parse(&env, "GARRISON_LOCKOUT_THRESHOLD", self.lockout_threshold);
        self.lockout_secs = env_parse(&env, "GARRISON_LOCKOUT_SECS", self.lockout_secs);
        self.unknown_notice_secs =
            env_parse(&env, "GARRISON_UNKNOWN_NOTICE_SECS", self.unknown_notice_secs);

        self.device_id = env_parse(&env, "GARRISON_DEVICE_ID", self.device_id);
        self.longitude = env_parse(&env, "GARRISON_LONGITUDE", self.longitude);
        self.latitude = env_parse(&env, "GARRISON_LATITUDE", self.latitude);

        self.dbus_session = env_bool(&env, "GARRISON_DBUS_SESSION", self.dbus_session);
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            match_tolerance: self.match_tolerance,
            thermal: ThermalThresholds {
                mean: self.thermal_mean_threshold,
                variance: self.thermal_variance_threshold,
                max: self.thermal_max_threshold,
            },
            ear_threshold: self.ear_threshold,
            motion_threshold: self.motion_threshold,
            liveness_policy: self.liveness_policy,
            punch_cooldown: ChronoDuration::seconds(self.punch_cooldown_secs),
            lockout_threshold: self.lockout_threshold,
            lockout_duration: ChronoDuration::seconds(self.lockout_secs),
            unknown_notice_interval: ChronoDuration::seconds(self.unknown_notice_secs),
            device_id: self.device_id,
            location: GeoPoint {
                longitude: self.longitude,
                latitude: self.latitude,
            },
        }
    }

    /// One producer per configured camera.
    pub fn producers(&self) -> Vec<ProducerConfig> {
        let cameras = [
            (Feed::Visual, Some(&self.visual_device)),
            (Feed::Thermal, self.thermal_device.as_ref()),
        ];
        cameras
            .into_iter()
            .filter_map(|(feed, device)| {
                let device = device?;
                Some(ProducerConfig {
                    width: self.frame_width,
                    height: self.frame_height,
                    connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                    retry_delay: Duration::from_secs(self.retry_delay_secs),
                    ..ProducerConfig::new(feed, device.clone())
                })
            })
            .collect()
    }
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match env(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparseable override");
            current
        }),
        None => current,
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str, current: bool) -> bool {
    match env(key).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_pipeline_constants() {
        let config = Config::default();
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.match_tolerance, 0.5);
        assert_eq!(pipeline.thermal, ThermalThresholds { mean: 100.0, variance: 50.0, max: 150.0 });
        assert_eq!(pipeline.punch_cooldown, ChronoDuration::seconds(30));
        assert_eq!(pipeline.lockout_threshold, 10);
        assert_eq!(pipeline.unknown_notice_interval, ChronoDuration::seconds(5));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.require_thermal);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            visual_device = "/dev/video4"
            liveness_policy = "blink-or-motion"
            match_tolerance = 0.45
            speech_command = ["espeak", "-s", "150"]
            "#,
        )
        .unwrap();
        assert_eq!(config.visual_device, "/dev/video4");
        assert_eq!(config.liveness_policy, LivenessPolicy::BlinkOrMotion);
        assert_eq!(config.match_tolerance, 0.45);
        assert_eq!(config.speech_command.as_deref().map(|c| c.len()), Some(3));
        assert_eq!(config.frame_width, 640);
        assert_eq!(config.photo_url_prefix, "/uploads");
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        assert!(Config::from_toml_str(r#"liveness_policy = "wink""#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("GARRISON_LOCKOUT_SECS", "60"),
            ("GARRISON_LIVENESS_POLICY", "motion"),
            ("GARRISON_THERMAL_DEVICE", "none"),
            ("GARRISON_DBUS_SESSION", "1"),
            ("GARRISON_SPEECH_COMMAND", "espeak -v en"),
        ]));
        assert_eq!(config.lockout_secs, 60);
        assert_eq!(config.liveness_policy, LivenessPolicy::Motion);
        assert_eq!(config.thermal_device, None);
        assert!(config.dbus_session);
        assert_eq!(
            config.speech_command,
            Some(vec!["espeak".to_string(), "-v".into(), "en".into()])
        );
    }

    #[test]
    fn test_invalid_env_value_keeps_current() {
        let mut config = Config::default();
        config.apply_overrides(overrides(&[
            ("GARRISON_MATCH_TOLERANCE", "tight"),
            ("GARRISON_REQUIRE_THERMAL", "maybe"),
        ]));
        assert_eq!(config.match_tolerance, 0.5);
        assert!(config.require_thermal);
    }

    #[test]
    fn test_producers_skip_missing_thermal() {
        let mut config = Config::default();
        assert_eq!(config.producers().len(), 2);

        config.thermal_device = None;
        let producers = config.producers();
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].feed, Feed::Visual);
        assert_eq!(producers[0].retry_delay, Duration::from_secs(5));
    }
}
