use anyhow::{bail, Context};
use attend_core::{CommitPolicy, Metric, SessionConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(BusKind::System),
            "session" | "user" => Ok(BusKind::Session),
            other => Err(format!("unknown bus: {other}")),
        }
    }
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A V4L2 device.
    Camera,
    /// A directory of image files, replayed in name order.
    Directory,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" | "v4l2" => Ok(SourceKind::Camera),
            "directory" | "dir" => Ok(SourceKind::Directory),
            other => Err(format!("unknown frame source: {other}")),
        }
    }
}

/// Upper bound for the capture and tick intervals.
const MAX_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ATTEND_CONFIG`, then `ATTEND_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera this daemon records attendance for.
    pub camera_id: String,
    pub camera_label: Option<String>,
    pub camera_location: Option<String>,
    pub source: SourceKind,
    /// V4L2 device used when `source = "camera"`.
    pub camera_device: String,
    /// Requested capture size; the driver may pick the nearest it supports.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory of frames replayed when `source = "directory"`.
    pub frames_dir: PathBuf,
    /// Restart from the first frame when the directory is exhausted.
    pub loop_frames: bool,
    /// Delay between captured frames.
    pub frame_interval_ms: u64,
    /// Delay between recognition ticks.
    pub tick_interval_ms: u64,
    /// SCRFD face detector ONNX model.
    pub detector_path: PathBuf,
    /// ArcFace ONNX model.
    pub model_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub metric: Metric,
    /// Acceptance threshold; the metric's default when unset.
    pub threshold: Option<f32>,
    /// Absence after which a presence lock is released.
    pub unlock_secs: f32,
    /// Minimum spacing between two commits of any identity.
    pub min_commit_interval_secs: f32,
    /// Maximum age of a frame whose match may still commit.
    pub freshness_secs: f32,
    /// `check-in`, `check-out` or `alternate`.
    pub policy: String,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_id: "CAM_MAIN_01".to_string(),
            camera_label: None,
            camera_location: None,
            source: SourceKind::Camera,
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            frames_dir: data_dir.join("frames"),
            loop_frames: true,
            frame_interval_ms: 100,
            tick_interval_ms: 700,
            detector_path: data_dir.join("models").join("det_10g.onnx"),
            model_path: data_dir.join("models").join("w600k_r50.onnx"),
            db_path: data_dir.join("attend.db"),
            metric: Metric::Cosine,
            threshold: None,
            unlock_secs: 5.0,
            min_commit_interval_secs: 1.0,
            freshness_secs: 2.0,
            policy: "check-in".to_string(),
            bus: BusKind::System,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attend")
}

impl Config {
    /// Load configuration from `$ATTEND_CONFIG` (if set) and `ATTEND_*` variables.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ATTEND_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply overrides from a variable lookup (the process environment in production).
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let env = Env(&var);
        if let Some(v) = var("ATTEND_CAMERA_ID") {
            self.camera_id = v;
        }
        if let Some(v) = var("ATTEND_CAMERA_LABEL") {
            self.camera_label = Some(v);
        }
        if let Some(v) = var("ATTEND_CAMERA_LOCATION") {
            self.camera_location = Some(v);
        }
        if let Some(v) = var("ATTEND_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ATTEND_DETECTOR_PATH") {
            self.detector_path = PathBuf::from(v);
        }
        if let Some(v) = var("ATTEND_FRAMES_DIR") {
            self.frames_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATTEND_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = var("ATTEND_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ATTEND_POLICY") {
            self.policy = v;
        }
        self.loop_frames = var("ATTEND_LOOP_FRAMES")
            .map(|v| v != "0")
            .unwrap_or(self.loop_frames);
        self.source = env.parse("ATTEND_SOURCE", self.source);
        self.camera_width = env.parse("ATTEND_CAMERA_WIDTH", self.camera_width);
        self.camera_height = env.parse("ATTEND_CAMERA_HEIGHT", self.camera_height);
        self.frame_interval_ms = env.parse("ATTEND_FRAME_INTERVAL_MS", self.frame_interval_ms);
        self.tick_interval_ms = env.parse("ATTEND_TICK_INTERVAL_MS", self.tick_interval_ms);
        self.metric = env.parse("ATTEND_METRIC", self.metric);
        self.threshold = env.parse_opt("ATTEND_THRESHOLD").or(self.threshold);
        self.unlock_secs = env.parse("ATTEND_UNLOCK_SECS", self.unlock_secs);
        self.min_commit_interval_secs =
            env.parse("ATTEND_MIN_COMMIT_INTERVAL_SECS", self.min_commit_interval_secs);
        self.freshness_secs = env.parse("ATTEND_FRESHNESS_SECS", self.freshness_secs);
        self.bus = env.parse("ATTEND_BUS", self.bus);
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.camera_id.trim().is_empty() {
            bail!("camera_id must not be empty");
        }
        for (name, secs) in [
            ("unlock_secs", self.unlock_secs),
            ("min_commit_interval_secs", self.min_commit_interval_secs),
            ("freshness_secs", self.freshness_secs),
        ] {
            if Duration::try_from_secs_f32(secs).is_err() {
                bail!("{name} must be a non-negative number of seconds, got {secs}");
            }
        }
        if self.tick_interval_ms == 0 || self.tick_interval_ms > MAX_INTERVAL_MS {
            bail!("tick_interval_ms must be between 1 and {MAX_INTERVAL_MS}");
        }
        if self.frame_interval_ms > MAX_INTERVAL_MS {
            bail!("frame_interval_ms must be at most {MAX_INTERVAL_MS}");
        }
        if self.source == SourceKind::Camera && (self.camera_width == 0 || self.camera_height == 0) {
            bail!("camera_width and camera_height must be positive");
        }
        if let Some(t) = self.threshold {
            if !t.is_finite() {
                bail!("threshold must be finite");
            }
        }
        self.commit_policy()?;
        Ok(())
    }

    pub fn commit_policy(&self) -> anyhow::Result<CommitPolicy> {
        self.policy.parse().map_err(anyhow::Error::msg)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold.unwrap_or_else(|| self.metric.default_threshold())
    }

    /// Session timings. Call after [`validate`](Self::validate); an
    /// out-of-range value falls back to the default.
    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        let secs = |value: f32, fallback: Duration| {
            Duration::try_from_secs_f32(value).unwrap_or(fallback)
        };
        SessionConfig {
            min_commit_interval: secs(self.min_commit_interval_secs, defaults.min_commit_interval),
            unlock_after: secs(self.unlock_secs, defaults.unlock_after),
            freshness: secs(self.freshness_secs, defaults.freshness),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse_opt<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = (self.0)(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
                None
            }
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.parse_opt(key).unwrap_or(default)
    }
}
