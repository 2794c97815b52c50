use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const EMBEDDER_MODEL_FILE: &str = "arcface.onnx";
const LIVENESS_MODEL_FILE: &str = "minifasnet.onnx";

/// Upper bound for `max_image_side`; keeps one capture's analysis short.
pub const MAX_IMAGE_SIDE_LIMIT: u32 = 2048;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{key} must be within [0, 1], got {value}")]
    InvalidThreshold { key: &'static str, value: f32 },
    #[error("max_image_side must be within [1, {max}], got {0}", max = MAX_IMAGE_SIDE_LIMIT)]
    InvalidImageSide(u32),
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `CLOCKFACE_*`
/// environment variables. Every file key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Run liveness scoring before matching.
    pub liveness_enabled: bool,
    /// Liveness score a capture must exceed to count as real.
    pub liveness_threshold: f32,
    /// Minimum cosine similarity for a positive match.
    pub match_threshold: f32,
    /// Minimum seconds between two attendance events of one employee.
    pub cooldown_secs: u64,
    /// Longer image side above which inputs are downscaled.
    pub max_image_side: u32,
    /// Smallest face crop side accepted for embedding.
    pub min_face_size: u32,
    /// Serve on the session bus instead of the system bus (development).
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_home().join("clockface");
        Self {
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("clockface.db"),
            liveness_enabled: true,
            liveness_threshold: clockface_core::liveness::DEFAULT_LIVENESS_THRESHOLD,
            match_threshold: clockface_core::matcher::DEFAULT_MATCH_THRESHOLD,
            cooldown_secs: clockface_core::DEFAULT_COOLDOWN.as_secs(),
            max_image_side: 640,
            min_face_size: clockface_core::onnx::DEFAULT_MIN_FACE_SIZE,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load from `$CLOCKFACE_CONFIG` (or `$XDG_CONFIG_HOME/clockface/config.toml`)
    /// and the process environment.
    ///
    /// An explicitly named config file must exist; the XDG default may be absent.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();

        let (path, required) = match env("CLOCKFACE_CONFIG") {
            Some(p) => (PathBuf::from(p), true),
            None => (config_home().join("clockface/config.toml"), false),
        };

        let file = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::info!(path = %path.display(), "loading config file");
                Some((path, text))
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        Self::from_sources(file.as_ref().map(|(p, t)| (p.as_path(), t.as_str())), env)
    }

    /// Build a config from optional TOML text and an environment lookup.
    pub fn from_sources(
        file: Option<(&Path, &str)>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some((path, text)) => toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            None => Config::default(),
        };

        if let Some(v) = env("CLOCKFACE_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("CLOCKFACE_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        env_parse(&env, "CLOCKFACE_LIVENESS_THRESHOLD", &mut config.liveness_threshold);
        env_parse(&env, "CLOCKFACE_MATCH_THRESHOLD", &mut config.match_threshold);
        env_parse(&env, "CLOCKFACE_COOLDOWN_SECS", &mut config.cooldown_secs);
        env_parse(&env, "CLOCKFACE_MAX_IMAGE_SIDE", &mut config.max_image_side);
        env_parse(&env, "CLOCKFACE_MIN_FACE_SIZE", &mut config.min_face_size);
        if let Some(v) = env("CLOCKFACE_LIVENESS_ENABLED") {
            config.liveness_enabled = env_flag(&v);
        }
        if let Some(v) = env("CLOCKFACE_SESSION_BUS") {
            config.session_bus = env_flag(&v);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("liveness_threshold", self.liveness_threshold),
            ("match_threshold", self.match_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold { key, value });
            }
        }
        if !(1..=MAX_IMAGE_SIDE_LIMIT).contains(&self.max_image_side) {
            return Err(ConfigError::InvalidImageSide(self.max_image_side));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Path to the face embedding model.
    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(EMBEDDER_MODEL_FILE)
    }

    /// Path to the trained liveness classifier.
    pub fn liveness_model_path(&self) -> PathBuf {
        self.model_dir.join(LIVENESS_MODEL_FILE)
    }
}

fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
}

fn config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Overwrite `slot` with the parsed variable. Unparseable values are
/// logged and ignored.
fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = env(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}

fn env_flag(value: &str) -> bool {
    !matches!(value, "0" | "false" | "no" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(None, env_of(&[])).unwrap();
        assert!(config.liveness_enabled);
        assert_eq!(config.liveness_threshold, 0.5);
        assert_eq!(config.match_threshold, 0.4);
        assert_eq!(config.cooldown(), Duration::from_secs(120));
        assert_eq!(config.min_face_size, 80);
        assert!(!config.session_bus);
        assert!(config.embedder_model_path().ends_with("arcface.onnx"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let toml = r#"
            match_threshold = 0.55
            cooldown_secs = 300
            model_dir = "/opt/clockface/models"
        "#;
        let env = env_of(&[
            ("CLOCKFACE_COOLDOWN_SECS", "60"),
            ("CLOCKFACE_SESSION_BUS", "1"),
            ("CLOCKFACE_LIVENESS_ENABLED", "false"),
        ]);
        let config = Config::from_sources(Some((Path::new("c.toml"), toml)), env).unwrap();

        assert_eq!(config.match_threshold, 0.55);
        assert_eq!(config.cooldown_secs, 60);
        assert_eq!(config.model_dir, PathBuf::from("/opt/clockface/models"));
        assert!(config.session_bus);
        assert!(!config.liveness_enabled);
        // untouched keys keep defaults
        assert_eq!(config.liveness_threshold, 0.5);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let err = Config::from_sources(None, env_of(&[("CLOCKFACE_LIVENESS_THRESHOLD", "1.5")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidThreshold { key: "liveness_threshold", .. }
        ));

        let err = Config::from_sources(Some((Path::new("c.toml"), "match_threshold = -0.2")), env_of(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThreshold { key: "match_threshold", .. }));
    }

    #[test]
    fn test_unparseable_env_is_ignored() {
        let config =
            Config::from_sources(None, env_of(&[("CLOCKFACE_MAX_IMAGE_SIDE", "huge")])).unwrap();
        assert_eq!(config.max_image_side, 640);
    }

    #[test]
    fn test_image_side_must_be_bounded() {
        for value in ["0", "100000"] {
            let err = Config::from_sources(None, env_of(&[("CLOCKFACE_MAX_IMAGE_SIDE", value)]))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidImageSide(_)), "{value}");
        }
        let config =
            Config::from_sources(Some((Path::new("c.toml"), "max_image_side = 2048")), env_of(&[]))
                .unwrap();
        assert_eq!(config.max_image_side, MAX_IMAGE_SIDE_LIMIT);
    }

    #[test]
    fn test_bad_toml_reports_path() {
        let err = Config::from_sources(Some((Path::new("/etc/cf.toml"), "cooldown_secs = \"x\"")), env_of(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("/etc/cf.toml"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_sources(Some((Path::new("c.toml"), "camera = 1")), env_of(&[])).is_err());
    }
}
