use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid duration {0:?}: expected [Nh][Nm][Ns], e.g. 1h30m or 45s")]
    InvalidDuration(String),
    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

/// Which guidance variant drives the session.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    /// Flat, offset-agnostic coverage guidance.
    #[default]
    Coverage,
    /// Coverage guidance with execution indexing.
    ExecutionIndex,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    #[serde(default)]
    pub engine: Engine,
    /// Fixed seed for reproducible sessions; drawn from entropy when absent.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Wall-clock budget as `[Nh][Nm][Ns]`.
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub trials: Option<u64>,
    #[serde(default)]
    pub blind: bool,
    #[serde(default)]
    pub fixed_size: bool,
    #[serde(default)]
    pub exit_on_crash: bool,
    /// Per-run time limit; 0 disables it.
    #[serde(default)]
    pub run_timeout_ms: u64,
    #[serde(default)]
    pub save_all: bool,
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,
}

pub fn default_max_input_size() -> usize {
    10 * 1024
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            engine: Engine::default(),
            random_seed: None,
            time: None,
            trials: None,
            blind: false,
            fixed_size: false,
            exit_on_crash: false,
            run_timeout_ms: 0,
            save_all: false,
            max_input_size: default_max_input_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Seed file or directory of seed files.
    #[serde(default)]
    pub input_dir: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("fuzz-results")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            input_dir: None,
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationSettings {
    /// Tokens spliced in by the dictionary insertion operator.
    #[serde(default)]
    pub dictionary: Vec<String>,
    #[serde(default = "default_max_mutations")]
    pub max_mutations: usize,
}

pub fn default_max_mutations() -> usize {
    8
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            dictionary: Vec::new(),
            max_mutations: default_max_mutations(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PreRoundSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Keep the pre-round run as the first seed.
    #[serde(default)]
    pub save_as_seed: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    #[serde(default = "default_harness_key")]
    pub harness_key: String,
}

pub fn default_harness_key() -> String {
    "magic-int".to_string()
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            harness_key: default_harness_key(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GyreConfig {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub mutation: MutationSettings,
    #[serde(default)]
    pub pre_round: PreRoundSettings,
    #[serde(default)]
    pub harness: HarnessSettings,
}

impl GyreConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: GyreConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Validates the settings and freezes them for one session.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let session = &self.session;
        if session.max_input_size == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "session.max-input-size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.mutation.max_mutations == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "mutation.max-mutations",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(SessionConfig {
            engine: session.engine,
            random_seed: session.random_seed,
            duration: session.time.as_deref().map(parse_duration).transpose()?,
            trials: session.trials,
            blind: session.blind,
            fixed_size: session.fixed_size,
            exit_on_crash: session.exit_on_crash,
            run_timeout: (session.run_timeout_ms > 0)
                .then(|| Duration::from_millis(session.run_timeout_ms)),
            save_all: session.save_all,
            max_input_size: session.max_input_size,
            seed_paths: self.corpus.input_dir.iter().cloned().collect(),
            output_dir: Some(self.corpus.output_dir.clone()),
            dictionary: self
                .mutation
                .dictionary
                .iter()
                .map(|token| token.as_bytes().to_vec())
                .collect(),
            max_mutations: self.mutation.max_mutations,
            pre_round: self.pre_round.enabled,
            pre_round_save_as_seed: self.pre_round.save_as_seed,
        })
    }
}

/// Session settings after validation. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub engine: Engine,
    pub random_seed: Option<u64>,
    pub duration: Option<Duration>,
    pub trials: Option<u64>,
    pub blind: bool,
    pub fixed_size: bool,
    pub exit_on_crash: bool,
    pub run_timeout: Option<Duration>,
    pub save_all: bool,
    pub max_input_size: usize,
    pub seed_paths: Vec<PathBuf>,
    /// `None` keeps the corpus and failures in memory only.
    pub output_dir: Option<PathBuf>,
    pub dictionary: Vec<Vec<u8>>,
    pub max_mutations: usize,
    pub pre_round: bool,
    pub pre_round_save_as_seed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            engine: Engine::Coverage,
            random_seed: None,
            duration: None,
            trials: None,
            blind: false,
            fixed_size: false,
            exit_on_crash: false,
            run_timeout: None,
            save_all: false,
            max_input_size: default_max_input_size(),
            seed_paths: Vec::new(),
            output_dir: None,
            dictionary: Vec::new(),
            max_mutations: default_max_mutations(),
            pre_round: false,
            pre_round_save_as_seed: false,
        }
    }
}

/// Parses `[Nh][Nm][Ns]`: each unit at most once, in that order, at least one present.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_string());
    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut last_rank = 0;
    for c in text.trim().chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let (rank, scale) = match c {
            'h' => (1, 3600),
            'm' => (2, 60),
            's' => (3, 1),
            _ => return Err(invalid()),
        };
        if digits.is_empty() || rank <= last_rank {
            return Err(invalid());
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        total = value
            .checked_mul(scale)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
        last_rank = rank;
    }
    if !digits.is_empty() || last_rank == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_accepts_unit_combinations() {
        assert_eq!(parse_duration("45s"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("10m"), Ok(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2h0m5s"), Ok(Duration::from_secs(7205)));
    }

    #[test]
    fn parse_duration_rejects_malformed_input() {
        for bad in ["", "10", "m", "5s1h", "1h1h", "3d", "1.5h"] {
            assert!(
                matches!(parse_duration(bad), Err(ConfigError::InvalidDuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: GyreConfig = toml::from_str("").unwrap();
        let session = config.session_config().unwrap();
        assert_eq!(session.engine, Engine::Coverage);
        assert_eq!(session.max_input_size, 10 * 1024);
        assert_eq!(session.output_dir, Some(PathBuf::from("fuzz-results")));
        assert_eq!(session.run_timeout, None);
        assert!(session.duration.is_none() && session.trials.is_none());
        assert_eq!(config.harness.harness_key, "magic-int");
    }

    #[test]
    fn full_config_is_frozen_into_session_config() {
        let text = r#"
            [session]
            engine = "execution-index"
            random-seed = 1
            time = "1m"
            trials = 5000
            fixed-size = true
            exit-on-crash = true
            run-timeout-ms = 250

            [corpus]
            input-dir = "seeds"
            output-dir = "out"

            [mutation]
            dictionary = ["GET", "POST"]

            [pre-round]
            enabled = true
            save-as-seed = true

            [harness]
            harness-key = "config-keys"
        "#;
        let config: GyreConfig = toml::from_str(text).unwrap();
        let session = config.session_config().unwrap();
        assert_eq!(session.engine, Engine::ExecutionIndex);
        assert_eq!(session.random_seed, Some(1));
        assert_eq!(session.duration, Some(Duration::from_secs(60)));
        assert_eq!(session.trials, Some(5000));
        assert_eq!(session.run_timeout, Some(Duration::from_millis(250)));
        assert_eq!(session.seed_paths, vec![PathBuf::from("seeds")]);
        assert_eq!(session.dictionary, vec![b"GET".to_vec(), b"POST".to_vec()]);
        assert!(session.pre_round && session.pre_round_save_as_seed);
        assert_eq!(config.harness.harness_key, "config-keys");
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(toml::from_str::<GyreConfig>("[session]\nspeed = 3").is_err());

        let config: GyreConfig = toml::from_str("[session]\ntime = \"soon\"").unwrap();
        assert!(matches!(
            config.session_config(),
            Err(ConfigError::InvalidDuration(_))
        ));

        let config: GyreConfig = toml::from_str("[session]\nmax-input-size = 0").unwrap();
        assert!(matches!(
            config.session_config(),
            Err(ConfigError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn load_from_file_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = GyreConfig::load_from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));

        let path = dir.path().join("gyre.toml");
        std::fs::write(&path, "[session]\ntrials = 3\n").unwrap();
        let config = GyreConfig::load_from_file(&path).unwrap();
        assert_eq!(config.session.trials, Some(3));
    }
}
