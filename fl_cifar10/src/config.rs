use std::{env, fs, path::Path, path::PathBuf, str::FromStr};

use federation::{FederationErr, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_DATA_DIR: &str = "data/cifar-10-batches-bin";

/// The hyper parameters of the tutorial and where its data lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// The directory holding the binary CIFAR-10 batches.
    pub data_dir: PathBuf,
    /// Shards the dataset is split into for the local simulation.
    pub shards: usize,
    pub rounds: usize,
    /// Local epochs per round.
    pub epochs: usize,
    pub train_batch_size: usize,
    pub valid_batch_size: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    /// Keeps at most this many samples of each split per shard.
    pub shard_limit: Option<usize>,
    /// Seeds initialization and shuffling, `None` for a random run.
    pub seed: Option<u64>,
    pub experiment_name: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            shards: 2,
            rounds: 5,
            epochs: 1,
            train_batch_size: 64,
            valid_batch_size: 256,
            learning_rate: 0.01,
            momentum: 0.9,
            shard_limit: None,
            seed: None,
            experiment_name: "cifar10_cnn".to_string(),
        }
    }
}

impl TrainingConfig {
    /// Reads the config from `CIFAR10_DIR`, `FL_SHARDS`, `FL_ROUNDS`, `FL_EPOCHS`,
    /// `FL_TRAIN_BATCH_SIZE`, `FL_VALID_BATCH_SIZE`, `FL_LEARNING_RATE`, `FL_MOMENTUM`,
    /// `FL_SHARD_LIMIT` and `FL_SEED`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reading variables through `var`.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = var("CIFAR10_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        set(&var, "FL_SHARDS", &mut config.shards)?;
        set(&var, "FL_ROUNDS", &mut config.rounds)?;
        set(&var, "FL_EPOCHS", &mut config.epochs)?;
        set(&var, "FL_TRAIN_BATCH_SIZE", &mut config.train_batch_size)?;
        set(&var, "FL_VALID_BATCH_SIZE", &mut config.valid_batch_size)?;
        set(&var, "FL_LEARNING_RATE", &mut config.learning_rate)?;
        set(&var, "FL_MOMENTUM", &mut config.momentum)?;

        if let Some(limit) = var("FL_SHARD_LIMIT") {
            config.shard_limit = Some(parse("FL_SHARD_LIMIT", &limit)?);
        }

        if let Some(seed) = var("FL_SEED") {
            config.seed = Some(parse("FL_SEED", &seed)?);
        }

        if config.shards == 0 {
            return Err(FederationErr::Config("FL_SHARDS must be at least 1".into()));
        }

        Ok(config)
    }

    /// Reads the config from a JSON file, missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FederationErr::Config(format!("cannot read '{}': {e}", path.display()))
        })?;

        Ok(serde_json::from_str(&content)?)
    }
}

fn set<F, T>(var: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = var(key) {
        *slot = parse(key, &raw)?;
    }

    Ok(())
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| FederationErr::Config(format!("invalid {key} '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(vars: &[(&str, &str)]) -> Result<TrainingConfig> {
        let vars: HashMap<_, _> = vars.iter().copied().collect();
        TrainingConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_follow_the_tutorial() {
        let config = from_map(&[]).unwrap();

        assert_eq!(config, TrainingConfig::default());
        assert_eq!(config.shards, 2);
        assert_eq!(config.rounds, 5);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.momentum, 0.9);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = from_map(&[
            ("CIFAR10_DIR", "/data/cifar"),
            ("FL_SHARDS", "4"),
            ("FL_ROUNDS", " 10 "),
            ("FL_SHARD_LIMIT", "500"),
            ("FL_SEED", "42"),
        ])
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/data/cifar"));
        assert_eq!(config.shards, 4);
        assert_eq!(config.rounds, 10);
        assert_eq!(config.shard_limit, Some(500));
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            from_map(&[("FL_ROUNDS", "many")]),
            Err(FederationErr::Config(_))
        ));
        assert!(matches!(
            from_map(&[("FL_SHARDS", "0")]),
            Err(FederationErr::Config(_))
        ));
    }

    #[test]
    fn json_file_fills_missing_fields() {
        let path = env::temp_dir().join(format!("fl_training_{}.json", std::process::id()));
        fs::write(&path, r#"{ "rounds": 3, "learning_rate": 0.05 }"#).unwrap();

        let config = TrainingConfig::from_json_file(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.rounds, 3);
        assert_eq!(config.learning_rate, 0.05);
        assert_eq!(config.epochs, 1);
    }
}
