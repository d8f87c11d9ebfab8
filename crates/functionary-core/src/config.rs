use std::path::PathBuf;
use std::time::Duration;

pub const DATABASE_PATH_ENV: &str = "FUNCTIONARY_DATABASE_PATH";
pub const BUSY_TIMEOUT_MS_ENV: &str = "FUNCTIONARY_BUSY_TIMEOUT_MS";

/// Settings needed to open the registry's backing store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RegistryConfig {
    pub database_path: PathBuf,
    /// How long a writer waits on a locked database before reporting a conflict.
    pub busy_timeout: Duration,
}

impl RegistryConfig {
    pub const DEFAULT_DATABASE_PATH: &'static str = "./data/functionary.sqlite3";
    pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            busy_timeout: Self::DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Reads overrides from the environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let database_path = lookup(DATABASE_PATH_ENV)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_DATABASE_PATH));
        let busy_timeout = lookup(BUSY_TIMEOUT_MS_ENV)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Self::DEFAULT_BUSY_TIMEOUT);

        Self {
            database_path,
            busy_timeout,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DATABASE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn falls_back_to_defaults_when_unset() {
        assert_eq!(
            RegistryConfig::from_lookup(lookup_from(&[])),
            RegistryConfig::default()
        );
    }

    #[test]
    fn reads_overrides() {
        let config = RegistryConfig::from_lookup(lookup_from(&[
            (DATABASE_PATH_ENV, "/var/lib/functionary/registry.db"),
            (BUSY_TIMEOUT_MS_ENV, "250"),
        ]));
        assert_eq!(
            config.database_path,
            PathBuf::from("/var/lib/functionary/registry.db")
        );
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn ignores_unparsable_timeout_and_blank_path() {
        let config = RegistryConfig::from_lookup(lookup_from(&[
            (DATABASE_PATH_ENV, "  "),
            (BUSY_TIMEOUT_MS_ENV, "soon"),
        ]));
        assert_eq!(config, RegistryConfig::default());
    }
}
