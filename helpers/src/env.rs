use std::collections::HashMap;
use std::env::{self, VarError};
use std::str::FromStr;

/// The environment a component sources its configuration from,
/// either the real process environment or a fixed snapshot of values.
pub trait EnvVars: Send + Sync {
    /// Fetches the variable `key`, with a `VarError` when it is absent
    /// or unreadable.
    fn var(&self, key: &str) -> Result<String, VarError>;

    /// Fetches and parses an optional variable. An absent value and a
    /// value that fails to parse are both treated as unset, so a
    /// misconfigured option falls back to its default instead of
    /// failing startup.
    fn parsed_var<T: FromStr>(&self, key: &str) -> Option<T> {
        self.var(key).ok().and_then(|value| value.parse::<T>().ok())
    }
}

/// Environment variables sourced from the current process.
#[derive(Debug, Default, Clone)]
pub struct ProcessEnvVars;

impl EnvVars for ProcessEnvVars {
    fn var(&self, key: &str) -> Result<String, VarError> {
        env::var(key)
    }
}

/// A fixed snapshot of variables, used in tests and wherever
/// configuration is assembled away from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvSnapshot {
    values: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn from_map(values: HashMap<String, String>) -> Self {
        EnvSnapshot { values }
    }
}

impl EnvVars for EnvSnapshot {
    fn var(&self, key: &str) -> Result<String, VarError> {
        self.values.get(key).cloned().ok_or(VarError::NotPresent)
    }
}
