//! Environment switches, read once when an allocator is built from the
//! environment.

use std::{env, path::PathBuf};

use thiserror::Error;

pub const TRACE_VAR: &str = "DIAGALLOC_TRACE";
pub const DONT_FREE_VAR: &str = "DIAGALLOC_DONT_FREE";
pub const LEAK_REPORT_VAR: &str = "DIAGALLOC_LEAK_REPORT";

pub const MAX_TRACE_LEVEL: u8 = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a non-negative integer, got {value:?}")]
    NotAnInteger { var: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// 0 silent, 1 a line per operation, 2 plus filtered call stack, 3 plus
    /// unfiltered call stack
    pub trace_level: u8,
    /// Skip the real release so freed addresses are never handed out again
    pub dont_free: bool,
    /// Where to dump a JSON [`Snapshot`](crate::alloc::diagnostic::Snapshot)
    /// when leaks are detected
    pub leak_report: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Unset and empty variables mean "default"
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let trace_level = integer(&lookup, TRACE_VAR)?.min(MAX_TRACE_LEVEL as u64) as u8;
        let dont_free = integer(&lookup, DONT_FREE_VAR)? != 0;
        let leak_report = lookup(LEAK_REPORT_VAR)
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            trace_level,
            dont_free,
            leak_report,
        })
    }
}

fn integer<F>(lookup: &F, var: &'static str) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(0),
        Some(value) if value.trim().is_empty() => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::NotAnInteger { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |var| {
            vars.iter()
                .find(|(k, _)| *k == var)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(Config::from_lookup(lookup(&[])), Ok(Config::default()));
    }

    #[test]
    fn reads_all_switches() {
        let config = Config::from_lookup(lookup(&[
            (TRACE_VAR, "2"),
            (DONT_FREE_VAR, "1"),
            (LEAK_REPORT_VAR, "/tmp/leaks.json"),
        ]))
        .unwrap();
        assert_eq!(config.trace_level, 2);
        assert!(config.dont_free);
        assert_eq!(config.leak_report, Some(PathBuf::from("/tmp/leaks.json")));
    }

    #[test]
    fn trace_level_is_clamped() {
        let config = Config::from_lookup(lookup(&[(TRACE_VAR, "9")])).unwrap();
        assert_eq!(config.trace_level, MAX_TRACE_LEVEL);
    }

    #[test]
    fn empty_values_are_defaults() {
        let config = Config::from_lookup(lookup(&[(TRACE_VAR, " "), (LEAK_REPORT_VAR, "")]));
        assert_eq!(config, Ok(Config::default()));
    }

    #[test]
    fn rejects_garbage() {
        let err = Config::from_lookup(lookup(&[(DONT_FREE_VAR, "yes")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::NotAnInteger {
                var: DONT_FREE_VAR,
                value: "yes".to_owned()
            }
        );
        assert!(err.to_string().starts_with(DONT_FREE_VAR));
    }
}
