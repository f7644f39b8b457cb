use std::str::FromStr;

use crate::{Error, Result};

/// How chatty user-facing logging is. Ordered from quietest to loudest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error,
    Warning,
    Success,
    Info,
    Hint,
    Debug,
}

impl FromStr for Verbosity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "0" => Ok(Verbosity::Error),
            "warning" | "1" => Ok(Verbosity::Warning),
            "success" | "2" => Ok(Verbosity::Success),
            "info" | "3" => Ok(Verbosity::Info),
            "hint" | "4" => Ok(Verbosity::Hint),
            "debug" | "5" => Ok(Verbosity::Debug),
            other => Err(Error::Config(format!("unknown verbosity: {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub verbosity: Verbosity,
    /// Look for records with the same name before creating a new one.
    pub upon_create_search_names: bool,
    /// Explicit database override; transfers are skipped while it is set.
    pub using_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Warning,
            upon_create_search_names: true,
            using_key: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();

        if let Ok(v) = std::env::var("LAMINDB_VERBOSITY") {
            settings.verbosity = v.parse()?;
        }
        if let Ok(v) = std::env::var("LAMINDB_UPON_CREATE_SEARCH_NAMES") {
            settings.upon_create_search_names = parse_bool("LAMINDB_UPON_CREATE_SEARCH_NAMES", &v)?;
        }
        settings.using_key = std::env::var("LAMINDB_USING_KEY").ok().filter(|v| !v.is_empty());

        Ok(settings)
    }

    /// Whether messages at `level` should be shown.
    pub fn logs(&self, level: Verbosity) -> bool {
        self.verbosity >= level
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => Err(Error::Config(format!("{key} must be a boolean, got {other:?}"))),
    }
}
