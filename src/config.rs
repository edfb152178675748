use std::fmt;
use std::str::FromStr;

// config lets you read a separate config file
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{PolystoreError, Result};

/// The prefix of environment variables overriding file settings,
/// e.g. `POLYSTORE_BACKEND=document`.
pub const ENVIRONMENT_PREFIX: &str = "POLYSTORE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Relational,
    Document,
    Keyvalue,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::Document => write!(f, "document"),
            BackendKind::Keyvalue => write!(f, "keyvalue"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = PolystoreError;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "sqlite" => Ok(BackendKind::Relational),
            "document" => Ok(BackendKind::Document),
            "keyvalue" | "key-value" => Ok(BackendKind::Keyvalue),
            other => Err(PolystoreError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub backend: BackendKind,
    /// SQLite database path; `:memory:` keeps everything in memory.
    pub database: String,
    /// Rows per page when a caller pages through results.
    pub page_size: usize,
    /// A `tracing_subscriber::EnvFilter` directive.
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Relational,
            database: ":memory:".to_string(),
            page_size: 10,
            log_filter: "polystore=info".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, overridden by the optional file at `path` (any format the
    /// config crate recognizes by extension), overridden in turn by
    /// `POLYSTORE_*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Settings> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("backend", defaults.backend.to_string())?
            .set_default("database", defaults.database)?
            .set_default("page_size", defaults.page_size as u64)?
            .set_default("log_filter", defaults.log_filter)?;
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix(ENVIRONMENT_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        if settings.page_size == 0 {
            return Err(PolystoreError::Config("page_size must be positive".to_string()));
        }
        Ok(settings)
    }
}
