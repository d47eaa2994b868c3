use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use resultfs::IoResultExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{backing::TestStatus, mirror::Comparator};

pub const CONFIG_FILE_NAME: &str = "testmirror.toml";

/// Sibling order within a branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SortOrder {
    #[default]
    Lexical,
    CaseInsensitive,

    /// Arrival order, newest first.
    None,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Lexical => "lexical",
            SortOrder::CaseInsensitive => "case-insensitive",
            SortOrder::None => "none",
        }
    }

    pub fn comparator(self) -> Option<Comparator> {
        match self {
            SortOrder::Lexical => Some(Comparator::lexical()),
            SortOrder::CaseInsensitive => Some(Comparator::case_insensitive()),
            SortOrder::None => None,
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = SortOrderParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "lexical" => Ok(SortOrder::Lexical),
            "case-insensitive" => Ok(SortOrder::CaseInsensitive),
            "none" => Ok(SortOrder::None),
            _ => Err(SortOrderParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid sort order '{attempted}'. Valid values are: lexical, case-insensitive, none")]
pub struct SortOrderParseError {
    attempted: String,
}

/// Contents of a `testmirror.toml` file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MirrorConfig {
    pub sort: SortOrder,

    /// `0` disables polling.
    pub poll_interval_ms: u64,

    pub result_suffix: String,

    /// `none` or `off` disables the log file.
    pub file_log_level: Option<String>,

    /// Statuses shown by default. Absent means everything is shown.
    pub filter: Option<Vec<TestStatus>>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sort: SortOrder::Lexical,
            poll_interval_ms: 2000,
            result_suffix: ".result.json".to_owned(),
            file_log_level: None,
            filter: None,
        }
    }
}

impl MirrorConfig {
    /// Reads `testmirror.toml` from `dir`, falling back to defaults when there
    /// isn't one.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);

        let contents = fs_err::read_to_string(&path)
            .with_not_found()
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;

        match contents {
            Some(contents) => {
                log::debug!("Loading config from {}", path.display());
                Self::from_toml(&contents, &path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    /// `None` when file logging is disabled. Unrecognized levels mean
    /// `trace`.
    pub fn file_log_level(&self) -> Option<LevelFilter> {
        match &self.file_log_level {
            Some(level) => parse_level(level),
            None => Some(LevelFilter::TRACE),
        }
    }
}

pub(crate) fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_lowercase().as_str() {
        "none" | "off" => None,
        "error" => Some(LevelFilter::ERROR),
        "warn" => Some(LevelFilter::WARN),
        "info" => Some(LevelFilter::INFO),
        "debug" => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
