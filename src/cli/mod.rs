//! Defines testmirror's CLI through clap types.

mod show;
mod watch;

use std::{
    borrow::Cow,
    env,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use clap::Parser;
use thiserror::Error;

use crate::config::{MirrorConfig, SortOrder};

pub use self::show::ShowCommand;
pub use self::watch::WatchCommand;

/// Command line options that testmirror accepts, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "testmirror", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Show(subcommand) => subcommand.run(self.global),
            Subcommand::Watch(subcommand) => subcommand.run(self.global),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

impl From<ColorChoice> for termcolor::ColorChoice {
    fn from(value: ColorChoice) -> Self {
        match value {
            ColorChoice::Auto => termcolor::ColorChoice::Auto,
            ColorChoice::Always => termcolor::ColorChoice::Always,
            ColorChoice::Never => termcolor::ColorChoice::Never,
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    Show(ShowCommand),
    Watch(WatchCommand),
}

impl Subcommand {
    /// The results directory the command works on.
    pub fn results_dir(&self) -> &Path {
        match self {
            Subcommand::Show(cmd) => &cmd.dir,
            Subcommand::Watch(cmd) => &cmd.dir,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Show(_) => "show",
            Subcommand::Watch(_) => "watch",
        }
    }
}

pub fn resolve_path(path: &Path) -> Cow<'_, Path> {
    if path.is_absolute() {
        Cow::Borrowed(path)
    } else {
        match env::current_dir() {
            Ok(current) => Cow::Owned(current.join(path)),
            Err(_) => Cow::Borrowed(path),
        }
    }
}

/// Loads the directory's config and applies the sort flag shared by every
/// subcommand.
fn load_config(dir: &Path, sort: Option<SortOrder>) -> anyhow::Result<(PathBuf, MirrorConfig)> {
    let dir = resolve_path(dir).into_owned();
    let mut config = MirrorConfig::load(&dir)
        .with_context(|| format!("Could not load config for {}", dir.display()))?;

    if let Some(sort) = sort {
        config.sort = sort;
    }

    Ok((dir, config))
}
