use std::{io::Write, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use futures::executor::block_on;
use termcolor::{BufferWriter, Color, ColorSpec, WriteColor};

use crate::{
    change::{ChangeKind, ChangeRecord},
    config::SortOrder,
    session::MirrorSession,
};

use super::{load_config, GlobalOptions};

/// Follow a results directory, printing every change to the mirror.
#[derive(Debug, Parser)]
pub struct WatchCommand {
    /// Path to the results directory. Defaults to the current directory.
    #[clap(default_value = ".")]
    pub dir: PathBuf,

    /// Sibling order: lexical, case-insensitive, or none.
    #[clap(long)]
    pub sort: Option<SortOrder>,

    /// Poll period in milliseconds on top of file watching. `0` disables
    /// polling.
    #[clap(long("poll-ms"))]
    pub poll_ms: Option<u64>,

    /// How many levels below the root to load up front.
    #[clap(long, default_value("1"))]
    pub depth: usize,
}

impl WatchCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let (dir, mut config) = load_config(&self.dir, self.sort)?;
        if let Some(poll_ms) = self.poll_ms {
            config.poll_interval_ms = poll_ms;
        }

        let session = MirrorSession::open(&dir, &config)
            .with_context(|| format!("Could not watch {}", dir.display()))?;

        let mut cursor = session.notifier().cursor();

        for err in session.tree().materialize_all(Some(self.depth)) {
            log::warn!("{:?}", anyhow::Error::from(err));
        }

        log::info!("Watching {} (sort: {})", dir.display(), config.sort);

        let writer = BufferWriter::stdout(global.color.into());

        loop {
            let receiver = session.notifier().subscribe(cursor);
            let Ok((new_cursor, records)) = block_on(receiver) else {
                return Ok(());
            };
            cursor = new_cursor;

            let mut buffer = writer.buffer();
            for record in &records {
                print_record(&mut buffer, record)?;
            }
            writer.print(&buffer)?;

            session.notifier().discard_before(cursor);
        }
    }
}

fn print_record<W: WriteColor>(output: &mut W, record: &ChangeRecord) -> std::io::Result<()> {
    let color = match record.kind {
        ChangeKind::Inserted => Color::Green,
        ChangeKind::Removed => Color::Red,
        ChangeKind::Changed => Color::Yellow,
        ChangeKind::StructureInvalidated => Color::Magenta,
    };

    output.set_color(ColorSpec::new().set_fg(Some(color)))?;
    write!(output, "{:>22}", record.kind.as_str())?;
    output.reset()?;

    writeln!(output, " /{} {:?}", record.names.join("/"), record.indices)
}
