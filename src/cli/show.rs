use std::{io::Write, path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use clap::Parser;
use termcolor::{BufferWriter, ColorSpec, WriteColor};

use crate::{
    backing::{BackingStore, FsStore, TestStatus},
    change::ChangeNotifier,
    config::SortOrder,
    filter::{ActiveFilterQuery, StatusFilter},
    mirror::MirrorTree,
    view,
};

use super::{load_config, GlobalOptions};

/// Print the current state of a results directory.
#[derive(Debug, Parser)]
pub struct ShowCommand {
    /// Path to the results directory. Defaults to the current directory.
    #[clap(default_value = ".")]
    pub dir: PathBuf,

    /// Sibling order: lexical, case-insensitive, or none.
    #[clap(long)]
    pub sort: Option<SortOrder>,

    /// Only show tests with these statuses. Others are listed as hidden.
    #[clap(long("only"))]
    pub only: Vec<TestStatus>,

    /// How many levels below the root to load and print.
    #[clap(long)]
    pub depth: Option<usize>,
}

impl ShowCommand {
    pub fn run(self, global: GlobalOptions) -> anyhow::Result<()> {
        let (dir, config) = load_config(&self.dir, self.sort)?;

        let store = FsStore::new(&dir, config.result_suffix.clone())
            .with_context(|| format!("Could not open {}", dir.display()))?;

        let tree = MirrorTree::new(
            Arc::new(store) as Arc<dyn BackingStore>,
            config.sort.comparator(),
            Arc::new(ChangeNotifier::new()),
        );

        let start = Instant::now();
        for err in tree.materialize_all(self.depth) {
            log::warn!("{:?}", anyhow::Error::from(err));
        }
        log::debug!("Loaded {} in {:.1?}", dir.display(), start.elapsed());

        let filter: Option<Box<dyn ActiveFilterQuery>> = if !self.only.is_empty() {
            Some(Box::new(StatusFilter::new(self.only.iter().copied())))
        } else {
            config
                .filter
                .as_ref()
                .map(|statuses| {
                    Box::new(StatusFilter::new(statuses.iter().copied()))
                        as Box<dyn ActiveFilterQuery>
                })
        };

        let writer = BufferWriter::stdout(global.color.into());
        let mut buffer = writer.buffer();

        view::write_tree(&mut buffer, tree.root(), filter.as_deref(), self.depth)?;

        let stats = tree.root().stats();
        buffer.set_color(&ColorSpec::new())?;
        writeln!(
            &mut buffer,
            "\n{} tests: {} passed, {} failed, {} errored, {} skipped, {} running, {} pending",
            stats.total(),
            stats.passed,
            stats.failed,
            stats.errored,
            stats.skipped,
            stats.running,
            stats.pending,
        )?;

        writer.print(&buffer)?;

        Ok(())
    }
}
