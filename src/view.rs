//! Text rendering of a mirror subtree, for the CLI and for tests.

use std::io::{self, Write};

use termcolor::{Color, ColorSpec, NoColor, WriteColor};

use crate::{
    backing::TestStatus,
    filter::ActiveFilterQuery,
    mirror::{MirrorNode, NodeKind},
};

const INDENT: &str = "  ";

/// Renders `node` and its loaded descendants, `max_depth` levels deep.
///
/// Rendering never loads anything: branches that haven't been materialized
/// are shown as such.
pub fn render_tree(
    node: &MirrorNode,
    filter: Option<&dyn ActiveFilterQuery>,
    max_depth: Option<usize>,
) -> String {
    let mut output = NoColor::new(Vec::new());

    // Writing into a Vec can't fail.
    let _ = write_tree(&mut output, node, filter, max_depth);

    String::from_utf8_lossy(&output.into_inner())
        .trim_end()
        .to_owned()
}

pub fn write_tree<W: WriteColor>(
    output: &mut W,
    node: &MirrorNode,
    filter: Option<&dyn ActiveFilterQuery>,
    max_depth: Option<usize>,
) -> io::Result<()> {
    write_node(output, node, filter, 0, max_depth)
}

fn write_node<W: WriteColor>(
    output: &mut W,
    node: &MirrorNode,
    filter: Option<&dyn ActiveFilterQuery>,
    depth: usize,
    max_depth: Option<usize>,
) -> io::Result<()> {
    write!(output, "{}", INDENT.repeat(depth))?;

    match node.kind() {
        NodeKind::Branch(_) => {
            output.set_color(ColorSpec::new().set_bold(true))?;
            write!(output, "{}/", node.display_name())?;
            output.reset()?;

            if !node.is_materialized() {
                writeln!(output, " (not loaded)")?;
                return Ok(());
            }
            writeln!(output)?;

            if max_depth.is_some_and(|max| depth >= max) {
                return Ok(());
            }

            for child in node.loaded_children() {
                write_node(output, &child, filter, depth + 1, max_depth)?;
            }
        }
        NodeKind::Leaf(leaf) => {
            let status = leaf.handle().status();

            write!(output, "{} ", node.display_name())?;
            output.set_color(&status_color(status))?;
            write!(output, "[{}]", status)?;
            output.reset()?;

            if !node.is_accepted(filter) {
                write!(output, " (hidden)")?;
            }
            writeln!(output)?;
        }
    }

    Ok(())
}

pub fn status_color(status: TestStatus) -> ColorSpec {
    let mut spec = ColorSpec::new();
    let color = match status {
        TestStatus::Passed => Some(Color::Green),
        TestStatus::Failed => Some(Color::Red),
        TestStatus::Errored => Some(Color::Magenta),
        TestStatus::Skipped => Some(Color::Yellow),
        TestStatus::Running => Some(Color::Cyan),
        TestStatus::Pending => None,
    };
    spec.set_fg(color);
    spec
}
