use std::{env, panic, process};

use backtrace::Backtrace;
use clap::Parser;

use libtestmirror::cli::{resolve_path, Options};
use libtestmirror::logging;

fn main() {
    #[cfg(feature = "profile-with-tracy")]
    profiling::tracy_client::Client::start();

    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<no message>");

        let location = panic_info
            .location()
            .map(|location| format!(" at {}:{}", location.file(), location.line()))
            .unwrap_or_default();

        log::error!(
            "testmirror {} panicked{}: {}",
            env!("CARGO_PKG_VERSION"),
            location,
            message
        );

        if env::var("RUST_BACKTRACE").is_ok_and(|var| var == "1") {
            eprintln!("{:?}", Backtrace::new());
        } else {
            eprintln!("note: set RUST_BACKTRACE=1 to print a backtrace");
        }

        process::exit(1);
    }));

    let options = Options::parse();

    let results_dir = resolve_path(options.subcommand.results_dir()).into_owned();

    let file_log_level = logging::quick_read_file_log_level(&results_dir)
        .unwrap_or(Some(tracing::level_filters::LevelFilter::TRACE));

    let command_name = format!("testmirror-{}", options.subcommand.command_name());

    let _log_guard = logging::init_logging(
        options.global.verbosity,
        options.global.color,
        Some(&results_dir),
        file_log_level,
        &command_name,
    );

    if let Err(err) = options.run() {
        log::error!("{:?}", err);
        process::exit(1);
    }
}
