use std::str::FromStr;

use tracing_subscriber::{filter::LevelFilter, prelude::*, Registry};

/// Configures the subscriber from the meta-config's logLevel/logFile.
/// Stdout belongs to the CNI result protocol, so diagnostics go to stderr
/// or, when configured, a file. Never fails the command.
pub fn init(level: Option<&str>, file: Option<&str>) {
    let level = level
        .and_then(|l| LevelFilter::from_str(l).ok())
        .unwrap_or(LevelFilter::INFO);
    // try_init keeps an already-installed subscriber (repeat invocations).
    let _ = match file.map(std::fs::File::create) {
        Some(Ok(f)) => Registry::default()
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(f)
                    .with_ansi(false),
            )
            .with(level)
            .try_init(),
        _ => Registry::default()
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .with(level)
            .try_init(),
    };
}
