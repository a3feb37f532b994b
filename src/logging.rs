use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Map a `-v` count to the default filter, unless `RUST_LOG` is set
fn filter_for(verbose_level: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let filter_str = match verbose_level {
        0 => "warn,tool_bridge=info,llm=info",
        1 => "info,tool_bridge=debug,llm=debug",
        _ => "debug,tool_bridge=trace,llm=trace",
    };
    EnvFilter::new(filter_str)
}

/// Install the global subscriber. Logs go to stderr, or to `log_file` when it can be opened.
pub fn setup_logging(verbose_level: u8, log_file: Option<&Path>) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbose_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    let file = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!(
                    "Warning: Could not open log file {}: {e}, falling back to stderr",
                    path.display()
                );
                None
            }
        }
    });

    match file {
        Some(file) => subscriber
            .with_ansi(false)
            .with_writer(move || match file.try_clone() {
                Ok(file) => Box::new(file) as Box<dyn io::Write + Send>,
                Err(_) => Box::new(io::stderr()),
            })
            .init(),
        None => subscriber.with_writer(io::stderr).init(),
    }
}
