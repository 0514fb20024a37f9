use slog::{o, Drain, FilterLevel, Logger};

/// Build the root logger: terminal output filtered through
/// `TENANT_STORE_LOG` (env_logger syntax), behind an async drain so
/// logging never blocks connection handling.
pub fn logger(show_debug: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator)
        .use_utc_timestamp()
        .build()
        .fuse();
    let drain = slog_envlogger::LogBuilder::new(drain)
        .filter(
            None,
            if show_debug {
                FilterLevel::Debug
            } else {
                FilterLevel::Info
            },
        )
        .parse(
            std::env::var("TENANT_STORE_LOG")
                .unwrap_or_default()
                .as_str(),
        )
        .build();
    let drain = slog_async::Async::new(drain.fuse())
        .chan_size(20000)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

/// A logger that discards everything; test helper.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
