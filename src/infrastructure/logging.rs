//! Tracing initialization.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::domain::models::LoggingConfig;

/// Initialize the global subscriber from config.
///
/// `ORCHFLOW_LOG` overrides the configured level. When a log directory is
/// configured, output additionally rolls daily into it; the returned guard
/// must be kept alive for the file writer to flush.
pub fn init(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_env("ORCHFLOW_LOG")
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    let mut guard = None;
    if let Some(ref dir) = config.file {
        let appender = tracing_appender::rolling::daily(dir, "orchflow.log");
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        if config.format == "json" {
            registry
                .with(file_layer)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).json())
                .init();
        } else {
            registry
                .with(file_layer)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    } else if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    guard
}
