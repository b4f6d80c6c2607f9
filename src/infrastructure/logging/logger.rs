//! Global tracing subscriber setup.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use super::config::{LogConfig, LogFormat, RotationPolicy};

const LOG_FILE_PREFIX: &str = "rehearse.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Handle to the installed global subscriber. Dropping it flushes and stops
/// the background file writer, so hold it until `main` returns.
pub struct LogHandle {
    file_writer: Option<WorkerGuard>,
}

impl LogHandle {
    /// Install the global subscriber described by `config`.
    ///
    /// Console records go to stderr; stdout belongs to command output.
    /// `RUST_LOG` directives take precedence over the configured level.
    pub fn init(config: &LogConfig) -> Result<Self> {
        let filter = EnvFilter::builder()
            .with_default_directive(level_filter(&config.level)?.into())
            .from_env_lossy();

        let mut layers = vec![console_layer(config.format, filter.clone())];
        let file_writer = config.log_dir.as_deref().map(|dir| {
            let (layer, guard) = file_layer(dir, config.rotation, filter);
            layers.push(layer);
            guard
        });

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context("a global tracing subscriber is already installed")?;

        tracing::debug!(
            level = %config.level,
            format = ?config.format,
            log_dir = ?config.log_dir,
            "logging ready"
        );
        Ok(Self { file_writer })
    }

    /// True when a file layer is installed.
    pub fn writes_files(&self) -> bool {
        self.file_writer.is_some()
    }
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer().with_writer(io::stderr);
    match format {
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => base.compact().with_target(false).with_filter(filter).boxed(),
    }
}

/// Rolling JSON file output, written from a background thread.
fn file_layer(dir: &Path, rotation: RotationPolicy, filter: EnvFilter) -> (BoxedLayer, WorkerGuard) {
    let appender: RollingFileAppender = match rotation {
        RotationPolicy::Daily => rolling::daily(dir, LOG_FILE_PREFIX),
        RotationPolicy::Hourly => rolling::hourly(dir, LOG_FILE_PREFIX),
        RotationPolicy::Never => rolling::never(dir, LOG_FILE_PREFIX),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter)
        .boxed();
    (layer, guard)
}

fn level_filter(level: &str) -> Result<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .with_context(|| format!("unknown log level `{level}`"))
}
