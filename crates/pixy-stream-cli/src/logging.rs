use std::path::Path;
use std::sync::OnceLock;

use pixy_stream::LogConfig;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global subscriber: a non-blocking file writer, plus stderr
/// when `config.stdout` is set. Extracted text owns stdout, so console logs
/// never go there.
pub fn init_tracing(config: &LogConfig) {
    static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    let appender = match open_log_writer(&config.file_path) {
        Ok(appender) => appender,
        Err(error) => {
            eprintln!("warning: logging disabled: {error}");
            return;
        }
    };
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    let stderr = config.stdout.then(|| plain_text(std::io::stderr));
    let installed = tracing_subscriber::registry()
        .with(level_filter(&config.level))
        .with(plain_text(file_writer))
        .with(stderr)
        .try_init();
    if let Err(error) = installed {
        eprintln!(
            "warning: logging to {} disabled: {error}",
            config.file_path.display()
        );
    }
}

/// `RUST_LOG` wins over the configured level.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn plain_text<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
}

fn open_log_writer(path: &Path) -> Result<tracing_appender::rolling::RollingFileAppender, String> {
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(directory)
        .map_err(|error| format!("create log dir {} failed: {error}", directory.display()))?;
    Ok(tracing_appender::rolling::never(directory, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_writer_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested/logs/stream.log");

        open_log_writer(&path).expect("writer opens");

        assert!(path.parent().expect("parent").is_dir());
    }

    #[test]
    fn configured_level_applies_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert_eq!(level_filter("debug").to_string(), "debug");
    }

    #[test]
    fn log_path_without_file_name_is_rejected() {
        let error = open_log_writer(Path::new("/")).expect_err("root has no file name");
        assert!(error.contains("no file name"));
    }
}
