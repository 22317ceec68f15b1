// Session-based logging: a tracing layer that writes one timestamped file per run
use anyhow::Result;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub struct SessionLogger {
    log_buffer: Mutex<Vec<String>>,
    log_path: PathBuf,
    log_dir: PathBuf,
    retention_count: usize,
    app_name: String,
    stream_to_file: bool,
}

impl SessionLogger {
    pub fn new(log_dir: PathBuf, app_name: &str, retention_count: usize, stream_to_file: bool) -> Result<Self> {
        fs::create_dir_all(&log_dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("{}_{}.log", app_name, timestamp);
        let log_path = log_dir.join(&log_filename);

        let logger = Self {
            log_buffer: Mutex::new(Vec::new()),
            log_path,
            log_dir,
            retention_count,
            app_name: app_name.to_string(),
            stream_to_file,
        };

        logger.clean_old_logs()?;
        logger.log(format!("=== {} Session Started ===", app_name));

        Ok(logger)
    }

    pub fn log(&self, message: impl AsRef<str>) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("[{}] {}", timestamp, message.as_ref());

        if self.stream_to_file {
            let _ = self.write_line_to_file(&log_line);
        } else {
            self.log_buffer.lock().push(log_line);
        }
    }

    fn write_line_to_file(&self, line: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    fn clean_old_logs(&self) -> Result<()> {
        let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        let prefix = format!("{}_", self.app_name);

        if let Ok(entries) = fs::read_dir(&self.log_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("log") {
                    continue;
                }
                let matches_app = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| name.starts_with(&prefix))
                    .unwrap_or(false);
                if !matches_app {
                    continue;
                }
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    log_files.push((path, modified));
                }
            }
        }

        log_files.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _) in log_files.iter().skip(self.retention_count) {
            let _ = fs::remove_file(path);
        }

        Ok(())
    }

    pub fn flush_to_disk(&self) -> Result<()> {
        let mut buffer = self.log_buffer.lock();
        if buffer.is_empty() {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        for line in buffer.iter() {
            writeln!(file, "{}", line)?;
        }

        file.flush()?;
        buffer.clear();

        Ok(())
    }

    pub fn finalize(&self) -> Result<()> {
        self.log(format!("=== {} Session Ended ===", self.app_name));
        self.flush_to_disk()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn buffered_lines(&self) -> Vec<String> {
        self.log_buffer.lock().clone()
    }
}

/// Routes tracing events into a [`SessionLogger`].
pub struct SessionLayer {
    logger: Arc<SessionLogger>,
}

impl SessionLayer {
    pub fn new(logger: Arc<SessionLogger>) -> Self {
        Self { logger }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for SessionLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let body = format!("{}{}", visitor.message, visitor.fields);
        let line = match *event.metadata().level() {
            Level::ERROR => format!("ERROR: {}", body),
            Level::WARN => format!("WARN: {}", body),
            Level::DEBUG | Level::TRACE => format!("DEBUG: {}", body),
            Level::INFO => body,
        };
        self.logger.log(line);
    }
}

static LOGGER: once_cell::sync::OnceCell<Arc<SessionLogger>> = once_cell::sync::OnceCell::new();

/// Installs the global subscriber. Streaming mode writes every line straight to
/// disk and mirrors it to stdout.
pub fn init_logger(log_dir: PathBuf, app_name: &str, retention_count: usize, stream: bool) -> Result<()> {
    let logger = Arc::new(SessionLogger::new(log_dir, app_name, retention_count, stream)?);
    LOGGER
        .set(Arc::clone(&logger))
        .map_err(|_| anyhow::anyhow!("Logger already initialized"))?;

    let level = if stream { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let stdout = if stream {
        Some(tracing_subscriber::fmt::layer().with_target(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level)
        .with(SessionLayer::new(logger))
        .with(stdout)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

pub fn finalize_logs() -> Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.finalize()?;
    }
    Ok(())
}

pub fn get_log_path() -> Option<PathBuf> {
    LOGGER.get().map(|logger| logger.log_path.clone())
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::__tracing::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::__tracing::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::__tracing::error!($($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "claritylayer_logs_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Local::now().format("%H%M%S%f")
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_layer_prefixes_levels() {
        let dir = scratch_dir("layer");
        let logger = Arc::new(SessionLogger::new(dir.clone(), "test", 5, false).unwrap());
        let subscriber = tracing_subscriber::registry().with(SessionLayer::new(Arc::clone(&logger)));

        tracing::subscriber::with_default(subscriber, || {
            crate::log_info!("frame pipeline ready");
            crate::log_warn!("monitor {} skipped", 2);
            crate::log_error!("device lost");
        });

        let lines = logger.buffered_lines();
        assert!(lines[0].ends_with("=== test Session Started ==="));
        assert!(lines.iter().any(|l| l.ends_with("] frame pipeline ready")));
        assert!(lines.iter().any(|l| l.ends_with("] WARN: monitor 2 skipped")));
        assert!(lines.iter().any(|l| l.ends_with("] ERROR: device lost")));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_finalize_writes_buffer_to_file() {
        let dir = scratch_dir("finalize");
        let logger = SessionLogger::new(dir.clone(), "test", 5, false).unwrap();
        logger.log("hello");
        logger.finalize().unwrap();

        let content = fs::read_to_string(logger.log_path()).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("=== test Session Ended ==="));
        assert!(logger.buffered_lines().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_old_sessions_beyond_retention_are_removed() {
        let dir = scratch_dir("retention");
        fs::create_dir_all(&dir).unwrap();
        for i in 0..4 {
            fs::write(dir.join(format!("test_2020010{}_000000.log", i)), "old").unwrap();
        }
        fs::write(dir.join("other_20200101_000000.log"), "keep").unwrap();

        let _logger = SessionLogger::new(dir.clone(), "test", 2, false).unwrap();

        let remaining = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("test_"))
            .count();
        assert_eq!(remaining, 2);
        assert!(dir.join("other_20200101_000000.log").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
