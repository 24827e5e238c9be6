//! Tracing setup for the operator CLI.

use crate::config::{LoggingConfig, RedactSensitive};
use crate::paths::Paths;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::PathBuf;

const MAX_MESSAGE_CHARS: usize = 280;

/// Field names whose values never reach a log line when redaction is on.
const SENSITIVE_FIELDS: [&str; 5] = ["access", "refresh", "token", "key", "secret"];

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: Option<String>,
    /// Daily rolling file under `log_dir` in addition to stderr.
    pub file: bool,
    pub log_dir: PathBuf,
    pub redact_sensitive: bool,
}

impl LoggingSettings {
    pub fn from_config(logging: &LoggingConfig, paths: &Paths) -> Self {
        Self {
            level: logging.level.clone(),
            file: logging.file.unwrap_or(false),
            log_dir: paths.logs_dir(),
            redact_sensitive: logging.redact_sensitive != Some(RedactSensitive::Off),
        }
    }
}

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

fn format_field(
    writer: &mut format::Writer<'_>,
    field: &tracing::field::Field,
    value: &dyn std::fmt::Debug,
    redact: bool,
) -> std::fmt::Result {
    let field_name = field.name();

    if redact && SENSITIVE_FIELDS.contains(&field_name) {
        write!(writer, "{field_name}=<redacted>")
    } else if field_name == "message" {
        let formatted = format!("{value:?}");
        let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
        if was_truncated {
            write!(writer, "{field_name}={truncated}...")
        } else {
            write!(writer, "{field_name}={formatted}")
        }
    } else {
        write!(writer, "{field_name}={value:?}")
    }
}

fn build_env_filter(debug: bool, level: Option<&str>) -> tracing_subscriber::EnvFilter {
    if debug {
        return tracing_subscriber::EnvFilter::new("debug");
    }
    let level = level.map(str::trim).filter(|level| !level.is_empty()).unwrap_or("info");
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine-readable. Hold the returned guard until exit so the
/// file writer flushes.
pub fn init_tracing(debug: bool, settings: &LoggingSettings) -> Option<WorkerGuard> {
    let redact = settings.redact_sensitive;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .fmt_fields(format::debug_fn(move |writer, field, value| {
            format_field(writer, field, value, redact)
        }))
        .compact();

    let (file_layer, guard) = if settings.file {
        let appender = tracing_appender::rolling::daily(&settings.log_dir, "epiloop.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .fmt_fields(format::debug_fn(move |writer, field, value| {
                format_field(writer, field, value, redact)
            }))
            .compact();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(build_env_filter(debug, settings.level.as_deref()))
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_for_log_handles_multibyte_characters() {
        let (truncated, was_truncated) = truncate_for_log("abc→def", 4);
        assert!(was_truncated);
        assert_eq!(truncated, "abc→");
    }

    #[test]
    fn truncate_for_log_returns_original_when_within_limit() {
        let (truncated, was_truncated) = truncate_for_log("hello", 10);
        assert!(!was_truncated);
        assert_eq!(truncated, "hello");
    }

    #[test]
    fn redaction_defaults_on() {
        let paths = Paths::resolve(PathBuf::from("/home/t"), PathBuf::from("/"), |_| None);
        let settings = LoggingSettings::from_config(&LoggingConfig::default(), &paths);
        assert!(settings.redact_sensitive);
        assert!(!settings.file);
        assert_eq!(settings.log_dir, PathBuf::from("/home/t/.epiloop/logs"));

        let off = LoggingConfig {
            redact_sensitive: Some(RedactSensitive::Off),
            ..Default::default()
        };
        assert!(!LoggingSettings::from_config(&off, &paths).redact_sensitive);
    }
}
