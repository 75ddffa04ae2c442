use std::io::Write;

use serde::Serialize;

/// Severity names matching the ones Google's structured logging ingestion
/// understands, so `RUST_LOG` output shows up with the right level when
/// shipped to a log aggregator that speaks this convention.
#[derive(Serialize)]
enum Severity {
	#[serde(rename = "DEBUG")]
	Debug,
	#[serde(rename = "INFO")]
	Info,
	#[serde(rename = "WARNING")]
	Warning,
	#[serde(rename = "ERROR")]
	Error,
}

impl From<log::Level> for Severity {
	fn from(level: log::Level) -> Self {
		match level {
			log::Level::Trace | log::Level::Debug => Severity::Debug,
			log::Level::Info => Severity::Info,
			log::Level::Warn => Severity::Warning,
			log::Level::Error => Severity::Error,
		}
	}
}

#[derive(Serialize)]
struct Log<'a> {
	severity: Severity,
	message: String,
	target: &'a str,
}

/// `env_logger::Builder::format` callback producing one JSON object per
/// line, the shape GKE's fluentd sidecar expects out of stdout.
pub fn format(
	f: &mut env_logger::fmt::Formatter,
	record: &log::Record,
) -> std::io::Result<()> {
	let log = Log {
		severity: record.level().into(),
		message: format!("{}", record.args()),
		target: record.target(),
	};
	writeln!(f, "{}", serde_json::to_string(&log).unwrap_or_default())
}
