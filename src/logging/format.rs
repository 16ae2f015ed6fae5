//! JSON log lines: one JSON object per line (ndjson) for ingestion and audit.

use serde::Serialize;
use std::io::Write;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Out-of-band record for lines written straight to the report sink (summaries, parity).
#[derive(Serialize)]
pub struct LogEvent<'a, T: Serialize> {
    pub ts: String,
    pub level: &'a str,
    pub target: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<&'a T>,
}

impl<'a, T: Serialize> LogEvent<'a, T> {
    pub fn info(target: &'a str, message: &'a str, body: &'a T) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            level: "INFO",
            target,
            message,
            watermark: None,
            body: Some(body),
        }
    }
}

/// Initialize tracing with JSON format (one JSON object per line)
pub struct StructuredLogger;

impl StructuredLogger {
    /// Install global subscriber to stderr; stdout carries report lines. Level from RUST_LOG
    /// or `default_level`. A second call is a no-op.
    pub fn init(json: bool, default_level: &str) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let result = if json {
            let fmt = tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NONE)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry().with(filter).with(fmt).try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }

    /// Emit a single structured line (report, summary) without going through tracing
    pub fn emit_json(event: &impl Serialize, w: &mut impl Write) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(w, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_json_writes_one_line() {
        let mut buf = Vec::new();
        let body = serde_json::json!({"passed": true});
        StructuredLogger::emit_json(&LogEvent::info("parity", "report", &body), &mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        let v: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(v["body"]["passed"], true);
        assert!(v.get("watermark").is_none());
    }
}
