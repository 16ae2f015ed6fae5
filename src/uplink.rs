//! Uplink client: deliver parity reports to the observability collector.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::ReportConfig;
use crate::error::{FeatureStoreError, Result};
use crate::logging::{LogEvent, StructuredLogger};
use crate::parity::ParityReport;

const PARITY_PATH: &str = "/api/v1/parity_reports";

enum Sink {
    Http {
        client: reqwest::blocking::Client,
        base_url: String,
    },
    Stdout,
}

pub struct ParityReporter {
    sink: Sink,
}

impl ParityReporter {
    /// HTTP when reporting is enabled with an endpoint, otherwise one JSON line per report on
    /// stdout.
    pub fn new(config: &ReportConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|_| config.enabled)
            .map(|e| e.trim_end_matches('/').to_string());
        let sink = match endpoint {
            Some(base_url) => {
                let client = reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(15))
                    .connect_timeout(Duration::from_secs(5))
                    .build()
                    .map_err(|e| FeatureStoreError::Report(e.to_string()))?;
                info!(endpoint = %base_url, "parity reports go to uplink");
                Sink::Http { client, base_url }
            }
            None => Sink::Stdout,
        };
        Ok(Self { sink })
    }

    pub fn stdout() -> Self {
        Self { sink: Sink::Stdout }
    }

    fn post<T: Serialize + ?Sized>(
        client: &reqwest::blocking::Client,
        base_url: &str,
        path: &str,
        body: &T,
    ) -> Result<()> {
        let url = format!("{}{}", base_url, path);
        let res = client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| FeatureStoreError::Report(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().unwrap_or_default();
            return Err(FeatureStoreError::Report(format!("{} {}", status, text)));
        }
        Ok(())
    }

    /// Delivery failure is returned to the caller; it never affects serving.
    pub fn report(&self, report: &ParityReport) -> Result<()> {
        match &self.sink {
            Sink::Http { client, base_url } => {
                if let Err(e) = Self::post(client, base_url, PARITY_PATH, report) {
                    warn!(error = %e, "parity report uplink failed");
                    return Err(e);
                }
                info!(passed = report.passed, "parity report uplinked");
                Ok(())
            }
            Sink::Stdout => {
                let line = LogEvent::info("featurestream::parity", "parity report", report);
                StructuredLogger::emit_json(&line, &mut std::io::stdout().lock());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_or_endpointless_falls_back_to_stdout() {
        let r = ParityReporter::new(&ReportConfig {
            enabled: true,
            endpoint: None,
        })
        .unwrap();
        assert!(matches!(r.sink, Sink::Stdout));
        let r = ParityReporter::new(&ReportConfig {
            enabled: false,
            endpoint: Some("http://localhost:9".into()),
        })
        .unwrap();
        assert!(matches!(r.sink, Sink::Stdout));
    }

    #[test]
    fn unreachable_endpoint_is_a_report_error() {
        let r = ParityReporter::new(&ReportConfig {
            enabled: true,
            endpoint: Some("http://127.0.0.1:9/".into()),
        })
        .unwrap();
        let report = ParityReport {
            timestamp: "2024-01-01T00:00:00.000Z".into(),
            reference_time: 0,
            entities_checked: 0,
            per_feature: Default::default(),
            overall_relative_error: 0.0,
            threshold: 0.005,
            passed: true,
            missing_online: 0,
            missing_offline: 0,
        };
        assert!(matches!(r.report(&report), Err(FeatureStoreError::Report(_))));
    }
}
