//! Error reporting integration.
//!
//! When `reporting.enabled` is set, unmapped request faults are forwarded to
//! an [`ErrorReporter`]. The bundled [`HttpReporter`] posts each report as
//! JSON to the configured DSN. Delivery is fire and forget: the request that
//! produced the fault never waits on the collector.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use liftoff_common::{ReportingSettings, SupportError};

/// One captured fault.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Fault category.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Originating request, if any.
    pub request_id: Option<String>,
    /// Request path, if any.
    pub path: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

impl ErrorReport {
    /// Create a report stamped with the current time.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        Self {
            kind: kind.into(),
            message: message.into(),
            request_id: None,
            path: None,
            timestamp,
        }
    }

    /// Attach the originating request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Receives captured faults.
pub trait ErrorReporter: Send + Sync {
    /// Forward a report. Must not block the caller.
    fn capture(&self, report: ErrorReport);
}

#[derive(Serialize)]
struct Envelope<'a> {
    environment: &'a str,
    #[serde(flatten)]
    report: &'a ErrorReport,
}

/// Posts reports to an HTTP collector.
#[derive(Clone)]
pub struct HttpReporter {
    client: Client,
    endpoint: Url,
    environment: Arc<str>,
}

impl HttpReporter {
    /// Create a reporter for `dsn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the DSN is not an http(s) URL or the client cannot
    /// be built.
    pub fn new(dsn: &str, environment: impl Into<String>) -> Result<Self, SupportError> {
        let endpoint = Url::parse(dsn).map_err(|e| SupportError::InvalidDsn {
            dsn: dsn.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(SupportError::InvalidDsn {
                dsn: dsn.to_string(),
                reason: format!("unsupported scheme '{}'", endpoint.scheme()),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("liftoff/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SupportError::HttpClient {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint,
            environment: Arc::from(environment.into()),
        })
    }

    /// Collector endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Environment tag attached to every report.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Deliver one report and wait for the collector.
    pub async fn send(&self, report: &ErrorReport) -> Result<(), reqwest::Error> {
        let envelope = Envelope {
            environment: &self.environment,
            report,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&envelope)
            .send()
            .await?;

        if response.status().is_success() {
            debug!(kind = %report.kind, "Error report delivered");
        } else {
            warn!(
                kind = %report.kind,
                status = %response.status(),
                "Collector rejected error report"
            );
        }
        Ok(())
    }
}

impl ErrorReporter for HttpReporter {
    fn capture(&self, report: ErrorReport) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(kind = %report.kind, "No runtime available, dropping error report");
            return;
        };

        let reporter = self.clone();
        handle.spawn(async move {
            if let Err(e) = reporter.send(&report).await {
                warn!(kind = %report.kind, error = %e, "Failed to deliver error report");
            }
        });
    }
}

impl fmt::Debug for HttpReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpReporter")
            .field("endpoint", &self.endpoint.as_str())
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

/// Build the configured reporter.
///
/// Returns `Ok(None)` when reporting is disabled; nothing is constructed in
/// that case. `default_environment` tags reports when
/// `reporting.environment` is unset.
///
/// # Errors
///
/// Returns an error if reporting is enabled without a usable DSN.
pub fn init_reporter(
    settings: &ReportingSettings,
    default_environment: &str,
) -> Result<Option<Arc<dyn ErrorReporter>>, SupportError> {
    if !settings.enabled {
        debug!("Error reporting disabled");
        return Ok(None);
    }

    let dsn = settings
        .dsn
        .as_deref()
        .filter(|dsn| !dsn.trim().is_empty())
        .ok_or(SupportError::MissingDsn)?;
    let environment = settings
        .environment
        .as_deref()
        .unwrap_or(default_environment);

    let reporter = HttpReporter::new(dsn, environment)?;
    info!(
        endpoint = %reporter.endpoint(),
        environment,
        "Error reporting enabled"
    );
    Ok(Some(Arc::new(reporter)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_disabled_builds_nothing() {
        let settings = ReportingSettings {
            enabled: false,
            dsn: Some("not even a url".into()),
            environment: None,
        };
        assert!(init_reporter(&settings, "dev").unwrap().is_none());
    }

    #[test]
    fn test_enabled_requires_dsn() {
        let settings = ReportingSettings {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            init_reporter(&settings, "dev"),
            Err(SupportError::MissingDsn)
        ));
    }

    #[test]
    fn test_invalid_dsn() {
        let settings = ReportingSettings {
            enabled: true,
            dsn: Some("::nope".into()),
            environment: None,
        };
        assert!(matches!(
            init_reporter(&settings, "dev"),
            Err(SupportError::InvalidDsn { .. })
        ));

        let err = HttpReporter::new("ftp://collector.local/x", "dev").unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_environment_falls_back_to_default() {
        let reporter = HttpReporter::new("http://127.0.0.1:9/report", "prod").unwrap();
        assert_eq!(reporter.environment(), "prod");
    }

    #[tokio::test]
    async fn test_capture_posts_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0_u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&received).contains("\"message\":\"boom\"") {
                    break;
                }
            }
            socket
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });

        let reporter = HttpReporter::new(&format!("http://{addr}/report"), "test").unwrap();
        reporter.capture(ErrorReport::new("internal", "boom").with_request_id("req-1"));

        let request = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(request.starts_with("POST /report"));
        assert!(request.contains("\"environment\":\"test\""));
        assert!(request.contains("\"request_id\":\"req-1\""));
    }
}
