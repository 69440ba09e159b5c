//! Connection diagnostics: reachability, CORS preflight and endpoint probes against the
//! assistant backend, run one after another with progress reported after every step.

use crate::config::DiagnosticsConfig;
use crate::logger::Logger;
use reqwest::header::{HeaderMap, ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, CONTENT_TYPE, ORIGIN};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::json;

const CATEGORY: &str = "DIAGNOSTICS";
const NOT_SET: &str = "not set";

/// Probes in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Probe {
    Network,
    CorsPreflight,
    ApiEndpoint,
}

impl Probe {
    pub const ALL: [Probe; 3] = [Probe::Network, Probe::CorsPreflight, Probe::ApiEndpoint];

    pub fn name(&self) -> &'static str {
        match self {
            Probe::Network => "network",
            Probe::CorsPreflight => "cors-preflight",
            Probe::ApiEndpoint => "api-endpoint",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Probe::Network => "Network connectivity",
            Probe::CorsPreflight => "CORS preflight",
            Probe::ApiEndpoint => "API endpoint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticStatus {
    Pending,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub test_name: String,
    pub status: DiagnosticStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl DiagnosticResult {
    fn new(probe: Probe, status: DiagnosticStatus, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            test_name: probe.name().to_string(),
            status,
            message: message.into(),
            details,
        }
    }

    pub fn pending(probe: Probe) -> Self {
        Self::new(
            probe,
            DiagnosticStatus::Pending,
            format!("Testing {}...", probe.title()),
            None,
        )
    }
}

/// Classify the preflight response: 2xx passes, 405 is tolerated, anything else fails.
pub fn classify_preflight(status: StatusCode, headers: &HeaderMap) -> DiagnosticResult {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(NOT_SET)
            .to_string()
    };
    if status.is_success() {
        DiagnosticResult::new(
            Probe::CorsPreflight,
            DiagnosticStatus::Success,
            "CORS preflight passed",
            Some(format!(
                "Allowed origin: {}\nAllowed methods: {}\nAllowed headers: {}",
                header("access-control-allow-origin"),
                header("access-control-allow-methods"),
                header("access-control-allow-headers"),
            )),
        )
    } else if status == StatusCode::METHOD_NOT_ALLOWED {
        DiagnosticResult::new(
            Probe::CorsPreflight,
            DiagnosticStatus::Warning,
            "OPTIONS method not supported",
            Some("The server does not answer OPTIONS requests; this can be normal".to_string()),
        )
    } else {
        DiagnosticResult::new(
            Probe::CorsPreflight,
            DiagnosticStatus::Error,
            format!("CORS preflight failed ({})", status.as_u16()),
            Some("The server may not have CORS configured or rejects cross-origin requests".to_string()),
        )
    }
}

/// Classify the endpoint probe: 401 means it exists behind auth, 405 or 2xx mean it exists.
pub fn classify_endpoint(status: StatusCode) -> DiagnosticResult {
    if status == StatusCode::UNAUTHORIZED {
        DiagnosticResult::new(
            Probe::ApiEndpoint,
            DiagnosticStatus::Warning,
            "API endpoint exists but requires authentication",
            Some("The endpoint is up; a valid API key is needed".to_string()),
        )
    } else if status == StatusCode::METHOD_NOT_ALLOWED {
        DiagnosticResult::new(
            Probe::ApiEndpoint,
            DiagnosticStatus::Success,
            "API endpoint exists",
            Some("GET is not supported, but the endpoint exists".to_string()),
        )
    } else if status.is_success() {
        DiagnosticResult::new(
            Probe::ApiEndpoint,
            DiagnosticStatus::Success,
            "API endpoint is responding",
            Some("The endpoint responded normally".to_string()),
        )
    } else {
        DiagnosticResult::new(
            Probe::ApiEndpoint,
            DiagnosticStatus::Error,
            format!("API endpoint error ({})", status.as_u16()),
            Some(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )),
        )
    }
}

/// Runs the probe battery against one base URL. Holds no session state.
pub struct Diagnostics {
    base_url: String,
    config: DiagnosticsConfig,
    client: reqwest::Client,
    logger: Logger,
}

impl Diagnostics {
    pub fn new(base_url: impl Into<String>, config: DiagnosticsConfig, logger: Logger) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
            client: reqwest::Client::new(),
            logger,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run every probe in order. `on_update` sees the full result list after each change
    /// (probe pending, probe resolved). Probe failures become `Error` results, never errors.
    pub async fn run(
        &self,
        on_update: &mut (dyn FnMut(&[DiagnosticResult]) + Send),
    ) -> Vec<DiagnosticResult> {
        self.logger.info(
            CATEGORY,
            "diagnostics started",
            Some(&json!({ "baseUrl": self.base_url })),
        );
        let delay = self.config.probe_delay();
        let mut results: Vec<DiagnosticResult> = Vec::with_capacity(Probe::ALL.len());
        for probe in Probe::ALL {
            results.push(DiagnosticResult::pending(probe));
            on_update(&results);

            let result = self.run_probe(probe).await;
            self.logger.info(
                CATEGORY,
                format!("probe {} finished", probe.name()),
                Some(&result),
            );
            if let Some(slot) = results.last_mut() {
                *slot = result;
            }
            on_update(&results);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        results
    }

    /// Run a single probe.
    pub async fn run_probe(&self, probe: Probe) -> DiagnosticResult {
        match probe {
            Probe::Network => self.probe_network().await,
            Probe::CorsPreflight => self.probe_preflight().await,
            Probe::ApiEndpoint => self.probe_endpoint().await,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, String> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no response within {:?}", timeout)),
        }
    }

    async fn probe_network(&self) -> DiagnosticResult {
        match self.send(self.client.get(&self.base_url)).await {
            Ok(res) => DiagnosticResult::new(
                Probe::Network,
                DiagnosticStatus::Success,
                "Network connection OK",
                Some(format!(
                    "The server is reachable (HTTP {})",
                    res.status().as_u16()
                )),
            ),
            Err(e) => DiagnosticResult::new(
                Probe::Network,
                DiagnosticStatus::Error,
                "Network connection failed",
                Some(format!("Cannot connect to {}: {}", self.base_url, e)),
            ),
        }
    }

    async fn probe_preflight(&self) -> DiagnosticResult {
        let request = self
            .client
            .request(Method::OPTIONS, &self.base_url)
            .header(ORIGIN, self.config.origin.as_str())
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(ACCESS_CONTROL_REQUEST_HEADERS, "Content-Type, Authorization");
        match self.send(request).await {
            Ok(res) => classify_preflight(res.status(), res.headers()),
            Err(e) => DiagnosticResult::new(
                Probe::CorsPreflight,
                DiagnosticStatus::Error,
                "CORS preflight request failed",
                Some(e),
            ),
        }
    }

    async fn probe_endpoint(&self) -> DiagnosticResult {
        let url = format!("{}/chat-messages", self.base_url);
        let request = self.client.get(&url).header(CONTENT_TYPE, "application/json");
        match self.send(request).await {
            Ok(res) => classify_endpoint(res.status()),
            Err(e) => DiagnosticResult::new(
                Probe::ApiEndpoint,
                DiagnosticStatus::Error,
                "API endpoint is not reachable",
                Some(e),
            ),
        }
    }
}
