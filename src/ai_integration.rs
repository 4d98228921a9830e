//! Intelligence advisor
//!
//! Optional recommendation backend consulted by the optimizer. Two
//! implementations share one call surface: an Ollama-backed advisor (behind
//! the `ai-integration` feature) and a deterministic fallback that returns
//! no-op advice. Calls are bounded by a per-call deadline; on timeout or
//! backend failure the caller proceeds without advice.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analytics::AnalysisReport;
use crate::config::CoordinationConfig;

/// Structured advice; never load-bearing for correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub action: String,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rationale: Option<String>,
}

enum AdvisorBackend {
    #[cfg(feature = "ai-integration")]
    Ollama(ollama::OllamaBackend),
    /// Deterministic no-op advice.
    Fallback,
}

/// Recommendation interface with graceful degradation.
pub struct IntelligenceAdvisor {
    backend: AdvisorBackend,
    deadline: Duration,
}

impl IntelligenceAdvisor {
    /// Pick a backend from configuration. Absent or unusable endpoints
    /// degrade to the fallback; construction never fails.
    pub async fn from_config(config: &CoordinationConfig) -> Self {
        #[cfg(feature = "ai-integration")]
        if let Some(endpoint) = &config.ollama_endpoint {
            match ollama::OllamaBackend::connect(endpoint) {
                Ok(backend) => {
                    tracing::info!(endpoint = %endpoint, "ollama advisor enabled");
                    return Self {
                        backend: AdvisorBackend::Ollama(backend),
                        deadline: config.advisor_deadline,
                    };
                }
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "ollama advisor unavailable, using fallback");
                }
            }
        }

        debug!("intelligence advisor running in fallback mode");
        Self {
            backend: AdvisorBackend::Fallback,
            deadline: config.advisor_deadline,
        }
    }

    pub fn fallback(deadline: Duration) -> Self {
        Self {
            backend: AdvisorBackend::Fallback,
            deadline,
        }
    }

    /// Ask for advice on an analysis report. `None` means "no
    /// recommendation"; callers always have a deterministic plan without it.
    pub async fn recommend(&self, report: &AnalysisReport) -> Option<Recommendation> {
        match &self.backend {
            AdvisorBackend::Fallback => Some(Recommendation {
                action: "no_op".to_string(),
                confidence: 1.0,
                rationale: None,
            }),
            #[cfg(feature = "ai-integration")]
            AdvisorBackend::Ollama(backend) => {
                match tokio::time::timeout(self.deadline, backend.recommend(report)).await {
                    Ok(Ok(recommendation)) => Some(recommendation),
                    Ok(Err(e)) => {
                        debug!(error = %e, "advisor call failed, proceeding without advice");
                        None
                    }
                    Err(_) => {
                        debug!(deadline_secs = self.deadline.as_secs(), "advisor deadline exceeded");
                        None
                    }
                }
            }
        }
    }
}

#[cfg(feature = "ai-integration")]
mod ollama {
    use anyhow::{Context, Result};
    use ollama_rs::generation::completion::request::GenerationRequest;
    use ollama_rs::Ollama;

    use super::Recommendation;
    use crate::analytics::AnalysisReport;

    const DEFAULT_MODEL: &str = "llama3.2";

    pub(super) struct OllamaBackend {
        client: Ollama,
        model: String,
    }

    impl OllamaBackend {
        pub(super) fn connect(endpoint: &str) -> Result<Self> {
            let url = url_parts(endpoint).context("invalid ollama endpoint")?;
            let (host, port) = url;
            Ok(Self {
                client: Ollama::new(host, port),
                model: std::env::var("OLLAMA_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            })
        }

        pub(super) async fn recommend(&self, report: &AnalysisReport) -> Result<Recommendation> {
            let prompt = format!(
                "You are advising a work coordination system. Current metrics: \
                 {} active items, {:.2} items per agent, team imbalance ratio {:.2}, \
                 {} spans in the telemetry log, {} stale claims. \
                 Reply with one short imperative action on the first line.",
                report.active_work,
                report.work_per_agent,
                report.team_load_imbalance_ratio,
                report.telemetry_volume,
                report.stale_claims,
            );
            let response = self
                .client
                .generate(GenerationRequest::new(self.model.clone(), prompt))
                .await
                .map_err(|e| anyhow::anyhow!("ollama generate failed: {e}"))?;

            let text = response.response.trim().to_string();
            let action = text
                .lines()
                .next()
                .unwrap_or("no_op")
                .trim()
                .to_string();
            Ok(Recommendation {
                action,
                confidence: 0.75,
                rationale: Some(text),
            })
        }
    }

    fn url_parts(endpoint: &str) -> Option<(String, u16)> {
        let rest = endpoint
            .strip_prefix("http://")
            .or_else(|| endpoint.strip_prefix("https://"))
            .unwrap_or(endpoint);
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (rest, 11434),
        };
        let scheme = if endpoint.starts_with("https://") {
            "https"
        } else {
            "http"
        };
        Some((format!("{scheme}://{host}"), port))
    }
}
