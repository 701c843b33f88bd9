use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use mapflow_core::fetch::{
    FetchPoint, ImageryProvider, PointResponse, PointResult, ProviderError, Scene,
};
use mapflow_core::types::{DateRange, PointId};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// JSON-over-HTTP imagery provider.
pub struct HttpProvider {
    base_url: String,
    token: Option<String>,
    client: Client,
}

#[derive(Serialize)]
struct TimeseriesRequest<'a> {
    points: &'a [FetchPoint],
    start: NaiveDate,
    end: NaiveDate,
    bands: &'a [String],
}

#[derive(Deserialize)]
struct TimeseriesResponse {
    results: Vec<WireResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireStatus {
    Ok,
    Rejected,
    Unavailable,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    id: PointId,
    status: WireStatus,
    #[serde(default)]
    scenes: Vec<Scene>,
    #[serde(default)]
    reason: Option<String>,
}

impl WireResult {
    fn into_point_result(self) -> PointResult {
        let reason = self.reason.unwrap_or_else(|| "no reason given".to_string());
        let response = match self.status {
            WireStatus::Ok => PointResponse::Series(self.scenes),
            WireStatus::Rejected => PointResponse::Rejected(reason),
            WireStatus::Unavailable => PointResponse::Unavailable(reason),
        };
        PointResult {
            id: self.id,
            response,
        }
    }
}

/// Seconds form of `Retry-After`; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Only credential failures stop the run; any other refused batch is retried
/// and its points fail on their own.
fn refusal(status: StatusCode, detail: &str) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Unreachable(format!("provider refused credentials ({status}): {detail}"))
        }
        _ => ProviderError::Transient(format!("provider refused batch ({status}): {detail}")),
    }
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn from_env() -> Result<Self> {
        let base_url =
            env::var("MAPFLOW_PROVIDER_URL").context("MAPFLOW_PROVIDER_URL must be set")?;
        let token = env::var("MAPFLOW_PROVIDER_TOKEN").ok();
        Self::new(base_url, token)
    }
}

#[async_trait]
impl ImageryProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn request(
        &self,
        points: &[FetchPoint],
        range: &DateRange,
        bands: &[String],
    ) -> Result<Vec<PointResult>, ProviderError> {
        let body = TimeseriesRequest {
            points,
            start: range.start,
            end: range.end,
            bands,
        };

        let mut request = self
            .client
            .post(format!("{}/timeseries", self.base_url))
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_connect() {
                ProviderError::Unreachable(err.to_string())
            } else {
                ProviderError::Transient(err.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("provider returned {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(refusal(status, &text));
        }

        let parsed: TimeseriesResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Transient(format!("malformed provider response: {err}")))?;
        debug!(points = points.len(), results = parsed.results.len(), "provider responded");

        Ok(parsed
            .results
            .into_iter()
            .map(WireResult::into_point_result)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_results_map_to_point_responses() {
        let body = r#"{
            "results": [
                {"id": "a", "status": "ok", "scenes": [
                    {"date": "2021-01-05", "values": {"B4": 0.1, "B8": null}}
                ]},
                {"id": "b", "status": "rejected", "reason": "outside coverage"},
                {"id": "c", "status": "unavailable"}
            ]
        }"#;
        let parsed: TimeseriesResponse = serde_json::from_str(body).unwrap();
        let results: Vec<PointResult> = parsed
            .results
            .into_iter()
            .map(WireResult::into_point_result)
            .collect();

        match &results[0].response {
            PointResponse::Series(scenes) => {
                assert_eq!(scenes.len(), 1);
                assert_eq!(scenes[0].values["B4"], Some(0.1));
                assert_eq!(scenes[0].values["B8"], None);
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(
            results[1].response,
            PointResponse::Rejected("outside coverage".to_string())
        );
        assert!(matches!(results[2].response, PointResponse::Unavailable(_)));
    }

    #[test]
    fn retry_after_accepts_seconds_only() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn only_credential_refusals_are_fatal() {
        assert!(matches!(
            refusal(StatusCode::UNAUTHORIZED, ""),
            ProviderError::Unreachable(_)
        ));
        assert!(matches!(
            refusal(StatusCode::FORBIDDEN, "expired token"),
            ProviderError::Unreachable(_)
        ));
        assert!(matches!(
            refusal(StatusCode::BAD_REQUEST, "bad bands"),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            refusal(StatusCode::NOT_FOUND, ""),
            ProviderError::Transient(_)
        ));
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let provider = HttpProvider::new("http://localhost:8080/", None).unwrap();
        assert_eq!(provider.base_url, "http://localhost:8080");
    }
}
