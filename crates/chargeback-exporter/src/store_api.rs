//! Client for the time-series store's HTTP API
//!
//! Used for the readiness probe before a backfill cycle and for the startup
//! history floor (`max(timestamp(<metric>))`).

use std::time::Duration;

use chargeback_common::{BackfillError, ChargebackError, Result};
use serde::Deserialize;
use tracing::debug;

const QUERY_PATH: &str = "/api/v1/query";
const READY_PATH: &str = "/-/ready";

#[derive(Clone)]
pub struct StoreApiClient {
    http: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    /// `[eval_time, "value"]`
    value: (f64, String),
}

impl StoreApiClient {
    pub fn new(
        base_url: &str,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChargebackError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.get(format!("{}{}", self.base_url, path));
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }

    /// `GET /-/ready`; any failure is a store-unavailable error
    pub async fn probe_ready(&self) -> std::result::Result<(), BackfillError> {
        let response = self
            .get(READY_PATH)
            .send()
            .await
            .map_err(|e| BackfillError::StoreUnavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackfillError::StoreUnavailable(format!(
                "store readiness returned HTTP {}",
                response.status().as_u16()
            )))
        }
    }

    /// Newest sample timestamp held for `metric`, in Unix millis
    pub async fn latest_sample_timestamp(&self, metric: &str) -> Result<Option<i64>> {
        let query = format!("max(timestamp({metric}))");
        let response = self
            .get(QUERY_PATH)
            .query(&[("query", query.as_str())])
            .send()
            .await
            .map_err(|e| ChargebackError::Storage(format!("store query failed: {}", e)))?;

        let status = response.status();
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| ChargebackError::Storage(format!("invalid store query response (HTTP {}): {}", status, e)))?;

        let latest = parse_latest(body)?;
        debug!(metric, ?latest, "Queried latest stored sample");
        Ok(latest)
    }
}

fn parse_latest(response: QueryResponse) -> Result<Option<i64>> {
    if response.status != "success" {
        return Err(ChargebackError::Storage(format!(
            "store query failed: {}",
            response.error.unwrap_or(response.status)
        )));
    }
    let Some(data) = response.data else {
        return Ok(None);
    };
    if data.result_type != "vector" {
        return Err(ChargebackError::Storage(format!(
            "unexpected result type {:?}",
            data.result_type
        )));
    }

    match data.result.first() {
        None => Ok(None),
        Some(sample) => {
            let seconds: f64 = sample
                .value
                .1
                .parse()
                .map_err(|_| ChargebackError::Storage(format!("invalid sample value {:?}", sample.value.1)))?;
            Ok(Some((seconds * 1000.0).round() as i64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    fn parse(body: &str) -> Result<Option<i64>> {
        parse_latest(serde_json::from_str(body).unwrap())
    }

    #[test]
    fn test_parse_vector_result() {
        let body = r#"{"status":"success","data":{"resultType":"vector",
            "result":[{"metric":{},"value":[1700000100.5,"1700000000"]}]}}"#;
        assert_eq!(parse(body).unwrap(), Some(1_700_000_000_000));
    }

    #[test]
    fn test_parse_empty_and_error() {
        let empty = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert_eq!(parse(empty).unwrap(), None);

        let failed = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        assert!(matches!(parse(failed), Err(ChargebackError::Storage(_))));
    }

    #[tokio::test]
    async fn test_probe_ready() {
        let app = Router::new().route(READY_PATH, get(|| async { "Prometheus Server is Ready." }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = StoreApiClient::new(&format!("http://{addr}"), None, None, Duration::from_secs(1)).unwrap();
        assert!(client.probe_ready().await.is_ok());

        let missing = StoreApiClient::new("http://127.0.0.1:1", None, None, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            missing.probe_ready().await,
            Err(BackfillError::StoreUnavailable(_))
        ));
    }
}
