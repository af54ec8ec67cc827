use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::models::{
    ConfigUpdate, EffectiveConfig, Job, RunAccepted, RunRequest, UploadReceipt,
};
use super::{ConfigurationError, Envelope, TransportError, TransportErrorKind, API_PREFIX};

/// Client for one job backend.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
}

impl ApiClient {
    /// Validate `base_url` and build a client for it.
    ///
    /// Nothing touches the network here; a malformed address is reported as a
    /// [`ConfigurationError`] before any request can be attempted.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConfigurationError> {
        let base = parse_base_url(base_url)?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigurationError::InvalidUrl {
                address: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { http, base })
    }

    /// Reuse an existing connection pool.
    pub fn with_client(http: Client, base_url: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            http,
            base: parse_base_url(base_url)?,
        })
    }

    /// The normalized API root, including the `/api/v1` prefix.
    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// Issue a JSON request and unwrap the response envelope.
    pub async fn request<T, B>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url(segments, &[]);
        let mut builder = self.http.request(method.clone(), url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|e| {
            warn!(%method, path = %segments.join("/"), error = %e, "backend unreachable");
            TransportError::network(&e)
        })?;
        debug!(%method, path = %segments.join("/"), status = response.status().as_u16(), "backend response");
        decode_envelope(response).await
    }

    /// Fetch raw bytes with no envelope decoding. Non-2xx still maps to
    /// [`TransportError`], so a 404 can be told apart from real failures.
    pub async fn fetch_binary(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Bytes, TransportError> {
        let url = self.url(segments, query);
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::network(&e))?;
        let status = response.status();
        debug!(path = %segments.join("/"), status = status.as_u16(), "artifact response");
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(http_error(status, &body));
        }
        response.bytes().await.map_err(|e| TransportError::network(&e))
    }

    /// `GET /status/{job_id}`
    pub async fn status(&self, job_id: &str) -> Result<Job, TransportError> {
        self.request::<Job, ()>(Method::GET, &["status", job_id], None)
            .await
    }

    /// `POST /run`
    pub async fn submit(&self, request: &RunRequest) -> Result<RunAccepted, TransportError> {
        self.request(Method::POST, &["run"], Some(request)).await
    }

    /// `POST /stop/{job_id}`
    pub async fn stop(&self, job_id: &str) -> Result<Job, TransportError> {
        self.request::<Job, ()>(Method::POST, &["stop", job_id], None)
            .await
    }

    /// `POST /config` with a partial update; returns the effective config.
    pub async fn update_config(
        &self,
        update: &ConfigUpdate,
    ) -> Result<EffectiveConfig, TransportError> {
        self.request(Method::POST, &["config"], Some(update)).await
    }

    /// `POST /upload` as multipart form field `file`.
    pub async fn upload(
        &self,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<UploadReceipt, TransportError> {
        let part = reqwest::multipart::Part::bytes(content).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(self.url(&["upload"], &[]))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::network(&e))?;
        decode_envelope(response).await
    }

    /// `GET /download/{job_id}/{artifact}?run_dir=...`
    ///
    /// `artifact` is either an alias (`stdout`, `script`, ...) or a relative
    /// path such as `images/screenshot_1.png`.
    pub async fn download_artifact(
        &self,
        job_id: &str,
        artifact: &str,
        run_dir: Option<&str>,
    ) -> Result<Bytes, TransportError> {
        let mut segments = vec!["download", job_id];
        segments.extend(artifact.split('/').filter(|s| !s.is_empty()));
        let query: Vec<(&str, &str)> = run_dir.map(|d| vec![("run_dir", d)]).unwrap_or_default();
        self.fetch_binary(&segments, &query).await
    }

    /// Fetch a playback frame by the image reference found in `script.json`.
    pub async fn download_frame(
        &self,
        job_id: &str,
        reference: &str,
        run_dir: Option<&str>,
    ) -> Result<Bytes, TransportError> {
        let path = crate::reconstruct::playback::frame_download_path(reference);
        self.download_artifact(job_id, &path, run_dir).await
    }

    /// Fetch many frames with at most `concurrency` requests in flight.
    /// Results come back in the order of `references`.
    pub async fn download_frames(
        &self,
        job_id: &str,
        references: &[String],
        run_dir: Option<&str>,
        concurrency: usize,
    ) -> Vec<(String, Result<Bytes, TransportError>)> {
        stream::iter(references)
            .map(|reference| async move {
                let result = self.download_frame(job_id, reference, run_dir).await;
                (reference.clone(), result)
            })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }
}

/// Normalize a user-supplied backend address into the API root URL.
pub fn parse_base_url(address: &str) -> Result<Url, ConfigurationError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(ConfigurationError::EmptyAddress);
    }
    let url = Url::parse(trimmed).map_err(|e| ConfigurationError::InvalidUrl {
        address: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigurationError::UnsupportedScheme {
            address: trimmed.to_string(),
            scheme: url.scheme().to_string(),
        });
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigurationError::MissingHost {
            address: trimmed.to_string(),
        });
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigurationError::UnexpectedSuffix {
            address: trimmed.to_string(),
        });
    }

    let path = url.path().trim_end_matches('/');
    let api_path = if path.ends_with(API_PREFIX) {
        path.to_string()
    } else {
        format!("{path}{API_PREFIX}")
    };
    let mut url = url;
    url.set_path(&api_path);
    Ok(url)
}

async fn decode_envelope<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| TransportError::network(&e))?;

    if !status.is_success() {
        return Err(http_error(status, &body));
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(&body).map_err(|e| {
        TransportError::decode(format!("malformed response envelope: {e}"), status.as_u16())
    })?;

    if envelope.code != 200 {
        return Err(TransportError {
            kind: TransportErrorKind::Envelope,
            message: non_empty_or(envelope.message, "request failed"),
            http_status: Some(status.as_u16()),
            code: Some(envelope.code),
            detail: envelope.detail,
        });
    }

    let Some(result) = envelope.result else {
        return Err(TransportError {
            kind: TransportErrorKind::Envelope,
            message: "response envelope carries no result".to_string(),
            http_status: Some(status.as_u16()),
            code: Some(envelope.code),
            detail: envelope.detail,
        });
    };

    serde_json::from_value(result).map_err(|e| {
        TransportError::decode(format!("unexpected result shape: {e}"), status.as_u16())
    })
}

/// Map a non-2xx response to an error, keeping envelope fields when the body has them.
fn http_error(status: reqwest::StatusCode, body: &[u8]) -> TransportError {
    let reason = status.canonical_reason().unwrap_or("request failed").to_string();
    match serde_json::from_slice::<Envelope<serde_json::Value>>(body) {
        Ok(envelope) => TransportError {
            kind: TransportErrorKind::Http,
            message: non_empty_or(envelope.message, &reason),
            http_status: Some(status.as_u16()),
            code: Some(envelope.code),
            detail: envelope.detail,
        },
        Err(_) => {
            let text = String::from_utf8_lossy(body).trim().to_string();
            TransportError {
                kind: TransportErrorKind::Http,
                message: reason,
                http_status: Some(status.as_u16()),
                code: None,
                detail: (!text.is_empty()).then(|| text.chars().take(512).collect()),
            }
        }
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_api_prefix() {
        let url = parse_base_url("http://127.0.0.1:8000").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8000/api/v1");

        let url = parse_base_url("https://jobs.example.com/proxy/").unwrap();
        assert_eq!(url.as_str(), "https://jobs.example.com/proxy/api/v1");
    }

    #[test]
    fn test_base_url_prefix_not_doubled() {
        let url = parse_base_url("http://localhost:8000/api/v1/").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/api/v1");
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        assert_eq!(parse_base_url("  "), Err(ConfigurationError::EmptyAddress));
        assert!(matches!(
            parse_base_url("localhost:8000"),
            Err(ConfigurationError::UnsupportedScheme { .. }) | Err(ConfigurationError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_base_url("ftp://files.example.com"),
            Err(ConfigurationError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            parse_base_url("not a url"),
            Err(ConfigurationError::InvalidUrl { .. })
        ));
        assert!(matches!(
            parse_base_url("http://host:8000/?x=1"),
            Err(ConfigurationError::UnexpectedSuffix { .. })
        ));
    }

    #[test]
    fn test_url_escapes_segments_and_adds_query() {
        let client = ApiClient::new("http://127.0.0.1:8000", Duration::from_secs(1)).unwrap();
        let url = client.url(&["download", "job 1", "images", "a.png"], &[("run_dir", "runs/T-1")]);
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8000/api/v1/download/job%201/images/a.png?run_dir=runs%2FT-1"
        );
    }

    #[test]
    fn test_http_error_keeps_envelope_detail() {
        let body = br#"{"code":404,"message":"error","detail":"no screenshots yet"}"#;
        let err = http_error(reqwest::StatusCode::NOT_FOUND, body);
        assert_eq!(err.kind, TransportErrorKind::Http);
        assert!(err.is_absence());
        assert_eq!(err.code, Some(404));
        assert_eq!(err.detail.as_deref(), Some("no screenshots yet"));
    }

    #[test]
    fn test_http_error_plain_body() {
        let err = http_error(reqwest::StatusCode::BAD_GATEWAY, b"upstream down");
        assert_eq!(err.http_status, Some(502));
        assert_eq!(err.code, None);
        assert_eq!(err.message, "Bad Gateway");
        assert_eq!(err.detail.as_deref(), Some("upstream down"));
    }
}
