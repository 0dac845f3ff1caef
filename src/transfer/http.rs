//! HTTP/JSON backend client.

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use super::backend::{Backend, CommitRequest, RemoteVersion, UploadRequest, UploadSession};
use super::error::TransferError;
use crate::config::BackendConfig;
use crate::state::{FileId, Fingerprint};

const AGENT_HEADER: &str = "x-stormcloud-agent";

pub struct HttpBackend {
    client: Client,
    base: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base", &self.base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Serialize)]
struct FingerprintList<'a> {
    fingerprints: &'a [Fingerprint],
}

#[derive(Deserialize)]
struct MissingResponse {
    missing: Vec<Fingerprint>,
}

#[derive(Deserialize)]
struct ConflictResponse {
    head: Option<u64>,
}

#[derive(Deserialize)]
struct VersionsResponse {
    versions: Vec<RemoteVersion>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("stormcloud/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(AGENT_HEADER, HeaderValue::from_str(&config.agent_id)?);
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder, TransferError> {
        match &self.api_key {
            Some(key) => Ok(builder.bearer_auth(key)),
            None => Err(TransferError::Auth("no api key configured".into())),
        }
    }

    async fn send(&self, builder: RequestBuilder, endpoint: &str) -> Result<Response, TransferError> {
        let response = self
            .authorize(builder)?
            .send()
            .await
            .map_err(|source| TransferError::Http {
                source,
                endpoint: endpoint.to_string(),
            })?;
        check_status(response, endpoint)
    }
}

fn check_status(response: Response, endpoint: &str) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TransferError::Auth(format!(
            "{endpoint} returned {status}"
        ))),
        StatusCode::NOT_FOUND => Err(TransferError::NotFound(endpoint.to_string())),
        _ => Err(TransferError::HttpStatus {
            status: status.as_u16(),
            endpoint: endpoint.to_string(),
        }),
    }
}

async fn json<T: serde::de::DeserializeOwned>(
    response: Response,
    endpoint: &str,
) -> Result<T, TransferError> {
    response.json().await.map_err(|source| TransferError::Http {
        source,
        endpoint: endpoint.to_string(),
    })
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    async fn initiate_upload(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadSession, TransferError> {
        let endpoint = "/v1/uploads";
        let resp = self
            .send(self.client.post(self.url(endpoint)).json(request), endpoint)
            .await?;
        json(resp, endpoint).await
    }

    async fn put_chunk(
        &self,
        session: &UploadSession,
        fingerprint: &Fingerprint,
        sealed: Vec<u8>,
    ) -> Result<(), TransferError> {
        let endpoint = format!("/v1/chunks/{}", fingerprint.to_hex());
        let builder = self
            .client
            .put(self.url(&endpoint))
            .query(&[("upload", session.id.as_str())])
            .header("content-type", "application/octet-stream")
            .body(sealed);
        self.send(builder, &endpoint).await?;
        Ok(())
    }

    async fn missing_chunks(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<Fingerprint>, TransferError> {
        if fingerprints.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = "/v1/chunks/missing";
        let builder = self
            .client
            .post(self.url(endpoint))
            .json(&FingerprintList { fingerprints });
        let resp: MissingResponse = json(self.send(builder, endpoint).await?, endpoint).await?;
        Ok(resp.missing)
    }

    async fn commit_version(&self, request: &CommitRequest) -> Result<(), TransferError> {
        let endpoint = format!("/v1/files/{}/versions", request.file_id);
        let builder = self.client.post(self.url(&endpoint)).json(request);
        let response = self
            .authorize(builder)?
            .send()
            .await
            .map_err(|source| TransferError::Http {
                source,
                endpoint: endpoint.clone(),
            })?;
        if response.status() == StatusCode::CONFLICT {
            let head = response
                .json::<ConflictResponse>()
                .await
                .ok()
                .and_then(|c| c.head);
            return Err(TransferError::Conflict {
                server_head: head,
                expected: request.parent_version,
            });
        }
        check_status(response, &endpoint)?;
        Ok(())
    }

    async fn list_versions(&self, file_id: FileId) -> Result<Vec<RemoteVersion>, TransferError> {
        let endpoint = format!("/v1/files/{file_id}/versions");
        let resp = match self.send(self.client.get(self.url(&endpoint)), &endpoint).await {
            Ok(resp) => resp,
            Err(TransferError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut versions = json::<VersionsResponse>(resp, &endpoint).await?.versions;
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    async fn get_chunk(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>, TransferError> {
        let endpoint = format!("/v1/chunks/{}", fingerprint.to_hex());
        let resp = self
            .send(self.client.get(self.url(&endpoint)), &endpoint)
            .await?;
        let bytes = resp.bytes().await.map_err(|source| TransferError::Http {
            source,
            endpoint: endpoint.clone(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn delete_chunks(&self, fingerprints: &[Fingerprint]) -> Result<(), TransferError> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        let endpoint = "/v1/chunks/delete";
        let builder = self
            .client
            .post(self.url(endpoint))
            .json(&FingerprintList { fingerprints });
        self.send(builder, endpoint).await?;
        Ok(())
    }

    async fn keepalive(&self) -> Result<(), TransferError> {
        let endpoint = "/v1/keepalive";
        self.send(self.client.post(self.url(endpoint)), endpoint)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(api_key: Option<&str>) -> BackendConfig {
        BackendConfig {
            url: "http://127.0.0.1:1/".into(),
            api_key: api_key.map(String::from),
            agent_id: "agent-1".into(),
            account_secret: vec![7; 32],
            request_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let backend = HttpBackend::new(&config(Some("k"))).unwrap();
        assert_eq!(backend.url("/v1/keepalive"), "http://127.0.0.1:1/v1/keepalive");
    }

    #[test]
    fn test_debug_redacts_key() {
        let backend = HttpBackend::new(&config(Some("super-secret"))).unwrap();
        let debug = format!("{backend:?}");
        assert!(!debug.contains("super-secret"));
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        let backend = HttpBackend::new(&config(None)).unwrap();
        let err = backend.keepalive().await.unwrap_err();
        assert!(matches!(err, TransferError::Auth(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retryable() {
        let backend = HttpBackend::new(&config(Some("k"))).unwrap();
        let err = backend.keepalive().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected: {err}");
    }

    #[tokio::test]
    async fn test_empty_batches_skip_network() {
        let backend = HttpBackend::new(&config(Some("k"))).unwrap();
        assert!(backend.missing_chunks(&[]).await.unwrap().is_empty());
        backend.delete_chunks(&[]).await.unwrap();
    }
}
