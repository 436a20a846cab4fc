use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Client for a Supabase-compatible object storage API.
#[derive(Clone)]
pub struct ObjectStoreClient {
    http: Client,
    base_url: Url,
    service_key: String,
    bucket: String,
}

impl ObjectStoreClient {
    pub fn new(
        base_url: Url,
        service_key: impl Into<String>,
        bucket: impl Into<String>,
        http: Client,
    ) -> Self {
        Self {
            http,
            base_url,
            service_key: service_key.into(),
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Uploads `bytes` to `path` inside the bucket, replacing any existing object.
    pub async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let url = self.object_url("storage/v1/object", path)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;

        ensure_success(response).await.map(|_| ())
    }

    /// Creates a time-limited download URL for an object.
    pub async fn signed_url(
        &self,
        path: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        let url = self.object_url("storage/v1/object/sign", path)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .json(&SignRequest {
                expires_in: expires_in.as_secs(),
            })
            .send()
            .await?;

        let signed: SignResponse = ensure_success(response).await?.json().await?;
        self.absolute(&signed.signed_url)
    }

    fn object_url(&self, prefix: &str, path: &str) -> Result<Url, ObjectStoreError> {
        let path = path.trim_start_matches('/');
        Ok(self
            .base_url
            .join(&format!("{prefix}/{}/{path}", self.bucket))?)
    }

    /// The API answers with a path relative to `storage/v1`.
    fn absolute(&self, signed_url: &str) -> Result<String, ObjectStoreError> {
        if signed_url.starts_with("http://") || signed_url.starts_with("https://") {
            return Ok(signed_url.to_string());
        }
        let relative = format!("storage/v1/{}", signed_url.trim_start_matches('/'));
        Ok(self.base_url.join(&relative)?.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    expires_in: u64,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

/// Errors produced by the object storage client.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<Response, ObjectStoreError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(ObjectStoreError::Status { status, body });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> ObjectStoreClient {
        ObjectStoreClient::new(
            Url::parse(&server.url("/")).expect("url"),
            "service-key",
            "documents",
            Client::builder().build().expect("client"),
        )
    }

    #[tokio::test]
    async fn upload_posts_bytes_with_upsert() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/storage/v1/object/documents/documents/tx-1/rec-1/signed.pdf")
                    .header("Authorization", "Bearer service-key")
                    .header("x-upsert", "true")
                    .header("content-type", "application/pdf")
                    .body("%PDF");
                then.status(200).json_body(json!({ "Key": "documents/tx-1/rec-1/signed.pdf" }));
            })
            .await;

        client(&server)
            .upload("documents/tx-1/rec-1/signed.pdf", b"%PDF".to_vec(), "application/pdf")
            .await
            .expect("upload");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn signed_url_is_made_absolute() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/storage/v1/object/sign/documents/a/signed.pdf")
                    .json_body(json!({ "expiresIn": 3600 }));
                then.status(200)
                    .json_body(json!({
                        "signedURL": "/object/sign/documents/a/signed.pdf?token=abc"
                    }));
            })
            .await;

        let url = client(&server)
            .signed_url("a/signed.pdf", Duration::from_secs(3600))
            .await
            .expect("signed url");
        mock.assert_async().await;
        assert_eq!(
            url,
            server.url("/storage/v1/object/sign/documents/a/signed.pdf?token=abc")
        );
    }

    #[tokio::test]
    async fn upload_failure_reports_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(413).body("too large");
            })
            .await;

        let err = client(&server)
            .upload("big.pdf", vec![0; 16], "application/pdf")
            .await
            .expect_err("should fail");
        assert!(matches!(
            err,
            ObjectStoreError::Status { status, ref body }
                if status == StatusCode::PAYLOAD_TOO_LARGE && body == "too large"
        ));
    }
}
