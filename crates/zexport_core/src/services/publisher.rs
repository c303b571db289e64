//! Downstream delivery of the latest snapshot.
//!
//! The backend receives the rendered snapshot as a multipart upload with a
//! single `file` part. Delivery is best-effort: a failure is reported to the
//! caller and never rolls back the committed snapshot.

use crate::error::ZexportError;
use crate::models::PublisherConfig;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use std::time::Duration;

/// The payload pushed downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUpload {
    /// Snapshot being delivered
    pub snapshot_id: i64,
    /// File name presented to the backend
    pub file_name: String,
    /// Rendered snapshot text
    pub content: String,
}

/// Pushes snapshots to a downstream consumer.
#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    /// Check if pushes actually go anywhere.
    fn is_enabled(&self) -> bool;

    /// Deliver one snapshot.
    async fn publish(&self, upload: &SnapshotUpload) -> Result<(), ZexportError>;
}

/// Uploads snapshots over HTTP as `multipart/form-data`.
pub struct HttpUploadPublisher {
    client: reqwest::Client,
    url: String,
}

impl HttpUploadPublisher {
    /// Create a publisher for `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ZexportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .build()
            .map_err(|e| ZexportError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl SnapshotPublisher for HttpUploadPublisher {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn publish(&self, upload: &SnapshotUpload) -> Result<(), ZexportError> {
        let part = Part::text(upload.content.clone())
            .file_name(upload.file_name.clone())
            .mime_str("text/plain")?;
        let form = Form::new().part("file", part);

        tracing::debug!(
            snapshot_id = upload.snapshot_id,
            url = %self.url,
            bytes = upload.content.len(),
            "Uploading snapshot"
        );

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ZexportError::downstream(
                format!("Downstream rejected upload with HTTP {status}"),
                Some(status.as_u16()),
            ));
        }

        tracing::info!(snapshot_id = upload.snapshot_id, status = status.as_u16(), "Snapshot delivered");
        Ok(())
    }
}

/// Publisher used when no downstream is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl SnapshotPublisher for NoopPublisher {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn publish(&self, _upload: &SnapshotUpload) -> Result<(), ZexportError> {
        Ok(())
    }
}

/// Build the publisher selected by the configuration.
pub fn publisher_from_config(
    config: &PublisherConfig,
) -> Result<Arc<dyn SnapshotPublisher>, ZexportError> {
    match config.upload_url.as_deref() {
        Some(url) => {
            tracing::info!(url, "Downstream push enabled");
            Ok(Arc::new(HttpUploadPublisher::new(url, config.push_timeout())?))
        }
        None => {
            tracing::info!("No upload URL configured, downstream push disabled");
            Ok(Arc::new(NoopPublisher))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use parking_lot::Mutex;

    /// Content type and raw body of the last upload.
    type Captured = Arc<Mutex<Option<(String, String)>>>;

    /// Serve `/upload` on an ephemeral port, answering every request with `status`.
    async fn spawn_upload_server(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let app = Router::new().route(
            "/upload",
            post(move |headers: HeaderMap, body: Bytes| {
                let sink = sink.clone();
                async move {
                    let content_type = headers
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    *sink.lock() = Some((content_type, String::from_utf8_lossy(&body).into_owned()));
                    status
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/upload", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url, captured)
    }

    fn upload() -> SnapshotUpload {
        SnapshotUpload {
            snapshot_id: 1,
            file_name: "current.txt".to_string(),
            content: "a\n\nb".to_string(),
        }
    }

    #[test]
    fn test_publisher_from_config() {
        let disabled = publisher_from_config(&PublisherConfig::default()).unwrap();
        assert!(!disabled.is_enabled());

        let config = PublisherConfig {
            upload_url: Some("http://127.0.0.1:9/upload".to_string()),
            ..PublisherConfig::default()
        };
        let enabled = publisher_from_config(&config).unwrap();
        assert!(enabled.is_enabled());
    }

    #[tokio::test]
    async fn test_noop_publisher_succeeds() {
        assert!(NoopPublisher.publish(&upload()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_downstream_is_downstream_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/upload", listener.local_addr().unwrap());
        drop(listener);

        let publisher = HttpUploadPublisher::new(url, Duration::from_secs(5)).unwrap();
        let err = publisher.publish(&upload()).await.unwrap_err();

        assert!(matches!(err, ZexportError::Downstream { .. }));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn test_upload_is_single_text_file_part() {
        let (url, captured) = spawn_upload_server(StatusCode::OK).await;
        let publisher = HttpUploadPublisher::new(url, Duration::from_secs(5)).unwrap();

        publisher.publish(&upload()).await.unwrap();

        let (content_type, body) = captured.lock().clone().expect("upload was not received");
        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .expect("multipart content type");

        let lower = body.to_ascii_lowercase();
        assert_eq!(lower.matches("content-disposition: form-data").count(), 1);
        assert!(lower.contains("content-disposition: form-data; name=\"file\"; filename=\"current.txt\""));
        assert!(lower.contains("content-type: text/plain"));
        assert!(body.contains("\r\n\r\na\n\nb\r\n"));
        assert!(body.trim_end().ends_with(&format!("--{boundary}--")));
    }

    #[tokio::test]
    async fn test_rejected_upload_carries_http_status() {
        let (url, captured) = spawn_upload_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        let publisher = HttpUploadPublisher::new(url, Duration::from_secs(5)).unwrap();

        let err = publisher.publish(&upload()).await.unwrap_err();

        assert!(matches!(err, ZexportError::Downstream { status: Some(500), .. }));
        assert_eq!(err.status_code(), 502);
        assert!(captured.lock().is_some());
    }
}
