//! Snapshot fetcher — one bounded HTTP GET against the metrics endpoint.
//!
//! Every failure mode maps to a typed error the caller records as a
//! "missing" snapshot. A hung endpoint costs at most the fetch timeout and
//! never stalls ingestion.

use std::time::Duration;

use http_body_util::BodyExt;
use thiserror::Error;
use tracing::debug;

/// Why an exposition fetch produced no snapshot.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),

    #[error("http handshake failed: {0}")]
    Handshake(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// Fetch raw exposition text from `http://{address}{path}`.
///
/// The whole operation — connect, request, body — is bounded by `timeout`.
pub async fn fetch_exposition(
    address: &str,
    path: &str,
    timeout: Duration,
) -> Result<String, FetchError> {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| FetchError::Connect(address.to_string(), e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FetchError::Handshake(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "taskline-metrics/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            debug!(status = %resp.status(), %uri, "exposition fetch non-2xx");
            return Err(FetchError::Status(resp.status().as_u16()));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?
            .to_bytes();

        Ok(String::from_utf8_lossy(&body).into_owned())
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => {
            debug!(%uri, ?timeout, "exposition fetch timed out");
            Err(FetchError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_from_closed_port_fails_fast() {
        let result =
            fetch_exposition("127.0.0.1:1", "/metrics", Duration::from_millis(500)).await;
        assert!(matches!(
            result,
            Err(FetchError::Connect(..)) | Err(FetchError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn fetch_against_unresponsive_listener_times_out() {
        // A listener that accepts but never responds.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result =
            fetch_exposition(&address, "/metrics", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn fetch_reads_full_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (mut socket, _) = listener.accept().await.unwrap();
            let body = "vllm:request_prefill_time_seconds_sum{} 1.5\n";
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            // Read the request head first so the client sees a response.
            let mut buf = [0u8; 1024];
            use tokio::io::AsyncReadExt;
            let _ = socket.read(&mut buf).await;
            socket.write_all(resp.as_bytes()).await.unwrap();
        });

        let text = fetch_exposition(&address, "/metrics", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(text.contains("request_prefill_time_seconds_sum"));
    }

    #[tokio::test]
    async fn non_2xx_status_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let result = fetch_exposition(&address, "/metrics", Duration::from_secs(2)).await;
        assert!(matches!(result, Err(FetchError::Status(503))));
    }
}
