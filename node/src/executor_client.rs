//! HTTP client for the validator-executor service.
//!
//! The executor fleet is a separate deployment; the node talks to it over
//! a single JSON-over-HTTP endpoint: POST the [`ExecutorRequest`], read
//! back the [`ExecutorOutcome`]. Failures are classified at this boundary
//! into the core's taxonomy — HTTP 429/503 is `Overloaded`, a 4xx with an
//! executor-reported contract fault is `User`, anything else is `Fatal`.
//!
//! The HTTP layer is deliberately minimal (one request per call,
//! `Connection: close`) — executor calls run for seconds, so connection
//! reuse buys nothing worth the dependency.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use conclave_core::executor::{
    ExecutorFailure, ExecutorOutcome, ExecutorRequest, ValidatorExecutor,
};

/// JSON-over-HTTP executor client.
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    host: String,
    port: u16,
    path: String,
}

impl HttpExecutor {
    /// Parses an `http://host:port/path` endpoint. Anything else is a
    /// configuration error worth failing startup over.
    pub fn new(endpoint: &str) -> Result<Self, String> {
        let rest = endpoint
            .strip_prefix("http://")
            .ok_or_else(|| format!("executor endpoint must be http://, got {endpoint}"))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|e| format!("bad executor port: {e}"))?,
            ),
            None => (authority.to_string(), 80),
        };
        Ok(Self {
            host,
            port,
            path: path.to_string(),
        })
    }

    async fn post_json(&self, body: &[u8]) -> Result<(u16, Vec<u8>), std::io::Error> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = tokio::net::TcpStream::connect(&addr).await?;

        let head = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.path,
            self.host,
            body.len(),
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        let header_end = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| i + 4)
            .unwrap_or(response.len());
        let status = parse_status_code(&response[..header_end]);
        Ok((status, response[header_end..].to_vec()))
    }
}

fn parse_status_code(head: &[u8]) -> u16 {
    // "HTTP/1.1 200 OK" — the status is the second token of line one.
    let line = head.split(|b| *b == b'\r').next().unwrap_or_default();
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ValidatorExecutor for HttpExecutor {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorOutcome, ExecutorFailure> {
        let body = serde_json::to_vec(&request)
            .map_err(|e| ExecutorFailure::Fatal(format!("request encoding: {e}")))?;

        let (status, payload) = self
            .post_json(&body)
            .await
            .map_err(|e| ExecutorFailure::Fatal(format!("executor unreachable: {e}")))?;

        match status {
            200 => serde_json::from_slice(&payload)
                .map_err(|e| ExecutorFailure::Fatal(format!("outcome decoding: {e}"))),
            429 | 503 => Err(ExecutorFailure::Overloaded(format!(
                "executor returned {status}"
            ))),
            400..=499 => Err(ExecutorFailure::User(
                String::from_utf8_lossy(&payload).into_owned(),
            )),
            other => Err(ExecutorFailure::Fatal(format!(
                "executor returned {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        let client = HttpExecutor::new("http://10.0.0.7:9860/execute").unwrap();
        assert_eq!(client.host, "10.0.0.7");
        assert_eq!(client.port, 9860);
        assert_eq!(client.path, "/execute");
    }

    #[test]
    fn endpoint_defaults() {
        let client = HttpExecutor::new("http://executor.internal").unwrap();
        assert_eq!(client.port, 80);
        assert_eq!(client.path, "/");
    }

    #[test]
    fn https_rejected() {
        assert!(HttpExecutor::new("https://executor.internal").is_err());
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_code(b"HTTP/1.1 200 OK\r\n"), 200);
        assert_eq!(parse_status_code(b"HTTP/1.1 503 Service Unavailable\r\n"), 503);
        assert_eq!(parse_status_code(b"garbage"), 0);
    }
}
