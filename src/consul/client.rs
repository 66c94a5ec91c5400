//! Idempotent HTTP client for the Consul agent API.
//!
//! Thin wrapper over `/v1/agent/service/*`, `/v1/agent/check/update/*` and
//! `/v1/kv/*`. The client is shared across the lifecycle listener and the
//! health reporter; reqwest pools its connections internally.

use crate::constants::{
    CONSUL_AVAILABILITY_RETRY_DELAY, CONSUL_IDLE_TIMEOUT, CONSUL_MAX_IDLE_CONNECTIONS,
    CONSUL_REQUEST_TIMEOUT,
};
use crate::error::{Error, Result};
use serde::Serialize;
use tracing::warn;

/// Service registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct ConsulService {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "EnableTagOverride")]
    pub enable_tag_override: bool,
    #[serde(rename = "Check")]
    pub check: HeartBeat,
}

/// TTL check attached to a service registration; decays to critical when no
/// update arrives within `ttl`.
#[derive(Debug, Clone, Serialize)]
pub struct HeartBeat {
    #[serde(rename = "Notes")]
    pub notes: String,
    #[serde(rename = "Ttl")]
    pub ttl: String,
}

/// Check update payload.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Output")]
    pub output: String,
}

/// HTTP client against one Consul agent.
pub struct ConsulClient {
    address: String,
    client: reqwest::Client,
}

impl ConsulClient {
    /// `address` is the agent base URL, e.g. `http://127.0.0.1:8500`.
    pub fn new(address: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CONSUL_REQUEST_TIMEOUT)
            .pool_max_idle_per_host(CONSUL_MAX_IDLE_CONNECTIONS)
            .pool_idle_timeout(CONSUL_IDLE_TIMEOUT)
            .build()
            .map_err(|e| Error::Registry(e.to_string()))?;
        Ok(Self {
            address: address.into(),
            client,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Probes the agent once per second until it responds, up to
    /// `max_retries` extra attempts. Logs a single warning on the first
    /// failure.
    pub async fn check_availability(&self, max_retries: u32) -> bool {
        for attempt in 0..=max_retries {
            match self.get("kv/?keys").await {
                Ok(_) => return true,
                Err(_) if attempt == 0 => {
                    warn!(
                        "consul at {} unavailable, retrying {max_retries} times",
                        self.address
                    );
                }
                Err(_) => {}
            }
            tokio::time::sleep(CONSUL_AVAILABILITY_RETRY_DELAY).await;
        }
        false
    }

    pub async fn register_service(&self, service: &ConsulService) -> Result<()> {
        self.put_json("agent/service/register", service).await
    }

    /// Idempotent by service id; deregistering twice is not an error on the
    /// agent side.
    pub async fn deregister_service(&self, id: &str) -> Result<()> {
        self.get(&format!("agent/service/deregister/{id}")).await.map(drop)
    }

    pub async fn report_health(&self, check_id: &str, health: &Health) -> Result<()> {
        self.put_json(&format!("agent/check/update/{check_id}"), health).await
    }

    /// Reads a raw KV value; a missing key yields an empty string.
    pub async fn get_key(&self, key: &str) -> Result<String> {
        let url = self.url(&format!("kv/{key}?raw"));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Registry(format!("request failed: {e}")))?;
        match response.status().as_u16() {
            200 => response
                .text()
                .await
                .map_err(|e| Error::Registry(format!("cannot read response: {e}"))),
            404 => Ok(String::new()),
            status => Err(Error::Registry(format!("status {status}: GET {url}"))),
        }
    }

    pub async fn set_key(&self, key: &str, value: &str) -> Result<()> {
        let url = self.url(&format!("kv/{key}"));
        let response = self
            .client
            .put(&url)
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| Error::Registry(format!("request failed: {e}")))?;
        expect_200(&url, "PUT", response.status())
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Registry(format!("request failed: {e}")))?;
        expect_200(&url, "GET", response.status())?;
        response
            .text()
            .await
            .map_err(|e| Error::Registry(format!("cannot read response: {e}")))
    }

    async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.url(path);
        let response = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Registry(format!("request failed: {e}")))?;
        expect_200(&url, "PUT", response.status())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.address)
    }
}

fn expect_200(url: &str, method: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.as_u16() == 200 {
        Ok(())
    } else {
        Err(Error::Registry(format!("status {}: {method} {url}", status.as_u16())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Minimal canned-response HTTP server capturing the requests it saw.
    async fn serve_once(
        listener: TcpListener,
        status_line: &'static str,
        body: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    ) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request_complete(&request) {
                break;
            }
        }
        seen.lock()
            .await
            .push(String::from_utf8_lossy(&request).to_string());
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.unwrap();
    }

    /// True once the headers arrived and content-length (if any) is satisfied.
    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text
            .lines()
            .take_while(|l| !l.is_empty())
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    async fn client_against(
        status_line: &'static str,
        body: &'static str,
    ) -> (ConsulClient, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve_once(listener, status_line, body, Arc::clone(&seen)));
        (ConsulClient::new(format!("http://{addr}")).unwrap(), seen)
    }

    #[tokio::test]
    async fn register_service_puts_expected_payload() {
        let (client, seen) = client_against("200 OK", "").await;
        let service = ConsulService {
            id: "rkt-1234".to_string(),
            name: "mypod".to_string(),
            address: "10.1.0.2".to_string(),
            tags: vec!["web".to_string()],
            enable_tag_override: false,
            check: HeartBeat {
                notes: "Aggregated checks (Interval: 30s, TTL: 1m)".to_string(),
                ttl: "1m".to_string(),
            },
        };
        client.register_service(&service).await.unwrap();
        let requests = seen.lock().await;
        let req = &requests[0];
        assert!(req.starts_with("PUT /v1/agent/service/register"));
        assert!(req.contains("\"ID\":\"rkt-1234\""));
        assert!(req.contains("\"Ttl\":\"1m\""));
    }

    #[tokio::test]
    async fn get_key_returns_raw_value() {
        let (client, seen) = client_against("200 OK", "the-value").await;
        let value = client.get_key("http/example.org").await.unwrap();
        assert_eq!(value, "the-value");
        let requests = seen.lock().await;
        assert!(requests[0].starts_with("GET /v1/kv/http/example.org?raw"));
    }

    #[tokio::test]
    async fn get_key_maps_404_to_empty() {
        let (client, _) = client_against("404 Not Found", "").await;
        assert_eq!(client.get_key("missing").await.unwrap(), "");
    }

    #[tokio::test]
    async fn report_health_targets_check_id() {
        let (client, seen) = client_against("200 OK", "").await;
        client
            .report_health(
                "service:rkt-1234",
                &Health {
                    status: "passing".to_string(),
                    output: "ok".to_string(),
                },
            )
            .await
            .unwrap();
        let requests = seen.lock().await;
        assert!(requests[0].starts_with("PUT /v1/agent/check/update/service:rkt-1234"));
        assert!(requests[0].contains("\"Status\":\"passing\""));
    }

    #[tokio::test]
    async fn non_200_is_an_error() {
        let (client, _) = client_against("500 Internal Server Error", "").await;
        assert!(client.set_key("k", "v").await.is_err());
    }
}
