use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use nodeadm_core::node::{NodeAttributes, NodeSpec, NodeState};

use crate::client::{NodeRepository, RepositoryError, RepositoryResult};

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    nodes: Vec<NodeSpec>,
}

/// [`NodeRepository`] over the node repository's JSON HTTP API.
pub struct HttpNodeRepository {
    client: Client,
    base_url: String,
}

impl HttpNodeRepository {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("nodeadm/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn node_url(&self, hostname: &str) -> String {
        format!("{}/nodes/{}", self.base_url, hostname)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> RepositoryResult<Response> {
        request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RepositoryError::Transient(format!("{} failed: {}", what, e)))
    }

    /// Map a non-2xx response. 404 is reported as `NotFound(hostname)`.
    fn check_status(response: &Response, hostname: &str, what: &str) -> RepositoryResult<()> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RepositoryError::NotFound(hostname.to_string()));
        }
        if !status.is_success() {
            return Err(RepositoryError::Transient(format!(
                "HTTP {} for {}",
                status, what
            )));
        }
        Ok(())
    }

    async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> RepositoryResult<T> {
        let body = response
            .text()
            .await
            .map_err(|e| RepositoryError::Transient(format!("reading {} failed: {}", what, e)))?;
        serde_json::from_str(&body).map_err(|e| RepositoryError::Decode(format!("{}: {}", what, e)))
    }
}

#[async_trait]
impl NodeRepository for HttpNodeRepository {
    async fn get_node_spec(&self, hostname: &str) -> RepositoryResult<Option<NodeSpec>> {
        let url = self.node_url(hostname);
        debug!(url = %url, "Fetching node spec");
        let response = self.send(self.client.get(&url), &url).await?;
        match Self::check_status(&response, hostname, &url) {
            Err(RepositoryError::NotFound(_)) => return Ok(None),
            other => other?,
        }
        Self::decode(response, &url).await.map(Some)
    }

    async fn list_nodes(&self, parent_hostname: &str) -> RepositoryResult<Vec<NodeSpec>> {
        let url = format!("{}/nodes", self.base_url);
        debug!(url = %url, parent = %parent_hostname, "Listing nodes");
        let request = self
            .client
            .get(&url)
            .query(&[("parentHost", parent_hostname)]);
        let response = self.send(request, &url).await?;
        match Self::check_status(&response, parent_hostname, &url) {
            Err(RepositoryError::NotFound(_)) => return Ok(Vec::new()),
            other => other?,
        }
        let list: NodeList = Self::decode(response, &url).await?;
        Ok(list.nodes)
    }

    async fn update_attributes(
        &self,
        hostname: &str,
        attributes: &NodeAttributes,
    ) -> RepositoryResult<()> {
        let url = format!("{}/attributes", self.node_url(hostname));
        debug!(url = %url, ?attributes, "Publishing node attributes");
        let response = self
            .send(self.client.patch(&url).json(attributes), &url)
            .await?;
        Self::check_status(&response, hostname, &url)
    }

    async fn set_node_state(&self, hostname: &str, state: NodeState) -> RepositoryResult<()> {
        let url = format!("{}/state/{}", self.node_url(hostname), state);
        debug!(url = %url, "Setting node state");
        let response = self.send(self.client.patch(&url), &url).await?;
        Self::check_status(&response, hostname, &url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const NODE_JSON: &str = r#"{
        "hostname": "host1.test.yahoo.com",
        "state": "active",
        "type": "tenant",
        "wantedDockerImage": "image1:7.1",
        "currentDockerImage": "image1:7.0",
        "flavor": "docker",
        "vcpus": 1.0,
        "memoryGb": 2.0,
        "diskGb": 10.0,
        "wantedRestartGeneration": 2,
        "currentRestartGeneration": 1,
        "wantedRebootGeneration": 0,
        "currentRebootGeneration": 0,
        "parentHostname": "dockerhost1"
    }"#;

    /// Serve a single HTTP exchange and return the raw request received.
    async fn serve_once(status: &'static str, body: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    fn repo(url: &str) -> HttpNodeRepository {
        HttpNodeRepository::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_node_spec_parses_wire_format() {
        let (url, server) = serve_once("200 OK", NODE_JSON.to_string()).await;
        let spec = repo(&url)
            .get_node_spec("host1.test.yahoo.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spec.state, NodeState::Active);
        assert_eq!(spec.wanted_docker_image.unwrap().as_str(), "image1:7.1");
        assert_eq!(spec.wanted_restart_generation, 2);
        assert_eq!(spec.parent_hostname.as_deref(), Some("dockerhost1"));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /nodes/host1.test.yahoo.com HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_get_node_spec_404_is_none() {
        let (url, _server) = serve_once("404 Not Found", "{}".to_string()).await;
        assert_eq!(repo(&url).get_node_spec("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (url, _server) = serve_once("503 Service Unavailable", String::new()).await;
        assert!(matches!(
            repo(&url).get_node_spec("host1").await,
            Err(RepositoryError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let (url, _server) = serve_once("200 OK", "{\"hostname\": 42}".to_string()).await;
        assert!(matches!(
            repo(&url).get_node_spec("host1").await,
            Err(RepositoryError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_list_nodes_sends_parent_query() {
        let body = format!("{{\"nodes\": [{}]}}", NODE_JSON);
        let (url, server) = serve_once("200 OK", body).await;
        let nodes = repo(&url).list_nodes("dockerhost1").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].hostname, "host1.test.yahoo.com");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /nodes?parentHost=dockerhost1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_update_attributes_sends_only_set_fields() {
        let (url, server) = serve_once("200 OK", "{}".to_string()).await;
        let attributes = NodeAttributes::new()
            .with_docker_image("image1:7.1".parse().unwrap())
            .with_vespa_version("7.1");
        repo(&url)
            .update_attributes("host1", &attributes)
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("PATCH /nodes/host1/attributes HTTP/1.1"));
        let body = request.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["dockerImage"], "image1:7.1");
        assert_eq!(json["vespaVersion"], "7.1");
        assert!(json.get("restartGeneration").is_none());
        assert!(json.get("fault").is_none());
    }

    #[tokio::test]
    async fn test_set_node_state_path() {
        let (url, server) = serve_once("200 OK", "{}".to_string()).await;
        repo(&url)
            .set_node_state("host2", NodeState::Ready)
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("PATCH /nodes/host2/state/ready HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_set_node_state_unknown_node() {
        let (url, _server) = serve_once("404 Not Found", String::new()).await;
        assert_eq!(
            repo(&url).set_node_state("ghost", NodeState::Ready).await,
            Err(RepositoryError::NotFound("ghost".into()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        assert!(matches!(
            repo(&url).list_nodes("dockerhost1").await,
            Err(RepositoryError::Transient(_))
        ));
    }
}
