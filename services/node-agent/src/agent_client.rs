//! HTTP client for the Guest Agent running inside a microVM.
//!
//! The Guest Agent listens on a VSOCK port; Firecracker exposes VSOCK to
//! the host as a Unix socket per guest port, named `{uds_path}_{port}`
//! (the same convention `firecracker/driver.rs` relies on when wiring up
//! the vsock device). This client is the host-side twin of
//! `guest-init`'s `agent_server.rs`: same routes, same wire DTOs from
//! `agent_protocol`, framed as plain HTTP/1.1 over that socket via
//! `hyper` + `hyperlocal`, mirroring `firecracker::api::FirecrackerClient`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper::{body::Buf, Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use thiserror::Error;
use tracing::debug;

use crate::agent_protocol::{
    AllowlistRequest, ErrorBody, ExecRequest, ExecResult, NetworkConfigRequest, RunRequest,
    AGENT_VSOCK_PORT,
};

#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("agent returned {status}: {code} - {message}")]
    Agent { status: u16, code: String, message: String },

    #[error("guest agent did not become reachable within {0:?}")]
    Unreachable(Duration),
}

/// Dials a microVM's Guest Agent over the vsock-backed Unix socket that
/// Firecracker exposes on the host.
pub struct AgentClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl AgentClient {
    /// `jail_vsock_path` is the host-visible path to the jail's vsock UDS
    /// (e.g. `<chroot>/run/agent.vsock`, without the port suffix).
    pub fn new(jail_vsock_path: &Path) -> Self {
        let socket_path = format!(
            "{}_{}",
            jail_vsock_path.to_string_lossy(),
            AGENT_VSOCK_PORT
        );
        Self {
            socket_path,
            client: Client::unix(),
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    fn socket_exists(&self) -> bool {
        PathBuf::from(&self.socket_path).exists()
    }

    /// Poll `/health` until it answers ok or `timeout` elapses.
    pub async fn wait_healthy(&self, timeout: Duration) -> Result<(), AgentClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(50);

        loop {
            if self.socket_exists() {
                if let Ok(resp) = self.health().await {
                    if resp {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentClientError::Unreachable(timeout));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(500));
        }
    }

    pub async fn health(&self) -> Result<bool, AgentClientError> {
        let (status, body) = self.request(Method::GET, "/health", None).await?;
        if !status.is_success() {
            return Ok(false);
        }
        #[derive(serde::Deserialize)]
        struct Health {
            ok: bool,
        }
        let health: Health = serde_json::from_slice(&body)?;
        Ok(health.ok)
    }

    pub async fn configure_network(&self, req: &NetworkConfigRequest) -> Result<(), AgentClientError> {
        self.post_no_content("/network", req).await
    }

    pub async fn apply_allowlist(&self, req: &AllowlistRequest) -> Result<(), AgentClientError> {
        self.post_no_content("/allowlist", req).await
    }

    pub async fn exec(&self, req: &ExecRequest) -> Result<ExecResult, AgentClientError> {
        self.post_json("/exec", req).await
    }

    pub async fn run_ts(&self, req: &RunRequest) -> Result<ExecResult, AgentClientError> {
        self.post_json("/run-ts", req).await
    }

    pub async fn run_js(&self, req: &RunRequest) -> Result<ExecResult, AgentClientError> {
        self.post_json("/run-js", req).await
    }

    /// Upload a gzip'd tar archive to `dest` inside the guest.
    pub async fn upload(&self, dest: &str, archive: Vec<u8>) -> Result<(), AgentClientError> {
        let path = format!("/upload?dest={}", percent_encode(dest));
        let uri = Uri::new(&self.socket_path, &path);
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/gzip")
            .body(Body::from(archive))?;
        let response = self.client.request(request).await?;
        self.check_empty(response).await
    }

    /// Download `path` from the guest as a gzip'd tar archive.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>, AgentClientError> {
        let (status, body) = self
            .request(Method::GET, &format!("/download?path={}", percent_encode(path)), None)
            .await?;
        if !status.is_success() {
            return Err(self.parse_error(status, &body));
        }
        Ok(body)
    }

    async fn post_no_content<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), AgentClientError> {
        let payload = serde_json::to_vec(body)?;
        let (status, resp_body) = self.request(Method::POST, path, Some(payload)).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(self.parse_error(status, &resp_body))
        }
    }

    async fn post_json<T: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, AgentClientError> {
        let payload = serde_json::to_vec(body)?;
        let (status, resp_body) = self.request(Method::POST, path, Some(payload)).await?;
        if status.is_success() {
            Ok(serde_json::from_slice(&resp_body)?)
        } else {
            Err(self.parse_error(status, &resp_body))
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(hyper::StatusCode, Vec<u8>), AgentClientError> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(%method, path, "agent client request");
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))?;
        let response = self.client.request(request).await?;
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;
        Ok((status, body.chunk().to_vec()))
    }

    async fn check_empty(&self, response: hyper::Response<Body>) -> Result<(), AgentClientError> {
        let status = response.status();
        let body = hyper::body::aggregate(response.into_body()).await?;
        let bytes = body.chunk().to_vec();
        if status.is_success() {
            Ok(())
        } else {
            Err(self.parse_error(status, &bytes))
        }
    }

    fn parse_error(&self, status: hyper::StatusCode, body: &[u8]) -> AgentClientError {
        if let Ok(err) = serde_json::from_slice::<ErrorBody>(body) {
            AgentClientError::Agent {
                status: status.as_u16(),
                code: err.code,
                message: err.message,
            }
        } else {
            AgentClientError::Agent {
                status: status.as_u16(),
                code: "unknown".to_string(),
                message: String::from_utf8_lossy(body).into_owned(),
            }
        }
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_appends_port() {
        let client = AgentClient::new(Path::new("/chroot/run/agent.vsock"));
        assert_eq!(client.socket_path(), "/chroot/run/agent.vsock_5210");
    }

    #[test]
    fn percent_encode_handles_slashes() {
        assert_eq!(percent_encode("/workspace/foo bar.txt"), "%2Fworkspace%2Ffoo%20bar.txt");
    }
}
