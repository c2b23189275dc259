//! HTTP/1.1 server bound to a VSOCK listen socket.
//!
//! A full async HTTP stack is not worth pulling into a PID-1 binary that
//! is optimized for size. The `vsock` crate's listener is blocking, so
//! the accept loop and per-connection I/O run on the blocking thread
//! pool; a minimal request-line + header + body reader stands in for a
//! parser crate, and dispatch happens on a `(Method, path)` match —
//! `exec.rs`'s (replaced) accept-loop-in-`spawn_blocking` shape, just
//! with the framing swapped for plain HTTP.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Component, Path};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{Method, StatusCode};
use serde::Serialize;
use tracing::{info, warn};
use vsock::{VsockAddr, VsockListener, VsockStream};

use crate::agent_protocol::{
    AllowlistRequest, ErrorBody, ExecRequest as WireExecRequest, ExecResult, HealthResponse,
    NetworkConfigRequest, RunRequest as WireRunRequest,
};
use crate::error::InitError;
use crate::exec_runner::{ExecRequest, ExecRunner, RunRequest};
use crate::network;
use crate::path_policy::PathPolicy;

/// Firecracker always gives the guest CID 3.
const GUEST_CID: u32 = 3;
const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 12 * 1024 * 1024; // 10 MiB upload cap + slack

pub struct AgentState {
    pub exec_runner: ExecRunner,
    pub path_policy: PathPolicy,
}

impl AgentState {
    pub fn new(sandbox_root: impl Into<String>, ca_bundle_path: impl Into<String>) -> Self {
        Self {
            exec_runner: ExecRunner::new(sandbox_root, ca_bundle_path),
            path_policy: PathPolicy::new("/workspace"),
        }
    }
}

pub async fn run(port: u32, state: Arc<AgentState>) -> Result<(), InitError> {
    let addr = VsockAddr::new(GUEST_CID, port);
    let listener = tokio::task::spawn_blocking(move || VsockListener::bind(&addr))
        .await
        .map_err(|e| InitError::AgentServerFailed(e.to_string()))?
        .map_err(|e| InitError::AgentServerFailed(e.to_string()))?;
    let listener = Arc::new(listener);
    let handle = tokio::runtime::Handle::current();

    info!(port, "agent server listening");

    loop {
        let listener = listener.clone();
        let accepted = tokio::task::spawn_blocking(move || listener.accept()).await;
        let (stream, peer) = match accepted {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!(error = %e, "agent accept failed");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "agent accept task panicked");
                continue;
            }
        };

        let state = state.clone();
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = handle_connection(stream, &state, &handle) {
                warn!(peer_cid = peer.cid(), error = %e, "agent connection failed");
            }
        });
    }
}

fn handle_connection(
    mut stream: VsockStream,
    state: &AgentState,
    handle: &tokio::runtime::Handle,
) -> Result<(), InitError> {
    let request = read_request(&mut stream)?;
    let response = handle.block_on(route(request, state));
    write_response(&mut stream, response)
}

struct ParsedRequest {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

struct RawResponse {
    status: StatusCode,
    content_type: &'static str,
    body: Vec<u8>,
}

async fn route(req: ParsedRequest, state: &AgentState) -> RawResponse {
    match (req.method.clone(), req.path.as_str()) {
        (Method::GET, "/health") => json_response(StatusCode::OK, &HealthResponse { ok: true }),
        (Method::POST, "/network") => handle_network(req).await,
        (Method::POST, "/allowlist") => handle_allowlist(req).await,
        (Method::POST, "/exec") => handle_exec(req, state).await,
        (Method::POST, "/run-ts") => handle_run(req, state, true).await,
        (Method::POST, "/run-js") => handle_run(req, state, false).await,
        (Method::POST, "/upload") => handle_upload(req, state).await,
        (Method::GET, "/download") => handle_download(req, state).await,
        _ => error_response(StatusCode::NOT_FOUND, "not_found", "unknown route"),
    }
}

async fn handle_network(req: ParsedRequest) -> RawResponse {
    let parsed: NetworkConfigRequest = match serde_json::from_slice(&req.body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()),
    };
    match network::configure(&parsed).await {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "net_config_failed", e.to_string()),
    }
}

async fn handle_allowlist(req: ParsedRequest) -> RawResponse {
    let parsed: AllowlistRequest = match serde_json::from_slice(&req.body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()),
    };
    match network::apply_allowlist(&parsed).await {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "allowlist_failed", e.to_string()),
    }
}

async fn handle_exec(req: ParsedRequest, state: &AgentState) -> RawResponse {
    let parsed: WireExecRequest = match serde_json::from_slice(&req.body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()),
    };
    let outcome = state
        .exec_runner
        .exec(ExecRequest {
            cmd: parsed.cmd,
            cwd: parsed.cwd,
            env: parsed.env,
            timeout_ms: parsed.timeout_ms,
        })
        .await;
    match outcome {
        Ok(o) => json_response(
            StatusCode::OK,
            &ExecResult {
                exit_code: o.exit_code,
                stdout: o.stdout,
                stderr: o.stderr,
                result: o.result,
                error: o.error,
            },
        ),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "exec_failed", e.to_string()),
    }
}

async fn handle_run(req: ParsedRequest, state: &AgentState, is_ts: bool) -> RawResponse {
    let parsed: WireRunRequest = match serde_json::from_slice(&req.body) {
        Ok(v) => v,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_body", e.to_string()),
    };
    let extra_flags = if is_ts {
        parsed.deno_flags.clone()
    } else {
        parsed.node_flags.clone()
    };
    let runner_req = RunRequest {
        code: parsed.code,
        path: parsed.path,
        args: parsed.args,
        extra_flags,
        env: parsed.env,
        allow_net: parsed.allow_net,
        cwd: None,
        timeout_ms: parsed.timeout_ms,
    };
    let outcome = if is_ts {
        state.exec_runner.run_ts(runner_req).await
    } else {
        state.exec_runner.run_js(runner_req).await
    };
    match outcome {
        Ok(o) => json_response(
            StatusCode::OK,
            &ExecResult {
                exit_code: o.exit_code,
                stdout: o.stdout,
                stderr: o.stderr,
                result: o.result,
                error: o.error,
            },
        ),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "run_failed", e.to_string()),
    }
}

async fn handle_upload(req: ParsedRequest, state: &AgentState) -> RawResponse {
    let dest_param = req.query.get("dest").map(String::as_str).unwrap_or("");
    let resolved = match state.path_policy.resolve(dest_param, true) {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_path", e.to_string()),
    };
    match extract_upload(resolved.as_path(), &req.body) {
        Ok(()) => empty_response(StatusCode::NO_CONTENT),
        Err(e) => error_response(StatusCode::BAD_REQUEST, "upload_failed", e.to_string()),
    }
}

async fn handle_download(req: ParsedRequest, state: &AgentState) -> RawResponse {
    let path_param = req.query.get("path").map(String::as_str).unwrap_or("");
    let resolved = match state.path_policy.resolve(path_param, false) {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "invalid_path", e.to_string()),
    };
    match build_download(resolved.as_path()) {
        Ok(bytes) => RawResponse {
            status: StatusCode::OK,
            content_type: "application/gzip",
            body: bytes,
        },
        Err(e) => error_response(StatusCode::BAD_REQUEST, "download_failed", e.to_string()),
    }
}

fn extract_upload(dest: &Path, body: &[u8]) -> Result<(), InitError> {
    std::fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(body);
    let mut archive = tar::Archive::new(decoder);
    let entries = archive
        .entries()
        .map_err(|e| InitError::InvalidPath(format!("malformed archive: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| InitError::InvalidPath(format!("malformed entry: {e}")))?;
        let entry_path = entry
            .path()
            .map_err(|e| InitError::InvalidPath(format!("malformed entry path: {e}")))?
            .into_owned();

        if entry_path.is_absolute() {
            return Err(InitError::InvalidPath(format!(
                "absolute path in archive: {}",
                entry_path.display()
            )));
        }
        if entry_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(InitError::InvalidPath(format!(
                "parent traversal in archive: {}",
                entry_path.display()
            )));
        }
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(InitError::InvalidPath(format!(
                "symlink entry rejected: {}",
                entry_path.display()
            )));
        }

        let full_path = dest.join(&entry_path);
        if !full_path.starts_with(dest) {
            return Err(InitError::InvalidPath(format!(
                "entry escapes destination: {}",
                entry_path.display()
            )));
        }

        entry
            .unpack(&full_path)
            .map_err(|e| InitError::InvalidPath(format!("unpack failed: {e}")))?;
    }

    Ok(())
}

fn build_download(path: &Path) -> Result<Vec<u8>, InitError> {
    if !path.exists() {
        return Err(InitError::NotFound(path.display().to_string()));
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    if path.is_dir() {
        append_dir(&mut builder, path, path)?;
    } else {
        let name = path.file_name().unwrap_or_default();
        builder
            .append_path_with_name(path, name)
            .map_err(|e| InitError::Io(e))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| InitError::Io(e))?;
    encoder.finish().map_err(InitError::Io)
}

fn append_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    dir: &Path,
) -> Result<(), InitError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let full = entry.path();
        let rel = full.strip_prefix(root).unwrap_or(&full);
        if file_type.is_dir() {
            builder.append_dir(rel, &full)?;
            append_dir(builder, root, &full)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(&full, rel)?;
        }
    }
    Ok(())
}

fn read_request(stream: &mut VsockStream) -> Result<ParsedRequest, InitError> {
    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let mut header_end = None;

    loop {
        let n = stream
            .read(&mut chunk)
            .map_err(|e| InitError::AgentServerFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            header_end = Some(pos);
            break;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(InitError::AgentServerFailed("request headers too large".to_string()));
        }
    }

    let header_end = header_end
        .ok_or_else(|| InitError::AgentServerFailed("connection closed before headers".to_string()))?;
    let header_str = std::str::from_utf8(&buf[..header_end])
        .map_err(|e| InitError::AgentServerFailed(e.to_string()))?;

    let mut lines = header_str.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| InitError::AgentServerFailed("empty request line".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| InitError::AgentServerFailed("missing method".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| InitError::AgentServerFailed("missing request target".to_string()))?;
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|e| InitError::AgentServerFailed(e.to_string()))?;
    let (path, query) = split_target(target);

    let mut content_length: usize = 0;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case("content-length") {
                content_length = v.trim().parse().unwrap_or(0);
            }
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Err(InitError::AgentServerFailed("request body too large".to_string()));
    }

    let mut body = buf[(header_end + 4)..].to_vec();
    while body.len() < content_length {
        let n = stream
            .read(&mut chunk)
            .map_err(|e| InitError::AgentServerFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(ParsedRequest {
        method,
        path,
        query,
        body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let mut query = HashMap::new();
    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };
    if let Some(qs) = query_str {
        for pair in qs.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            query.insert(percent_decode(k), percent_decode(v));
        }
    }
    (percent_decode(path), query)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        if bytes[i] == b'+' {
            out.push(b' ');
        } else {
            out.push(bytes[i]);
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn write_response(stream: &mut VsockStream, resp: RawResponse) -> Result<(), InitError> {
    let reason = resp.status.canonical_reason().unwrap_or("");
    let mut head = format!("HTTP/1.1 {} {}\r\n", resp.status.as_u16(), reason).into_bytes();
    head.extend_from_slice(format!("content-type: {}\r\n", resp.content_type).as_bytes());
    head.extend_from_slice(format!("content-length: {}\r\n", resp.body.len()).as_bytes());
    head.extend_from_slice(b"connection: close\r\n\r\n");

    stream
        .write_all(&head)
        .map_err(|e| InitError::AgentServerFailed(e.to_string()))?;
    stream
        .write_all(&resp.body)
        .map_err(|e| InitError::AgentServerFailed(e.to_string()))?;
    stream
        .flush()
        .map_err(|e| InitError::AgentServerFailed(e.to_string()))
}

fn json_response(status: StatusCode, value: &impl Serialize) -> RawResponse {
    RawResponse {
        status,
        content_type: "application/json",
        body: serde_json::to_vec(value).unwrap_or_default(),
    }
}

fn empty_response(status: StatusCode) -> RawResponse {
    RawResponse {
        status,
        content_type: "application/octet-stream",
        body: Vec::new(),
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> RawResponse {
    json_response(
        status,
        &ErrorBody {
            code: code.to_string(),
            message: message.into(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_header_terminator() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody";
        assert_eq!(find_header_end(buf), Some(24));
    }

    #[test]
    fn splits_target_into_path_and_query() {
        let (path, query) = split_target("/download?path=%2Fworkspace%2Ffoo.txt");
        assert_eq!(path, "/download");
        assert_eq!(query.get("path").unwrap(), "/workspace/foo.txt");
    }

    #[test]
    fn percent_decode_handles_plus_and_escapes() {
        assert_eq!(percent_decode("a+b%2Fc"), "a b/c");
    }
}
