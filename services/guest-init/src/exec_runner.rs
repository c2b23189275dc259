//! Shapes `exec`, `run-ts`, and `run-js` into a single wrapper-script +
//! JailRunner pattern.
//!
//! All three share a derivation: resolve `cwd` via [`PathPolicy`] (falling
//! back to `/workspace` if it's unusable), optionally materialize a
//! snippet file for inline `code`, write a wrapper entrypoint that
//! captures a structured `{result, error}` payload, invoke the language
//! runtime through [`JailRunner`], then clean up every scratch file
//! regardless of how the run ended.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jail::{JailError, JailOutput, JailRequest, JailRunner};
use crate::path_policy::{PathPolicy, PathPolicyError};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ExecRunnerError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathPolicyError),

    #[error("jail error: {0}")]
    Jail(#[from] JailError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub cmd: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub code: Option<String>,
    pub path: Option<String>,
    pub args: Vec<String>,
    pub extra_flags: Vec<String>,
    pub env: HashMap<String, String>,
    pub allow_net: bool,
    pub cwd: Option<String>,
    pub timeout_ms: Option<u64>,
}

enum Kind {
    Ts,
    Js,
}

impl Kind {
    fn tag(&self) -> &'static str {
        match self {
            Kind::Ts => "ts",
            Kind::Js => "js",
        }
    }
}

/// Shapes exec/run-ts/run-js invocations for a single guest.
pub struct ExecRunner {
    jail: JailRunner,
    path_policy: PathPolicy,
    ca_bundle_path: String,
}

impl ExecRunner {
    pub fn new(sandbox_root: impl Into<String>, ca_bundle_path: impl Into<String>) -> Self {
        Self {
            jail: JailRunner::new(sandbox_root),
            path_policy: PathPolicy::new("/workspace"),
            ca_bundle_path: ca_bundle_path.into(),
        }
    }

    fn resolve_cwd(&self, cwd: Option<&str>) -> String {
        match cwd {
            Some(c) => match self.path_policy.resolve(c, true) {
                Ok(resolved) => resolved.as_path().display().to_string(),
                Err(_) => "/workspace".to_string(),
            },
            None => "/workspace".to_string(),
        }
    }

    pub async fn exec(&self, req: ExecRequest) -> Result<ExecOutcome, ExecRunnerError> {
        let cwd = self.resolve_cwd(req.cwd.as_deref());
        let timeout = Duration::from_millis(req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));

        let output = self
            .jail
            .run(JailRequest {
                command: req.cmd,
                cwd: Some(cwd),
                env: req.env,
                timeout,
            })
            .await?;

        Ok(ExecOutcome {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            result: None,
            error: None,
        })
    }

    pub async fn run_ts(&self, req: RunRequest) -> Result<ExecOutcome, ExecRunnerError> {
        self.run(Kind::Ts, req).await
    }

    pub async fn run_js(&self, req: RunRequest) -> Result<ExecOutcome, ExecRunnerError> {
        self.run(Kind::Js, req).await
    }

    async fn run(&self, kind: Kind, req: RunRequest) -> Result<ExecOutcome, ExecRunnerError> {
        let cwd = self.resolve_cwd(req.cwd.as_deref());
        let id = Uuid::new_v4();
        let tag = kind.tag();

        let module_guest_path = if let Some(code) = &req.code {
            let snippet_name = format!(".run-{tag}-snippet-{id}.{tag}");
            let snippet_guest = format!("/workspace/{snippet_name}");
            tokio::fs::write(&snippet_guest, code.as_bytes()).await?;
            snippet_guest
        } else if let Some(path) = &req.path {
            let resolved = self.path_policy.resolve(path, false)?;
            resolved.as_path().display().to_string()
        } else {
            return Ok(ExecOutcome {
                exit_code: 1,
                stdout: String::new(),
                stderr: "either code or path must be provided".to_string(),
                result: None,
                error: Some(serde_json::json!({
                    "name": "Error",
                    "message": "either code or path must be provided",
                })),
            });
        };

        // Node only accepts top-level `await` in ESM; .mjs forces that
        // regardless of any package.json "type" field in /workspace.
        let wrapper_ext = match kind {
            Kind::Ts => "ts",
            Kind::Js => "mjs",
        };
        let wrapper_name = format!(".run-{tag}-wrapper-{id}.{wrapper_ext}");
        let wrapper_guest = format!("/workspace/{wrapper_name}");
        let result_name = format!(".run-{tag}-result-{id}.json");
        let result_guest = format!("/workspace/{result_name}");

        let wrapper_src = wrapper_template(&kind, &module_guest_path, &result_guest, &req.args);
        tokio::fs::write(&wrapper_guest, wrapper_src.as_bytes()).await?;

        let command = match kind {
            Kind::Ts => deno_command(&wrapper_guest, &req, &self.ca_bundle_path),
            Kind::Js => node_command(&wrapper_guest, &req),
        };

        let timeout = Duration::from_millis(req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let run_result = self
            .jail
            .run(JailRequest {
                command,
                cwd: Some(cwd),
                env: req.env.clone(),
                timeout,
            })
            .await;

        let outcome = match run_result {
            Ok(output) => self.finish(kind, output, &result_guest).await,
            Err(e) => Err(ExecRunnerError::Jail(e)),
        };

        cleanup(&[&wrapper_guest, &result_guest]).await;
        if req.code.is_some() {
            cleanup(&[&module_guest_path]).await;
        }

        outcome
    }

    async fn finish(
        &self,
        kind: Kind,
        output: JailOutput,
        result_guest_path: &str,
    ) -> Result<ExecOutcome, ExecRunnerError> {
        let (result, error) = match tokio::fs::read(result_guest_path).await {
            Ok(bytes) => match serde_json::from_slice::<ResultFile>(&bytes) {
                Ok(parsed) => (parsed.result, parsed.error),
                Err(e) => {
                    warn!(error = %e, "malformed result file from wrapper");
                    (None, None)
                }
            },
            Err(_) => (None, None),
        };

        let stdout = if matches!(kind, Kind::Ts) {
            strip_ansi(&output.stdout)
        } else {
            output.stdout
        };
        let stderr = if matches!(kind, Kind::Ts) {
            strip_ansi(&output.stderr)
        } else {
            output.stderr
        };

        Ok(ExecOutcome {
            exit_code: output.exit_code,
            stdout,
            stderr,
            result,
            error,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ResultFile {
    result: Option<Value>,
    error: Option<Value>,
}

async fn cleanup(paths: &[&str]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path, error = %e, "failed to clean up scratch file");
            }
        }
    }
}

fn deno_command(wrapper: &str, req: &RunRequest, ca_bundle: &str) -> String {
    let allow_read = format!("/workspace,/tmp,/etc/resolv.conf,/etc/hosts,/etc/nsswitch.conf,{ca_bundle}");
    let allow_write = "/workspace,/tmp".to_string();
    let allow_env: Vec<&str> = req.env.keys().map(String::as_str).collect();

    let mut args = vec!["deno".to_string(), "run".to_string()];
    args.push(format!("--allow-read={allow_read}"));
    args.push(format!("--allow-write={allow_write}"));
    if !allow_env.is_empty() {
        args.push(format!("--allow-env={}", allow_env.join(",")));
    }
    if req.allow_net {
        args.push("--allow-net".to_string());
    }
    for flag in &req.extra_flags {
        args.push(flag.clone());
    }
    args.push(crate::jail::shell_quote(wrapper));
    for arg in &req.args {
        args.push(crate::jail::shell_quote(arg));
    }
    args.join(" ")
}

fn node_command(wrapper: &str, req: &RunRequest) -> String {
    let mut args = vec!["node".to_string()];
    for flag in &req.extra_flags {
        args.push(flag.clone());
    }
    args.push(crate::jail::shell_quote(wrapper));
    for arg in &req.args {
        args.push(crate::jail::shell_quote(arg));
    }
    args.join(" ")
}

/// Strip ANSI escape sequences (Deno colorizes its default output).
fn strip_ansi(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0x1b && i + 1 < bytes.len() && bytes[i + 1] == b'[' {
            i += 2;
            while i < bytes.len() && !bytes[i].is_ascii_alphabetic() {
                i += 1;
            }
            i += 1; // consume final letter
        } else {
            let ch_len = utf8_char_len(bytes[i]);
            if let Ok(s) = std::str::from_utf8(&bytes[i..(i + ch_len).min(bytes.len())]) {
                out.push_str(s);
            }
            i += ch_len;
        }
    }
    out
}

fn utf8_char_len(byte: u8) -> usize {
    if byte & 0x80 == 0 {
        1
    } else if byte & 0xE0 == 0xC0 {
        2
    } else if byte & 0xF0 == 0xE0 {
        3
    } else if byte & 0xF8 == 0xF0 {
        4
    } else {
        1
    }
}

/// The wrapper entrypoint contract shared by run-ts and run-js: exposes a
/// global `result` with `set(v)`/`error(e)`, dynamically imports the
/// target module so its stack traces resolve to its own URL, then writes
/// `{result, error}` to `result_path` and exits 1 on an uncaught error.
/// The result-file write and process exit are the only lines that differ
/// between the two runtimes, so only those are kind-specific.
fn wrapper_template(kind: &Kind, module_path: &str, result_path: &str, args: &[String]) -> String {
    let args_json = serde_json::to_string(args).unwrap_or_else(|_| "[]".to_string());
    let (write_result, exit_one) = match kind {
        Kind::Ts => (
            "await Deno.writeTextFile(__resultPath, __payload);".to_string(),
            "Deno.exit(1);".to_string(),
        ),
        Kind::Js => (
            "const { writeFileSync } = await import(\"node:fs\"); writeFileSync(__resultPath, __payload);".to_string(),
            "process.exit(1);".to_string(),
        ),
    };
    format!(
        r#"const __resultPath = {result_path:?};
const __args = {args_json};
let __captured = {{ result: undefined, error: undefined }};
let __hasResult = false;
let __hasError = false;

globalThis.result = {{
  set(v) {{
    __captured.result = v;
    __hasResult = true;
  }},
  error(e) {{
    __captured.error = e;
    __hasError = true;
  }},
}};

function normalizeError(e) {{
  if (typeof e === "string") {{
    return {{ name: "Error", message: e }};
  }}
  if (e !== null && typeof e === "object") {{
    if ("name" in e || "message" in e || "stack" in e) {{
      const out = {{}};
      if ("name" in e) out.name = e.name;
      if ("message" in e) out.message = e.message;
      if ("stack" in e) out.stack = e.stack;
      return out;
    }}
    return e;
  }}
  return {{ name: "Error", message: String(e) }};
}}

function safeStringify(value) {{
  const seen = new WeakSet();
  return JSON.stringify(value, (_key, v) => {{
    if (typeof v === "bigint") return v.toString();
    if (typeof v === "object" && v !== null) {{
      if (seen.has(v)) return "[Circular]";
      seen.add(v);
    }}
    return v;
  }});
}}

async function __main() {{
  try {{
    await import({module_path:?});
  }} catch (e) {{
    __captured.error = normalizeError(e);
    __hasError = true;
  }}

  if (__hasError && !__hasResult) {{
    const __payload = safeStringify({{
      result: __captured.result ?? null,
      error: normalizeError(__captured.error),
    }});
    {write_result}
    {exit_one}
  }}

  const __payload = safeStringify({{
    result: __captured.result ?? null,
    error: __hasError ? normalizeError(__captured.error) : null,
  }});
  {write_result}
}}

await __main();
"#,
        result_path = result_path,
        args_json = args_json,
        module_path = module_path,
        write_result = write_result,
        exit_one = exit_one,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_color_codes() {
        let input = "\x1b[31mred\x1b[0m plain";
        assert_eq!(strip_ansi(input), "red plain");
    }

    #[test]
    fn deno_command_includes_allow_net_only_when_requested() {
        let req = RunRequest {
            allow_net: true,
            ..Default::default()
        };
        let cmd = deno_command("/workspace/.wrap.ts", &req, "/etc/ssl/cert.pem");
        assert!(cmd.contains("--allow-net"));

        let req2 = RunRequest::default();
        let cmd2 = deno_command("/workspace/.wrap.ts", &req2, "/etc/ssl/cert.pem");
        assert!(!cmd2.contains("--allow-net"));
    }

    #[test]
    fn wrapper_template_embeds_module_and_result_paths() {
        let src = wrapper_template(
            &Kind::Ts,
            "/workspace/snippet.ts",
            "/workspace/.result.json",
            &[],
        );
        assert!(src.contains("/workspace/snippet.ts"));
        assert!(src.contains("/workspace/.result.json"));
        assert!(src.contains("globalThis.result"));
    }
}
