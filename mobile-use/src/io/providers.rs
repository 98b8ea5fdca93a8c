//! Model provider transports.
//!
//! - [`HttpProvider`]: OpenAI-compatible `/chat/completions` over blocking HTTP.
//! - [`CommandProvider`]: an external agent CLI (`codex exec` style) that reads the
//!   prompt on stdin and writes its last message to a file, constrained by a
//!   JSON Schema file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::io::cancel::CancelToken;
use crate::io::config::{ProviderConfig, ProviderKind};
use crate::io::gateway::{ModelProvider, ModelRequest, ProviderErrorKind, ProviderFailure};
use crate::io::process::run_command_cancellable;

const SYSTEM_PROMPT: &str =
    "You control a mobile device through a structured interface. Reply with JSON only.";

/// Build the provider selected by `cfg.kind`.
pub fn build_provider(cfg: &ProviderConfig) -> Result<Box<dyn ModelProvider>> {
    match cfg.kind {
        ProviderKind::Openai => Ok(Box::new(HttpProvider::from_config(cfg)?)),
        ProviderKind::Command => Ok(Box::new(CommandProvider::from_config(cfg))),
    }
}

/// OpenAI-compatible chat completions provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    temperature: f32,
}

impl HttpProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout())
            .build()
            .context("build http client")?;
        let api_key = env::var(&cfg.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(env = %cfg.api_key_env, "api key not set");
        }
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            api_key,
            api_key_env: cfg.api_key_env.clone(),
            temperature: cfg.temperature(),
        })
    }

    fn body(&self, request: &ModelRequest) -> Value {
        let mut content = vec![json!({"type": "text", "text": request.prompt})];
        for png in &request.images {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/png;base64,{}", BASE64.encode(png.as_slice()))}
            }));
        }
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": content}
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.role.as_str(),
                    "schema": request.schema.as_ref(),
                    "strict": false
                }
            }
        })
    }
}

impl ModelProvider for HttpProvider {
    #[instrument(skip_all, fields(role = %request.role, model = %self.model))]
    fn complete(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> Result<String, ProviderFailure> {
        let Some(api_key) = &self.api_key else {
            return Err(ProviderFailure::Unconfigured(format!(
                "environment variable {} is not set",
                self.api_key_env
            )));
        };
        if cancel.is_cancelled() {
            return Err(ProviderFailure::Cancelled);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(request.timeout)
            .json(&self.body(request))
            .send()
            .map_err(|err| {
                let kind = if err.is_timeout() {
                    ProviderErrorKind::Timeout
                } else {
                    ProviderErrorKind::Network
                };
                ProviderFailure::transient(kind, err.to_string())
            })?;

        let status = response.status();
        let text = response.text().map_err(|err| {
            ProviderFailure::transient(ProviderErrorKind::Network, err.to_string())
        })?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        debug!(response_bytes = text.len(), "chat completion returned");
        Ok(extract_content(&text).unwrap_or(text))
    }
}

fn classify_status(status: StatusCode, body: &str) -> ProviderFailure {
    let message = format!("{status}: {}", truncate(body, 500));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderFailure::transient(ProviderErrorKind::Auth, message)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            ProviderFailure::transient(ProviderErrorKind::RateLimited, message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ProviderFailure::transient(ProviderErrorKind::Timeout, message)
        }
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
            ProviderFailure::Unconfigured(message)
        }
        _ => ProviderFailure::transient(ProviderErrorKind::Network, message),
    }
}

fn extract_content(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Provider backed by an external agent CLI.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    command: Vec<String>,
    output_limit_bytes: usize,
    scratch_dir: PathBuf,
}

impl CommandProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        Self::new(cfg.command.clone(), cfg.output_limit_bytes)
    }

    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
            scratch_dir: env::temp_dir().join("mobile-use"),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

/// Files written for one CLI call, removed on drop.
struct CallFiles {
    paths: Vec<PathBuf>,
}

impl Drop for CallFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = fs::remove_file(path);
        }
    }
}

fn write_scratch(path: &Path, contents: &[u8]) -> Result<(), ProviderFailure> {
    fs::write(path, contents).map_err(|err| {
        ProviderFailure::Unconfigured(format!("write {}: {err}", path.display()))
    })
}

impl ModelProvider for CommandProvider {
    #[instrument(skip_all, fields(role = %request.role, program = ?self.command.first()))]
    fn complete(
        &self,
        request: &ModelRequest,
        cancel: &CancelToken,
    ) -> Result<String, ProviderFailure> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ProviderFailure::Unconfigured("empty provider command".into()));
        };
        fs::create_dir_all(&self.scratch_dir).map_err(|err| {
            ProviderFailure::Unconfigured(format!(
                "create scratch dir {}: {err}",
                self.scratch_dir.display()
            ))
        })?;

        let call_id = Uuid::new_v4();
        let schema_path = self.scratch_dir.join(format!("{call_id}.schema.json"));
        let output_path = self.scratch_dir.join(format!("{call_id}.out.json"));
        let mut files = CallFiles {
            paths: vec![schema_path.clone(), output_path.clone()],
        };
        let schema = serde_json::to_vec_pretty(request.schema.as_ref())
            .map_err(|err| ProviderFailure::Unconfigured(err.to_string()))?;
        write_scratch(&schema_path, &schema)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path);
        for (i, png) in request.images.iter().enumerate() {
            let image_path = self.scratch_dir.join(format!("{call_id}.{i}.png"));
            write_scratch(&image_path, png)?;
            cmd.arg("--image").arg(&image_path);
            files.paths.push(image_path);
        }
        cmd.arg("-");

        info!("invoking provider command");
        let output = run_command_cancellable(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
            Some(cancel),
        )
        .map_err(|err| ProviderFailure::Unconfigured(format!("{err:#}")))?;

        if output.cancelled {
            return Err(ProviderFailure::Cancelled);
        }
        if output.timed_out {
            return Err(ProviderFailure::transient(
                ProviderErrorKind::Timeout,
                format!("provider command timed out after {:?}", request.timeout),
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            return Err(ProviderFailure::transient(
                ProviderErrorKind::Network,
                format!(
                    "provider command exited with {:?}: {}{}",
                    output.status.code(),
                    truncate(stderr.trim(), 500),
                    output.stderr_truncated_notice("provider")
                ),
            ));
        }

        match fs::read_to_string(&output_path) {
            Ok(text) => Ok(text),
            Err(_) => Ok(output.stdout_lossy()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gateway::Role;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(prompt: &str) -> ModelRequest {
        ModelRequest {
            role: Role::Verifier,
            prompt: prompt.to_string(),
            images: Vec::new(),
            schema: Arc::new(json!({"type": "object"})),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            ProviderFailure::Transient {
                kind: ProviderErrorKind::RateLimited,
                ..
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ProviderFailure::Transient {
                kind: ProviderErrorKind::Auth,
                ..
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "no such model"),
            ProviderFailure::Unconfigured(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            ProviderFailure::Transient {
                kind: ProviderErrorKind::Network,
                ..
            }
        ));
    }

    #[test]
    fn extracts_chat_completion_content() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "{\"ok\": true}"}}]}"#;
        assert_eq!(extract_content(body).as_deref(), Some("{\"ok\": true}"));
        assert_eq!(extract_content("not json"), None);
    }

    #[test]
    fn http_provider_without_key_is_unconfigured() {
        let cfg = ProviderConfig {
            api_key_env: "MOBILE_USE_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..ProviderConfig::default()
        };
        let provider = HttpProvider::from_config(&cfg).expect("provider");
        let err = provider
            .complete(&request("hi"), &CancelToken::new())
            .expect_err("unconfigured");
        assert!(matches!(err, ProviderFailure::Unconfigured(_)));
    }

    #[cfg(unix)]
    #[test]
    fn command_provider_falls_back_to_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        // `sh -c 'cat' <flags...>` ignores the trailing arguments and echoes stdin.
        let provider = CommandProvider::new(
            vec!["sh".into(), "-c".into(), "cat".into(), "provider".into()],
            4096,
        )
        .with_scratch_dir(temp.path());
        let reply = provider
            .complete(&request("{\"verdict\": \"confirmed\"}"), &CancelToken::new())
            .expect("reply");
        assert_eq!(reply, "{\"verdict\": \"confirmed\"}");
        assert_eq!(fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn command_provider_maps_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = CommandProvider::new(
            vec!["sh".into(), "-c".into(), "cat >/dev/null; exit 3".into()],
            4096,
        )
        .with_scratch_dir(temp.path());
        let err = provider
            .complete(&request("x"), &CancelToken::new())
            .expect_err("failure");
        assert!(matches!(
            err,
            ProviderFailure::Transient {
                kind: ProviderErrorKind::Network,
                ..
            }
        ));

        let missing = CommandProvider::new(vec!["/nonexistent/mobile-use-provider".into()], 4096)
            .with_scratch_dir(temp.path());
        assert!(matches!(
            missing.complete(&request("x"), &CancelToken::new()),
            Err(ProviderFailure::Unconfigured(_))
        ));
    }
}
