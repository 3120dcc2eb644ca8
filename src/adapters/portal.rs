use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::domain::ports::{PortalError, PortalRenderer};

const PDF_MAGIC: &[u8] = b"%PDF";

/// Runs an external portal automation command.
///
/// The command receives `{ access_key, pfx_base64, password }` as JSON on
/// stdin and must write the document to stdout, raw or base64 encoded.
/// Credentials are never put on the command line.
#[derive(Debug, Clone)]
pub struct CommandPortalRenderer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct PortalRequest<'a> {
    access_key: &'a str,
    pfx_base64: &'a str,
    password: &'a str,
}

impl CommandPortalRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, request: &[u8]) -> Result<Vec<u8>, PortalError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PortalError::Failed(format!("cannot start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request)
                .await
                .map_err(|e| PortalError::Failed(format!("cannot write request: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PortalError::Failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PortalError::Failed(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        decode_document(output.stdout)
    }
}

fn decode_document(stdout: Vec<u8>) -> Result<Vec<u8>, PortalError> {
    if stdout.starts_with(PDF_MAGIC) {
        return Ok(stdout);
    }
    let text: Vec<u8> = stdout
        .into_iter()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let decoded = STANDARD
        .decode(&text)
        .map_err(|_| PortalError::Failed("output is neither a PDF nor base64".into()))?;
    if decoded.is_empty() {
        return Err(PortalError::Failed("empty document".into()));
    }
    Ok(decoded)
}

#[async_trait]
impl PortalRenderer for CommandPortalRenderer {
    async fn download_official_artifact(
        &self,
        access_key: &str,
        pfx_base64: &SecretString,
        password: &SecretString,
    ) -> Result<Vec<u8>, PortalError> {
        let request = serde_json::to_vec(&PortalRequest {
            access_key,
            pfx_base64: pfx_base64.expose_secret(),
            password: password.expose_secret(),
        })
        .map_err(|e| PortalError::Failed(e.to_string()))?;

        info!(access_key, program = %self.program, "Requesting official document from the portal");
        match tokio::time::timeout(self.timeout, self.run(&request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(access_key, "Portal renderer timed out");
                Err(PortalError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

/// Used when no portal command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledPortal;

#[async_trait]
impl PortalRenderer for DisabledPortal {
    async fn download_official_artifact(
        &self,
        _access_key: &str,
        _pfx_base64: &SecretString,
        _password: &SecretString,
    ) -> Result<Vec<u8>, PortalError> {
        Err(PortalError::Unavailable)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn shell(script: &str, timeout: Duration) -> CommandPortalRenderer {
        CommandPortalRenderer::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn test_raw_pdf_output() {
        let renderer = shell("cat > /dev/null; printf '%%PDF-1.4 test'", Duration::from_secs(5));
        let document = renderer
            .download_official_artifact("KEY", &secret("pfx"), &secret("pw"))
            .await
            .unwrap();
        assert!(document.starts_with(PDF_MAGIC));
    }

    #[tokio::test]
    async fn test_credentials_travel_on_stdin() {
        // Echoes the request back base64 encoded
        let renderer = shell("base64", Duration::from_secs(5));
        let document = renderer
            .download_official_artifact("KEY", &secret("pfx-data"), &secret("s3cret"))
            .await
            .unwrap();
        let request: serde_json::Value = serde_json::from_slice(&document).unwrap();
        assert_eq!(request["access_key"], "KEY");
        assert_eq!(request["password"], "s3cret");
    }

    #[tokio::test]
    async fn test_failing_command() {
        let renderer = shell("cat > /dev/null; echo boom >&2; exit 3", Duration::from_secs(5));
        let err = renderer
            .download_official_artifact("KEY", &secret("pfx"), &secret("pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Failed(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_timeout() {
        let renderer = shell("sleep 5", Duration::from_millis(200));
        let err = renderer
            .download_official_artifact("KEY", &secret("pfx"), &secret("pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_disabled_portal() {
        let err = DisabledPortal
            .download_official_artifact("KEY", &secret("pfx"), &secret("pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::Unavailable));
    }
}
