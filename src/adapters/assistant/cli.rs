//! Subprocess client for the external assistant CLI.
//!
//! The assistant is invoked as
//! `<cmd> -p "<prompt>" --output-format stream-json --verbose [--image <path>]*`
//! for a fresh session and `<cmd> -r <session> -p "<prompt>" --output-format
//! stream-json` when resuming. It writes NDJSON to stdout and exits.

use base64::Engine as _;
use futures::StreamExt;
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::{ImageAttachment, StreamRecord};
use crate::domain::ports::{AssistantClient, AssistantRequest, AssistantTurn};

use super::fold_outcome;

/// A single NDJSON record may grow to 256 KiB before it is dropped.
pub const MAX_RECORD_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct CliAssistantConfig {
    /// Executable name or path of the assistant.
    pub command: String,
    /// No event for this long means the subprocess hung.
    pub idle_timeout: Duration,
    /// How long to keep reading after an interrupt before force-killing.
    pub drain_window: Duration,
    pub max_record_bytes: usize,
    /// Event channel capacity; the reader blocks when the consumer lags.
    pub channel_capacity: usize,
}

impl Default for CliAssistantConfig {
    fn default() -> Self {
        Self {
            command: "assistant".to_string(),
            idle_timeout: Duration::from_secs(300),
            drain_window: Duration::from_secs(2),
            max_record_bytes: MAX_RECORD_BYTES,
            channel_capacity: 64,
        }
    }
}

pub struct CliAssistantClient {
    config: CliAssistantConfig,
}

impl CliAssistantClient {
    pub fn new(config: CliAssistantConfig) -> Self {
        Self { config }
    }

    pub fn with_command(command: impl Into<String>) -> Self {
        Self::new(CliAssistantConfig {
            command: command.into(),
            ..Default::default()
        })
    }

    /// Decode base64 attachments into temp files the CLI can read.
    ///
    /// The files must outlive the subprocess; the caller keeps the handles.
    fn materialize_attachments(
        attachments: &[ImageAttachment],
    ) -> EngineResult<Vec<NamedTempFile>> {
        let mut files = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&attachment.base64)
                .map_err(|e| EngineError::Validation(format!("invalid image attachment: {e}")))?;
            let suffix = match attachment.media_type.as_str() {
                "image/png" => ".png",
                "image/jpeg" => ".jpg",
                "image/gif" => ".gif",
                "image/webp" => ".webp",
                _ => ".img",
            };
            let file = tempfile::Builder::new()
                .prefix("taskpilot-attach-")
                .suffix(suffix)
                .tempfile()
                .map_err(|e| EngineError::SubprocessSpawnFailed(e.to_string()))?;
            std::fs::write(file.path(), &bytes)
                .map_err(|e| EngineError::SubprocessSpawnFailed(e.to_string()))?;
            files.push(file);
        }
        Ok(files)
    }

    fn build_args(request: &AssistantRequest, attachments: &[NamedTempFile]) -> Vec<String> {
        let mut args = Vec::new();
        match &request.resume_session_id {
            Some(session_id) => {
                args.push("-r".to_string());
                args.push(session_id.clone());
                args.push("-p".to_string());
                args.push(request.prompt.clone());
                args.push("--output-format".to_string());
                args.push("stream-json".to_string());
            }
            None => {
                args.push("-p".to_string());
                args.push(request.prompt.clone());
                args.push("--output-format".to_string());
                args.push("stream-json".to_string());
                args.push("--verbose".to_string());
                for file in attachments {
                    args.push("--image".to_string());
                    args.push(file.path().to_string_lossy().into_owned());
                }
            }
        }
        args
    }
}

#[async_trait::async_trait]
impl AssistantClient for CliAssistantClient {
    async fn begin(
        &self,
        request: AssistantRequest,
        cancel: CancellationToken,
    ) -> EngineResult<AssistantTurn> {
        if let Some(workdir) = &request.workdir {
            if !workdir.exists() {
                return Err(EngineError::Validation(format!(
                    "working directory not found: {}",
                    workdir.display()
                )));
            }
        }

        let attachments = Self::materialize_attachments(&request.attachments)?;
        let args = Self::build_args(&request, &attachments);
        let resumed = request.resume_session_id.is_some();

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &request.workdir {
            cmd.current_dir(workdir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::SubprocessSpawnFailed(e.to_string()))?;

        let pid = child.id();
        info!(
            command = %self.config.command,
            pid = ?pid,
            resumed,
            workdir = ?request.workdir,
            "assistant subprocess started"
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::SubprocessSpawnFailed("failed to capture stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::SubprocessSpawnFailed("failed to capture stderr".into()))?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let idle_timeout = self.config.idle_timeout;
        let drain_window = self.config.drain_window;
        let max_record_bytes = self.config.max_record_bytes;

        tokio::spawn(async move {
            // Attachment temp files live until this task ends.
            let _attachments = attachments;

            let mut frames = FramedRead::new(
                stdout,
                LinesCodec::new_with_max_length(max_record_bytes),
            );
            let mut records: Vec<StreamRecord> = Vec::new();
            let mut interrupted = false;
            let mut drain_deadline: Option<Instant> = None;
            let mut failure: Option<EngineError> = None;

            loop {
                let next = if let Some(deadline) = drain_deadline {
                    // Post-interrupt drain: bounded by the remaining window.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match timeout(remaining, frames.next()).await {
                        Ok(item) => item,
                        Err(_) => break,
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled(), if !interrupted => {
                            interrupted = true;
                            interrupt(pid, &mut child).await;
                            drain_deadline = Some(Instant::now() + drain_window);
                            continue;
                        }
                        item = timeout(idle_timeout, frames.next()) => match item {
                            Ok(item) => item,
                            Err(_) => {
                                warn!(pid = ?pid, "assistant idle timeout, killing subprocess");
                                let _ = child.start_kill();
                                failure =
                                    Some(EngineError::AssistantTimeout(idle_timeout.as_secs()));
                                break;
                            }
                        },
                    }
                };

                match next {
                    Some(Ok(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let record: StreamRecord = match serde_json::from_str(line) {
                            Ok(record) => record,
                            // Non-JSON noise on stdout is skipped.
                            Err(_) => continue,
                        };
                        records.push(record.clone());
                        if tx.send(record).await.is_err() {
                            // Consumer went away; keep reading so the tally
                            // and exit handling stay correct.
                            debug!(pid = ?pid, "event consumer dropped");
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        // The codec discards the oversized line and resumes at
                        // the next newline; the turn continues.
                        warn!(
                            pid = ?pid,
                            error = %EngineError::ChunkTooLarge {
                                limit: max_record_bytes
                            },
                            "oversized stream record dropped"
                        );
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        warn!(pid = ?pid, error = %e, "stream read error");
                        break;
                    }
                    None => break,
                }
            }

            drop(frames);

            let exit = if interrupted || failure.is_some() {
                match timeout(Duration::from_secs(1), child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        let _ = child.kill().await;
                        None
                    }
                }
            } else {
                child.wait().await.ok()
            };

            let result = if let Some(failure) = failure {
                Err(failure)
            } else {
                let mut outcome = fold_outcome(records.iter(), resumed);
                outcome.subprocess_id = pid;

                match exit {
                    Some(status) if !status.success() && !interrupted => {
                        let mut stderr_buf = String::new();
                        let _ = stderr.read_to_string(&mut stderr_buf).await;
                        // The CLI's own framing limit is survivable: partial
                        // output was already captured, the session continues.
                        if stderr_buf.contains("chunk is longer than limit") {
                            warn!(pid = ?pid, "assistant hit its own chunk limit, keeping partial output");
                            Ok(outcome)
                        } else {
                            Err(EngineError::AssistantFailed {
                                code: status.code().unwrap_or(-1),
                                stderr: stderr_buf.trim().to_string(),
                            })
                        }
                    }
                    _ => Ok(outcome),
                }
            };

            let _ = outcome_tx.send(result);
        });

        Ok(AssistantTurn {
            events: rx,
            outcome: outcome_rx,
            subprocess_id: pid,
        })
    }
}

/// Interrupt the subprocess (process group on Unix) to begin the drain.
async fn interrupt(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        let delivered = Command::new("kill")
            .arg("-INT")
            .arg(format!("-{pid}"))
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if delivered {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_invocation_args() {
        let request = AssistantRequest::new("do the thing");
        let args = CliAssistantClient::build_args(&request, &[]);
        assert_eq!(
            args,
            vec![
                "-p",
                "do the thing",
                "--output-format",
                "stream-json",
                "--verbose"
            ]
        );
    }

    #[test]
    fn test_resumed_invocation_args() {
        let request = AssistantRequest::new("continue").resuming("sid-42");
        let args = CliAssistantClient::build_args(&request, &[]);
        assert_eq!(
            args,
            vec![
                "-r",
                "sid-42",
                "-p",
                "continue",
                "--output-format",
                "stream-json"
            ]
        );
        assert!(!args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_attachments_become_image_flags() {
        let request = AssistantRequest::new("look at this").with_attachments(vec![
            ImageAttachment {
                base64: base64::engine::general_purpose::STANDARD.encode(b"fake-png"),
                media_type: "image/png".to_string(),
            },
        ]);
        let files = CliAssistantClient::materialize_attachments(&request.attachments).unwrap();
        let args = CliAssistantClient::build_args(&request, &files);
        assert!(args.contains(&"--image".to_string()));
        let path = &args[args.iter().position(|a| a == "--image").unwrap() + 1];
        assert!(path.ends_with(".png"));
        assert_eq!(std::fs::read(path).unwrap(), b"fake-png");
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result = CliAssistantClient::materialize_attachments(&[ImageAttachment {
            base64: "not base64 !!!".to_string(),
            media_type: "image/png".to_string(),
        }]);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
