//! Connect-protocol framing for the envd process service.
//!
//! A streaming Connect call exchanges envelopes:
//!
//! ```text
//! [flags: u8][len: u32 big-endian][message: len bytes of JSON]
//! ```
//!
//! Flag bit `0x02` marks the end-of-stream envelope, whose message carries
//! an optional `error`. Process output arrives as base64 in `data` events;
//! the `end` event carries the exit code.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

use crate::sandbox::error::SandboxError;

pub const END_STREAM_FLAG: u8 = 0x02;
const PREFIX_LEN: usize = 5;

pub fn encode_envelope(flags: u8, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + message.len());
    out.push(flags);
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub message: Vec<u8>,
}

impl Envelope {
    pub fn is_end_stream(&self) -> bool {
        self.flags & END_STREAM_FLAG != 0
    }
}

/// Incremental envelope decoder; accepts arbitrary chunking.
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    buf: Vec<u8>,
}

impl EnvelopeDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Envelope> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buf.len() < PREFIX_LEN {
                break;
            }
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if self.buf.len() < PREFIX_LEN + len {
                break;
            }
            let flags = self.buf[0];
            let message = self.buf[PREFIX_LEN..PREFIX_LEN + len].to_vec();
            self.buf.drain(..PREFIX_LEN + len);
            out.push(Envelope { flags, message });
        }
        out
    }

    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

// ── Messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StartRequest {
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessConfig {
    pub cmd: String,
    pub args: Vec<String>,
    pub envs: std::collections::BTreeMap<String, String>,
    pub cwd: String,
}

impl StartRequest {
    /// `/bin/bash -l -c <command>` in `cwd`.
    pub fn shell(command: &str, cwd: &str) -> Self {
        Self {
            process: ProcessConfig {
                cmd: "/bin/bash".into(),
                args: vec!["-l".into(), "-c".into(), command.into()],
                envs: Default::default(),
                cwd: cwd.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartResponse {
    #[serde(default)]
    pub event: Option<ProcessEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessEvent {
    #[serde(default)]
    pub start: Option<serde_json::Value>,
    #[serde(default)]
    pub data: Option<DataEvent>,
    #[serde(default)]
    pub end: Option<EndEvent>,
    #[serde(default)]
    pub keepalive: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataEvent {
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndEvent {
    /// Omitted by the server when zero.
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndStreamMessage {
    #[serde(default)]
    pub error: Option<ConnectError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Accumulates a process' output from decoded envelopes.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
    pub ended: bool,
}

impl ProcessOutput {
    pub fn apply(&mut self, envelope: &Envelope) -> Result<(), SandboxError> {
        if envelope.is_end_stream() {
            self.ended = true;
            let end: EndStreamMessage = if envelope.message.is_empty() {
                EndStreamMessage::default()
            } else {
                serde_json::from_slice(&envelope.message)
                    .map_err(|e| SandboxError::Serde(format!("envd end-of-stream: {e}")))?
            };
            if let Some(err) = end.error {
                return Err(SandboxError::Exec(format!("envd {}: {}", err.code, err.message)));
            }
            return Ok(());
        }

        let resp: StartResponse = serde_json::from_slice(&envelope.message)
            .map_err(|e| SandboxError::Serde(format!("envd event: {e}")))?;
        let Some(event) = resp.event else {
            return Ok(());
        };
        if let Some(data) = event.data {
            if let Some(out) = data.stdout {
                self.stdout.extend(decode_b64(&out)?);
            }
            if let Some(err) = data.stderr {
                self.stderr.extend(decode_b64(&err)?);
            }
        }
        if let Some(end) = event.end {
            self.exit_code = Some(end.exit_code);
        }
        Ok(())
    }
}

fn decode_b64(data: &str) -> Result<Vec<u8>, SandboxError> {
    B64.decode(data)
        .map_err(|e| SandboxError::Serde(format!("envd output is not base64: {e}")))
}

#[cfg(test)]
pub fn encode_b64(data: &[u8]) -> String {
    B64.encode(data)
}
