//! Decoder for the Docker multiplexed exec/attach stream.
//!
//! When a container runs without a TTY, Docker interleaves stdout and stderr
//! on one connection as a sequence of frames:
//!
//! ```text
//! [kind: u8][0u8; 3][len: u32 big-endian][payload: len bytes]
//! ```
//!
//! `kind` is 1 for stdout and 2 for stderr (0 is stdin echo, written to
//! stdout). Frames arrive through the HTTP body in arbitrary chunks: one
//! delivery may hold many frames, or cut a header or payload in half. The
//! decoder therefore keeps its own state between deliveries.

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_header_byte(byte: u8) -> Option<Self> {
        match byte {
            0 | 1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeader {
        filled: usize,
    },
    AwaitingPayload {
        /// `None` for frames of an unknown kind: consumed, not kept.
        kind: Option<StreamKind>,
        remaining: usize,
    },
}

/// Output of a fully drained stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Demuxed {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Some output was dropped because a stream hit the byte cap.
    pub truncated: bool,
    /// The channel closed in the middle of a frame.
    pub incomplete: bool,
}

impl Demuxed {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug)]
pub struct Demuxer {
    state: State,
    header: [u8; HEADER_LEN],
    out: Demuxed,
    max_bytes_per_stream: usize,
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Cap each logical stream at `max_bytes_per_stream` bytes.
    pub fn with_limit(max_bytes_per_stream: usize) -> Self {
        Self {
            state: State::AwaitingHeader { filled: 0 },
            header: [0; HEADER_LEN],
            out: Demuxed::default(),
            max_bytes_per_stream,
        }
    }

    /// Consume one transport delivery.
    pub fn feed(&mut self, mut chunk: &[u8]) {
        while !chunk.is_empty() {
            match self.state {
                State::AwaitingHeader { filled } => {
                    let take = (HEADER_LEN - filled).min(chunk.len());
                    self.header[filled..filled + take].copy_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    let filled = filled + take;
                    self.state = if filled == HEADER_LEN {
                        self.parse_header()
                    } else {
                        State::AwaitingHeader { filled }
                    };
                }
                State::AwaitingPayload { kind, remaining } => {
                    let take = remaining.min(chunk.len());
                    if let Some(kind) = kind {
                        self.append(kind, &chunk[..take]);
                    }
                    chunk = &chunk[take..];
                    self.state = if take == remaining {
                        State::AwaitingHeader { filled: 0 }
                    } else {
                        State::AwaitingPayload {
                            kind,
                            remaining: remaining - take,
                        }
                    };
                }
            }
        }
    }

    /// True when no frame is partially decoded.
    pub fn is_at_frame_boundary(&self) -> bool {
        self.state == State::AwaitingHeader { filled: 0 }
    }

    /// Stop decoding; the channel has closed.
    pub fn finish(mut self) -> Demuxed {
        if !self.is_at_frame_boundary() {
            tracing::warn!(state = ?self.state, "exec stream closed mid-frame");
            self.out.incomplete = true;
        }
        self.out
    }

    fn parse_header(&mut self) -> State {
        let kind = StreamKind::from_header_byte(self.header[0]);
        let len = u32::from_be_bytes([self.header[4], self.header[5], self.header[6], self.header[7]])
            as usize;
        if kind.is_none() {
            tracing::warn!(kind = self.header[0], len, "discarding frame of unknown stream kind");
        }
        if len == 0 {
            State::AwaitingHeader { filled: 0 }
        } else {
            State::AwaitingPayload {
                kind,
                remaining: len,
            }
        }
    }

    fn append(&mut self, kind: StreamKind, bytes: &[u8]) {
        let buf = match kind {
            StreamKind::Stdout => &mut self.out.stdout,
            StreamKind::Stderr => &mut self.out.stderr,
        };
        let room = self.max_bytes_per_stream.saturating_sub(buf.len());
        if bytes.len() > room {
            self.out.truncated = true;
        }
        buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
}

/// Encode one frame the way the engine does.
#[cfg(test)]
pub(crate) fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&[kind, 0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
