// SPDX-License-Identifier: MIT OR Apache-2.0
//! NDJSON wire protocol for streaming one execution's progress and outcome.
//!
//! A stream is one newline-delimited JSON object per line, tagged by
//! `type`: `start`, any number of `event`, an optional `end`, and exactly
//! one of `result`/`error` as the terminal frame. [`FrameSequenceValidator`]
//! enforces that shape incrementally as frames arrive, the streaming
//! counterpart of the batch envelope-sequence validator this protocol's
//! flow rules are grounded on.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One NDJSON protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame in every stream, naming the request being executed.
    Start {
        /// Sanitized request id this stream reports progress for.
        request_id: String,
    },
    /// Zero or more progress events, strictly increasing by `seq`.
    Event {
        /// Monotonically increasing sequence number, starting anywhere but
        /// always strictly greater than the previous event's.
        seq: u64,
        /// Event-specific payload.
        payload: serde_json::Value,
    },
    /// Optional marker that no more `event` frames will follow. At most one
    /// per stream.
    End,
    /// Terminal frame reporting success. Mutually exclusive with `Error`.
    Result {
        /// Canonical result payload.
        payload: serde_json::Value,
    },
    /// Terminal frame reporting failure. Mutually exclusive with `Result`.
    Error {
        /// Wire-format error code, see `requiem_error::ErrorCode::as_wire_str`.
        error_code: String,
        /// Human-readable message. Must never embed secret values.
        message: String,
    },
}

impl Frame {
    /// Whether this frame type is a stream terminator (`Result` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Result { .. } | Frame::Error { .. })
    }
}

/// Failures from encoding or decoding a single frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line was not valid JSON, or not a recognized frame shape.
    #[error("failed to parse protocol frame: {0}")]
    ParseError(String),
}

/// Codec for one NDJSON line per [`Frame`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Serialize one frame to a single newline-terminated JSON line.
    pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(frame).map_err(|e| ProtocolError::ParseError(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (without its trailing newline) back into a [`Frame`].
    pub fn decode(line: &str) -> Result<Frame, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::ParseError(e.to_string()))
    }

    /// Encode a whole sequence of frames into one NDJSON blob.
    pub fn encode_batch(frames: &[Frame]) -> Result<String, ProtocolError> {
        let mut out = String::new();
        for frame in frames {
            out.push_str(&Self::encode(frame)?);
        }
        Ok(out)
    }

    /// Decode an NDJSON blob into frames, one result per non-blank line.
    pub fn decode_batch(input: &str) -> Vec<Result<Frame, ProtocolError>> {
        input
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Self::decode)
            .collect()
    }
}

/// A violation of the frame-sequencing rules found while observing a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// An `Event`, `End`, `Result`, or `Error` frame arrived before `Start`.
    NotStartFirst,
    /// A second `Start` frame arrived in the same stream.
    DuplicateStart,
    /// An `Event` frame's `seq` did not strictly increase over the previous one.
    NonIncreasingSeq {
        /// The previous event's sequence number.
        prev: u64,
        /// The out-of-order sequence number that was observed.
        got: u64,
    },
    /// A second `End` frame arrived in the same stream.
    MultipleEnd,
    /// Any frame arrived after a terminal (`Result`/`Error`) frame.
    FrameAfterTerminal,
    /// The stream finished without a terminal frame.
    MissingTerminal,
}

impl std::fmt::Display for SequenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStartFirst => write!(f, "frame observed before a Start frame"),
            Self::DuplicateStart => write!(f, "duplicate Start frame"),
            Self::NonIncreasingSeq { prev, got } => {
                write!(f, "event seq {got} did not strictly increase over previous seq {prev}")
            }
            Self::MultipleEnd => write!(f, "duplicate End frame"),
            Self::FrameAfterTerminal => write!(f, "frame observed after a terminal frame"),
            Self::MissingTerminal => write!(f, "stream ended without a Result or Error frame"),
        }
    }
}

impl std::error::Error for SequenceError {}

/// Incremental validator for the frame-sequencing contract: `Start` first,
/// strictly increasing `Event.seq`, at most one `End`, and exactly one
/// terminal (`Result` xor `Error`) with nothing after it.
#[derive(Debug, Clone, Default)]
pub struct FrameSequenceValidator {
    started: bool,
    last_event_seq: Option<u64>,
    ended: bool,
    terminal_seen: bool,
}

impl FrameSequenceValidator {
    /// Create a validator for a fresh stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next frame in arrival order.
    pub fn observe(&mut self, frame: &Frame) -> Result<(), SequenceError> {
        if self.terminal_seen {
            return Err(SequenceError::FrameAfterTerminal);
        }

        match frame {
            Frame::Start { .. } => {
                if self.started {
                    return Err(SequenceError::DuplicateStart);
                }
                self.started = true;
            }
            Frame::Event { seq, .. } => {
                if !self.started {
                    return Err(SequenceError::NotStartFirst);
                }
                if let Some(prev) = self.last_event_seq {
                    if *seq <= prev {
                        return Err(SequenceError::NonIncreasingSeq { prev, got: *seq });
                    }
                }
                self.last_event_seq = Some(*seq);
            }
            Frame::End => {
                if !self.started {
                    return Err(SequenceError::NotStartFirst);
                }
                if self.ended {
                    return Err(SequenceError::MultipleEnd);
                }
                self.ended = true;
            }
            Frame::Result { .. } | Frame::Error { .. } => {
                if !self.started {
                    return Err(SequenceError::NotStartFirst);
                }
                self.terminal_seen = true;
            }
        }
        Ok(())
    }

    /// Call once no more frames will arrive; confirms a terminal frame was seen.
    pub fn finish(&self) -> Result<(), SequenceError> {
        if !self.terminal_seen {
            return Err(SequenceError::MissingTerminal);
        }
        Ok(())
    }

    /// Validate a complete, already-collected sequence of frames in one call.
    pub fn validate_sequence(frames: &[Frame]) -> Result<(), SequenceError> {
        let mut validator = Self::new();
        for frame in frames {
            validator.observe(frame)?;
        }
        validator.finish()
    }
}
