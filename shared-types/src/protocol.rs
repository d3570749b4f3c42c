//! Result frame encoding and line-oriented parsing.
//!
//! A frame on the worker's stdout is exactly three lines:
//!
//! ```text
//! ---SANDBOX_OUTPUT_START---
//! {"status":"success","result":"hello","newSessionId":"s1"}
//! ---SANDBOX_OUTPUT_END---
//! ```
//!
//! Any line outside a marker pair is diagnostic output.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::ResultFrame;

pub const OUTPUT_START_MARKER: &str = "---SANDBOX_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---SANDBOX_OUTPUT_END---";

/// Upper bound on the payload accumulated between markers.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed result frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("result frame exceeded {0} bytes")]
    TooLarge(usize),
    #[error("result frame was never terminated")]
    Unterminated,
}

/// Serialize a frame, markers included, as a newline-terminated block.
pub fn encode_frame(frame: &ResultFrame) -> Result<String, FrameError> {
    let payload = serde_json::to_string(frame)?;
    Ok(format!(
        "{OUTPUT_START_MARKER}\n{payload}\n{OUTPUT_END_MARKER}\n"
    ))
}

/// Write one frame and flush, so the host sees it before the next round starts.
pub async fn write_frame<W>(out: &mut W, frame: &ResultFrame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let block = encode_frame(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    out.write_all(block.as_bytes()).await?;
    out.flush().await
}

/// Outcome of feeding one output line to a [`FrameParser`].
#[derive(Debug)]
pub enum ParsedLine {
    /// Line outside any marker pair.
    Diagnostic(String),
    /// Line consumed into the frame currently being assembled.
    Pending,
    Frame(ResultFrame),
    /// Marker pair seen but the payload could not be used.
    Malformed { error: FrameError, raw: String },
}

#[derive(Debug, Default)]
pub struct FrameParser {
    in_frame: bool,
    buf: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn push_line(&mut self, line: &str) -> ParsedLine {
        let trimmed = line.trim();

        if !self.in_frame {
            if trimmed == OUTPUT_START_MARKER {
                self.in_frame = true;
                self.buf.clear();
                return ParsedLine::Pending;
            }
            return ParsedLine::Diagnostic(line.to_string());
        }

        if trimmed == OUTPUT_END_MARKER {
            self.in_frame = false;
            let raw = std::mem::take(&mut self.buf);
            return match serde_json::from_str::<ResultFrame>(raw.trim()) {
                Ok(frame) => ParsedLine::Frame(frame),
                Err(e) => ParsedLine::Malformed {
                    error: FrameError::Malformed(e),
                    raw,
                },
            };
        }

        if trimmed == OUTPUT_START_MARKER {
            // Previous frame lost its end marker; start over from this one.
            let raw = std::mem::take(&mut self.buf);
            return ParsedLine::Malformed {
                error: FrameError::Unterminated,
                raw,
            };
        }

        if self.buf.len() + line.len() > MAX_FRAME_BYTES {
            self.in_frame = false;
            let raw = std::mem::take(&mut self.buf);
            return ParsedLine::Malformed {
                error: FrameError::TooLarge(MAX_FRAME_BYTES),
                raw,
            };
        }

        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        self.buf.push_str(line);
        ParsedLine::Pending
    }

    /// Call at end of stream. Returns the partial frame, if any, as malformed.
    pub fn finish(&mut self) -> Option<ParsedLine> {
        if !self.in_frame {
            return None;
        }
        self.in_frame = false;
        Some(ParsedLine::Malformed {
            error: FrameError::Unterminated,
            raw: std::mem::take(&mut self.buf),
        })
    }
}
