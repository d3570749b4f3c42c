//! Envelope intake from the worker's input channel.
//!
//! The host writes exactly one JSON envelope and then closes the channel, so
//! the whole stream is read to EOF. EOF is not a shutdown signal.

use shared_types::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Envelopes carry prompts and secrets, never files.
pub const MAX_ENVELOPE_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("failed to read envelope: {0}")]
    Io(#[from] std::io::Error),
    #[error("no envelope received")]
    Empty,
    #[error("envelope exceeds {MAX_ENVELOPE_BYTES} bytes")]
    TooLarge,
    #[error("invalid envelope: {0}")]
    Invalid(#[from] serde_json::Error),
}

pub async fn read_envelope<R>(input: R) -> Result<Envelope, IntakeError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    input
        .take(MAX_ENVELOPE_BYTES + 1)
        .read_to_end(&mut raw)
        .await?;

    if raw.len() as u64 > MAX_ENVELOPE_BYTES {
        return Err(IntakeError::TooLarge);
    }
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(IntakeError::Empty);
    }
    Ok(serde_json::from_slice(&raw)?)
}
