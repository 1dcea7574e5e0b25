use thingwire_core::{ConnectionError, Envelope, FrameError};

use crate::connection::Connection;

/// Outbound seam between the correlation layer and a concrete transport.
pub trait FrameSink: Send + Sync {
    fn send_text(&self, text: String) -> Result<(), ConnectionError>;

    /// Keep `text` to be re-sent after every reconnect, replacing any frame
    /// already kept under `key`.
    fn retain_for_replay(&self, _key: &str, _text: String) {}

    fn release_replay(&self, _key: &str) {}
}

/// Failure to put an envelope on the wire.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] FrameError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Serialize and send one envelope.
pub fn send_envelope(sink: &dyn FrameSink, envelope: &Envelope) -> Result<(), SendError> {
    let text = envelope.to_text()?;
    sink.send_text(text)?;
    Ok(())
}

impl FrameSink for Connection {
    fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.send(text)
    }

    fn retain_for_replay(&self, key: &str, text: String) {
        self.register_replay(key, text);
    }

    fn release_replay(&self, key: &str) {
        self.unregister_replay(key);
    }
}
