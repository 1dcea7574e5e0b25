use std::collections::BTreeMap;

use parking_lot::Mutex;
use thingwire_core::{ConnectionError, ControlFrame, Envelope, Frame};
use thingwire_transport::FrameSink;

/// Sink that keeps everything sent through it.
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<String>>,
    replay: Mutex<BTreeMap<String, String>>,
    closed: Mutex<bool>,
}

impl RecordingSink {
    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.envelopes()
            .into_iter()
            .filter_map(|envelope| match envelope {
                Envelope::Signal(frame) => Some(frame),
                Envelope::Control(_) => None,
            })
            .collect()
    }

    pub(crate) fn controls(&self) -> Vec<ControlFrame> {
        self.envelopes()
            .into_iter()
            .filter_map(|envelope| match envelope {
                Envelope::Control(control) => Some(control),
                Envelope::Signal(_) => None,
            })
            .collect()
    }

    pub(crate) fn replay(&self) -> BTreeMap<String, String> {
        self.replay.lock().clone()
    }

    pub(crate) fn close(&self) {
        *self.closed.lock() = true;
    }

    fn envelopes(&self) -> Vec<Envelope> {
        self.sent().iter().filter_map(|text| Envelope::parse(text).ok()).collect()
    }
}

impl FrameSink for RecordingSink {
    fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        if *self.closed.lock() {
            return Err(ConnectionError::Closed);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn retain_for_replay(&self, key: &str, text: String) {
        let _ = self.replay.lock().insert(key.to_owned(), text);
    }

    fn release_replay(&self, key: &str) {
        let _ = self.replay.lock().remove(key);
    }
}
