use std::fmt;
use std::str::FromStr;

use url::form_urlencoded;

use crate::errors::FrameError;

const ACK_SUFFIX: &str = ":ACK";

/// Plain-text protocol command such as `START-SEND-EVENTS?namespaces=org.acme`
/// or its acknowledgement `START-SEND-EVENTS:ACK`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ControlFrame {
    command: String,
    ack: bool,
    params: Vec<(String, String)>,
}

impl ControlFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ack: false,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn without_param(mut self, key: &str) -> Self {
        self.params.retain(|(k, _)| k != key);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The acknowledgement the peer sends back for this command.
    pub fn acknowledgement(&self) -> Self {
        Self {
            command: self.command.clone(),
            ack: true,
            params: Vec::new(),
        }
    }
}

impl fmt::Display for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        if self.ack {
            f.write_str(ACK_SUFFIX)?;
        }
        if !self.params.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter())
                .finish();
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

impl FromStr for ControlFrame {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (head, query) = match s.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (s, None),
        };
        let (command, ack) = match head.strip_suffix(ACK_SUFFIX) {
            Some(command) => (command, true),
            None => (head, false),
        };
        if command.is_empty() {
            return Err(FrameError::EmptyControlFrame);
        }
        let params = query
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Ok(Self {
            command: command.to_owned(),
            ack,
            params,
        })
    }
}

/// Server-side streams a client opts into with `START-SEND-*`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    TwinEvents,
    LiveEvents,
    LiveMessages,
    LiveCommands,
    PolicyAnnouncements,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        Self::TwinEvents,
        Self::LiveEvents,
        Self::LiveMessages,
        Self::LiveCommands,
        Self::PolicyAnnouncements,
    ];

    fn literal(self) -> &'static str {
        match self {
            Self::TwinEvents => "EVENTS",
            Self::LiveEvents => "LIVE-EVENTS",
            Self::LiveMessages => "MESSAGES",
            Self::LiveCommands => "LIVE-COMMANDS",
            Self::PolicyAnnouncements => "POLICY-ANNOUNCEMENTS",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TwinEvents => "twin-events",
            Self::LiveEvents => "live-events",
            Self::LiveMessages => "live-messages",
            Self::LiveCommands => "live-commands",
            Self::PolicyAnnouncements => "policy-announcements",
        }
    }

    pub fn start(self) -> ControlFrame {
        ControlFrame::new(format!("START-SEND-{}", self.literal()))
    }

    pub fn stop(self) -> ControlFrame {
        ControlFrame::new(format!("STOP-SEND-{}", self.literal()))
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
