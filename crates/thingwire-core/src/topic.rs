use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::acks::AckLabel;
use crate::errors::FrameError;
use crate::ids::ThingId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Group {
    Things,
    Policies,
}

impl Group {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Things => "things",
            Self::Policies => "policies",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Twin,
    Live,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Twin => "twin",
            Self::Live => "live",
        }
    }

    /// The acknowledgement label that stands for the final response on this channel.
    pub fn terminal_label(self) -> AckLabel {
        match self {
            Self::Twin => AckLabel::twin_persisted(),
            Self::Live => AckLabel::live_response(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "twin" => Some(Self::Twin),
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Criterion {
    Commands,
    Events,
    Messages,
    Acks,
    Errors,
    Search,
    Announcements,
}

impl Criterion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Events => "events",
            Self::Messages => "messages",
            Self::Acks => "acks",
            Self::Errors => "errors",
            Self::Search => "search",
            Self::Announcements => "announcements",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "commands" => Self::Commands,
            "events" => Self::Events,
            "messages" => Self::Messages,
            "acks" => Self::Acks,
            "errors" => Self::Errors,
            "search" => Self::Search,
            "announcements" => Self::Announcements,
            _ => return None,
        })
    }
}

/// Command verbs understood by the live dispatcher's global handler table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandAction {
    Create,
    Modify,
    Merge,
    Delete,
    Retrieve,
}

impl CommandAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Merge => "merge",
            Self::Delete => "delete",
            Self::Retrieve => "retrieve",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "create" => Self::Create,
            "modify" => Self::Modify,
            "merge" => Self::Merge,
            "delete" => Self::Delete,
            "retrieve" => Self::Retrieve,
            _ => return None,
        })
    }

    /// Past-tense event action emitted after the command was applied.
    /// Retrieval changes nothing and has no event.
    pub fn event_action(self) -> Option<&'static str> {
        match self {
            Self::Create => Some("created"),
            Self::Modify => Some("modified"),
            Self::Merge => Some("merged"),
            Self::Delete => Some("deleted"),
            Self::Retrieve => None,
        }
    }
}

/// `{namespace}/{name}/{group}/{channel}/{criterion}/{action-or-subject}`.
///
/// Policies carry no channel segment. The trailing segment is an action for
/// commands and events, a free-form subject (which may itself contain `/`) for
/// messages, and a label for acknowledgements.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopicPath {
    namespace: String,
    name: String,
    group: Group,
    channel: Option<Channel>,
    criterion: Criterion,
    action: Option<String>,
}

impl TopicPath {
    pub fn new(
        thing: &ThingId,
        group: Group,
        channel: Option<Channel>,
        criterion: Criterion,
        action: Option<String>,
    ) -> Self {
        Self {
            namespace: thing.namespace().to_owned(),
            name: thing.name().to_owned(),
            group,
            channel,
            criterion,
            action,
        }
    }

    pub fn live_command(thing: &ThingId, action: CommandAction) -> Self {
        Self::new(
            thing,
            Group::Things,
            Some(Channel::Live),
            Criterion::Commands,
            Some(action.as_str().to_owned()),
        )
    }

    pub fn twin_command(thing: &ThingId, action: CommandAction) -> Self {
        Self::new(
            thing,
            Group::Things,
            Some(Channel::Twin),
            Criterion::Commands,
            Some(action.as_str().to_owned()),
        )
    }

    pub fn live_message(thing: &ThingId, subject: impl Into<String>) -> Self {
        Self::new(
            thing,
            Group::Things,
            Some(Channel::Live),
            Criterion::Messages,
            Some(subject.into()),
        )
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thing_id(&self) -> ThingId {
        ThingId::new(self.namespace.clone(), self.name.clone())
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    pub fn criterion(&self) -> Criterion {
        self.criterion
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn command_action(&self) -> Option<CommandAction> {
        match self.criterion {
            Criterion::Commands => self.action().and_then(CommandAction::parse),
            _ => None,
        }
    }

    /// Same entity and channel with a different criterion and trailing segment.
    pub fn with_criterion(&self, criterion: Criterion, action: Option<String>) -> Self {
        Self {
            criterion,
            action,
            ..self.clone()
        }
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.group.as_str())?;
        if let Some(channel) = self.channel {
            write!(f, "/{}", channel.as_str())?;
        }
        write!(f, "/{}", self.criterion.as_str())?;
        if let Some(action) = &self.action {
            write!(f, "/{action}")?;
        }
        Ok(())
    }
}

impl FromStr for TopicPath {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| FrameError::InvalidTopic {
            topic: s.to_owned(),
            reason,
        };

        let mut parts = s.splitn(4, '/');
        let namespace = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| invalid("missing namespace"))?;
        let name = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| invalid("missing entity name"))?;
        let group = match parts.next() {
            Some("things") => Group::Things,
            Some("policies") => Group::Policies,
            _ => return Err(invalid("unknown group")),
        };
        let rest = parts.next().ok_or_else(|| invalid("missing criterion"))?;

        let (channel, rest) = match group {
            Group::Things => {
                let (channel, rest) = rest.split_once('/').ok_or_else(|| invalid("missing criterion"))?;
                (Some(Channel::parse(channel).ok_or_else(|| invalid("unknown channel"))?), rest)
            }
            Group::Policies => (None, rest),
        };

        let (criterion, action) = match rest.split_once('/') {
            Some((criterion, action)) => (criterion, Some(action)),
            None => (rest, None),
        };
        let criterion = Criterion::parse(criterion).ok_or_else(|| invalid("unknown criterion"))?;

        Ok(Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            group,
            channel,
            criterion,
            action: action.filter(|a| !a.is_empty()).map(str::to_owned),
        })
    }
}

impl Serialize for TopicPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TopicPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
