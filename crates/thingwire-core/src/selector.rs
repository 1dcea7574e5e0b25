//! Structural address matching for subscriptions.
//!
//! Inbound signals are addressed as `/{group}/{namespace}:{name}{path}`, for
//! example `/things/org.acme:lamp/features/light/properties/on`. A selector is a
//! set of precompiled segment patterns; a frame matches when any pattern does.

use std::fmt;

use crate::ids::ThingId;
use crate::topic::TopicPath;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    segments: Vec<String>,
}

impl Address {
    pub fn of(topic: &TopicPath, path: &str) -> Self {
        let mut segments = vec![
            topic.group().as_str().to_owned(),
            format!("{}:{}", topic.namespace(), topic.name()),
        ];
        segments.extend(split_segments(path).map(str::to_owned));
        Self { segments }
    }

    pub fn parse(raw: &str) -> Self {
        Self {
            segments: split_segments(raw).map(str::to_owned).collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

fn split_segments(raw: &str) -> impl Iterator<Item = &str> {
    raw.split('/').filter(|s| !s.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    /// Exactly one segment.
    Any,
    /// One or more trailing segments.
    AnyRest,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Pattern(Vec<Segment>);

impl Pattern {
    /// Compile `/things/*/features/*/**`-style templates. `*` matches one
    /// segment; `**` matches the remainder and is only honoured in last place.
    pub fn compile(template: &str) -> Self {
        let raw: Vec<&str> = split_segments(template).collect();
        let last = raw.len().saturating_sub(1);
        let segments = raw
            .iter()
            .enumerate()
            .map(|(i, s)| match *s {
                "*" => Segment::Any,
                "**" if i == last => Segment::AnyRest,
                "**" => Segment::Any,
                literal => Segment::Literal(literal.to_owned()),
            })
            .collect();
        Self(segments)
    }

    fn from_segments(segments: Vec<Segment>) -> Self {
        Self(segments)
    }

    pub fn matches(&self, address: &Address) -> bool {
        let segments = address.segments();
        for (i, pattern) in self.0.iter().enumerate() {
            match pattern {
                Segment::AnyRest => return segments.len() > i,
                Segment::Any => {
                    if i >= segments.len() {
                        return false;
                    }
                }
                Segment::Literal(literal) => {
                    if segments.get(i) != Some(literal) {
                        return false;
                    }
                }
            }
        }
        self.0.len() == segments.len()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            match segment {
                Segment::Literal(s) => write!(f, "/{s}")?,
                Segment::Any => f.write_str("/*")?,
                Segment::AnyRest => f.write_str("/**")?,
            }
        }
        Ok(())
    }
}

/// OR-combination of patterns.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Selector {
    patterns: Vec<Pattern>,
}

impl Selector {
    pub fn compile(template: &str) -> Self {
        Self {
            patterns: vec![Pattern::compile(template)],
        }
    }

    pub fn or(mut self, other: Selector) -> Self {
        self.patterns.extend(other.patterns);
        self
    }

    pub fn matches(&self, address: &Address) -> bool {
        self.patterns.iter().any(|p| p.matches(address))
    }

    /// Messages sent to or from any thing, with the given subject or any subject.
    pub fn thing_messages(subject: Option<&str>) -> Self {
        Self::messages(vec![thing_segment(None)], subject)
    }

    /// Messages sent to or from any feature of any thing.
    pub fn feature_messages(subject: Option<&str>) -> Self {
        Self::messages(
            vec![thing_segment(None), Segment::Literal("features".into()), Segment::Any],
            subject,
        )
    }

    /// Thing or feature messages with the given subject.
    pub fn message_subject(subject: Option<&str>) -> Self {
        Self::thing_messages(subject).or(Self::feature_messages(subject))
    }

    /// Any change of one thing, or of every thing when `thing` is `None`.
    pub fn thing_changes(thing: Option<&ThingId>) -> Self {
        Self::exact_or_below(vec![thing_segment(thing)])
    }

    /// Any change of one feature, or of every feature when `feature` is `None`.
    pub fn feature_changes(thing: Option<&ThingId>, feature: Option<&str>) -> Self {
        let feature = match feature {
            Some(id) => Segment::Literal(id.to_owned()),
            None => Segment::Any,
        };
        Self::exact_or_below(vec![thing_segment(thing), Segment::Literal("features".into()), feature])
    }

    fn messages(prefix: Vec<Segment>, subject: Option<&str>) -> Self {
        let mut segments = vec![Segment::Literal("things".into())];
        segments.extend(prefix);
        // inbox or outbox
        segments.push(Segment::Any);
        segments.push(Segment::Literal("messages".into()));
        match subject {
            Some(subject) => segments.extend(split_segments(subject).map(|s| Segment::Literal(s.to_owned()))),
            None => segments.push(Segment::AnyRest),
        }
        Self {
            patterns: vec![Pattern::from_segments(segments)],
        }
    }

    fn exact_or_below(prefix: Vec<Segment>) -> Self {
        let mut exact = vec![Segment::Literal("things".into())];
        exact.extend(prefix);
        let mut below = exact.clone();
        below.push(Segment::AnyRest);
        Self {
            patterns: vec![Pattern::from_segments(exact), Pattern::from_segments(below)],
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pattern) in self.patterns.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{pattern}")?;
        }
        Ok(())
    }
}

fn thing_segment(thing: Option<&ThingId>) -> Segment {
    match thing {
        Some(id) => Segment::Literal(id.to_string()),
        None => Segment::Any,
    }
}
