use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicKind {
    Task,
    Workspace,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Task => "task",
            TopicKind::Workspace => "workspace",
        }
    }
}

/// A subscription target: one task or one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    #[serde(rename = "topicType")]
    pub kind: TopicKind,
    #[serde(rename = "topicId", deserialize_with = "crate::ids::id")]
    pub id: String,
}

impl Topic {
    pub fn new(kind: TopicKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(TopicKind::Task, id)
    }

    pub fn workspace(id: impl Into<String>) -> Self {
        Self::new(TopicKind::Workspace, id)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for Topic {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ProtoError::InvalidTopic(s.to_string()))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(ProtoError::InvalidTopic(s.to_string()));
        }
        let kind = match kind.trim() {
            "task" => TopicKind::Task,
            "workspace" => TopicKind::Workspace,
            _ => return Err(ProtoError::InvalidTopic(s.to_string())),
        };
        Ok(Topic::new(kind, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_display_form() {
        let topic: Topic = "task:42".parse().expect("parse");
        assert_eq!(topic, Topic::task("42"));
        assert_eq!(topic.to_string(), "task:42");

        let ws: Topic = "workspace: 9".parse().expect("parse");
        assert_eq!(ws, Topic::workspace("9"));
    }

    #[test]
    fn rejects_unknown_kind_and_empty_id() {
        assert!("project:1".parse::<Topic>().is_err());
        assert!("task:".parse::<Topic>().is_err());
        assert!("task".parse::<Topic>().is_err());
    }

    #[test]
    fn wire_shape_uses_topic_fields() {
        let value = serde_json::to_value(Topic::workspace("9")).unwrap();
        assert_eq!(value["topicType"], "workspace");
        assert_eq!(value["topicId"], "9");
    }
}
