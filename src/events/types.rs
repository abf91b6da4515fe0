//! Event data model.
//!
//! Defines [`EventCategory`], [`Impact`], the [`StreamKey`] that scopes an
//! append-only stream, the immutable [`Event`] record, the [`NewEvent`] input
//! accepted by `append`, and [`EventFilter`] for backward reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ContinuumError, Result};

/// What kind of significant action an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Fix,
    Feature,
    Decision,
    Insight,
    Git,
    Achievement,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fix => "fix",
            Self::Feature => "feature",
            Self::Decision => "decision",
            Self::Insight => "insight",
            Self::Git => "git",
            Self::Achievement => "achievement",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fix" => Ok(Self::Fix),
            "feature" => Ok(Self::Feature),
            "decision" => Ok(Self::Decision),
            "insight" => Ok(Self::Insight),
            "git" => Ok(Self::Git),
            "achievement" => Ok(Self::Achievement),
            _ => Err(format!("unknown event category: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    High,
    #[default]
    Medium,
    Low,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::str::FromStr for Impact {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown impact level: {s}")),
        }
    }
}

/// Identifies one append-only stream: a user's work on one branch of one project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub user_id: String,
    pub project_id: String,
    pub branch: String,
}

impl StreamKey {
    pub fn new(
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            branch: branch.into(),
        }
    }

    /// Unambiguous key for SQLite rows (components may themselves contain `/`).
    pub fn storage_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.user_id, self.project_id, self.branch
        )
    }

    /// Reject keys with empty components.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("user_id", &self.user_id),
            ("project_id", &self.project_id),
            ("branch", &self.branch),
        ] {
            if value.trim().is_empty() {
                return Err(ContinuumError::InvalidEvent(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.project_id, self.branch)
    }
}

/// An immutable, appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// UUID v7, strictly increasing within a stream.
    pub id: String,
    /// Back-link to the event appended immediately before this one. `None` for the first.
    pub previous_id: Option<String>,
    pub user_id: String,
    pub project_id: String,
    pub branch: String,
    pub timestamp: DateTime<Utc>,
    pub category: EventCategory,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Ids of knowledge nodes this event mentions.
    #[serde(default)]
    pub node_refs: Vec<String>,
}

impl Event {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.user_id, &self.project_id, &self.branch)
    }

    /// Rough token estimate (four characters per token).
    pub fn token_estimate(&self) -> usize {
        let files: usize = self.files.iter().map(|f| f.len() + 1).sum();
        let tags: usize = self.tags.iter().map(|t| t.len() + 1).sum();
        (self.description.len() + files + tags) / 4 + 8
    }
}

/// Input to `append`. Id, timestamp and back-link are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub stream: StreamKey,
    pub category: EventCategory,
    pub description: String,
    pub files: Vec<String>,
    pub impact: Impact,
    pub tags: Vec<String>,
    pub shared: bool,
    pub commit: Option<String>,
    pub node_refs: Vec<String>,
}

impl NewEvent {
    pub fn new(stream: StreamKey, category: EventCategory, description: impl Into<String>) -> Self {
        Self {
            stream,
            category,
            description: description.into(),
            files: Vec::new(),
            impact: Impact::default(),
            tags: Vec::new(),
            shared: false,
            commit: None,
            node_refs: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_impact(mut self, impact: Impact) -> Self {
        self.impact = impact;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_node_refs(mut self, node_refs: Vec<String>) -> Self {
        self.node_refs = node_refs;
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.stream.validate()?;
        if self.description.trim().is_empty() {
            return Err(ContinuumError::InvalidEvent(
                "description must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Optional filters for backward reads. An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub categories: Vec<EventCategory>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if !self.categories.is_empty() && !self.categories.contains(&event.category) {
            return false;
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| event.tags.contains(t)) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips_through_str() {
        for c in [
            EventCategory::Fix,
            EventCategory::Feature,
            EventCategory::Decision,
            EventCategory::Insight,
            EventCategory::Git,
            EventCategory::Achievement,
        ] {
            assert_eq!(c.as_str().parse::<EventCategory>().unwrap(), c);
        }
        assert!("refactor".parse::<EventCategory>().is_err());
    }

    #[test]
    fn new_event_requires_stream_and_description() {
        let ok = NewEvent::new(StreamKey::new("u", "p", "main"), EventCategory::Fix, "fixed it");
        assert!(ok.validate().is_ok());

        let blank = NewEvent::new(StreamKey::new("u", "p", "main"), EventCategory::Fix, "  ");
        assert!(matches!(blank.validate(), Err(ContinuumError::InvalidEvent(_))));

        let no_branch = NewEvent::new(StreamKey::new("u", "p", ""), EventCategory::Fix, "x");
        let err = no_branch.validate().unwrap_err();
        assert!(err.to_string().contains("branch"));
    }

    #[test]
    fn filter_matches_category_and_tags() {
        let event = Event {
            id: "e1".into(),
            previous_id: None,
            user_id: "u".into(),
            project_id: "p".into(),
            branch: "main".into(),
            timestamp: Utc::now(),
            category: EventCategory::Decision,
            description: "use sqlite".into(),
            files: vec![],
            impact: Impact::High,
            tags: vec!["storage".into()],
            shared: false,
            commit: None,
            node_refs: vec![],
        };

        assert!(EventFilter::default().matches(&event));
        let by_cat = EventFilter {
            categories: vec![EventCategory::Fix],
            ..Default::default()
        };
        assert!(!by_cat.matches(&event));
        let by_tag = EventFilter {
            tags: vec!["storage".into()],
            ..Default::default()
        };
        assert!(by_tag.matches(&event));
    }
}
