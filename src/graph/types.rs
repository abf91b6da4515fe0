use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ContinuumError, Result};

/// Kind-specific payload of a knowledge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Decision {
        #[serde(default)]
        rationale: String,
        #[serde(default)]
        alternatives: Vec<String>,
    },
    Requirement {
        #[serde(default)]
        acceptance_criteria: Vec<String>,
    },
    Pattern {
        #[serde(default)]
        applies_to: Vec<String>,
    },
    Gotcha {
        #[serde(default)]
        workaround: Option<String>,
    },
    Component {
        #[serde(default)]
        paths: Vec<String>,
    },
    Note,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Decision { .. } => "decision",
            Self::Requirement { .. } => "requirement",
            Self::Pattern { .. } => "pattern",
            Self::Gotcha { .. } => "gotcha",
            Self::Component { .. } => "component",
            Self::Note => "note",
        }
    }
}

/// A typed entity in the graph store (decision, requirement, pattern, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: String,
    pub title: String,
    pub content: String,
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl KnowledgeNode {
    pub fn new(kind: NodeKind, title: impl Into<String>, content: impl Into<String>) -> Self {
        let title = title.into();
        let content = content.into();
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            content_hash: content_hash(&title, &content),
            title,
            content,
            status: "active".into(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            kind,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Text the similarity scorer sees.
    pub fn similarity_text(&self) -> String {
        format!("{}\n{}", self.title, self.content)
    }

    pub fn token_estimate(&self) -> usize {
        (self.title.len() + self.content.len()) / 4 + 8
    }
}

/// SHA-256 over the normalized title and content.
pub fn content_hash(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.trim().to_lowercase().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Relationship type names reserved for machine-created edges.
pub const SIMILAR_TO: &str = "SIMILAR_TO";
pub const MENTIONS: &str = "MENTIONS";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum RelationType {
    /// Automated similarity edge; `context` carries the band.
    SimilarTo,
    /// Event → node mention, written during replication.
    Mentions,
    /// Any explicit, caller-named relationship (`IMPLEMENTS`, `DEPENDS_ON`, ...).
    Typed(String),
}

impl RelationType {
    /// Parse a caller-supplied type name into a typed relationship.
    ///
    /// Names are normalized to `UPPER_SNAKE_CASE`. Reserved names are rejected.
    pub fn typed(name: &str) -> Result<Self> {
        let normalized = normalize_type_name(name);
        if normalized.is_empty() {
            return Err(ContinuumError::InvalidRelationship(
                "relationship type must not be empty".into(),
            ));
        }
        if normalized == SIMILAR_TO || normalized == MENTIONS {
            return Err(ContinuumError::InvalidRelationship(format!(
                "{normalized} is reserved for automated edges"
            )));
        }
        Ok(Self::Typed(normalized))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::SimilarTo => SIMILAR_TO,
            Self::Mentions => MENTIONS,
            Self::Typed(name) => name,
        }
    }

    pub fn is_similarity(&self) -> bool {
        matches!(self, Self::SimilarTo)
    }

    pub fn is_typed(&self) -> bool {
        matches!(self, Self::Typed(_))
    }
}

impl From<String> for RelationType {
    fn from(s: String) -> Self {
        match s.as_str() {
            SIMILAR_TO => Self::SimilarTo,
            MENTIONS => Self::Mentions,
            _ => Self::Typed(s),
        }
    }
}

impl From<RelationType> for String {
    fn from(t: RelationType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_type_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_lower = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            out.extend(c.to_uppercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

/// Who created a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Creator {
    Ai,
    #[default]
    Human,
    Automated,
}

impl Creator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Human => "human",
            Self::Automated => "automated",
        }
    }
}

impl std::str::FromStr for Creator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ai" => Ok(Self::Ai),
            "human" => Ok(Self::Human),
            "automated" => Ok(Self::Automated),
            _ => Err(format!("unknown creator: {s}")),
        }
    }
}

/// A directed edge between two graph entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub rel_type: RelationType,
    pub source_id: String,
    pub target_id: String,
    pub context: String,
    pub creator: Creator,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        rel_type: RelationType,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        context: impl Into<String>,
        creator: Creator,
        confidence: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            rel_type,
            source_id: source_id.into(),
            target_id: target_id.into(),
            context: context.into(),
            creator,
            confidence,
            created_at: Utc::now(),
        }
    }
}

/// Strength band of an automated similarity edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityBand {
    NearDuplicate,
    HighlyRelated,
    Related,
}

impl SimilarityBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NearDuplicate => "near_duplicate",
            Self::HighlyRelated => "highly_related",
            Self::Related => "related",
        }
    }
}

/// A candidate node id with its similarity to a query node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredNode {
    pub id: String,
    pub score: f64,
}

/// Whether an upsert wrote a new row or found one already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Existing,
}
