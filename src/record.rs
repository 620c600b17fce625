//! Structured records produced by enrichment.
//!
//! A record is either a complete briefing card or a degraded placeholder
//! produced when extraction failed. Both are indexed and stored the same way;
//! consumers that care can branch on [`Record::is_degraded`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{fingerprint, Fingerprint};

/// Value used for every descriptive field of a degraded record.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BriefingCard {
    pub repo_name: String,
    pub url: String,
    pub one_liner: String,
    pub primary_language: String,
    #[serde(default)]
    pub key_dependencies: Vec<String>,
    #[serde(default)]
    pub installation_method: Option<String>,
    pub primary_use_case: String,
    pub integration_points: String,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub enriched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedRecord {
    pub repo_name: String,
    pub url: String,
    pub one_liner: String,
    pub primary_language: String,
    #[serde(default)]
    pub key_dependencies: Vec<String>,
    #[serde(default)]
    pub installation_method: Option<String>,
    pub primary_use_case: String,
    pub integration_points: String,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    /// Why extraction did not produce a full card
    pub justification: String,
    pub enriched_at: DateTime<Utc>,
}

impl DegradedRecord {
    pub fn new(identity: &str, justification: impl Into<String>) -> Self {
        Self {
            repo_name: repo_name_from_identity(identity),
            url: identity.to_string(),
            one_liner: UNKNOWN.to_string(),
            primary_language: UNKNOWN.to_string(),
            key_dependencies: Vec::new(),
            installation_method: None,
            primary_use_case: UNKNOWN.to_string(),
            integration_points: UNKNOWN.to_string(),
            capability_tags: Vec::new(),
            justification: justification.into(),
            enriched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Record {
    Complete(BriefingCard),
    Degraded(DegradedRecord),
}

/// Small per-entry payload kept next to the embedding and returned with
/// search hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub repo_name: String,
    pub url: String,
    #[serde(default)]
    pub degraded: bool,
}

/// Anything the index can store.
pub trait Searchable {
    fn identity(&self) -> &str;

    fn canonical_text(&self) -> String;

    fn entry_metadata(&self) -> EntryMetadata;

    fn is_degraded(&self) -> bool;

    fn fingerprint(&self) -> Fingerprint {
        fingerprint(self.identity())
    }
}

impl Record {
    pub fn degraded(identity: &str, justification: impl Into<String>) -> Self {
        Self::Degraded(DegradedRecord::new(identity, justification))
    }

    pub fn repo_name(&self) -> &str {
        match self {
            Self::Complete(card) => &card.repo_name,
            Self::Degraded(rec) => &rec.repo_name,
        }
    }

    pub fn one_liner(&self) -> &str {
        match self {
            Self::Complete(card) => &card.one_liner,
            Self::Degraded(rec) => &rec.one_liner,
        }
    }

    pub fn primary_use_case(&self) -> &str {
        match self {
            Self::Complete(card) => &card.primary_use_case,
            Self::Degraded(rec) => &rec.primary_use_case,
        }
    }

    pub fn key_dependencies(&self) -> &[String] {
        match self {
            Self::Complete(card) => &card.key_dependencies,
            Self::Degraded(rec) => &rec.key_dependencies,
        }
    }

    pub fn capability_tags(&self) -> &[String] {
        match self {
            Self::Complete(card) => &card.capability_tags,
            Self::Degraded(rec) => &rec.capability_tags,
        }
    }

    pub fn enriched_at(&self) -> DateTime<Utc> {
        match self {
            Self::Complete(card) => card.enriched_at,
            Self::Degraded(rec) => rec.enriched_at,
        }
    }

    pub fn set_enriched_at(&mut self, at: DateTime<Utc>) {
        match self {
            Self::Complete(card) => card.enriched_at = at,
            Self::Degraded(rec) => rec.enriched_at = at,
        }
    }

    pub fn justification(&self) -> Option<&str> {
        match self {
            Self::Complete(_) => None,
            Self::Degraded(rec) => Some(&rec.justification),
        }
    }

    /// Condensed description handed to the LLM for impact analysis.
    pub fn briefing_summary(&self) -> String {
        format!(
            "Repo Name: {}\nOne-Liner: {}\nPrimary Use Case: {}\nKey Dependencies: {}\nCapability Tags: {}",
            self.repo_name(),
            self.one_liner(),
            self.primary_use_case(),
            self.key_dependencies().join(", "),
            self.capability_tags().join(", ")
        )
    }
}

impl Searchable for Record {
    fn identity(&self) -> &str {
        match self {
            Self::Complete(card) => &card.url,
            Self::Degraded(rec) => &rec.url,
        }
    }

    fn canonical_text(&self) -> String {
        format!(
            "Repo: {}\nUse Case: {}\nOne Liner: {}\nTags: {}",
            self.repo_name(),
            self.primary_use_case(),
            self.one_liner(),
            self.capability_tags().join(", ")
        )
    }

    fn entry_metadata(&self) -> EntryMetadata {
        EntryMetadata {
            repo_name: self.repo_name().to_string(),
            url: self.identity().to_string(),
            degraded: self.is_degraded(),
        }
    }

    fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

/// Last non-empty path segment of the identity.
pub fn repo_name_from_identity(identity: &str) -> String {
    identity
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(identity)
        .trim_end_matches(".git")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> BriefingCard {
        BriefingCard {
            repo_name: "ripgrep".into(),
            url: "https://github.com/BurntSushi/ripgrep".into(),
            one_liner: "Fast recursive grep.".into(),
            primary_language: "Rust".into(),
            key_dependencies: vec!["regex".into()],
            installation_method: Some("cargo install ripgrep".into()),
            primary_use_case: "Searching code".into(),
            integration_points: "CLI".into(),
            capability_tags: vec!["#search".into(), "#cli".into()],
            enriched_at: Utc::now(),
        }
    }

    #[test]
    fn test_canonical_text() {
        let record = Record::Complete(card());
        assert_eq!(
            record.canonical_text(),
            "Repo: ripgrep\nUse Case: Searching code\nOne Liner: Fast recursive grep.\nTags: #search, #cli"
        );
    }

    #[test]
    fn test_status_tag_in_json() {
        let complete = serde_json::to_value(Record::Complete(card())).unwrap();
        assert_eq!(complete["status"], "complete");

        let degraded = serde_json::to_value(Record::degraded("https://github.com/a/b", "timeout")).unwrap();
        assert_eq!(degraded["status"], "degraded");
        assert_eq!(degraded["justification"], "timeout");
        assert_eq!(degraded["one_liner"], UNKNOWN);
    }

    #[test]
    fn test_degraded_record_fields() {
        let record = Record::degraded("https://github.com/owner/tool/", "LLM analysis failed: timeout");
        assert!(record.is_degraded());
        assert_eq!(record.repo_name(), "tool");
        assert_eq!(record.identity(), "https://github.com/owner/tool/");
        assert_eq!(record.justification(), Some("LLM analysis failed: timeout"));
        assert_eq!(record.canonical_text(), "Repo: tool\nUse Case: unknown\nOne Liner: unknown\nTags: ");
    }

    #[test]
    fn test_fingerprint_follows_identity() {
        let record = Record::Complete(card());
        assert_eq!(record.fingerprint(), fingerprint("https://github.com/BurntSushi/ripgrep"));
        assert_eq!(record.entry_metadata().repo_name, "ripgrep");
        assert!(!record.entry_metadata().degraded);
    }

    #[test]
    fn test_repo_name_from_identity() {
        assert_eq!(repo_name_from_identity("https://github.com/a/b"), "b");
        assert_eq!(repo_name_from_identity("https://github.com/a/b.git"), "b");
        assert_eq!(repo_name_from_identity("plain"), "plain");
    }
}
