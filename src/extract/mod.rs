//! LLM-backed extraction of structured records.
//!
//! Extraction never fails outward: when the model keeps timing out or
//! answers with something unusable, a degraded record carrying the reason is
//! returned instead.

pub mod prompts;
pub mod schema;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::CacheStore;
use crate::fetch::github::truncate_chars;
use crate::llm::{Completer, CompletionError};
use crate::record::{repo_name_from_identity, BriefingCard, Record};
use crate::retry::BackoffPolicy;

use schema::{parse_response, CardDraft, ImpactDraft, Schema};

const CARD_PURPOSE: &str = "briefing_card";
const IMPACT_PURPOSE: &str = "impact_analysis";

/// Project structure is cut to this many characters before prompting.
pub const MAX_STRUCTURE_CHARS: usize = 1000;

/// Rating used when impact analysis could not run.
pub const UNKNOWN_RATING: &str = "Unknown";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("{0}")]
    Completion(#[from] CompletionError),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ExtractError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Completion(err) => err.is_transient(),
            Self::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    pub repo_name: String,
    pub url: String,
    pub integration_cost: String,
    pub integration_justification: String,
    pub capability_boost: String,
    pub capability_justification: String,
}

impl ImpactAnalysis {
    fn fallback(repo_name: String, url: &str, reason: &str) -> Self {
        let justification = format!("LLM analysis failed: {reason}");
        Self {
            repo_name,
            url: url.to_string(),
            integration_cost: UNKNOWN_RATING.to_string(),
            integration_justification: justification.clone(),
            capability_boost: UNKNOWN_RATING.to_string(),
            capability_justification: justification,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.integration_cost == UNKNOWN_RATING && self.capability_boost == UNKNOWN_RATING
    }
}

pub struct Extractor {
    completer: Arc<dyn Completer>,
    cache: Arc<CacheStore>,
    policy: BackoffPolicy,
}

impl Extractor {
    pub fn new(completer: Arc<dyn Completer>, cache: Arc<CacheStore>, policy: BackoffPolicy) -> Self {
        Self {
            completer,
            cache,
            policy,
        }
    }

    /// Turn the raw context of `identity` into a record.
    pub fn extract(&self, identity: &str, raw_text: &str) -> Record {
        let payload = json!({ "identity": identity, "context": raw_text });

        if let Some(draft) = self.cache.get_as::<_, CardDraft>(&payload, CARD_PURPOSE) {
            log::debug!("identity={identity} briefing card served from cache");
            return Record::Complete(finish_card(identity, draft));
        }

        let prompt = prompts::briefing_card::<CardDraft>(raw_text);
        match self.complete_schema::<CardDraft>(identity, &prompt) {
            Ok(draft) => {
                self.cache.set_as(&payload, CARD_PURPOSE, &draft);
                Record::Complete(finish_card(identity, draft))
            }
            Err(err) => {
                log::warn!("identity={identity} outcome=degraded err={err}");
                Record::degraded(identity, format!("LLM analysis failed: {err}"))
            }
        }
    }

    /// Rate how well the enriched repository fits a project goal.
    pub fn impact(&self, identity: &str, goal: &str, project_structure: &Value, record: &Record) -> ImpactAnalysis {
        let payload = json!({
            "goal": goal,
            "project_structure": project_structure,
            "repo_url": identity,
        });
        if let Some(cached) = self.cache.get_as::<_, ImpactAnalysis>(&payload, IMPACT_PURPOSE) {
            return cached;
        }

        let structure = serde_json::to_string_pretty(project_structure).unwrap_or_default();
        let structure = truncate_chars(&structure, MAX_STRUCTURE_CHARS);
        let prompt = prompts::impact_analysis::<ImpactDraft>(goal, &structure, &record.briefing_summary());

        let analysis = match self.complete_schema::<ImpactDraft>(identity, &prompt) {
            Ok(draft) => ImpactAnalysis {
                repo_name: record.repo_name().to_string(),
                url: identity.to_string(),
                integration_cost: draft.integration_cost,
                integration_justification: draft.integration_justification,
                capability_boost: draft.capability_boost,
                capability_justification: draft.capability_justification,
            },
            Err(err) => {
                log::warn!("identity={identity} impact analysis falling back: {err}");
                ImpactAnalysis::fallback(record.repo_name().to_string(), identity, &err.to_string())
            }
        };

        self.cache.set_as(&payload, IMPACT_PURPOSE, &analysis);
        analysis
    }

    fn complete_schema<T: Schema>(&self, identity: &str, prompt: &str) -> Result<T, ExtractError> {
        self.policy.run(
            identity,
            |_attempt| {
                let text = self.completer.complete_json(prompt)?;
                parse_response::<T>(&text)
            },
            ExtractError::is_transient,
        )
    }
}

fn finish_card(identity: &str, draft: CardDraft) -> BriefingCard {
    let repo_name = if draft.repo_name.trim().is_empty() {
        repo_name_from_identity(identity)
    } else {
        draft.repo_name
    };

    BriefingCard {
        repo_name,
        url: identity.to_string(),
        one_liner: draft.one_liner,
        primary_language: draft.primary_language,
        key_dependencies: draft.key_dependencies,
        installation_method: draft.installation_method,
        primary_use_case: draft.primary_use_case,
        integration_points: draft.integration_points,
        capability_tags: draft.capability_tags,
        enriched_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Searchable;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Scripted {
        replies: Mutex<Vec<Result<String, CompletionError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Completer for Scripted {
        fn complete(&self, _prompt: &str) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies[0].clone()
            }
        }

        fn model_name(&self) -> String {
            "scripted".into()
        }
    }

    const CARD: &str = r##"{"repo_name": "axum", "one_liner": "Web framework.", "primary_language": "Rust",
        "primary_use_case": "HTTP services", "integration_points": "Router", "capability_tags": ["#web"]}"##;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            attempts: 3,
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    fn extractor(completer: Arc<Scripted>, cache: Arc<CacheStore>) -> Extractor {
        Extractor::new(completer, cache, policy())
    }

    #[test]
    fn test_extract_complete_card() {
        let completer = Scripted::new(vec![Ok(CARD.into())]);
        let ex = extractor(completer, Arc::new(CacheStore::disabled()));

        let record = ex.extract("https://github.com/tokio-rs/axum", "ctx");
        match record {
            Record::Complete(card) => {
                assert_eq!(card.url, "https://github.com/tokio-rs/axum");
                assert_eq!(card.repo_name, "axum");
            }
            other => panic!("expected complete card, got {other:?}"),
        }
    }

    #[test]
    fn test_transient_then_success() {
        let completer = Scripted::new(vec![Err(CompletionError::Timeout), Ok(CARD.into())]);
        let ex = extractor(completer.clone(), Arc::new(CacheStore::disabled()));

        assert!(!ex.extract("https://github.com/a/b", "ctx").is_degraded());
        assert_eq!(completer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exhausted_retries_degrade() {
        let completer = Scripted::new(vec![Err(CompletionError::Timeout)]);
        let ex = extractor(completer.clone(), Arc::new(CacheStore::disabled()));

        let record = ex.extract("https://github.com/a/b", "ctx");
        assert!(record.is_degraded());
        assert!(record.justification().unwrap().starts_with("LLM analysis failed"));
        assert_eq!(completer.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_malformed_degrades_without_retry() {
        let completer = Scripted::new(vec![Ok("I cannot help with that".into())]);
        let ex = extractor(completer.clone(), Arc::new(CacheStore::disabled()));

        assert!(ex.extract("https://github.com/a/b", "ctx").is_degraded());
        assert_eq!(completer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cards_cached_degraded_not() {
        let cache = Arc::new(CacheStore::in_memory(Duration::from_secs(60)));

        let failing = Scripted::new(vec![Ok("garbage".into())]);
        assert!(extractor(failing, cache.clone()).extract("https://github.com/a/b", "ctx").is_degraded());

        let working = Scripted::new(vec![Ok(CARD.into())]);
        let ex = extractor(working.clone(), cache);
        assert!(!ex.extract("https://github.com/a/b", "ctx").is_degraded());
        assert!(!ex.extract("https://github.com/a/b", "ctx").is_degraded());
        assert_eq!(working.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_impact_success_and_fallback() {
        let record = Record::degraded("https://github.com/a/b", "x");
        let structure = json!({"src": ["main.rs"]});

        let ok = Scripted::new(vec![Ok(
            r#"{"integration_cost": "Low", "integration_justification": "tiny", "capability_boost": "Moderate", "capability_justification": "useful"}"#.into(),
        )]);
        let analysis = extractor(ok, Arc::new(CacheStore::disabled())).impact("https://github.com/a/b", "goal", &structure, &record);
        assert_eq!(analysis.integration_cost, "Low");
        assert_eq!(analysis.repo_name, "b");
        assert!(!analysis.is_fallback());

        let down = Scripted::new(vec![Err(CompletionError::Connection("refused".into()))]);
        let analysis = extractor(down, Arc::new(CacheStore::disabled())).impact("https://github.com/a/b", "goal", &structure, &record);
        assert!(analysis.is_fallback());
        assert!(analysis.capability_justification.starts_with("LLM analysis failed: "));
    }
}
