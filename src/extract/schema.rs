//! Output schemas the LLM is asked to fill, and how its answers are parsed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ExtractError;

pub trait Schema: DeserializeOwned {
    /// Field list with a short description each, shown in the prompt.
    fn field_descriptions() -> &'static str;

    /// Example JSON object shown in the prompt.
    fn output_format() -> &'static str;

    /// Semantic checks serde cannot express.
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDraft {
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub one_liner: String,
    #[serde(default)]
    pub primary_language: String,
    #[serde(default, deserialize_with = "nullable_list")]
    pub key_dependencies: Vec<String>,
    #[serde(default)]
    pub installation_method: Option<String>,
    #[serde(default)]
    pub primary_use_case: String,
    #[serde(default)]
    pub integration_points: String,
    #[serde(default, deserialize_with = "nullable_list")]
    pub capability_tags: Vec<String>,
}

impl Schema for CardDraft {
    fn field_descriptions() -> &'static str {
        "repo_name: the name of the repository (e.g. 'llama_index').
one_liner: a single, compelling sentence summarizing the repository's purpose.
primary_language: the primary programming language (e.g. 'Python', 'TypeScript').
key_dependencies: crucial libraries or frameworks the repository depends on.
installation_method: the typical install command (e.g. 'pip install llama-index'), or null.
primary_use_case: the main problem this repository solves.
integration_points: how a developer would typically integrate this tool into their own project.
capability_tags: 3-5 short tags for the repository's capabilities (e.g. '#RAG', '#embeddings')."
    }

    fn output_format() -> &'static str {
        r##"{ "repo_name": "...", "one_liner": "...", "primary_language": "...", "key_dependencies": ["..."], "installation_method": "...", "primary_use_case": "...", "integration_points": "...", "capability_tags": ["#..."] }"##
    }

    fn validate(&self) -> Result<(), String> {
        if self.one_liner.trim().is_empty() {
            return Err("missing one_liner".into());
        }
        if self.primary_use_case.trim().is_empty() {
            return Err("missing primary_use_case".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactDraft {
    pub integration_cost: String,
    #[serde(default)]
    pub integration_justification: String,
    pub capability_boost: String,
    #[serde(default)]
    pub capability_justification: String,
}

impl Schema for ImpactDraft {
    fn field_descriptions() -> &'static str {
        "integration_cost: a rating (Low, Medium, High) of the effort required to integrate the tool.
integration_justification: a short sentence justifying the integration cost rating.
capability_boost: a rating (Basic, Moderate, Exceptional) of how much the tool will improve the project.
capability_justification: a short sentence justifying the capability boost rating."
    }

    fn output_format() -> &'static str {
        r#"{ "integration_cost": "Low|Medium|High", "integration_justification": "Short justification", "capability_boost": "Basic|Moderate|Exceptional", "capability_justification": "Short justification" }"#
    }

    fn validate(&self) -> Result<(), String> {
        if self.integration_cost.trim().is_empty() || self.capability_boost.trim().is_empty() {
            return Err("missing rating".into());
        }
        Ok(())
    }
}

fn nullable_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse the first JSON object found in a completion into `T`.
///
/// Models often wrap the object in prose or code fences, so anything before
/// the first `{` and after the matching object is ignored.
pub fn parse_response<T: Schema>(text: &str) -> Result<T, ExtractError> {
    let start = text
        .find('{')
        .ok_or_else(|| ExtractError::Malformed("no JSON object in response".into()))?;

    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    let value = match stream.next() {
        Some(Ok(value)) => value,
        Some(Err(err)) => return Err(ExtractError::Malformed(format!("invalid JSON: {err}"))),
        None => return Err(ExtractError::Malformed("empty response".into())),
    };

    let parsed: T = serde_json::from_value(value)
        .map_err(|e| ExtractError::Malformed(format!("response does not match schema: {e}")))?;
    parsed.validate().map_err(ExtractError::Malformed)?;
    Ok(parsed)
}
