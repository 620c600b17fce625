use super::schema::Schema;

pub fn briefing_card<S: Schema>(context: &str) -> String {
    format!(
        "Analyze the following technical context from a GitHub repository to generate a detailed Briefing Card.

**Repository Context:**
---------------------
{context}
---------------------

**Instructions:**
Based on the provided context (which includes README, dependency files, etc.), extract and synthesize the information below.
Fill out the JSON object precisely. Do not include any preamble or extra text outside of the JSON object.

{fields}

**JSON Output Format:**
{format}
",
        fields = S::field_descriptions(),
        format = S::output_format(),
    )
}

pub fn impact_analysis<S: Schema>(goal: &str, project_structure: &str, summary: &str) -> String {
    format!(
        "Analyze the following project goal, project structure, and repository summary to generate an Impact Analysis.

**Project Goal:**
---------------------
{goal}
---------------------

**Project Structure (JSON):**
---------------------
{project_structure}
---------------------

**Repository Summary:**
---------------------
{summary}
---------------------

**Instructions:**
Based on the content, provide the following information in a clean JSON format. Do not include any preamble or extra text outside of the JSON object.

{fields}

**JSON Output Format:**
{format}
",
        fields = S::field_descriptions(),
        format = S::output_format(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::schema::{CardDraft, ImpactDraft};

    #[test]
    fn test_card_prompt_embeds_context_and_format() {
        let prompt = briefing_card::<CardDraft>("Repository: axum");
        assert!(prompt.contains("Repository: axum"));
        assert!(prompt.contains("\"capability_tags\""));
        assert!(prompt.contains("one_liner:"));
    }

    #[test]
    fn test_impact_prompt() {
        let prompt = impact_analysis::<ImpactDraft>("build a CLI", "{}", "Repo Name: clap");
        assert!(prompt.contains("build a CLI"));
        assert!(prompt.contains("Repo Name: clap"));
        assert!(prompt.contains("Low|Medium|High"));
    }
}
