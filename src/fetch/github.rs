//! GitHub repositories as enrichment sources.

use url::Url;

use super::{CandidateMap, FetchError, Location};

/// Files that describe a repository, in the order they appear in the context.
pub const CONTEXT_FILES: [&str; 11] = [
    "README.md",
    "readme.md",
    "README.rst",
    "requirements.txt",
    "pyproject.toml",
    "package.json",
    "pom.xml",
    "build.gradle",
    "Dockerfile",
    "docker-compose.yml",
    "Cargo.toml",
];

/// Branches tried for each file, highest priority first.
pub const BRANCHES: [&str; 3] = ["main", "master", "develop"];

/// Context handed to the extractor is cut to this many characters.
pub const MAX_CONTEXT_CHARS: usize = 8000;

const RAW_HOST: &str = "https://raw.githubusercontent.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRepo {
    pub owner: String,
    pub name: String,
    pub url: String,
}

impl GithubRepo {
    /// Accepts `https://github.com/<owner>/<repo>` with an optional trailing
    /// slash or `.git`.
    pub fn parse(identity: &str) -> Result<Self, FetchError> {
        let invalid = |why: &str| FetchError::InvalidIdentity(format!("{identity}: {why}"));

        let url = Url::parse(identity.trim()).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "https" || url.host_str() != Some("github.com") {
            return Err(invalid("expected an https://github.com/<owner>/<repo> URL"));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [owner, name] => Ok(Self {
                owner: owner.to_string(),
                name: name.trim_end_matches(".git").to_string(),
                url: identity.to_string(),
            }),
            _ => Err(invalid("expected exactly <owner>/<repo> in the path")),
        }
    }

    pub fn raw_url(&self, branch: &str, file: &str) -> String {
        format!("{RAW_HOST}/{}/{}/{branch}/{file}", self.owner, self.name)
    }
}

/// Every (file, branch) pair as a fetchable location, grouped by file.
pub fn context_locations(repo: &GithubRepo) -> Vec<Location> {
    CONTEXT_FILES
        .iter()
        .flat_map(|file| {
            BRANCHES
                .iter()
                .map(move |branch| Location::new(*file, repo.raw_url(branch, file)))
        })
        .collect()
}

/// Build the extractor context: for each file the first branch that had it.
pub fn assemble_context(repo: &GithubRepo, locations: &[Location], candidates: &CandidateMap) -> String {
    let mut context = format!("Repository: {}\nURL: {}\n\n", repo.name, repo.url);
    let mut missing = Vec::new();

    for file in CONTEXT_FILES {
        let content = locations
            .iter()
            .filter(|loc| loc.label == file)
            .find_map(|loc| candidates.get(&loc.url).and_then(|c| c.as_deref()))
            .filter(|c| !c.is_empty());

        match content {
            Some(content) => {
                context.push_str(&format!("--- Content of {file} ---\n{content}\n\n"));
            }
            None => missing.push(file),
        }
    }

    if !missing.is_empty() {
        log::info!(
            "repo={} optional files not found: {}",
            repo.name,
            missing.join(", ")
        );
    }

    truncate_chars(&context, MAX_CONTEXT_CHARS)
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> GithubRepo {
        GithubRepo::parse("https://github.com/tokio-rs/axum").unwrap()
    }

    #[test]
    fn test_parse_accepts_repo_urls() {
        let repo = repo();
        assert_eq!(repo.owner, "tokio-rs");
        assert_eq!(repo.name, "axum");

        assert_eq!(GithubRepo::parse("https://github.com/a/b.git").unwrap().name, "b");
        assert_eq!(GithubRepo::parse("https://github.com/a/b/").unwrap().name, "b");
    }

    #[test]
    fn test_parse_rejects_other_urls() {
        for bad in [
            "",
            "not a url",
            "http://github.com/a/b",
            "https://gitlab.com/a/b",
            "https://github.com/a",
            "https://github.com/a/b/tree/main",
        ] {
            assert!(
                matches!(GithubRepo::parse(bad), Err(FetchError::InvalidIdentity(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_locations_in_priority_order() {
        let locations = context_locations(&repo());
        assert_eq!(locations.len(), CONTEXT_FILES.len() * BRANCHES.len());
        assert_eq!(
            locations[0].url,
            "https://raw.githubusercontent.com/tokio-rs/axum/main/README.md"
        );
        assert_eq!(locations[1].label, "README.md");
        assert!(locations[1].url.contains("/master/"));
        assert!(locations[2].url.contains("/develop/"));
        assert_eq!(locations[3].label, "readme.md");
    }

    #[test]
    fn test_assemble_prefers_first_branch() {
        let repo = repo();
        let locations = context_locations(&repo);
        let mut candidates = CandidateMap::new();
        for loc in &locations {
            candidates.insert(loc.url.clone(), None);
        }
        candidates.insert(repo.raw_url("master", "README.md"), Some("from master".into()));
        candidates.insert(repo.raw_url("develop", "README.md"), Some("from develop".into()));
        candidates.insert(repo.raw_url("main", "Cargo.toml"), Some("[package]".into()));

        let context = assemble_context(&repo, &locations, &candidates);
        assert!(context.starts_with("Repository: axum\nURL: https://github.com/tokio-rs/axum\n\n"));
        assert!(context.contains("--- Content of README.md ---\nfrom master\n\n"));
        assert!(!context.contains("from develop"));
        assert!(context.contains("--- Content of Cargo.toml ---\n[package]"));
    }

    #[test]
    fn test_context_is_truncated_on_char_boundary() {
        let repo = repo();
        let locations = context_locations(&repo);
        let mut candidates = CandidateMap::new();
        candidates.insert(repo.raw_url("main", "README.md"), Some("é".repeat(10_000)));

        let context = assemble_context(&repo, &locations, &candidates);
        assert_eq!(context.chars().count(), MAX_CONTEXT_CHARS);
    }
}
