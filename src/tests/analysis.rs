use super::support::*;
use crate::analysis::{Section, SECTION_UNAVAILABLE};
use crate::engine::EngineError;

fn project() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    std::fs::create_dir_all(root.join("app")).unwrap();
    std::fs::write(
        root.join("app/settings.py"),
        "import os\nfrom pathlib import Path\n\nclass Settings:\n    pass\n",
    )
    .unwrap();
    std::fs::write(root.join("app/main.py"), "from app.settings import Settings\n").unwrap();
    std::fs::write(root.join("cli.py"), "import settings\n").unwrap();
    std::fs::write(root.join("unrelated.py"), "import json\n").unwrap();
    std::fs::write(root.join("empty.py"), "").unwrap();
    tmp
}

#[test]
fn test_analyse_file_in_project() {
    let t = test_engine(FakeSource::new(), Mode::Working);
    let proj = project();

    let summary = t
        .engine
        .analyse_in(proj.path(), std::path::Path::new("app/settings.py"))
        .unwrap();

    assert_eq!(summary.summary, Section::Ready("Loads and validates settings.".into()));
    assert_eq!(
        summary.components,
        Section::Ready(vec!["load_config".into(), "Settings".into()])
    );
    assert_eq!(summary.dependencies, Section::Ready(vec!["os".into(), "pathlib".into()]));

    let Section::Ready(dependents) = summary.dependents else {
        panic!("dependents unavailable");
    };
    assert_eq!(dependents.len(), 2);
    assert!(dependents.iter().any(|d| d.ends_with("main.py")));
    assert!(dependents.iter().any(|d| d == "cli.py"));
}

#[test]
fn test_one_failing_processor_does_not_sink_the_rest() {
    let t = test_engine(FakeSource::new(), Mode::ComponentsDown);
    let proj = project();

    let summary = t
        .engine
        .analyse(&proj.path().join("app").join("settings.py"))
        .unwrap();

    assert!(summary.summary.is_ready());
    assert_eq!(summary.components, Section::Unavailable(SECTION_UNAVAILABLE.into()));
    assert!(summary.dependencies.is_ready());
    assert!(summary.dependents.is_ready());

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["components"], "unavailable");
    assert_eq!(json["dependencies"], serde_json::json!(["os", "pathlib"]));
}

#[test]
fn test_llm_outage_leaves_static_sections() {
    let t = test_engine(FakeSource::new(), Mode::AlwaysTimeout);
    let proj = project();

    let summary = t.engine.analyse_in(proj.path(), &proj.path().join("cli.py")).unwrap();
    assert_eq!(summary.summary, Section::Unavailable("Error generating summary.".into()));
    assert!(!summary.components.is_ready());
    assert_eq!(summary.dependencies, Section::Ready(vec!["settings".into()]));
}

#[test]
fn test_empty_file() {
    let t = test_engine(FakeSource::new(), Mode::Working);
    let proj = project();

    let summary = t.engine.analyse_in(proj.path(), std::path::Path::new("empty.py")).unwrap();
    assert_eq!(summary.summary, Section::Ready("This file is empty.".into()));
    assert_eq!(summary.components, Section::Ready(vec![]));
    assert_eq!(summary.dependencies, Section::Ready(vec![]));
}

#[test]
fn test_missing_file_is_not_found() {
    let t = test_engine(FakeSource::new(), Mode::Working);
    let proj = project();

    let err = t
        .engine
        .analyse_in(proj.path(), std::path::Path::new("nope.py"))
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "{err:?}");
}
