use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use knowbridge::sources::document_id_for_path;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kb");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Onboarding\n\nNew engineers request laptop access through the service desk.\n\nCargo builds run on the shared CI runners.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Benefits\n\nDental and vision coverage start on the first day of employment.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Deployment notes.\n\nProduction deploys happen on Tuesdays after the change review.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/kb.sqlite"

[chunking]
max_tokens = 400

[embedding]
provider = "hash"
dims = 256

[retrieval]
min_relevance = 0.3

[conversation]
on_empty_context = "decline"

[documents]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]
"#,
        root = root.display()
    );

    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn conversation_id(stdout: &str) -> String {
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("conversation: "))
        .expect("no conversation id printed")
        .trim()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_kb(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_kb(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_validate() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kb(&config_path, &["validate"]);
    assert!(success, "validate failed: {}", stderr);
    assert!(stdout.contains("knowledge"));
    assert!(stdout.contains("code"));
}

#[test]
fn test_validate_rejects_bad_template() {
    let (_tmp, config_path) = setup_test_env();
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("\n[prompts.templates.broken]\nsystem = \"{context}\"\nuser = \"no query here\"\n");
    fs::write(&config_path, content).unwrap();

    let (_, stderr, success) = run_kb(&config_path, &["validate"]);
    assert!(!success);
    assert!(stderr.contains("broken"), "stderr: {}", stderr);
}

#[test]
fn test_index_all_then_reindex_is_unchanged() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout1, stderr, success) = run_kb(&config_path, &["index", "--all"]);
    assert!(success, "index failed: {}", stderr);
    assert_eq!(stdout1.lines().filter(|l| l.contains(" chunks (")).count(), 3);
    for line in stdout1.lines() {
        assert!(!line.contains("(0 embedded"), "first index embedded nothing: {}", line);
    }

    let (stdout2, _, success) = run_kb(&config_path, &["index", "--all"]);
    assert!(success);
    for line in stdout2.lines().filter(|l| l.contains(" chunks (")) {
        assert!(line.contains("(0 embedded"), "re-index re-embedded: {}", line);
    }
}

#[test]
fn test_index_single_path() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("files/beta.md");

    let (stdout, stderr, success) = run_kb(&config_path, &["index", file.to_str().unwrap()]);
    assert!(success, "index failed: {}", stderr);
    assert!(stdout.contains(&document_id_for_path("beta.md")));
    assert_eq!(stdout.lines().count(), 1);
}

#[test]
fn test_index_path_outside_root_fails() {
    let (tmp, config_path) = setup_test_env();
    let outside = tmp.path().join("outside.md");
    fs::write(&outside, "stray").unwrap();

    let (_, stderr, success) = run_kb(&config_path, &["index", outside.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("outside documents.root"), "stderr: {}", stderr);
}

#[test]
fn test_search_finds_exact_match_first() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["index", "--all"]);

    let (stdout, stderr, success) = run_kb(&config_path, &["search", "dental vision coverage"]);
    assert!(success, "search failed: {}", stderr);
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.starts_with("1."), "stdout: {}", stdout);
    assert!(first.contains(&document_id_for_path("beta.md")), "stdout: {}", stdout);
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["index", "--all"]);

    let (a, _, _) = run_kb(&config_path, &["search", "deploys tuesdays"]);
    let (b, _, _) = run_kb(&config_path, &["search", "deploys tuesdays"]);
    assert_eq!(a, b);
}

#[test]
fn test_ask_declines_without_context_and_keeps_history() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["index", "--all"]);

    let (stdout, stderr, success) = run_kb(&config_path, &["ask", "quarterly xylophone budget"]);
    assert!(success, "ask failed: {}", stderr);
    assert!(stdout.contains("couldn't find anything"));
    let id = conversation_id(&stdout);

    let (history, _, success) = run_kb(&config_path, &["history", &id]);
    assert!(success);
    let lines: Vec<&str> = history.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("user: quarterly xylophone budget"));
    assert!(lines[1].contains("assistant:"));
}

#[test]
fn test_ask_with_disabled_completion_persists_question() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["index", "--all"]);

    let (stdout, _, _) = run_kb(&config_path, &["ask", "quarterly xylophone budget"]);
    let id = conversation_id(&stdout);

    // Relevant context exists, so the (disabled) model is called and fails.
    let (_, stderr, success) = run_kb(
        &config_path,
        &["ask", "dental vision coverage", "--conversation", &id],
    );
    assert!(!success);
    assert!(stderr.contains("completion"), "stderr: {}", stderr);

    let (history, _, _) = run_kb(&config_path, &["history", &id]);
    let lines: Vec<&str> = history.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[2].contains("user: dental vision coverage"));
}

#[test]
fn test_history_unknown_conversation() {
    let (_tmp, config_path) = setup_test_env();
    run_kb(&config_path, &["init"]);

    let (_, stderr, success) = run_kb(&config_path, &["history", "nope"]);
    assert!(!success);
    assert!(stderr.contains("conversation not found"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_kb(&tmp.path().join("missing.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
