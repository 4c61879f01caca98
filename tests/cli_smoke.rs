use std::{
    path::Path,
    process::{Command, Output},
};

use serde_json::Value;

fn docrag(data_dir: &Path, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_docrag"));
    cmd.args(args)
        .arg("-q")
        .env("DOCRAG_DATA_DIR", data_dir)
        .env_remove("DOCRAG_LOG");
    for var in [
        "DOCRAG_MODEL",
        "DOCRAG_EMBEDDING_URL",
        "DOCRAG_CHUNK_SIZE",
        "DOCRAG_TOP_K",
    ] {
        cmd.env_remove(var);
    }
    cmd.output().expect("failed to run docrag")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "docrag failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn corpus(dir: &Path) {
    std::fs::write(
        dir.join("cats.md"),
        "# Cats\n\nCats purr when they are content.",
    )
    .unwrap();
    std::fs::write(
        dir.join("dogs.md"),
        "# Dogs\n\nDogs bark at the mail carrier.",
    )
    .unwrap();
}

#[test]
fn expand_prints_the_query_first() {
    let data = tempfile::tempdir().unwrap();
    let out = stdout(&docrag(data.path(), &["expand", "vector caching"]));
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "vector caching");
    assert_eq!(lines[1], "What is vector caching?");
}

#[test]
fn config_set_get_and_clear() {
    let data = tempfile::tempdir().unwrap();
    stdout(&docrag(data.path(), &["config", "set", "retrieval.top_k", "3"]));
    let out = stdout(&docrag(data.path(), &["config", "get", "retrieval.top_k"]));
    assert_eq!(out.trim(), "3");

    stdout(&docrag(
        data.path(),
        &["config", "set", "citation.format", "footnote", "--user", "ana"],
    ));
    let out = stdout(&docrag(
        data.path(),
        &["config", "get", "citation.format", "--user", "ana"],
    ));
    assert_eq!(out.trim(), "footnote");
    let out = stdout(&docrag(data.path(), &["config", "get", "citation.format"]));
    assert_eq!(out.trim(), "numbered");

    let out = stdout(&docrag(
        data.path(),
        &["config", "get", "citation.format", "--stored", "--user", "ana"],
    ));
    assert_eq!(out.trim(), "footnote");
    let out = stdout(&docrag(
        data.path(),
        &["config", "get", "retrieval.top_k", "--stored"],
    ));
    assert_eq!(out.trim(), "3");
    let out = docrag(
        data.path(),
        &["config", "get", "citation.format", "--stored"],
    );
    assert!(!out.status.success());

    stdout(&docrag(data.path(), &["config", "clear"]));
    let out = stdout(&docrag(data.path(), &["config", "get", "retrieval.top_k"]));
    assert_eq!(out.trim(), "5");
}

#[test]
fn config_rejects_unknown_keys_and_values() {
    let data = tempfile::tempdir().unwrap();
    let out = docrag(data.path(), &["config", "set", "retrieval.nope", "1"]);
    assert!(!out.status.success());
    let out = docrag(data.path(), &["config", "set", "rerank.method", "magic"]);
    assert!(!out.status.success());
}

#[test]
fn chunk_emits_json() {
    let data = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    let file = docs.path().join("story.txt");
    std::fs::write(&file, "One. Two! Three?").unwrap();

    let out = stdout(&docrag(
        data.path(),
        &[
            "chunk",
            file.to_str().unwrap(),
            "--strategy",
            "sentence",
            "--size",
            "20",
            "--json",
        ],
    ));
    let chunks: Value = serde_json::from_str(&out).unwrap();
    let chunks = chunks.as_array().unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[1]["content"], "Two!");
    assert_eq!(chunks[1]["metadata"]["strategy"], "sentence");
}

#[test]
fn search_builds_cited_context_and_fills_the_cache() {
    let data = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    corpus(docs.path());
    let root = docs.path().to_str().unwrap();

    let out = stdout(&docrag(data.path(), &["search", "why do cats purr", root]));
    assert!(out.contains("Cats purr"), "{out}");
    assert!(out.contains("References:"), "{out}");
    assert!(out.contains("cats.md"), "{out}");

    let out = stdout(&docrag(
        data.path(),
        &["search", "cats", root, "--json", "-n", "1", "--format", "markdown"],
    ));
    let response: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(response["results"].as_array().unwrap().len(), 1);
    assert!(response["context"].as_str().unwrap().contains("[^1]"));

    let out = stdout(&docrag(data.path(), &["cache", "status", "--json"]));
    let status: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(status["backend"], "fs");
    // Two chunks plus the two query vectors.
    assert_eq!(status["entries"], 4);

    let out = stdout(&docrag(data.path(), &["cache", "clear"]));
    assert!(out.contains("Removed 4"), "{out}");
}

#[test]
fn search_rejects_unknown_methods() {
    let data = tempfile::tempdir().unwrap();
    let docs = tempfile::tempdir().unwrap();
    corpus(docs.path());
    let out = docrag(
        data.path(),
        &["search", "cats", docs.path().to_str().unwrap(), "--rerank", "vibes"],
    );
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("vibes"));
}
