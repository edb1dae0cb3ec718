use chrono::{Local, TimeZone};
use owui_hugo::frontmatter;
use owui_hugo::graph::SelectionError;
use owui_hugo::pipeline::{PipelineError, Summary, execute};
use owui_hugo::utils::ExportConfig;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const TS: i64 = 1704110400; // 2024-01-01T12:00:00Z

const FLAT: &str = r#"[{
    "id": "id1",
    "user_id": "user1",
    "title": "hello🍺🍖  \n",
    "updated_at": 1704110400,
    "created_at": 1704110400,
    "chat": {
        "id": "cid1",
        "title": "hello🍺🍖  \n",
        "models": ["model1:latest"],
        "params": {},
        "messages": [
            {"id": "msg1", "role": "user", "content": "content 1"},
            {"id": "res1", "role": "assistant", "content": "response 1"}
        ]
    }
}]"#;

const BRANCHING: &str = r#"[{
    "id": "id1",
    "title": "hello🍺🍖",
    "updated_at": 1704110400,
    "chat": {
        "title": "hello🍺🍖",
        "models": ["model1:latest", "prefix/model2:latest"],
        "history": {
            "messages": {
                "uuid1": {"id": "uuid1", "childrenIds": ["uuid2", "uuid3"], "role": "user", "content": "content 1"},
                "uuid2": {"id": "uuid2", "parentId": "uuid1", "role": "assistant", "content": "response 1"},
                "uuid3": {"id": "uuid3", "parentId": "uuid1", "role": "assistant", "content": "response 2"}
            }
        }
    }
}]"#;

const MEMO: &str = "
---
categories: [hello]
authors_add: [author2]
---
first memo
<!-- skip 2 -->
second memo
<!-- seek last -->
last memo
";

struct Site {
    _tmp: TempDir,
    root: PathBuf,
}

impl Site {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        Self { _tmp: tmp, root }
    }

    fn rel(slug: &str) -> PathBuf {
        let dt = Local.timestamp_opt(TS, 0).single().unwrap();
        Path::new(&dt.format("%Y-%m").to_string())
            .join(format!("{}-{}.md", dt.format("%Y-%m-%d"), slug))
    }

    fn input(&self, json: &str) -> PathBuf {
        let path = self.root.join("input.json");
        fs::write(&path, json).unwrap();
        path
    }

    fn annotate(&self, slug: &str, text: &str) {
        let path = self.root.join("md").join(Self::rel(slug));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    fn annotation(&self, slug: &str) -> String {
        fs::read_to_string(self.root.join("md").join(Self::rel(slug))).unwrap()
    }

    fn output(&self, slug: &str) -> String {
        fs::read_to_string(self.output_path(slug)).unwrap()
    }

    fn output_path(&self, slug: &str) -> PathBuf {
        self.root.join("out").join(Self::rel(slug))
    }

    fn config(&self, json: &str) -> ExportConfig {
        ExportConfig {
            inputs: vec![self.input(json)],
            output_dir: self.root.join("out"),
            metadir: self.root.join("md"),
            quiet: true,
            ..Default::default()
        }
    }
}

fn meta(text: &str) -> serde_yaml::Mapping {
    frontmatter::parse(text).unwrap().metadata
}

fn strings(m: &serde_yaml::Mapping, key: &str) -> Vec<String> {
    match m.get(key) {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

#[test]
fn test_flat_export_with_annotations() {
    let site = Site::new();
    site.annotate("beer-mug", MEMO);
    let summary = execute(&site.config(FLAT)).unwrap();
    assert_eq!(summary.created, 1);

    let out = site.output("beer-mug");
    for needle in [
        "model1",
        "author2",
        "first memo",
        "content 1",
        "response 1",
        "second memo",
        "last memo",
        "notice info",
        "notice tip",
    ] {
        assert!(out.contains(needle), "missing {needle:?} in:\n{out}");
    }

    let body = frontmatter::parse(&out).unwrap().body;
    let pos = |needle: &str| body.iter().position(|l| l == needle).unwrap();
    assert!(pos("first memo") < pos("content 1"));
    assert!(pos("content 1") < pos("response 1"));
    assert!(pos("response 1") < pos("second memo"));
    assert!(pos("second memo") < pos("last memo"));

    let m = meta(&out);
    assert_eq!(m.get("title"), Some(&Value::String("hello🍺🍖".into())));
    assert_eq!(m.get("slug"), Some(&Value::String("beer-mug".into())));
    assert_eq!(m.get("draft"), Some(&Value::Bool(false)));
    assert_eq!(strings(&m, "authors"), vec!["model1", "author2"]);
    assert_eq!(strings(&m, "categories"), vec!["hello"]);
}

#[test]
fn test_history_forest_single_path() {
    let site = Site::new();
    let json = BRANCHING.replace(r#", "uuid3"]"#, "]").replace(
        r#""uuid3": {"id": "uuid3", "parentId": "uuid1", "role": "assistant", "content": "response 2"}"#,
        r#""uuid9": {"id": "uuid9", "parentId": "uuid2", "role": "user", "content": "unlinked"}"#,
    );
    site.annotate("beer-mug", MEMO);
    execute(&site.config(&json)).unwrap();

    let out = site.output("beer-mug");
    assert!(out.contains("model1"));
    assert!(out.contains("model2"));
    assert!(!out.contains("prefix"));
    assert!(out.contains("content 1"));
    assert!(out.contains("response 1"));
    assert!(!out.contains("unlinked"));
}

#[test]
fn test_history_key_selects_branch() {
    let site = Site::new();
    site.annotate(
        "beer-mug",
        "---\nhistory: [uuid3]\n---\n<!-- seek uuid3 -->\nabout the second answer\n",
    );
    execute(&site.config(BRANCHING)).unwrap();

    let out = site.output("beer-mug");
    assert!(out.contains("response 2"));
    assert!(!out.contains("response 1"));
    let body = frontmatter::parse(&out).unwrap().body;
    let note = body.iter().position(|l| l == "about the second answer").unwrap();
    let reply = body.iter().position(|l| l == "response 2").unwrap();
    assert!(note < reply);
    assert_eq!(strings(&meta(&out), "history"), vec!["uuid3"]);
}

#[test]
fn test_ambiguous_branch_aborts_without_writing() {
    let site = Site::new();
    let err = execute(&site.config(BRANCHING)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SelectionError>(),
        Some(SelectionError::Ambiguous { candidates: 2, .. })
    ));
    assert!(!site.root.join("out").exists());
}

#[test]
fn test_duplicate_output_path_aborts_without_writing() {
    let site = Site::new();
    let twice = FLAT.replacen(r#""id": "id1""#, r#""id": "id2""#, 1);
    let json = format!(
        "[{},{}]",
        FLAT.trim().trim_start_matches('[').trim_end_matches(']'),
        twice.trim().trim_start_matches('[').trim_end_matches(']')
    );
    let err = execute(&site.config(&json)).unwrap_err();
    assert!(err.downcast_ref::<PipelineError>().is_some());
    assert!(!site.root.join("out").exists());
    assert!(!site.root.join("md").exists());
}

#[test]
fn test_fresh_export_creates_skeleton_then_is_unchanged() {
    let site = Site::new();
    let mut config = site.config(FLAT);
    config.categories = vec!["chat".into()];

    let first = execute(&config).unwrap();
    assert_eq!(first, Summary { created: 1, ..Default::default() });
    assert_eq!(site.annotation("beer-mug"), "---\ncategories:\n- chat\n---\n");
    assert_eq!(strings(&meta(&site.output("beer-mug")), "categories"), vec!["chat"]);

    let second = execute(&config).unwrap();
    assert_eq!(second, Summary { unchanged: 1, ..Default::default() });

    config.force = true;
    let forced = execute(&config).unwrap();
    assert_eq!(forced, Summary { updated: 1, ..Default::default() });
}

#[test]
fn test_annotation_edit_updates_post() {
    let site = Site::new();
    let config = site.config(FLAT);
    execute(&config).unwrap();
    site.annotate("beer-mug", "---\ntitle: Renamed\n---\nA new intro.\n");

    let summary = execute(&config).unwrap();
    assert_eq!(summary.updated, 1);
    let out = site.output("beer-mug");
    assert!(out.contains("A new intro."));
    assert_eq!(meta(&out).get("title"), Some(&Value::String("Renamed".into())));
}

#[test]
fn test_skip_lists_filter_messages() {
    let site = Site::new();
    site.annotate(
        "beer-mug",
        "---\nskip_id: [res1]\nskip_n: [0]\n---\n<!-- seek res1 -->\nhidden note\n",
    );
    execute(&site.config(FLAT)).unwrap();

    let out = site.output("beer-mug");
    assert!(!out.contains("content 1"));
    assert!(!out.contains("response 1"));
    assert!(!out.contains("hidden note"));
    let m = meta(&out);
    assert!(m.get("skip_id").is_none());
    assert!(m.get("skip_n").is_none());
}

#[test]
fn test_normalize_rewrites_annotation() {
    let site = Site::new();
    site.annotate("beer-mug", MEMO);
    let mut config = site.config(FLAT);
    config.normalize = true;
    execute(&config).unwrap();
    let first_out = site.output("beer-mug");

    let normalized = site.annotation("beer-mug");
    assert!(normalized.contains("<!-- seek 0 -->"));
    assert!(normalized.contains("<!-- seek 2 -->"));
    assert!(normalized.contains("<!-- seek last -->"));
    assert!(!normalized.contains("skip 2"));
    assert_eq!(strings(&meta(&normalized), "authors_add"), vec!["author2"]);

    // the canonical form renders the same post
    config.normalize = false;
    let summary = execute(&config).unwrap();
    assert_eq!(summary.unchanged, 1);
    assert_eq!(site.output("beer-mug"), first_out);
}

#[test]
fn test_dry_run_writes_nothing() {
    let site = Site::new();
    let mut config = site.config(FLAT);
    config.dry_run = true;
    let summary = execute(&config).unwrap();
    assert_eq!(summary.created, 1);
    assert!(!site.output_path("beer-mug").exists());
    assert!(!site.root.join("md").exists());
}

#[test]
fn test_malformed_conversation_is_skipped() {
    let site = Site::new();
    let json = r#"[{"chat": {"title": "no id"}},
        {"id": "bad", "updated_at": 1704110400, "chat": {"title": "🐍", "history": {"messages": {
            "a": {"id": "a", "parentId": "ghost", "role": "user", "content": "?"}}}}}]"#;
    let summary = execute(&site.config(json)).unwrap();
    assert_eq!(summary, Summary { skipped: 2, ..Default::default() });
}

#[test]
fn test_skipped_conversation_does_not_hold_its_path() {
    let site = Site::new();
    let json = r#"[
        {"id": "a", "updated_at": 1704110400, "chat": {"title": "🐍", "history": {"messages": {
            "a1": {"id": "a1", "parentId": "ghost", "role": "user", "content": "?"}}}}},
        {"id": "b", "updated_at": 1704110400, "chat": {"title": "🐍", "models": ["m"],
            "messages": [{"id": "b1", "role": "user", "content": "the good one"}]}}
    ]"#;
    for jobs in [1, 2] {
        let mut config = site.config(json);
        config.jobs = jobs;
        config.dry_run = jobs == 1;
        let summary = execute(&config).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.created, 1);
    }
    assert!(site.output("snake").contains("the good one"));
}

#[test]
fn test_toml_output_format() {
    let site = Site::new();
    let mut config = site.config(FLAT);
    config.format = frontmatter::Format::Toml;
    execute(&config).unwrap();
    let out = site.output("beer-mug");
    assert!(out.starts_with("+++\n"));
    assert_eq!(meta(&out).get("slug"), Some(&Value::String("beer-mug".into())));
}

#[test]
fn test_parallel_matches_sequential() {
    let site = Site::new();
    let chats: Vec<String> = (0..8)
        .map(|i| {
            format!(
                r#"{{"id": "c{i}", "updated_at": {TS}, "chat": {{"title": "chat {i}", "models": ["m"],
                    "messages": [{{"id": "u{i}", "role": "user", "content": "question {i}"}}]}}}}"#
            )
        })
        .collect();
    let json = format!("[{}]", chats.join(","));

    let mut config = site.config(&json);
    config.jobs = 4;
    let summary = execute(&config).unwrap();
    assert_eq!(summary.created, 8);
    for i in 0..8 {
        assert!(site.output(&format!("c{i}")).contains(&format!("question {i}")));
    }
}

#[test]
fn test_reads_open_webui_database() {
    let site = Site::new();
    let db = site.root.join("webui.db");
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE chat (id TEXT PRIMARY KEY, user_id TEXT, title TEXT, chat TEXT,
                                created_at INTEGER, updated_at INTEGER);",
        )
        .unwrap();
        let chat = r#"{"title": "hello🍺", "models": ["model1:latest"],
            "messages": [{"id": "m1", "role": "user", "content": "from the db"}]}"#;
        conn.execute(
            "INSERT INTO chat VALUES ('db1', 'u', 'hello🍺', ?1, ?2, ?2)",
            rusqlite::params![chat, TS],
        )
        .unwrap();
    }

    let config = ExportConfig {
        db_path: Some(db),
        output_dir: site.root.join("out"),
        metadir: site.root.join("md"),
        quiet: true,
        ..Default::default()
    };
    execute(&config).unwrap();
    assert!(site.output("beer-mug").contains("from the db"));
}

#[test]
fn test_no_input_is_an_error() {
    let site = Site::new();
    let config = ExportConfig {
        output_dir: site.root.join("out"),
        quiet: true,
        ..Default::default()
    };
    assert!(execute(&config).is_err());
}
