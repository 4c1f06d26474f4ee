use std::fs;
use std::path::Path;

use pollflow_engine::{HandlerRegistry, RunOptions, run_batch};
use pollflow_util::{DefaultStoreProvider, KeyValueStore, STATE_KEY, SqliteStore};
use serde_json::json;

const FEED: &str = r#"
sources:
  - use: echo
    args: [[{ id: 1 }, { id: 2 }]]
    key: id
steps:
  - use: state.merge
    args: { last: "${{ ctx.item.id }}" }
"#;

fn write_workflow(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().expect("workflow parent")).expect("create workflow dir");
    fs::write(path, body).expect("write workflow");
}

fn options(root: &Path) -> RunOptions {
    RunOptions {
        patterns: vec!["workflows/*.yml".into()],
        cwd: root.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn json_store_lives_under_the_data_dir() {
    let temp = tempfile::tempdir().unwrap();
    write_workflow(temp.path(), "workflows/feed.yml", FEED);
    let stores = DefaultStoreProvider::new(temp.path(), "data");
    let registry = HandlerRegistry::with_builtins();

    let first = run_batch(&options(temp.path()), &registry, &stores).await.unwrap();
    assert_eq!(first.workflows[0].summary.processed, 2);

    let file = temp.path().join("data/workflows/feed.json");
    let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
    assert_eq!(saved["entries"]["state"]["value"], json!({ "last": 2 }));
    assert_eq!(saved["entries"]["internalState"]["value"], json!({ "keys": ["2", "1"] }));

    let second = run_batch(&options(temp.path()), &registry, &stores).await.unwrap();
    assert_eq!(second.workflows[0].summary.aggregated, 0);
}

#[tokio::test]
async fn workflow_database_selects_sqlite() {
    let temp = tempfile::tempdir().unwrap();
    write_workflow(temp.path(), "workflows/feed.yml", &format!("database: sqlite://state/pollflow.db\n{FEED}"));
    let stores = DefaultStoreProvider::new(temp.path(), "data");
    let registry = HandlerRegistry::with_builtins();

    run_batch(&options(temp.path()), &registry, &stores).await.unwrap();
    assert!(!temp.path().join("data").exists());

    let store = SqliteStore::open(&temp.path().join("state/pollflow.db"), "workflows/feed").unwrap();
    assert_eq!(store.get(STATE_KEY).unwrap(), Some(json!({ "last": 2 })));

    let second = run_batch(&options(temp.path()), &registry, &stores).await.unwrap();
    assert_eq!(second.workflows[0].summary.aggregated, 0);
}

#[tokio::test]
async fn invocation_database_applies_when_workflow_names_none() {
    let temp = tempfile::tempdir().unwrap();
    write_workflow(temp.path(), "workflows/feed.yml", FEED);
    let stores = DefaultStoreProvider::new(temp.path(), "data");
    let registry = HandlerRegistry::with_builtins();
    let run = RunOptions {
        database: Some("json://shared-state".into()),
        ..options(temp.path())
    };

    run_batch(&run, &registry, &stores).await.unwrap();
    assert!(temp.path().join("shared-state/workflows/feed.json").is_file());
}

#[tokio::test]
async fn memory_database_forgets_between_runs() {
    let temp = tempfile::tempdir().unwrap();
    write_workflow(temp.path(), "workflows/feed.yml", &format!("database: \"sqlite::memory:\"\n{FEED}"));
    let stores = DefaultStoreProvider::new(temp.path(), "data");
    let registry = HandlerRegistry::with_builtins();

    run_batch(&options(temp.path()), &registry, &stores).await.unwrap();
    let second = run_batch(&options(temp.path()), &registry, &stores).await.unwrap();
    assert_eq!(second.workflows[0].summary.aggregated, 2);
}

#[tokio::test]
async fn unsupported_descriptor_fails_the_workflow() {
    let temp = tempfile::tempdir().unwrap();
    write_workflow(temp.path(), "workflows/feed.yml", &format!("database: redis://localhost\n{FEED}"));
    let stores = DefaultStoreProvider::new(temp.path(), "data");

    let error = run_batch(&options(temp.path()), &HandlerRegistry::with_builtins(), &stores)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("1 of 1 workflows failed"));
}
