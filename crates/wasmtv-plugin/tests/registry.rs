mod common;

use std::path::Path;
use std::time::{Duration, Instant};

use common::*;
use wasmtv_plugin::{DispatchOutcome, PluginError, PluginRegistry, SandboxConfig};

const INFO_TVDB: &str = include_str!("../../../plugins/info_tvdb.wat");

fn write_plugin(dir: &Path, name: &str, wasm: &[u8]) {
    std::fs::write(dir.join(format!("plugin_{name}.wasm")), wasm).unwrap();
}

fn failing_plugin(status: i32) -> Vec<u8> {
    guest(&format!(
        r#"{NOOP_ON_LOAD} {NOOP_ON_UNLOAD}
           (func (export "on_file_found") (param i32) (result i32) i32.const {status})"#
    ))
}

fn trapping_plugin() -> Vec<u8> {
    guest(&format!(
        r#"{NOOP_ON_LOAD} {NOOP_ON_UNLOAD}
           (func (export "on_file_found") (param i32) (result i32) unreachable)"#
    ))
}

fn spinning_plugin() -> Vec<u8> {
    guest(&format!(
        r#"{NOOP_ON_LOAD} {NOOP_ON_UNLOAD}
           (func (export "on_file_found") (param i32) (result i32)
             (loop $spin (br $spin))
             i32.const 0)"#
    ))
}

fn refusing_plugin() -> Vec<u8> {
    guest(&format!(
        r#"(func (export "on_load") (result i32) i32.const 1)
           {NOOP_ON_UNLOAD} {NOOP_ON_FILE_FOUND}"#
    ))
}

#[tokio::test]
async fn test_load_all_skips_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "info_tvdb", &wat::parse_str(INFO_TVDB).unwrap());
    write_plugin(dir.path(), "broken", b"this is not valid wasm at all");
    write_plugin(dir.path(), "refuses", &refusing_plugin());
    std::fs::write(dir.path().join("notes.txt"), "not a plugin").unwrap();

    let services = RecordingServices::new();
    let registry = PluginRegistry::new(services.clone(), test_config(), dir.path()).unwrap();

    let loaded = registry.load_all().await;
    assert_eq!(loaded, vec!["info_tvdb"]);
    assert_eq!(registry.loaded_count().await, 1);
    assert!(registry.is_loaded("info_tvdb").await);
    assert!(!registry.is_loaded("refuses").await);
    assert_eq!(services.trace_messages(), vec!["info_tvdb loaded"]);
}

#[tokio::test]
async fn test_file_found_reaches_every_plugin() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "info_tvdb", &wat::parse_str(INFO_TVDB).unwrap());
    write_plugin(dir.path(), "failing", &failing_plugin(2));
    write_plugin(dir.path(), "trapper", &trapping_plugin());

    let services = RecordingServices::new();
    let registry = PluginRegistry::new(services.clone(), test_config(), dir.path()).unwrap();
    assert_eq!(registry.load_all().await.len(), 3);

    let reports = registry.file_found("tv", "show.s01e01.mkv").await;
    let outcomes: Vec<_> = reports
        .iter()
        .map(|r| (r.plugin.as_str(), &r.outcome))
        .collect();
    assert_eq!(outcomes[0], ("failing", &DispatchOutcome::Failed(2)));
    assert_eq!(outcomes[1], ("info_tvdb", &DispatchOutcome::Processed));
    assert_eq!(outcomes[2].0, "trapper");
    assert!(matches!(outcomes[2].1, DispatchOutcome::Discarded(_)));

    assert!(!registry.is_loaded("trapper").await);
    assert_eq!(registry.loaded_count().await, 2);
    assert!(services
        .trace_messages()
        .contains(&"show.s01e01.mkv".to_string()));
    assert_eq!(
        services.stored("info_tvdb:last_file").unwrap(),
        b"show.s01e01.mkv"
    );

    // the session goes on without the discarded plugin
    let reports = registry.file_found("tv", "show.s01e02.mkv").await;
    assert_eq!(reports.len(), 2);
    assert_eq!(
        services.stored("info_tvdb:last_file").unwrap(),
        b"show.s01e02.mkv"
    );
}

#[tokio::test]
async fn test_file_found_with_no_plugins() {
    let dir = tempfile::tempdir().unwrap();
    let registry =
        PluginRegistry::new(RecordingServices::new(), test_config(), dir.path()).unwrap();
    assert!(registry.file_found("tv", "x.mkv").await.is_empty());
}

#[tokio::test]
async fn test_load_module_twice_rejected() {
    let registry =
        PluginRegistry::new(RecordingServices::new(), test_config(), "plugins").unwrap();
    let wasm = wat::parse_str(INFO_TVDB).unwrap();

    registry.load_module("info_tvdb", wasm.clone()).await.unwrap();
    let err = registry.load_module("info_tvdb", wasm).await.unwrap_err();
    assert!(matches!(err, PluginError::AlreadyExists(_)));
    assert_eq!(registry.loaded_count().await, 1);
}

#[tokio::test]
async fn test_refusing_plugin_never_registered() {
    let registry =
        PluginRegistry::new(RecordingServices::new(), test_config(), "plugins").unwrap();
    let err = registry
        .load_module("refuses", refusing_plugin())
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::LoadFailed { status: 1, .. }));
    assert!(!registry.is_loaded("refuses").await);
}

#[tokio::test]
async fn test_invalid_plugin_name_rejected() {
    let registry =
        PluginRegistry::new(RecordingServices::new(), test_config(), "plugins").unwrap();
    let err = registry.load_plugin("../escape").await.unwrap_err();
    assert!(matches!(err, PluginError::Load(_)));
}

#[tokio::test]
async fn test_unload_plugin_and_unload_all() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "info_tvdb", &wat::parse_str(INFO_TVDB).unwrap());
    write_plugin(dir.path(), "failing", &failing_plugin(4));

    let registry =
        PluginRegistry::new(RecordingServices::new(), test_config(), dir.path()).unwrap();
    registry.load_all().await;

    let plugins = registry.loaded_plugins().await;
    let names: Vec<_> = plugins.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(names, vec!["failing", "info_tvdb"]);

    registry.unload_plugin("failing").await.unwrap();
    assert!(!registry.is_loaded("failing").await);
    assert!(matches!(
        registry.unload_plugin("failing").await,
        Err(PluginError::NotFound(_))
    ));

    let results = registry.unload_all().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "info_tvdb");
    assert!(results[0].1.is_ok());
    assert_eq!(registry.loaded_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_loads_of_one_name_run_on_load_once() {
    let services = RecordingServices::new();
    let registry = PluginRegistry::new(services.clone(), test_config(), "plugins").unwrap();
    let wasm = wat::parse_str(INFO_TVDB).unwrap();

    let (first, second) = tokio::join!(
        registry.load_module("dup", wasm.clone()),
        registry.load_module("dup", wasm.clone()),
    );
    assert!(first.is_ok() != second.is_ok(), "{first:?} / {second:?}");
    let err = first.err().or(second.err()).unwrap();
    assert!(matches!(err, PluginError::AlreadyExists(_)));

    // every instance whose on_load ran is still registered for unload
    assert_eq!(services.trace_messages(), vec!["info_tvdb loaded"]);
    assert_eq!(registry.loaded_count().await, 1);
    let results = registry.unload_all().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());

    // the name is free again once unloaded
    registry.load_module("dup", wasm).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loaded_plugins_does_not_wait_for_busy_plugin() {
    let config = SandboxConfig {
        fuel_limit: i64::MAX as u64,
        call_timeout: Duration::from_secs(2),
        ..test_config()
    };
    let registry = PluginRegistry::new(RecordingServices::new(), config, "plugins").unwrap();
    registry
        .load_module("spinner", spinning_plugin())
        .await
        .unwrap();

    let (reports, (plugins, elapsed)) = tokio::join!(registry.file_found("tv", "x.mkv"), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let start = Instant::now();
        let plugins = registry.loaded_plugins().await;
        (plugins, start.elapsed())
    });

    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].1, "spinner");
    assert!(elapsed < Duration::from_secs(1), "query took {elapsed:?}");
    assert_eq!(reports.len(), 1);
    assert!(matches!(reports[0].outcome, DispatchOutcome::Discarded(_)));
    assert!(!registry.is_loaded("spinner").await);
}
