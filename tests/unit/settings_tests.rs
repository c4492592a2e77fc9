//! Unit tests for `SettingsService` reloads and `ConfigWatcher`.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use agent_fleet::config_watcher::ConfigWatcher;
use agent_fleet::settings::SettingsService;
use agent_fleet::{AppError, FleetConfig};

fn write_config(path: &std::path::Path, tick: u64) {
    std::fs::write(
        path,
        format!("default_workspace_root = \"/tmp/fleet\"\ntick_interval_seconds = {tick}\n"),
    )
    .expect("write config");
}

#[test]
fn reload_swaps_snapshot_on_valid_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("fleet.toml");
    write_config(&path, 10);

    let settings = SettingsService::load(&path).expect("load");
    let before = settings.current();
    assert_eq!(before.tick_interval_seconds, 10);

    write_config(&path, 20);
    let reloaded = settings.reload().expect("reload");
    assert_eq!(reloaded.tick_interval_seconds, 20);
    assert_eq!(settings.current().tick_interval_seconds, 20);
    // Earlier snapshots are unaffected.
    assert_eq!(before.tick_interval_seconds, 10);
}

#[test]
fn invalid_reload_keeps_previous_values() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("fleet.toml");
    write_config(&path, 10);
    let settings = SettingsService::load(&path).expect("load");

    write_config(&path, 0);
    assert!(matches!(settings.reload(), Err(AppError::Config(_))));
    assert_eq!(settings.current().tick_interval_seconds, 10);
}

#[test]
fn in_memory_settings_reload_is_a_no_op() {
    let config = FleetConfig::from_toml_str("default_workspace_root = \"/w\"\n").expect("config");
    let settings = SettingsService::from_config(config.clone());

    assert!(settings.path().is_none());
    assert_eq!(*settings.reload().expect("reload"), config);

    let mut changed = config;
    changed.tick_interval_seconds = 99;
    settings.replace(changed);
    assert_eq!(settings.current().tick_interval_seconds, 99);
}

#[test]
fn watcher_requires_a_backing_file() {
    let config = FleetConfig::from_toml_str("default_workspace_root = \"/w\"\n").expect("config");
    let settings = Arc::new(SettingsService::from_config(config));
    assert!(matches!(ConfigWatcher::new(settings), Err(AppError::Config(_))));
}

#[tokio::test]
#[serial]
async fn watcher_reloads_on_file_change() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("fleet.toml");
    write_config(&path, 10);
    let settings = Arc::new(SettingsService::load(&path).expect("load"));
    let watcher = ConfigWatcher::new(Arc::clone(&settings)).expect("watcher");
    assert_eq!(watcher.path(), path.as_path());

    write_config(&path, 42);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while settings.current().tick_interval_seconds != 42 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "watcher did not reload within 5s"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
