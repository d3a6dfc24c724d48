// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use tempfile::tempdir;

fn config_in(dir: &Path) -> Config {
    Config {
        project_root: dir.to_path_buf(),
        socket_path: dir.join("moor.sock"),
        lock_path: dir.join("state").join("daemon.pid"),
        version_path: dir.join("state").join("daemon.version"),
        log_path: dir.join("state").join("daemon.log"),
        settings_path: dir.join(".moor").join("coordinator.toml"),
    }
}

#[test]
fn settings_default_when_table_missing() {
    assert_eq!(Settings::parse("").unwrap(), Settings::default());
    assert_eq!(
        Settings::parse("[unrelated]\nkey = 1\n").unwrap(),
        Settings::default()
    );
}

#[test]
fn settings_parse_human_durations() {
    let settings = Settings::parse(
        r#"
[coordinator]
release_grace = "250ms"
io_timeout = "2s"
"#,
    )
    .unwrap();
    assert_eq!(settings.release_grace, Duration::from_millis(250));
    assert_eq!(settings.io_timeout, Duration::from_secs(2));
}

#[test]
fn settings_partial_table_keeps_defaults() {
    let settings = Settings::parse("[coordinator]\nrelease_grace = \"1m\"\n").unwrap();
    assert_eq!(settings.release_grace, Duration::from_secs(60));
    assert_eq!(settings.io_timeout, Settings::default().io_timeout);
}

#[test]
fn settings_load_missing_file_is_default() {
    let dir = tempdir().unwrap();
    let settings = Settings::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
fn settings_load_rejects_bad_duration() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("coordinator.toml");
    std::fs::write(&path, "[coordinator]\nrelease_grace = \"soon\"\n").unwrap();

    let err = Settings::load(&path).unwrap_err();
    assert!(matches!(err, LifecycleError::Settings(p, _) if p == path));
}

#[test]
fn project_hash_is_stable_and_short() {
    let a = project_hash(Path::new("/work/project"));
    assert_eq!(a, project_hash(Path::new("/work/project")));
    assert_ne!(a, project_hash(Path::new("/work/other")));
    assert_eq!(a.len(), 16);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn for_project_rejects_missing_root() {
    let dir = tempdir().unwrap();
    let err = Config::for_project(&dir.path().join("nope")).unwrap_err();
    assert!(matches!(err, LifecycleError::ProjectNotFound(..)));
}

#[tokio::test]
async fn startup_writes_files_and_shutdown_removes_them() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());

    let mut daemon = startup(&config).await.unwrap();
    assert!(config.socket_path.exists());
    assert!(config.version_path.exists());
    let pid = std::fs::read_to_string(&config.lock_path).unwrap();
    assert_eq!(pid.trim(), std::process::id().to_string());

    assert!(daemon.take_listener().is_some());
    assert!(daemon.take_listener().is_none());

    daemon.shutdown().unwrap();
    assert!(daemon.server.shutdown_token().is_cancelled());
    assert!(!config.socket_path.exists());
    assert!(!config.lock_path.exists());
    assert!(!config.version_path.exists());
}

#[tokio::test]
async fn second_startup_fails_and_leaves_files() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());

    let _first = startup(&config).await.unwrap();
    let err = startup(&config).await.err().unwrap();
    assert!(matches!(err, LifecycleError::LockFailed(_)));

    assert!(config.socket_path.exists());
    assert!(config.lock_path.exists());
}

#[tokio::test]
async fn invalid_settings_abort_startup_and_clean_up() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::create_dir_all(config.settings_path.parent().unwrap()).unwrap();
    std::fs::write(&config.settings_path, "[coordinator]\nio_timeout = 5\n").unwrap();

    let err = startup(&config).await.err().unwrap();
    assert!(matches!(err, LifecycleError::Settings(..)));
    assert!(!config.socket_path.exists());
    assert!(!config.lock_path.exists());
    assert!(!config.version_path.exists());
}

#[tokio::test]
async fn startup_replaces_stale_socket() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(&config.socket_path, b"stale").unwrap();

    let mut daemon = startup(&config).await.unwrap();
    assert!(daemon.take_listener().is_some());
    daemon.shutdown().unwrap();
}
