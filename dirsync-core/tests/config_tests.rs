//! Config file loading and validation.

use std::fs;
use std::time::Duration;

use dirsync_core::{CoreError, SyncConfig, WatchMode};
use rstest::rstest;
use tempfile::TempDir;

fn write_config(dir: &TempDir, yaml: &str) -> std::path::PathBuf {
    let path = dir.path().join("dirsync.yaml");
    fs::write(&path, yaml).expect("write config");
    path
}

#[test]
fn partial_yaml_keeps_defaults() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(
        &dir,
        "watch_root: /srv/outbox\nwatch_mode: poll\npoll_interval_ms: 250\nremote: 10.0.0.7:9000\n",
    );

    let config = SyncConfig::load(&path).expect("load");
    assert_eq!(config.watch_root, std::path::PathBuf::from("/srv/outbox"));
    assert_eq!(config.watch_mode, WatchMode::Poll);
    assert_eq!(config.poll_interval(), Duration::from_millis(250));
    assert_eq!(config.remote.map(|a| a.port()), Some(9000));
    assert_eq!(config.max_sessions, 10);
    assert_eq!(config.queue_capacity, 100);
}

#[test]
fn yaml_roundtrip() {
    let mut config = SyncConfig::new("/srv/outbox");
    config.max_sessions = 4;
    config.status_file = Some("/run/dirsync/status.json".into());
    let yaml = config.to_yaml().expect("serialize");

    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, &yaml);
    let loaded = SyncConfig::load(&path).expect("load");
    assert_eq!(loaded, config);
}

#[test]
fn unknown_field_is_a_parse_error_with_path() {
    let dir = TempDir::new().expect("tempdir");
    let path = write_config(&dir, "watch_root: /a\nmax_clients: 3\n");
    let err = SyncConfig::load(&path).unwrap_err();
    match err {
        CoreError::ConfigParse { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_file_is_io_error() {
    let dir = TempDir::new().expect("tempdir");
    let err = SyncConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, CoreError::Io { .. }));
}

#[rstest]
#[case::zero_capacity(|c: &mut SyncConfig| c.queue_capacity = 0)]
#[case::zero_sessions(|c: &mut SyncConfig| c.max_sessions = 0)]
#[case::zero_backlog(|c: &mut SyncConfig| c.backlog = 0)]
#[case::zero_tick(|c: &mut SyncConfig| c.tick_ms = 0)]
#[case::serve_equals_watch(|c: &mut SyncConfig| c.serve_root = c.watch_root.clone())]
fn validation_rejects(#[case] mutate: fn(&mut SyncConfig)) {
    let mut config = SyncConfig::new("/srv/outbox");
    mutate(&mut config);
    assert!(matches!(
        config.validate(),
        Err(CoreError::InvalidConfig(_))
    ));
}

#[test]
fn serve_root_equal_after_canonicalization_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let watch = dir.path().join("box");
    fs::create_dir_all(&watch).expect("mkdir");
    let mut config = SyncConfig::new(&watch);
    config.serve_root = dir.path().join("box").join(".");
    assert!(config.validate().is_err());
}
