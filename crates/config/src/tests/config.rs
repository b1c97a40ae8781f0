use camino::Utf8Path;
use tempdir::TempDir;

use super::*;

fn config_dir() -> TempDir {
    TempDir::new("tessera-config").unwrap()
}

fn utf8(dir: &TempDir) -> &Utf8Path {
    Utf8Path::from_path(dir.path()).unwrap()
}

#[test]
fn save_then_load_round_trips() {
    let dir = config_dir();
    let dir = utf8(&dir);

    let mut config = ConfigFile::default();
    config.ring.ring_capacity_bound = 7;
    config.sync.bucket_count = 32;

    assert!(!ConfigFile::exists(dir));
    config.save(dir).unwrap();
    assert!(ConfigFile::exists(dir));

    let loaded = ConfigFile::load(dir).unwrap();
    assert_eq!(loaded.ring.ring_capacity_bound, 7);
    assert_eq!(
        loaded.ring.node_capacity_bound,
        config.ring.node_capacity_bound
    );
    assert_eq!(loaded.sync.bucket_count, 32);
}

#[test]
fn empty_file_yields_defaults() {
    let dir = config_dir();
    let dir = utf8(&dir);
    std::fs::write(dir.join(CONFIG_FILE), "").unwrap();

    let loaded = ConfigFile::load(dir).unwrap();
    let defaults = ConfigFile::default();
    assert_eq!(
        loaded.ring.ring_capacity_bound,
        defaults.ring.ring_capacity_bound
    );
    assert_eq!(loaded.sync.bucket_count, defaults.sync.bucket_count);
}

#[test]
fn partial_section_fills_in_defaults() {
    let dir = config_dir();
    let dir = utf8(&dir);
    std::fs::write(dir.join(CONFIG_FILE), "[ring]\nring_capacity_bound = 3\n").unwrap();

    let loaded = ConfigFile::load(dir).unwrap();
    assert_eq!(loaded.ring.ring_capacity_bound, 3);
    assert_eq!(
        loaded.ring.node_capacity_bound,
        RingConfig::default().node_capacity_bound
    );
    assert_eq!(
        loaded.sync.bucket_count,
        TreeConfig::default().bucket_count
    );
}

#[test]
fn unknown_keys_are_rejected() {
    let dir = config_dir();
    let dir = utf8(&dir);
    std::fs::write(dir.join(CONFIG_FILE), "[ring]\nmystery_knob = 1\n").unwrap();

    assert!(ConfigFile::load(dir).is_err());
}

#[test]
fn missing_file_is_an_error() {
    let dir = config_dir();
    assert!(ConfigFile::load(utf8(&dir)).is_err());
}
