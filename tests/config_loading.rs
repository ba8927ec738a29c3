use std::io::Write;
use std::path::Path;
use std::time::Duration;

use plexus_core::config::{AppConfig, CacheScope, TransportMode};
use plexus_core::PlexusError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[storage]
database_path = "/var/lib/plexus/ledger.db"
artifacts_path = "/var/lib/plexus/artifacts"

[executor]
node_timeout_secs = 10
terminal_node = "final"
cache_scope = "global"

[transport]
mode = "stdio"
call_timeout_secs = 15
manifest_timeout_secs = 2

[transport.workers.srv_table]
command = "python3"
args = ["-m", "table_server"]
env = { PYTHONUNBUFFERED = "1" }

[servers]
data_dir = "/srv/data"
tracking_path = "/srv/data/tracking.json"
table_path = "orders.csv"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.database_path(), Path::new("/var/lib/plexus/ledger.db"));
    assert_eq!(config.artifacts_path(), Path::new("/var/lib/plexus/artifacts"));

    assert_eq!(config.executor.node_timeout(), Duration::from_secs(10));
    assert_eq!(config.executor.terminal_node, "final");
    assert_eq!(config.executor.cache_scope, CacheScope::Global);

    assert_eq!(config.transport.mode, TransportMode::Stdio);
    assert_eq!(config.transport.call_timeout(), Duration::from_secs(15));
    assert_eq!(config.transport.manifest_timeout(), Duration::from_secs(2));
    let worker = &config.transport.workers["srv_table"];
    assert_eq!(worker.command, "python3");
    assert_eq!(worker.args, vec!["-m", "table_server"]);
    assert_eq!(worker.env["PYTHONUNBUFFERED"], "1");

    assert_eq!(config.servers.data_dir, "/srv/data");
    assert_eq!(config.servers.table_path.as_deref(), Some("orders.csv"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("PLEXUS_TEST_DATA_ROOT", "/mnt/shared");

    let toml_content = r#"
[servers]
data_dir = "${PLEXUS_TEST_DATA_ROOT}/inputs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.servers.data_dir, "/mnt/shared/inputs");

    std::env::remove_var("PLEXUS_TEST_DATA_ROOT");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[executor]
node_timeout_secs = 5
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.executor.node_timeout_secs, 5);
    assert_eq!(config.executor.terminal_node, "reduce");
    assert_eq!(config.executor.cache_scope, CacheScope::Off);
    assert_eq!(config.storage.database_path, "./plexus.db");
    assert_eq!(config.storage.artifacts_path, "./artifacts");
    assert_eq!(config.transport.mode, TransportMode::Direct);
    assert_eq!(config.transport.call_timeout_secs, 30);
    assert!(config.transport.workers.is_empty());
    assert!(config.servers.table_path.is_none());
}

#[test]
fn test_invalid_values_rejected() {
    let toml_content = r#"
[executor]
cache_scope = "forever"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    assert!(matches!(AppConfig::load(tmp.path()), Err(PlexusError::Config(_))));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("absent.toml");

    assert!(matches!(AppConfig::load(&path), Err(PlexusError::ConfigNotFound(_))));

    let config = AppConfig::load_or_default(&path).expect("defaults");
    assert_eq!(config.executor.node_timeout_secs, 30);
}
