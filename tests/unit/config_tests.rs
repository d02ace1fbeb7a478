//! Configuration parsing and overlay precedence.

use std::collections::HashMap;
use std::path::PathBuf;

use mcp_bridge::config::{GlobalConfig, MCP_ENV_VARS_ENV, PORT_ENV};
use mcp_bridge::AppError;
use serial_test::serial;

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn empty_file_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults");
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 6277);
    assert_eq!(config.max_port_probes, 100);
    assert!(config.default_environment.is_empty());
    assert!(config.default_command.is_empty());
    assert_eq!(config.log_dir, PathBuf::from(".mcp-bridge").join("logs"));
    assert!(!config.process.duplex);
    assert_eq!(config.process.kill_grace_ms, 2000);
    assert_eq!(config, GlobalConfig::default());
}

#[test]
fn full_file_parses() {
    let config = GlobalConfig::from_toml_str(
        r#"
host = "0.0.0.0"
port = 7000
max_port_probes = 5
default_command = "npx"
default_args = ["-y", "@modelcontextprotocol/server-everything"]
log_dir = "/tmp/bridge-logs"

[default_environment]
API_BASE = "http://localhost:9000"

[process]
duplex = true
kill_grace_ms = 250
"#,
    )
    .expect("valid config");

    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 7000);
    assert_eq!(config.max_port_probes, 5);
    assert_eq!(config.default_command, "npx");
    assert_eq!(config.default_args.len(), 2);
    assert_eq!(config.default_environment["API_BASE"], "http://localhost:9000");
    assert!(config.process.duplex);
    assert_eq!(config.process.kill_grace_ms, 250);
}

#[test]
fn malformed_toml_is_a_config_error() {
    let err = GlobalConfig::from_toml_str("port = \"not a number\"").expect_err("invalid");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_probe_budget_is_rejected() {
    let err = GlobalConfig::from_toml_str("max_port_probes = 0").expect_err("invalid");
    assert!(err.to_string().contains("max_port_probes"));
}

#[test]
fn empty_host_is_rejected() {
    assert!(GlobalConfig::from_toml_str("host = \"  \"").is_err());
}

#[test]
fn port_env_overrides_file() {
    let mut config = GlobalConfig::from_toml_str("port = 7000").expect("config");
    config
        .apply_env_from(lookup(&[(PORT_ENV, "7123")]))
        .expect("overlay");
    assert_eq!(config.port, 7123);
}

#[test]
fn invalid_port_env_is_rejected() {
    let mut config = GlobalConfig::default();
    let err = config
        .apply_env_from(lookup(&[(PORT_ENV, "seventy")]))
        .expect_err("invalid port");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn mcp_env_vars_extend_and_override_file_defaults() {
    let mut config = GlobalConfig::from_toml_str(
        "[default_environment]\nKEEP = \"file\"\nSHARED = \"file\"\n",
    )
    .expect("config");
    config
        .apply_env_from(lookup(&[(MCP_ENV_VARS_ENV, r#"{"SHARED":"env","NEW":"env"}"#)]))
        .expect("overlay");

    assert_eq!(config.default_environment["KEEP"], "file");
    assert_eq!(config.default_environment["SHARED"], "env");
    assert_eq!(config.default_environment["NEW"], "env");
}

#[test]
fn mcp_env_vars_must_be_an_object_of_strings() {
    let mut config = GlobalConfig::default();
    assert!(config
        .apply_env_from(lookup(&[(MCP_ENV_VARS_ENV, "[1,2,3]")]))
        .is_err());
    assert!(config
        .apply_env_from(lookup(&[(MCP_ENV_VARS_ENV, r#"{"N":1}"#)]))
        .is_err());
}

#[test]
fn env_pairs_apply_last_and_validate_shape() {
    let mut config = GlobalConfig::default();
    config
        .apply_env_pairs(&["A=1", "B=x=y", "A=2"])
        .expect("pairs");
    assert_eq!(config.default_environment["A"], "2");
    assert_eq!(config.default_environment["B"], "x=y");

    assert!(config.apply_env_pairs(&["NOEQUALS"]).is_err());
    assert!(config.apply_env_pairs(&["=value"]).is_err());
}

#[test]
#[serial]
fn merged_environment_layers_defaults_over_inherited() {
    std::env::set_var("MCP_BRIDGE_SECRET_FOR_TEST", "leak");
    let mut config = GlobalConfig::default();
    config
        .default_environment
        .insert("EXTRA".into(), "1".into());

    let merged = config.merged_environment();
    std::env::remove_var("MCP_BRIDGE_SECRET_FOR_TEST");

    assert_eq!(merged["EXTRA"], "1");
    if let Ok(path) = std::env::var("PATH") {
        assert_eq!(merged["PATH"], path);
    }
    assert!(!merged.contains_key("MCP_BRIDGE_SECRET_FOR_TEST"));
}

#[test]
#[serial]
fn apply_env_reads_process_environment() {
    std::env::set_var(PORT_ENV, "7345");
    std::env::set_var(MCP_ENV_VARS_ENV, r#"{"FROM_ENV":"yes"}"#);

    let mut config = GlobalConfig::default();
    let result = config.apply_env();

    std::env::remove_var(PORT_ENV);
    std::env::remove_var(MCP_ENV_VARS_ENV);

    result.expect("overlay");
    assert_eq!(config.port, 7345);
    assert_eq!(config.default_environment["FROM_ENV"], "yes");
}

#[test]
fn load_from_missing_path_is_a_config_error() {
    let err = GlobalConfig::load_from_path("/definitely/not/here.toml").expect_err("missing");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "port = 9100\n").expect("write");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.port, 9100);
}
