//! Configuration layering: defaults < file < environment < command line

use serial_test::serial;
use std::env;
use std::fs;
use std::net::SocketAddr;
use tempfile::TempDir;

use cipher_relay_local::config::{ConfigLoader, ConfigOverrides, ConfigValidator, RelayConfig};
use cipher_relay_local::crypto::CipherKind;
use cipher_relay_local::ProxyError;

const ENV_KEYS: &[&str] = &[
    "CIPHER_RELAY_HTTP_LISTEN",
    "CIPHER_RELAY_RELAY_SERVER",
    "CIPHER_RELAY_PASSWORD",
    "CIPHER_RELAY_BUFFER_SIZE",
    "CIPHER_RELAY_LOG_LEVEL",
];

fn clear_env() {
    for key in ENV_KEYS {
        env::remove_var(key);
    }
}

fn write_config(dir: &TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("relay.json");
    fs::write(&path, content).expect("Failed to write config file");
    path
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"{
            "relay_server": "relay.example.com:9443",
            "password": "from-file",
            "cipher": "aes-128-ctr",
            "buffer_size": 16384
        }"#,
    );

    let config = RelayConfig::load(Some(path.as_path())).unwrap();

    assert_eq!(config.relay_server, "relay.example.com:9443");
    assert_eq!(config.password, "from-file");
    assert_eq!(config.cipher, CipherKind::Aes128Ctr);
    assert_eq!(config.buffer_size, 16384);
    // Untouched keys keep their defaults
    assert_eq!(config.http_listen, RelayConfig::default().http_listen);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"{ "password": "from-file", "buffer_size": 16384, "log_level": "warn" }"#,
    );

    env::set_var("CIPHER_RELAY_PASSWORD", "from-env");
    env::set_var("CIPHER_RELAY_BUFFER_SIZE", "32768");
    env::set_var("CIPHER_RELAY_HTTP_LISTEN", "127.0.0.1:18080");

    let config = RelayConfig::load(Some(path.as_path()));
    clear_env();
    let config = config.unwrap();

    assert_eq!(config.password, "from-env");
    assert_eq!(config.buffer_size, 32768);
    assert_eq!(config.http_listen, "127.0.0.1:18080".parse::<SocketAddr>().unwrap());
    assert_eq!(config.log_level, "warn");
}

#[test]
#[serial]
fn test_command_line_overrides_environment() {
    clear_env();
    env::set_var("CIPHER_RELAY_RELAY_SERVER", "env.example.com:9000");
    env::set_var("CIPHER_RELAY_LOG_LEVEL", "debug");

    let config = RelayConfig::load(None);
    clear_env();
    let mut config = config.unwrap();
    assert_eq!(config.relay_server, "env.example.com:9000");

    config.apply_overrides(ConfigOverrides {
        relay_server: Some("cli.example.com:9001".to_string()),
        password: Some("from-cli".to_string()),
        ..Default::default()
    });

    assert_eq!(config.relay_server, "cli.example.com:9001");
    assert_eq!(config.password, "from-cli");
    // Not given on the command line, so the environment value stands
    assert_eq!(config.log_level, "debug");
}

#[test]
#[serial]
fn test_from_file_ignores_environment() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, r#"{ "password": "from-file" }"#);
    env::set_var("CIPHER_RELAY_PASSWORD", "from-env");

    let config = RelayConfig::from_file(&path);
    clear_env();

    assert_eq!(config.unwrap().password, "from-file");
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    clear_env();
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent.json");

    assert!(matches!(RelayConfig::load(Some(missing.as_path())), Err(ProxyError::Config(_))));
}

#[test]
#[serial]
fn test_invalid_file_values_are_rejected() {
    clear_env();
    let dir = TempDir::new().unwrap();

    let path = write_config(&dir, r#"{ "cipher": "rc4" }"#);
    assert!(matches!(RelayConfig::load(Some(path.as_path())), Err(ProxyError::Config(_))));

    let path = write_config(&dir, r#"{ "password": "x", "buffer_size": 16 }"#);
    let config = RelayConfig::load(Some(path.as_path())).unwrap();
    assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
}
