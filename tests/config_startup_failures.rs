use std::time::Duration;

use clap::Parser;
use porthole::{ApplicationConfig, entrypoint};
use tokio::{net::TcpListener, time::timeout};

fn config_args(extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "porthole".to_string(),
        "--base-domain=foobar.tld".to_string(),
        "--listen-address=127.0.0.1".to_string(),
        "--ssh-port=18622".to_string(),
        "--http-port=18680".to_string(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fails_on_missing_users_file() {
    let config = ApplicationConfig::parse_from(config_args(&[
        "--host-key",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_key"),
        "--users-file=does/not/exist.json",
    ]));
    let result = timeout(Duration::from_secs(5), entrypoint(config))
        .await
        .expect("entrypoint should fail promptly");
    assert!(result.is_err(), "missing users file should be fatal");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fails_on_unparseable_users_file() {
    let config = ApplicationConfig::parse_from(config_args(&[
        "--host-key",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_key"),
        "--users-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/users_invalid.json"),
    ]));
    let result = timeout(Duration::from_secs(5), entrypoint(config))
        .await
        .expect("entrypoint should fail promptly");
    assert!(result.is_err(), "unparseable users file should be fatal");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fails_on_unreadable_host_key() {
    let config = ApplicationConfig::parse_from(config_args(&[
        "--host-key",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data"),
    ]));
    let result = timeout(Duration::from_secs(5), entrypoint(config))
        .await
        .expect("entrypoint should fail promptly");
    assert!(result.is_err(), "unreadable host key should be fatal");
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn fails_on_occupied_listen_port() {
    let _occupied = TcpListener::bind("127.0.0.1:18680")
        .await
        .expect("failed to occupy port");
    let config = ApplicationConfig::parse_from(config_args(&[
        "--host-key",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_key"),
    ]));
    let result = timeout(Duration::from_secs(5), entrypoint(config))
        .await
        .expect("entrypoint should fail promptly");
    assert!(result.is_err(), "occupied HTTP port should be fatal");
}

#[test]
fn rejects_missing_base_domain() {
    assert!(
        ApplicationConfig::try_parse_from(["porthole", "--ssh-port=18622"]).is_err(),
        "base domain should be required"
    );
}
