// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use modelgate::config::GatewayConfig;
use modelgate::polling::PollingManager;
use modelgate::proxy::{build_router, ProxyState};
use tempfile::TempDir;

/// Write an executable shell script standing in for the external LLM binary.
pub fn fake_cli(dir: &TempDir, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("fake-cli");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Start a real proxy server on an ephemeral port, backed by a fake CLI.
/// Returns the gateway config pointing at the running server.
pub async fn spawn_proxy(dir: &TempDir, cli_body: &str) -> GatewayConfig {
    let workspace = dir.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();

    let mut config = GatewayConfig::default();
    config.proxy.cli_path = fake_cli(dir, cli_body);
    config.proxy.workspace_dir = workspace;
    config.proxy.subprocess_timeout_secs = 10;
    config.polling.db_path = dir.path().join("tasks.db");
    config.polling.poll_interval_ms = 10;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    config.proxy.host = addr.ip().to_string();
    config.proxy.port = addr.port();

    let polling = PollingManager::new(&config.polling).unwrap();
    let state = ProxyState::new(config.clone(), polling);
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    config
}
