use super::*;

#[test]
fn defaults_are_sane() {
    let config = GatewayConfig::default();
    assert_eq!(config.llm.max_recursion_depth, 3);
    assert_eq!(config.proxy.port, 3010);
    assert_eq!(config.proxy.subprocess_timeout_secs, 120);
    assert_eq!(config.polling.max_concurrent_tasks, 5);
    assert_eq!(config.polling.cleanup_after_hours, 24);
    assert!(config.circuit_breaker.is_none());
    assert!(config.llm.json_mode_instruction.contains("JSON"));
}

#[test]
fn toml_file_overrides_defaults() {
    let raw = r#"
        [proxy]
        host = "0.0.0.0"
        port = 8099
        cliPath = "/opt/bin/llm"

        [polling]
        maxConcurrentTasks = 2

        [circuitBreaker]
        failureThreshold = 7
    "#;
    let config: GatewayConfig = toml::from_str(raw).unwrap();
    assert_eq!(config.proxy.host, "0.0.0.0");
    assert_eq!(config.proxy.port, 8099);
    assert_eq!(config.proxy.cli_path, PathBuf::from("/opt/bin/llm"));
    assert_eq!(config.polling.max_concurrent_tasks, 2);
    assert_eq!(config.circuit_breaker.unwrap().failure_threshold, 7);
    // Untouched sections keep defaults
    assert_eq!(config.llm.default_temperature, 0.7);
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let config = GatewayConfig::load(Some(Path::new("/nonexistent/modelgate.toml"))).unwrap();
    assert_eq!(config.proxy.port, 3010);
}

#[test]
fn proxy_base_url_includes_v1() {
    let config = ProxyConfig::default();
    assert_eq!(config.base_url(), "http://127.0.0.1:3010/v1");
}

#[test]
fn provider_keys_debug_redacts_secrets() {
    let keys = ProviderKeys {
        openai_api_key: Some("sk-secret".into()),
        anthropic_api_key: None,
        vertex_project: Some("proj".into()),
        vertex_location: None,
    };
    let debug = format!("{keys:?}");
    assert!(!debug.contains("sk-secret"));
    assert!(debug.contains("[REDACTED]"));
    assert!(debug.contains("proj"));
}
