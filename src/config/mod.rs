//! # 配置管理模块
//!
//! 处理应用配置加载、验证和管理

mod app_config;
mod manager;

pub use app_config::{
    AppConfig, ClientKeyConfig, GatewayConfig, OAuthConfig, RateLimitConfig, SeedConfig,
    ServerConfig,
};
pub use manager::ConfigManager;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
host = "127.0.0.1"
port = 9100
admin_token = "admin-secret"

[gateway]
max_attempts = 2

[[clients]]
key = "client-key-1"
name = "alice"
group_id = 7

[[seed.accounts]]
id = "acc-1"
platform = "anthropic"
kind = "apikey"
credential = { type = "api_key", api_key = "sk-ant-1" }

[[seed.passthrough_rules]]
id = 1
name = "busy"
priority = 1
keywords = ["overloaded"]
match_mode = "any"
passthrough_code = false
response_code = 503
passthrough_body = false
custom_message = "Upstream busy"
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample_with_defaults() {
        let file = write_config(SAMPLE);
        let manager = ConfigManager::from_file_with_overrides(file.path(), HashMap::new()).unwrap();
        let config = manager.shared();
        let config = config.try_read().unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.gateway.max_attempts, 2);
        assert_eq!(config.gateway.error_body_limit, 64 * 1024);
        assert_eq!(config.rate_limit.default_cooldown_secs, 60);
        assert_eq!(config.clients[0].group_id, Some(7));
        assert_eq!(config.seed.accounts.len(), 1);
        assert_eq!(config.seed.passthrough_rules[0].custom_message.as_deref(), Some("Upstream busy"));
    }

    #[test]
    fn test_env_overrides_applied() {
        let file = write_config(SAMPLE);
        let overrides = ConfigManager::build_env_overrides(vec![
            ("API_RELAY_SERVER_PORT".to_string(), "9200".to_string()),
            ("API_RELAY_RATE_LIMIT_DEFAULT_COOLDOWN_SECS".to_string(), "30".to_string()),
            ("API_RELAY_CONFIG_PATH".to_string(), "ignored.toml".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        assert_eq!(overrides.len(), 2);

        let manager = ConfigManager::from_file_with_overrides(file.path(), overrides).unwrap();
        let config = manager.shared();
        let config = config.try_read().unwrap();
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.rate_limit.default_cooldown_secs, 30);
    }

    #[test]
    fn test_invalid_override_value_is_config_error() {
        let file = write_config(SAMPLE);
        let overrides = HashMap::from([("server.port".to_string(), "not-a-port".to_string())]);
        let result = ConfigManager::from_file_with_overrides(file.path(), overrides);
        assert!(matches!(result, Err(crate::error::ProxyError::Config { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigManager::from_file_with_overrides("/nonexistent/relay.toml", HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_client_keys() {
        let mut config = AppConfig::default();
        for name in ["a", "b"] {
            config.clients.push(ClientKeyConfig {
                key: "same".to_string(),
                name: name.to_string(),
                group_id: None,
                enabled: true,
            });
        }
        assert!(config.validate().unwrap_err().contains("duplicate client key"));
    }

    #[test]
    fn test_validate_cooldown_bounds() {
        let mut config = AppConfig::default();
        config.rate_limit.max_cooldown_secs = 10;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_reload_keeps_old_config_on_error() {
        let file = write_config(SAMPLE);
        let manager = ConfigManager::from_file_with_overrides(file.path(), HashMap::new()).unwrap();

        std::fs::write(file.path(), "server = [broken").unwrap();
        assert!(manager.reload().await.is_err());
        assert_eq!(manager.get_config().await.server.port, 9100);
    }
}
