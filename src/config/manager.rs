//! # 配置管理器
//!
//! 统一的配置管理接口，支持环境变量覆盖与手动重载

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::AppConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, linfo, lwarn};

/// 环境变量前缀
const ENV_PREFIX: &str = "API_RELAY_";
/// 支持环境变量覆盖的配置段
const ENV_SECTIONS: [&str; 4] = ["SERVER", "GATEWAY", "RATE_LIMIT", "OAUTH"];

/// 配置管理器
pub struct ConfigManager {
    /// 配置文件路径
    path: PathBuf,
    /// 当前配置
    config: Arc<RwLock<AppConfig>>,
    /// 环境变量覆盖映射
    env_overrides: HashMap<String, String>,
}

impl ConfigManager {
    /// 创建配置管理器
    pub fn new() -> Result<Self> {
        Self::from_file(Self::default_path())
    }

    /// 默认配置文件路径
    #[must_use]
    pub fn default_path() -> PathBuf {
        // 优先使用环境变量指定的配置文件路径
        if let Ok(path) = env::var("API_RELAY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        PathBuf::from(format!("config/config.{env}.toml"))
    }

    /// 从指定文件创建配置管理器
    pub fn from_file(config_path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_with_overrides(config_path, Self::build_env_overrides(env::vars()))
    }

    /// 从指定文件和覆盖映射创建配置管理器
    pub fn from_file_with_overrides(
        config_path: impl AsRef<Path>,
        env_overrides: HashMap<String, String>,
    ) -> Result<Self> {
        let path = config_path.as_ref().to_path_buf();
        let config = Self::load(&path, &env_overrides)?;

        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "config_loaded",
            "配置管理器初始化完成",
            path = %path.display(),
            overrides = env_overrides.len(),
            accounts = config.seed.accounts.len(),
            rules = config.seed.passthrough_rules.len()
        );

        Ok(Self {
            path,
            config: Arc::new(RwLock::new(config)),
            env_overrides,
        })
    }

    /// 获取当前配置
    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// 共享的配置句柄
    #[must_use]
    pub fn shared(&self) -> Arc<RwLock<AppConfig>> {
        Arc::clone(&self.config)
    }

    /// 手动重载配置，失败时保留旧配置
    pub async fn reload(&self) -> Result<AppConfig> {
        match Self::load(&self.path, &self.env_overrides) {
            Ok(config) => {
                *self.config.write().await = config.clone();
                linfo!(
                    "system",
                    LogStage::Configuration,
                    LogComponent::Config,
                    "config_reloaded",
                    "手动重载配置成功"
                );
                Ok(config)
            }
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Configuration,
                    LogComponent::Config,
                    "config_reload_failed",
                    "配置重载失败，保留当前配置",
                    error = %e
                );
                Err(e)
            }
        }
    }

    fn load(path: &Path, overrides: &HashMap<String, String>) -> Result<AppConfig> {
        let mut config = Self::load_config_file(path)?;
        Self::apply_env_overrides(&mut config, overrides)?;
        config
            .validate()
            .map_err(|e| crate::config_error!("配置校验失败: {}", e))?;
        Ok(config)
    }

    /// 加载配置文件
    fn load_config_file(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            return Err(crate::config_error!("配置文件不存在: {}", path.display()));
        }

        let config_content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
        })?;

        toml::from_str(&config_content).map_err(|e| {
            ProxyError::config_with_source(
                format!("TOML解析失败 - 配置文件: {}, 详细错误: {e}", path.display()),
                e,
            )
        })
    }

    /// 构建环境变量覆盖映射
    ///
    /// `API_RELAY_SERVER_PORT` 映射为 `server.port`。
    pub fn build_env_overrides(
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> HashMap<String, String> {
        let overrides: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let config_key = key.strip_prefix(ENV_PREFIX)?;
                let (section, field) = ENV_SECTIONS.iter().find_map(|section| {
                    config_key
                        .strip_prefix(section)
                        .and_then(|rest| rest.strip_prefix('_'))
                        .map(|field| (*section, field))
                })?;
                Some((
                    format!("{}.{}", section.to_lowercase(), field.to_lowercase()),
                    value,
                ))
            })
            .collect();

        ldebug!(
            "system",
            LogStage::Configuration,
            LogComponent::Config,
            "env_overrides",
            "发现环境变量覆盖",
            count = overrides.len()
        );
        overrides
    }

    /// 应用环境变量覆盖
    fn apply_env_overrides(
        config: &mut AppConfig,
        overrides: &HashMap<String, String>,
    ) -> Result<()> {
        for (path, value) in overrides {
            let shown = if path.contains("token") || path.contains("key") {
                "***"
            } else {
                value.as_str()
            };
            ldebug!(
                "system",
                LogStage::Configuration,
                LogComponent::Config,
                "apply_override",
                "应用环境变量覆盖",
                path = %path,
                value = %shown
            );
            Self::apply_override_to_config(config, path, value)?;
        }
        Ok(())
    }

    /// 将环境变量覆盖应用到配置对象
    fn apply_override_to_config(config: &mut AppConfig, path: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(path: &str, value: &str) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value.parse().map_err(|e| {
                ProxyError::config_with_source(format!("无效的配置值 {path}={value}"), e)
            })
        }

        match path {
            "server.host" => config.server.host = value.to_string(),
            "server.port" => config.server.port = parse(path, value)?,
            "server.admin_token" => config.server.admin_token = Some(value.to_string()),
            "gateway.max_attempts" => config.gateway.max_attempts = parse(path, value)?,
            "rate_limit.default_cooldown_secs" => {
                config.rate_limit.default_cooldown_secs = parse(path, value)?;
            }
            "rate_limit.max_cooldown_secs" => {
                config.rate_limit.max_cooldown_secs = parse(path, value)?;
            }
            "oauth.client_id" => config.oauth.client_id = value.to_string(),
            "oauth.token_url" => config.oauth.token_url = value.to_string(),
            _ => {
                lwarn!(
                    "system",
                    LogStage::Configuration,
                    LogComponent::Config,
                    "unknown_override",
                    "未知的配置路径，忽略环境变量覆盖",
                    path = %path
                );
            }
        }

        Ok(())
    }
}
