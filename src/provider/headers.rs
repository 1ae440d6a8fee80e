//! # 上游请求头组装
//!
//! 根据 {平台, 凭证类型, 模型级别, 是否携带工具} 查表得到请求头。
//! OAuth 凭证绑定官方 CLI 客户端，必须始终携带该客户端完整的身份指纹。

use super::models::ModelRegistry;
use crate::error::{ProxyError, Result};
use crate::types::{AccountKind, Credential, Platform};
use reqwest::header::{
    AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};

/// Anthropic API 版本
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// OAuth 授权范围标记
pub const BETA_OAUTH: &str = "oauth-2025-04-20";
/// 官方 CLI 客户端标记
pub const BETA_CLAUDE_CODE: &str = "claude-code-20250219";
/// 交错思考
pub const BETA_INTERLEAVED_THINKING: &str = "interleaved-thinking-2025-05-14";
/// 工具参数流式输出
pub const BETA_FINE_GRAINED_TOOL_STREAMING: &str = "fine-grained-tool-streaming-2025-05-14";
/// token 计数
pub const BETA_TOKEN_COUNTING: &str = "token-counting-2024-11-01";

/// OAuth 请求使用的 CLI 身份
const CLI_IDENTITY: [(&str, &str); 11] = [
    ("x-stainless-lang", "js"),
    ("x-stainless-package-version", "0.52.0"),
    ("x-stainless-os", "Linux"),
    ("x-stainless-arch", "x64"),
    ("x-stainless-runtime", "node"),
    ("x-stainless-runtime-version", "v22.14.0"),
    ("x-stainless-retry-count", "0"),
    ("x-stainless-timeout", "60"),
    ("x-app", "cli"),
    ("anthropic-dangerous-direct-browser-access", "true"),
    ("user-agent", CLI_USER_AGENT),
];

/// CLI 客户端 User-Agent
pub const CLI_USER_AGENT: &str = "claude-cli/2.0.62 (external, cli)";

/// 预先计算好的 beta 组合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaProfile {
    /// API Key + haiku 模型
    ApiKeyHaiku,
    /// API Key
    ApiKey,
    /// OAuth，无工具
    OAuth,
    /// OAuth，带工具
    OAuthWithTools,
    /// API Key 计数
    ApiKeyCountTokens,
    /// OAuth 计数
    OAuthCountTokens,
}

impl BetaProfile {
    /// 该组合包含的 beta 标记
    #[must_use]
    pub const fn flags(&self) -> &'static [&'static str] {
        match self {
            Self::ApiKeyHaiku => &[BETA_INTERLEAVED_THINKING],
            Self::ApiKey => &[
                BETA_CLAUDE_CODE,
                BETA_INTERLEAVED_THINKING,
                BETA_FINE_GRAINED_TOOL_STREAMING,
            ],
            Self::OAuth => &[BETA_CLAUDE_CODE, BETA_OAUTH, BETA_INTERLEAVED_THINKING],
            Self::OAuthWithTools => &[
                BETA_CLAUDE_CODE,
                BETA_OAUTH,
                BETA_INTERLEAVED_THINKING,
                BETA_FINE_GRAINED_TOOL_STREAMING,
            ],
            Self::ApiKeyCountTokens => &[
                BETA_CLAUDE_CODE,
                BETA_INTERLEAVED_THINKING,
                BETA_TOKEN_COUNTING,
            ],
            Self::OAuthCountTokens => &[
                BETA_CLAUDE_CODE,
                BETA_OAUTH,
                BETA_INTERLEAVED_THINKING,
                BETA_TOKEN_COUNTING,
            ],
        }
    }

    /// 消息请求的组合选择
    #[must_use]
    pub fn for_messages(kind: AccountKind, model: &str, has_tools: bool) -> Self {
        match kind {
            AccountKind::ApiKey if ModelRegistry::is_haiku(model) => Self::ApiKeyHaiku,
            AccountKind::ApiKey => Self::ApiKey,
            AccountKind::OAuthSession if has_tools => Self::OAuthWithTools,
            AccountKind::OAuthSession => Self::OAuth,
        }
    }

    /// 计数请求的组合选择
    #[must_use]
    pub const fn for_count_tokens(kind: AccountKind) -> Self {
        match kind {
            AccountKind::ApiKey => Self::ApiKeyCountTokens,
            AccountKind::OAuthSession => Self::OAuthCountTokens,
        }
    }

    /// `anthropic-beta` 头的取值
    #[must_use]
    pub fn header_value(&self) -> String {
        self.flags().join(",")
    }
}

/// 上游调用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// 创建消息
    Messages,
    /// 计数
    CountTokens,
}

/// 请求头组装器
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderComposer;

impl HeaderComposer {
    /// 组装消息请求的协议头
    pub fn compose(
        platform: Platform,
        kind: AccountKind,
        model: &str,
        has_tools: bool,
    ) -> Result<HeaderMap> {
        Self::compose_for(platform, kind, CallKind::Messages, model, has_tools)
    }

    /// 组装指定调用类型的协议头
    pub fn compose_for(
        platform: Platform,
        kind: AccountKind,
        call: CallKind,
        model: &str,
        has_tools: bool,
    ) -> Result<HeaderMap> {
        if platform != Platform::Anthropic {
            return Err(ProxyError::UnsupportedProfile {
                platform: platform.to_string(),
                kind: kind.to_string(),
            });
        }

        let profile = match call {
            CallKind::Messages => BetaProfile::for_messages(kind, model, has_tools),
            CallKind::CountTokens => BetaProfile::for_count_tokens(kind),
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(
            HeaderName::from_static("anthropic-beta"),
            HeaderValue::from_str(&profile.header_value()).map_err(|e| {
                ProxyError::internal_with_source("无效的 anthropic-beta 头", e)
            })?,
        );

        if kind == AccountKind::OAuthSession {
            for (name, value) in CLI_IDENTITY {
                headers.insert(
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                );
            }
        } else {
            headers.insert(USER_AGENT, HeaderValue::from_static(concat!(
                "api-relay/",
                env!("CARGO_PKG_VERSION")
            )));
        }

        Ok(headers)
    }

    /// 凭证头：API Key 使用 `x-api-key`，OAuth 使用 Bearer
    pub fn credential_headers(credential: &Credential) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        match credential {
            Credential::ApiKey { api_key } => {
                let mut value = HeaderValue::from_str(api_key)
                    .map_err(|e| ProxyError::internal_with_source("API Key 含非法字符", e))?;
                value.set_sensitive(true);
                headers.insert(HeaderName::from_static("x-api-key"), value);
            }
            Credential::OAuth(tokens) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", tokens.access_token))
                    .map_err(|e| ProxyError::internal_with_source("访问令牌含非法字符", e))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn beta(headers: &HeaderMap) -> Vec<String> {
        headers
            .get("anthropic-beta")
            .unwrap()
            .to_str()
            .unwrap()
            .split(',')
            .map(str::to_string)
            .collect()
    }

    #[rstest]
    #[case::apikey_haiku(AccountKind::ApiKey, "claude-haiku-4-5-20251001", true, &[BETA_INTERLEAVED_THINKING])]
    #[case::apikey(AccountKind::ApiKey, "claude-sonnet-4-5", false, &[BETA_CLAUDE_CODE, BETA_INTERLEAVED_THINKING, BETA_FINE_GRAINED_TOOL_STREAMING])]
    #[case::oauth_no_tools(AccountKind::OAuthSession, "claude-haiku-4-5", false, &[BETA_CLAUDE_CODE, BETA_OAUTH, BETA_INTERLEAVED_THINKING])]
    #[case::oauth_tools(AccountKind::OAuthSession, "claude-opus-4-5", true, &[BETA_CLAUDE_CODE, BETA_OAUTH, BETA_INTERLEAVED_THINKING, BETA_FINE_GRAINED_TOOL_STREAMING])]
    fn test_profile_table(
        #[case] kind: AccountKind,
        #[case] model: &str,
        #[case] has_tools: bool,
        #[case] expected: &[&str],
    ) {
        let headers = HeaderComposer::compose(Platform::Anthropic, kind, model, has_tools).unwrap();
        assert_eq!(beta(&headers), expected);
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
    }

    #[test]
    fn test_api_key_never_carries_oauth_scope() {
        for model in ["claude-haiku-4-5", "claude-opus-4-5"] {
            for tools in [true, false] {
                let headers =
                    HeaderComposer::compose(Platform::Anthropic, AccountKind::ApiKey, model, tools)
                        .unwrap();
                assert!(!beta(&headers).contains(&BETA_OAUTH.to_string()));
                assert!(headers.get("x-stainless-lang").is_none());
            }
        }
    }

    #[test]
    fn test_oauth_fingerprint_is_complete() {
        let headers = HeaderComposer::compose(
            Platform::Anthropic,
            AccountKind::OAuthSession,
            "claude-haiku-4-5",
            false,
        )
        .unwrap();
        assert_eq!(headers.get(USER_AGENT).unwrap(), CLI_USER_AGENT);
        assert_eq!(headers.get("x-app").unwrap(), "cli");
        assert_eq!(headers.get("x-stainless-package-version").unwrap(), "0.52.0");
    }

    #[test]
    fn test_count_tokens_profile_is_wider() {
        let headers = HeaderComposer::compose_for(
            Platform::Anthropic,
            AccountKind::OAuthSession,
            CallKind::CountTokens,
            "claude-sonnet-4-5",
            false,
        )
        .unwrap();
        assert!(beta(&headers).contains(&BETA_TOKEN_COUNTING.to_string()));
        assert!(beta(&headers).contains(&BETA_OAUTH.to_string()));
    }

    #[test]
    fn test_unknown_platform_fails_loudly() {
        let result = HeaderComposer::compose(Platform::Gemini, AccountKind::ApiKey, "m", false);
        assert!(matches!(result, Err(ProxyError::UnsupportedProfile { .. })));
    }

    #[test]
    fn test_credential_headers() {
        let api = HeaderComposer::credential_headers(&Credential::ApiKey {
            api_key: "sk-ant-1".to_string(),
        })
        .unwrap();
        assert_eq!(api.get("x-api-key").unwrap(), "sk-ant-1");
        assert!(api.get("x-api-key").unwrap().is_sensitive());

        let oauth = HeaderComposer::credential_headers(&Credential::OAuth(
            crate::types::OAuthTokens {
                access_token: "at".to_string(),
                refresh_token: None,
                expires_at: chrono::Utc::now(),
                scope: None,
            },
        ))
        .unwrap();
        assert_eq!(oauth.get(AUTHORIZATION).unwrap(), "Bearer at");
    }
}
