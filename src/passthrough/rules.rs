//! # 错误透传规则
//!
//! 规则由三类固定谓词组成（状态码集合、关键字集合、平台集合），
//! 通过 `any` / `all` 组合。

use crate::types::Platform;
use serde::{Deserialize, Serialize};

/// 谓词组合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// 任一已配置谓词成立即匹配
    #[default]
    Any,
    /// 全部已配置谓词成立才匹配
    All,
}

/// 错误透传规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPassthroughRule {
    /// 规则ID，新建时由存储分配
    #[serde(default)]
    pub id: i64,
    /// 规则名称
    pub name: String,
    /// 是否启用
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 优先级，数值越小越先评估
    #[serde(default)]
    pub priority: i32,
    /// 上游状态码集合
    #[serde(default)]
    pub error_codes: Vec<u16>,
    /// 上游响应体关键字（大小写不敏感）
    #[serde(default)]
    pub keywords: Vec<String>,
    /// 组合方式
    #[serde(default)]
    pub match_mode: MatchMode,
    /// 限定平台，空表示全部
    #[serde(default)]
    pub platforms: Vec<Platform>,
    /// 是否原样返回上游状态码
    #[serde(default)]
    pub passthrough_code: bool,
    /// 覆盖状态码，为空时沿用上游状态码
    #[serde(default)]
    pub response_code: Option<u16>,
    /// 是否原样返回上游响应体
    #[serde(default)]
    pub passthrough_body: bool,
    /// 不透传响应体时返回的消息
    #[serde(default)]
    pub custom_message: Option<String>,
    /// 备注
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

const fn default_enabled() -> bool {
    true
}

/// 一次上游失败，供规则匹配
#[derive(Debug, Clone)]
pub struct UpstreamFailure<'a> {
    /// 上游状态码
    pub status: u16,
    /// 上游响应体
    pub body: &'a [u8],
    /// 账号平台
    pub platform: Platform,
    body_lower: String,
}

impl<'a> UpstreamFailure<'a> {
    /// 创建失败描述，预先计算小写响应体
    #[must_use]
    pub fn new(status: u16, body: &'a [u8], platform: Platform) -> Self {
        Self {
            status,
            body,
            platform,
            body_lower: String::from_utf8_lossy(body).to_lowercase(),
        }
    }
}

/// 单个谓词
#[derive(Debug, Clone, Copy)]
enum Condition<'r> {
    StatusIn(&'r [u16]),
    KeywordIn(&'r [String]),
    PlatformIn(&'r [Platform]),
}

impl Condition<'_> {
    fn holds(&self, failure: &UpstreamFailure<'_>) -> bool {
        match self {
            Self::StatusIn(codes) => codes.contains(&failure.status),
            Self::KeywordIn(keywords) => keywords
                .iter()
                .filter(|keyword| !keyword.is_empty())
                .any(|keyword| failure.body_lower.contains(&keyword.to_lowercase())),
            Self::PlatformIn(platforms) => platforms.contains(&failure.platform),
        }
    }
}

impl ErrorPassthroughRule {
    /// 已配置（非空）的谓词
    fn conditions(&self) -> impl Iterator<Item = Condition<'_>> {
        [
            (!self.error_codes.is_empty()).then_some(Condition::StatusIn(&self.error_codes)),
            (!self.keywords.is_empty()).then_some(Condition::KeywordIn(&self.keywords)),
            (!self.platforms.is_empty()).then_some(Condition::PlatformIn(&self.platforms)),
        ]
        .into_iter()
        .flatten()
    }

    /// 规则是否匹配该失败；停用的规则永不匹配
    #[must_use]
    pub fn matches(&self, failure: &UpstreamFailure<'_>) -> bool {
        if !self.enabled {
            return false;
        }
        let mut conditions = self.conditions().peekable();
        if conditions.peek().is_none() {
            return false;
        }
        match self.match_mode {
            MatchMode::Any => conditions.any(|condition| condition.holds(failure)),
            MatchMode::All => conditions.all(|condition| condition.holds(failure)),
        }
    }

    /// 规则的排序键：优先级升序，同优先级按ID升序
    #[must_use]
    pub const fn order_key(&self) -> (i32, i64) {
        (self.priority, self.id)
    }

    /// 校验规则字段
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("rule name cannot be empty".to_string());
        }
        if let Some(code) = self.error_codes.iter().find(|code| !(100..=599).contains(*code)) {
            return Err(format!("invalid error code: {code}"));
        }
        if let Some(code) = self.response_code.filter(|code| !(100..=599).contains(code)) {
            return Err(format!("invalid response code: {code}"));
        }
        if self.conditions().next().is_none() {
            return Err("rule needs at least one error code, keyword or platform".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rule(codes: &[u16], keywords: &[&str], platforms: &[Platform], mode: MatchMode) -> ErrorPassthroughRule {
        ErrorPassthroughRule {
            id: 1,
            name: "r".to_string(),
            enabled: true,
            priority: 0,
            error_codes: codes.to_vec(),
            keywords: keywords.iter().map(ToString::to_string).collect(),
            match_mode: mode,
            platforms: platforms.to_vec(),
            passthrough_code: true,
            response_code: None,
            passthrough_body: true,
            custom_message: None,
            description: None,
        }
    }

    #[rstest]
    #[case::any_code_only(rule(&[429], &["quota"], &[], MatchMode::Any), 429, "nothing", true)]
    #[case::any_keyword_only(rule(&[400], &["Quota"], &[], MatchMode::Any), 500, "QUOTA exceeded", true)]
    #[case::any_none(rule(&[400], &["quota"], &[], MatchMode::Any), 500, "other", false)]
    #[case::all_both(rule(&[400], &["quota"], &[], MatchMode::All), 400, "quota exceeded", true)]
    #[case::all_missing_keyword(rule(&[400], &["quota"], &[], MatchMode::All), 400, "other", false)]
    #[case::all_with_platform(rule(&[400], &[], &[Platform::Anthropic], MatchMode::All), 400, "", true)]
    #[case::all_wrong_platform(rule(&[400], &[], &[Platform::Gemini], MatchMode::All), 400, "", false)]
    #[case::empty_any(rule(&[], &[], &[], MatchMode::Any), 400, "x", false)]
    #[case::empty_all(rule(&[], &[], &[], MatchMode::All), 400, "x", false)]
    fn test_rule_matching(
        #[case] rule: ErrorPassthroughRule,
        #[case] status: u16,
        #[case] body: &str,
        #[case] expected: bool,
    ) {
        let failure = UpstreamFailure::new(status, body.as_bytes(), Platform::Anthropic);
        assert_eq!(rule.matches(&failure), expected);
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let mut rule = rule(&[429], &[], &[], MatchMode::Any);
        rule.enabled = false;
        let failure = UpstreamFailure::new(429, b"", Platform::Anthropic);
        assert!(!rule.matches(&failure));
    }

    #[test]
    fn test_validate() {
        assert!(rule(&[429], &[], &[], MatchMode::Any).validate().is_ok());
        assert!(rule(&[], &[], &[], MatchMode::Any).validate().is_err());
        assert!(rule(&[42], &[], &[], MatchMode::Any).validate().is_err());

        let mut bad_response = rule(&[429], &[], &[], MatchMode::Any);
        bad_response.response_code = Some(1000);
        assert!(bad_response.validate().is_err());
    }
}
