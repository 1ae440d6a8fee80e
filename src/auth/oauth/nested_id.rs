//! # 嵌套标识符提取
//!
//! 上游响应里的标识符可能是纯字符串，也可能是带 `uuid` / `id` 字段的对象

use serde::Deserialize;

/// 字符串或记录形式的标识符
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NestedId {
    /// 纯字符串
    Plain(String),
    /// 带命名字段的记录
    Record {
        /// 优先使用
        #[serde(default)]
        uuid: Option<String>,
        /// 其次使用
        #[serde(default)]
        id: Option<String>,
    },
}

impl NestedId {
    /// 提取标识符，空字符串视为不存在
    #[must_use]
    pub fn extract(&self) -> Option<&str> {
        match self {
            Self::Plain(value) => Some(value.as_str()),
            Self::Record { uuid, id } => uuid.as_deref().or(id.as_deref()),
        }
        .map(str::trim)
        .filter(|value| !value.is_empty())
    }
}

/// 从可能缺失的字段中提取标识符
#[must_use]
pub fn extract_id(value: Option<&NestedId>) -> Option<&str> {
    value.and_then(NestedId::extract)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(default)]
        organization: Option<NestedId>,
    }

    #[rstest]
    #[case::plain(r#"{"organization":"org-1"}"#, Some("org-1"))]
    #[case::uuid(r#"{"organization":{"uuid":"org-2","name":"x"}}"#, Some("org-2"))]
    #[case::id_fallback(r#"{"organization":{"id":"org-3"}}"#, Some("org-3"))]
    #[case::empty_record(r#"{"organization":{}}"#, None)]
    #[case::blank(r#"{"organization":"  "}"#, None)]
    #[case::absent(r#"{}"#, None)]
    fn test_extract(#[case] json: &str, #[case] expected: Option<&str>) {
        let holder: Holder = serde_json::from_str(json).unwrap();
        assert_eq!(extract_id(holder.organization.as_ref()), expected);
    }
}
