//! # 模型映射
//!
//! 对外的短模型名与上游完整模型ID之间的双向映射，以及默认模型目录

use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

/// 对外暴露的模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Model {
    /// 固定为 `model`
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// 上游模型ID
    pub id: &'static str,
    /// 显示名称
    pub display_name: &'static str,
    /// 发布时间
    pub created_at: &'static str,
}

const fn model(id: &'static str, display_name: &'static str, created_at: &'static str) -> Model {
    Model {
        kind: "model",
        id,
        display_name,
        created_at,
    }
}

/// 默认模型目录，按声明顺序返回
static CATALOGUE: [Model; 3] = [
    model(
        "claude-opus-4-5-20251101",
        "Claude Opus 4.5",
        "2025-11-01T00:00:00Z",
    ),
    model(
        "claude-sonnet-4-5-20250929",
        "Claude Sonnet 4.5",
        "2025-09-29T00:00:00Z",
    ),
    model(
        "claude-haiku-4-5-20251001",
        "Claude Haiku 4.5",
        "2025-10-01T00:00:00Z",
    ),
];

/// 短名 -> 上游ID
const SHORT_TO_UPSTREAM: [(&str, &str); 3] = [
    ("claude-opus-4-5", "claude-opus-4-5-20251101"),
    ("claude-sonnet-4-5", "claude-sonnet-4-5-20250929"),
    ("claude-haiku-4-5", "claude-haiku-4-5-20251001"),
];

static REGISTRY: LazyLock<ModelRegistry> =
    LazyLock::new(|| ModelRegistry::new(&SHORT_TO_UPSTREAM, &CATALOGUE));

/// 模型映射表
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    to_upstream: HashMap<&'static str, &'static str>,
    to_short: HashMap<&'static str, &'static str>,
    catalogue: &'static [Model],
}

impl ModelRegistry {
    fn new(pairs: &[(&'static str, &'static str)], catalogue: &'static [Model]) -> Self {
        Self {
            to_upstream: pairs.iter().copied().collect(),
            to_short: pairs.iter().map(|&(short, long)| (long, short)).collect(),
            catalogue,
        }
    }

    /// 全局映射表
    #[must_use]
    pub fn global() -> &'static Self {
        &REGISTRY
    }

    /// 短名转上游ID，未知ID原样返回
    #[must_use]
    pub fn normalize<'a>(&self, id: &'a str) -> &'a str {
        self.to_upstream.get(id).copied().unwrap_or(id)
    }

    /// 上游ID转短名，未知ID原样返回
    #[must_use]
    pub fn denormalize<'a>(&self, id: &'a str) -> &'a str {
        self.to_short.get(id).copied().unwrap_or(id)
    }

    /// 默认模型目录
    #[must_use]
    pub const fn default_catalogue(&self) -> &'static [Model] {
        self.catalogue
    }

    /// 映射表中的全部 (短名, 上游ID)
    pub fn pairs(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.to_upstream.iter().map(|(short, long)| (*short, *long))
    }

    /// 是否为 haiku 级模型
    #[must_use]
    pub fn is_haiku(id: &str) -> bool {
        id.to_ascii_lowercase().contains("haiku")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip_for_every_mapped_id() {
        let registry = ModelRegistry::global();
        for (short, long) in registry.pairs() {
            assert_eq!(registry.normalize(registry.denormalize(long)), long);
            assert_eq!(registry.denormalize(registry.normalize(short)), short);
            assert_eq!(registry.normalize(short), long);
        }
    }

    #[test]
    fn test_catalogue_declaration_order() {
        let ids: Vec<_> = ModelRegistry::global()
            .default_catalogue()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "claude-opus-4-5-20251101",
                "claude-sonnet-4-5-20250929",
                "claude-haiku-4-5-20251001"
            ]
        );
    }

    #[test]
    fn test_catalogue_ids_are_upstream_ids() {
        let registry = ModelRegistry::global();
        for model in registry.default_catalogue() {
            assert_ne!(registry.denormalize(model.id), model.id);
        }
    }

    #[test]
    fn test_haiku_tier() {
        assert!(ModelRegistry::is_haiku("claude-haiku-4-5-20251001"));
        assert!(ModelRegistry::is_haiku("Claude-3-Haiku"));
        assert!(!ModelRegistry::is_haiku("claude-sonnet-4-5"));
    }

    proptest! {
        #[test]
        fn prop_unmapped_ids_pass_through(id in "[a-z0-9.-]{1,40}") {
            let registry = ModelRegistry::global();
            prop_assume!(registry.pairs().all(|(s, l)| s != id && l != id));
            prop_assert_eq!(registry.normalize(&id), id.as_str());
            prop_assert_eq!(registry.denormalize(&id), id.as_str());
        }
    }
}
