//! # PKCE (Proof Key for Code Exchange)
//!
//! RFC 7636 S256：随机 verifier，SHA256 后 base64url（无填充）得到 challenge

use base64::engine::{Engine, general_purpose::URL_SAFE_NO_PAD};
use rand::{Rng, distributions::Alphanumeric};
use sha2::{Digest, Sha256};

/// Code Verifier 长度范围
const MIN_CODE_VERIFIER_LENGTH: usize = 43;
const MAX_CODE_VERIFIER_LENGTH: usize = 128;
const DEFAULT_CODE_VERIFIER_LENGTH: usize = 64;

/// challenge 方法，只支持 S256
pub const CHALLENGE_METHOD: &str = "S256";

/// PKCE 参数对
#[derive(Debug, Clone)]
pub struct PkceParams {
    verifier: String,
    challenge: String,
}

impl PkceParams {
    /// 生成默认长度的参数对
    #[must_use]
    pub fn new() -> Self {
        Self::with_length(DEFAULT_CODE_VERIFIER_LENGTH)
    }

    /// 生成指定长度的参数对，长度被限制在 43..=128
    #[must_use]
    pub fn with_length(length: usize) -> Self {
        let length = length.clamp(MIN_CODE_VERIFIER_LENGTH, MAX_CODE_VERIFIER_LENGTH);
        let verifier = random_string(length);
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Code Verifier
    #[must_use]
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// Code Challenge
    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

impl Default for PkceParams {
    fn default() -> Self {
        Self::new()
    }
}

/// 计算 verifier 的 S256 challenge
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// 检查 verifier 是否符合规范
#[must_use]
pub fn is_valid_code_verifier(verifier: &str) -> bool {
    (MIN_CODE_VERIFIER_LENGTH..=MAX_CODE_VERIFIER_LENGTH).contains(&verifier.len())
        && verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
}

/// 随机字母数字串，用于 verifier 与 state
#[must_use]
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
