//! # 管理端处理器

pub mod accounts;
pub mod oauth;
pub mod rules;
pub mod system;
