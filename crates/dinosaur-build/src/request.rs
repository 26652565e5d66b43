//! ビルド要求
//!
//! `POST /build` に渡すクエリパラメータとコンテキストをまとめた値。

use crate::error::{BuildError, Result};
use bytes::Bytes;
use serde::Serialize;

/// 1回のビルド呼び出しに対する要求（構築後は不変）
#[derive(Debug, Clone)]
pub struct BuildRequest {
    target: String,
    dockerfile: String,
    interactive: bool,
    context: Bytes,
}

/// クエリ文字列としてシリアライズされる部分
#[derive(Debug, Serialize)]
struct BuildQuery<'a> {
    t: &'a str,
    dockerfile: &'a str,
    rm: u8,
    forcerm: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    interactive: Option<u8>,
}

impl BuildRequest {
    /// `rm` / `forcerm` は常に有効
    pub fn new(
        context: Bytes,
        target: impl Into<String>,
        dockerfile: impl Into<String>,
        interactive: bool,
    ) -> Result<Self> {
        let target = target.into();
        if target.trim().is_empty() {
            return Err(BuildError::Configuration(
                "build target (-t) must not be empty".to_string(),
            ));
        }

        Ok(Self {
            target,
            dockerfile: dockerfile.into(),
            interactive,
            context,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn dockerfile(&self) -> &str {
        &self.dockerfile
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    pub fn remove_intermediate(&self) -> bool {
        true
    }

    pub fn force_remove(&self) -> bool {
        true
    }

    /// 送信用にコンテキストを取り出す
    pub fn into_context(self) -> Bytes {
        self.context
    }

    /// `t=...&dockerfile=...&rm=1&forcerm=1[&interactive=1]`
    pub fn query(&self) -> Result<String> {
        let query = BuildQuery {
            t: &self.target,
            dockerfile: &self.dockerfile,
            rm: u8::from(self.remove_intermediate()),
            forcerm: u8::from(self.force_remove()),
            interactive: self.interactive.then_some(1),
        };

        serde_urlencoded::to_string(&query)
            .map_err(|e| BuildError::Submission(format!("Failed to encode build query: {}", e)))
    }
}
