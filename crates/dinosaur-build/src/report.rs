//! ビルド結果の表示
//!
//! 成功時はイメージIDだけを1行で出力する（スクリプトから `$(dino-build ...)` で使える）。

use crate::events::{BuildLog, ImageOutcome};
use colored::Colorize;
use std::io::{self, Write};
use std::process::ExitCode;

pub const FAILURE_MESSAGE: &str = "😭 Sorry, that image build failed.";

/// 最終結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Built(String),
    Failed,
}

impl BuildStatus {
    pub fn exit_status(&self) -> u8 {
        match self {
            BuildStatus::Built(_) => 0,
            BuildStatus::Failed => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}

/// 結果を `out` に書き出す
///
/// 失敗理由（デーモンのエラー、解釈できなかった `aux`）はログに出し、`out` には書かない。
pub fn report<W: Write>(log: &BuildLog, out: &mut W) -> io::Result<BuildStatus> {
    let image_id = log.outcome.image_id();
    if !image_id.is_empty() {
        writeln!(out, "{}", image_id)?;
        return Ok(BuildStatus::Built(image_id.to_string()));
    }

    writeln!(out, "{}", FAILURE_MESSAGE.red())?;

    if let ImageOutcome::Malformed(detail) = &log.outcome {
        tracing::warn!("Build stream did not contain a readable image ID: {}", detail);
    }
    if let Some(error) = &log.daemon_error {
        tracing::error!("Daemon reported: {}", error);
    }

    Ok(BuildStatus::Failed)
}
