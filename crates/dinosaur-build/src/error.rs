use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid build configuration: {0}")]
    Configuration(String),

    #[error("Failed to stage Dockerfile {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to package build context {path}: {source}")]
    Packaging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Docker daemon unreachable at {host}: {message}")]
    DaemonUnreachable { host: String, message: String },

    #[error("Build submission failed: {0}")]
    Submission(String),

    #[error("Build request rejected by daemon (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Build stream error: {0}")]
    Stream(#[from] hyper::Error),

    #[error("Build did not finish within {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::Configuration(msg) => {
                format!(
                    "設定が不正です: {}\n\
                     \n\
                     ビルド対象のタグを -t で指定してください:\n\
                        dino-build -t my-image:latest -f Dockerfile",
                    msg
                )
            }
            BuildError::Staging { path, .. } => {
                format!(
                    "Dockerfileを読み込めません: {}\n\
                     \n\
                     解決方法:\n\
                     1. Dockerfileのパスを確認してください\n\
                     2. -f で明示的にパスを指定してください:\n\
                        dino-build -t my-image -f path/to/Dockerfile",
                    path.display()
                )
            }
            BuildError::DaemonUnreachable { host, .. } => {
                format!(
                    "Dockerデーモンに接続できません: {}\n\
                     \n\
                     解決方法:\n\
                     1. デーモンが起動しているか確認してください\n\
                     2. DOCKER_HOST または -H で接続先を指定してください",
                    host
                )
            }
            BuildError::Rejected { message, .. } => {
                format!(
                    "デーモンがビルド要求を拒否しました: {}\n\
                     \n\
                     インタラクティブモード (-i) に対応したデーモンか確認してください。",
                    message
                )
            }
            BuildError::Timeout(limit) => {
                format!(
                    "ビルドが {:?} 以内に完了しませんでした。\n\
                     \n\
                     --timeout の値を増やすか、デーモンの状態を確認してください。",
                    limit
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
