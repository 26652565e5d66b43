//! Dinosaur debug builder のビルド機能
//!
//! Dockerfileだけを含むビルドコンテキストの作成、デーモンへのビルド要求
//! （インタラクティブデバッグモードを含む）、ビルドストリームからのイメージID抽出、
//! 結果の表示を提供します。

pub mod builder;
pub mod context;
pub mod daemon;
pub mod error;
pub mod events;
pub mod progress;
pub mod report;
pub mod request;

pub use builder::ImageBuilder;
pub use context::{CONTEXT_DOCKERFILE, ContextBuilder, StagedContext};
pub use daemon::{BuildDaemon, DaemonHost, DockerDaemon, ResponseStream};
pub use error::{BuildError, Result};
pub use events::{
    BuildEvent, BuildLog, EventDecoder, ImageOutcome, decode_build_stream, extract_image_id,
};
pub use progress::BuildProgress;
pub use report::{BuildStatus, FAILURE_MESSAGE, report};
pub use request::BuildRequest;
