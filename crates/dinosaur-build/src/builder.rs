use crate::context::CONTEXT_DOCKERFILE;
use crate::daemon::{BuildDaemon, ResponseStream};
use crate::error::{BuildError, Result};
use crate::events::{BuildLog, decode_build_stream};
use crate::progress::BuildProgress;
use crate::request::BuildRequest;
use bytes::Bytes;
use std::time::Duration;

/// ビルド要求の送信とストリームのデコードを行う
///
/// デーモンのハンドルは呼び出し側が所有し、ここでは借用するだけ。
pub struct ImageBuilder<'a, D: BuildDaemon + ?Sized> {
    daemon: &'a D,
    timeout: Option<Duration>,
}

impl<'a, D: BuildDaemon + ?Sized> ImageBuilder<'a, D> {
    pub fn new(daemon: &'a D) -> Self {
        Self {
            daemon,
            timeout: None,
        }
    }

    /// 送信からデコード完了までの制限時間
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// ビルド要求を送信し、未読のレスポンスストリームを返す
    pub async fn submit(
        &self,
        context: Bytes,
        target: &str,
        dockerfile: &str,
        interactive: bool,
    ) -> Result<ResponseStream> {
        let request = BuildRequest::new(context, target, dockerfile, interactive)?;

        tracing::info!(
            "Building image: {} (interactive: {}) via {}",
            request.target(),
            request.interactive(),
            self.daemon.endpoint()
        );

        self.daemon.build(request).await
    }

    /// イメージをビルドし、ストリームから結果を取り出す
    pub async fn build_image(
        &self,
        context: Bytes,
        target: &str,
        interactive: bool,
        progress: &BuildProgress,
    ) -> Result<BuildLog> {
        let run = async {
            let mut stream = self
                .submit(context, target, CONTEXT_DOCKERFILE, interactive)
                .await?;
            decode_build_stream(&mut stream, progress).await
        };

        let log = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| BuildError::Timeout(limit))??,
            None => run.await?,
        };

        if log.outcome.is_found() {
            tracing::info!("Successfully built: {} ({})", target, log.outcome.image_id());
        } else {
            tracing::info!("Build of {} produced no image ID", target);
        }
        Ok(log)
    }
}
