//! Dockerデーモンとの接続
//!
//! ビルド要求は `interactive` フラグを含むため、bollard の `build_image` ではなく
//! HTTP/1.1 で `/build` を直接叩き、レスポンスボディを生のバイトストリームとして返す。

use crate::error::{BuildError, Result};
use crate::request::BuildRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// デーモンのレスポンスボディ（読み取り1回限りのチャンク列）
pub type ResponseStream = BoxStream<'static, Result<Bytes>>;

/// ビルド要求を受け付けるデーモン
#[async_trait]
pub trait BuildDaemon: Send + Sync {
    /// ログ表示用の接続先
    fn endpoint(&self) -> String;

    /// ビルド要求を送信し、未読のレスポンスストリームを返す
    async fn build(&self, request: BuildRequest) -> Result<ResponseStream>;
}

/// デーモンの接続先
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonHost {
    Unix(PathBuf),
    Tcp(String),
}

impl DaemonHost {
    pub const DEFAULT: &'static str = "unix:///var/run/docker.sock";

    /// `unix:///path`, `tcp://host:port`, `http://host:port`
    pub fn parse(host: &str) -> Result<Self> {
        let host = host.trim();
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(BuildError::Configuration(format!(
                    "missing socket path in daemon host: {}",
                    host
                )));
            }
            return Ok(DaemonHost::Unix(PathBuf::from(path)));
        }

        let addr = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
            .ok_or_else(|| {
                BuildError::Configuration(format!("unsupported daemon host: {}", host))
            })?
            .trim_end_matches('/');

        if addr.is_empty() {
            return Err(BuildError::Configuration(format!(
                "missing address in daemon host: {}",
                host
            )));
        }

        Ok(DaemonHost::Tcp(addr.to_string()))
    }

    /// `DOCKER_HOST` 環境変数、未設定ならデフォルトのソケット
    pub fn from_env() -> Result<Self> {
        match std::env::var("DOCKER_HOST") {
            Ok(host) if !host.trim().is_empty() => Self::parse(&host),
            _ => Self::parse(Self::DEFAULT),
        }
    }

    fn host_header(&self) -> HeaderValue {
        match self {
            DaemonHost::Unix(_) => HeaderValue::from_static("docker"),
            DaemonHost::Tcp(addr) => {
                HeaderValue::from_str(addr).unwrap_or(HeaderValue::from_static("docker"))
            }
        }
    }
}

impl fmt::Display for DaemonHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonHost::Unix(path) => write!(f, "unix://{}", path.display()),
            DaemonHost::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

trait DaemonIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DaemonIo for T {}

/// エラーレスポンスのボディ
#[derive(Debug, Deserialize)]
struct ErrorMessage {
    message: String,
}

/// Dockerデーモンへのハンドル
///
/// 要求ごとに新しい接続を開く。プロセス全体で1つ作成し、最後に `close` する。
#[derive(Debug, Clone)]
pub struct DockerDaemon {
    host: DaemonHost,
    api_version: Option<String>,
}

impl DockerDaemon {
    /// I/Oを行わずにハンドルを作成
    pub fn new(host: DaemonHost, api_version: Option<String>) -> Self {
        let api_version = api_version
            .map(|v| v.trim().trim_start_matches('v').to_string())
            .filter(|v| !v.is_empty());
        Self { host, api_version }
    }

    /// ハンドルを作成し、`/_ping` で疎通を確認
    pub async fn connect(host: DaemonHost, api_version: Option<String>) -> Result<Self> {
        let daemon = Self::new(host, api_version);
        daemon.ping().await?;
        tracing::debug!("Connected to Docker daemon: {}", daemon.host);
        Ok(daemon)
    }

    pub async fn ping(&self) -> Result<()> {
        let request = self.request(Method::GET, "/_ping", None, Bytes::new())?;
        let response = self.send(request).await.map_err(|e| match e {
            e @ BuildError::DaemonUnreachable { .. } => e,
            other => self.unreachable_error(other),
        })?;

        if !response.status().is_success() {
            return Err(
                self.unreachable_error(format!("ping returned HTTP {}", response.status()))
            );
        }
        Ok(())
    }

    /// ハンドルを閉じる
    pub fn close(self) {
        tracing::debug!("Closing Docker daemon handle: {}", self.host);
    }

    fn path(&self, endpoint: &str) -> String {
        match &self.api_version {
            Some(version) => format!("/v{}{}", version, endpoint),
            None => endpoint.to_string(),
        }
    }

    fn unreachable_error(&self, message: impl fmt::Display) -> BuildError {
        BuildError::DaemonUnreachable {
            host: self.host.to_string(),
            message: message.to_string(),
        }
    }

    fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>> {
        let mut uri = self.path(endpoint);
        if let Some(query) = query {
            uri.push('?');
            uri.push_str(query);
        }

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .map_err(|e| BuildError::Submission(format!("failed to build request: {}", e)))?;

        request
            .headers_mut()
            .insert(header::HOST, self.host.host_header());
        request
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        Ok(request)
    }

    async fn open(&self) -> std::io::Result<Box<dyn DaemonIo>> {
        let io: Box<dyn DaemonIo> = match &self.host {
            DaemonHost::Unix(path) => Box::new(UnixStream::connect(path).await?),
            DaemonHost::Tcp(addr) => Box::new(TcpStream::connect(addr.as_str()).await?),
        };
        Ok(io)
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let io = self.open().await.map_err(|e| self.unreachable_error(e))?;

        let (mut sender, conn) = http1::Builder::new()
            .handshake(TokioIo::new(io))
            .await
            .map_err(|e| BuildError::Submission(format!("daemon handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("daemon connection ended: {}", e);
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| BuildError::Submission(format!("daemon request failed: {}", e)))
    }

    async fn rejection(status: StatusCode, body: Incoming) -> BuildError {
        let message = match body.collect().await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                serde_json::from_slice::<ErrorMessage>(&bytes)
                    .map(|e| e.message)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string())
            }
            Err(e) => e.to_string(),
        };
        BuildError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl BuildDaemon for DockerDaemon {
    fn endpoint(&self) -> String {
        self.host.to_string()
    }

    async fn build(&self, request: BuildRequest) -> Result<ResponseStream> {
        let query = request.query()?;
        tracing::debug!("POST {}?{}", self.path("/build"), query);

        let mut http_request = self.request(
            Method::POST,
            "/build",
            Some(&query),
            request.into_context(),
        )?;
        http_request.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-tar"),
        );

        let response = self.send(http_request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Self::rejection(status, response.into_body()).await);
        }

        let stream = BodyStream::new(response.into_body())
            .try_filter_map(|frame| futures_util::future::ready(Ok(frame.into_data().ok())))
            .map_err(BuildError::Stream)
            .boxed();
        Ok(stream)
    }
}
