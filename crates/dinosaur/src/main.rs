mod build;

use clap::Parser;
use colored::Colorize;
use dinosaur_build::{BuildError, DaemonHost};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dino-build", version)]
#[command(
    about = "🦎 Dinosaur debug builder: Dockerfileをビルドし、失敗したステップをインタラクティブに調査する",
    long_about = None
)]
struct Cli {
    /// ビルド対象のタグ（必須）
    #[arg(short = 't', long = "tag", value_name = "TARGET")]
    target: Option<String>,

    /// Dockerfileのパス
    #[arg(short = 'f', long = "file", value_name = "DOCKERFILE", default_value = "Dockerfile")]
    dockerfile: PathBuf,

    /// インタラクティブデバッグビルド（失敗した中間コンテナを調査用に残す）
    #[arg(short = 'i', long)]
    interactive: bool,

    /// ビルドコンテキスト（表示のみ。送信するのはDockerfileだけ）
    #[arg(value_name = "CONTEXT", default_value = ".")]
    context: PathBuf,

    /// Dockerデーモンの接続先
    #[arg(short = 'H', long, env = "DOCKER_HOST", default_value = DaemonHost::DEFAULT)]
    host: String,

    /// Docker APIバージョン（例: 1.45）。省略時はバージョンなしのパス
    #[arg(long, env = "DOCKER_API_VERSION", value_name = "VERSION")]
    api_version: Option<String>,

    /// ビルド全体の制限時間（秒）
    #[arg(long, env = "DINO_BUILD_TIMEOUT", value_name = "SECS")]
    timeout: Option<u64>,

    /// デバッグログを表示
    #[arg(short, long)]
    verbose: bool,
}

/// 検証済みの実行設定
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub target: String,
    pub dockerfile: PathBuf,
    pub interactive: bool,
    pub context: PathBuf,
    pub host: DaemonHost,
    pub api_version: Option<String>,
    pub timeout: Option<Duration>,
}

impl TryFrom<Cli> for BuildConfig {
    type Error = BuildError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let target = cli
            .target
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                BuildError::Configuration("Please enter a -t target to build".to_string())
            })?;

        Ok(Self {
            target,
            dockerfile: cli.dockerfile,
            interactive: cli.interactive,
            context: cli.context,
            host: DaemonHost::parse(&cli.host)?,
            api_version: cli.api_version,
            timeout: cli.timeout.map(Duration::from_secs),
        })
    }
}

fn init_tracing(verbose: bool) {
    // stdoutはバナーと結果専用
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // 設定の検証はファイル・デーモンに触れる前に行う
    let config = match BuildConfig::try_from(cli) {
        Ok(config) => config,
        Err(e) => return fail(&anyhow::Error::from(e)),
    };

    match build::run(&config).await {
        Ok(status) => status.exit_code(),
        Err(e) => fail(&e),
    }
}

fn fail(error: &anyhow::Error) -> ExitCode {
    let message = match error.downcast_ref::<BuildError>() {
        Some(build_error) => build_error.user_message(),
        None => format!("{:#}", error),
    };
    eprintln!("{} {}", "Error:".red().bold(), message);
    ExitCode::FAILURE
}
