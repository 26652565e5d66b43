use crate::BuildConfig;
use anyhow::Context;
use colored::Colorize;
use dinosaur_build::{
    BuildError, BuildLog, BuildProgress, BuildStatus, DockerDaemon, ImageBuilder, StagedContext,
    report,
};

/// 設定内容を表示
fn print_banner(config: &BuildConfig) {
    println!("{}", "🦎 Dinosaur debug builder:".green());
    println!("  interactive debug: {}", config.interactive);
    println!("         dockerfile: {}", config.dockerfile.display());
    println!("            context: {}", config.context.display());
    println!("             target: {}", config.target.cyan());
}

/// ビルドを実行し、結果を表示
pub async fn run(config: &BuildConfig) -> anyhow::Result<BuildStatus> {
    print_banner(config);

    // コンテキスト引数は表示のみ。送信するのはステージしたDockerfileだけ
    tracing::debug!(
        "Context directory {} is not packaged",
        config.context.display()
    );

    let daemon = DockerDaemon::connect(config.host.clone(), config.api_version.clone()).await?;
    let result = build(&daemon, config).await;
    daemon.close();

    let log = result?;
    let mut stdout = std::io::stdout().lock();
    let status = report(&log, &mut stdout).context("failed to write build result")?;
    Ok(status)
}

async fn build(daemon: &DockerDaemon, config: &BuildConfig) -> Result<BuildLog, BuildError> {
    let staged = StagedContext::stage(&config.dockerfile)?;
    let context = staged.package()?;

    let progress = BuildProgress::new(&config.target);
    let result = ImageBuilder::new(daemon)
        .with_timeout(config.timeout)
        .build_image(context, &config.target, config.interactive, &progress)
        .await;

    match &result {
        Ok(log) if log.outcome.is_found() => progress.finish_success(log.outcome.image_id()),
        Ok(log) => progress.finish_error(log.daemon_error.as_deref().unwrap_or("no image ID")),
        Err(e) => progress.finish_error(&e.to_string()),
    }

    keep_build_result(result, staged.close())
}

/// 一時ディレクトリの削除に失敗しても、ビルド結果はそのまま返す
fn keep_build_result(
    result: Result<BuildLog, BuildError>,
    cleanup: Result<(), BuildError>,
) -> Result<BuildLog, BuildError> {
    if let Err(e) = cleanup {
        tracing::warn!("Failed to remove staging directory: {}", e);
    }
    result
}
