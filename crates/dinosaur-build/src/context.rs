use crate::error::{BuildError, Result};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::{Path, PathBuf};
use tar::Builder;
use tempfile::TempDir;

/// コンテキスト内でのDockerfile名（ビルド要求の `dockerfile` にも使う）
pub const CONTEXT_DOCKERFILE: &str = "Dockerfile";

const STAGING_PREFIX: &str = "docker-dinosaur-build";

/// Dockerfile 1つだけを置いた一時ビルドコンテキスト
///
/// ドロップ時にディレクトリごと削除されるため、どの終了経路でも残らない。
#[derive(Debug)]
pub struct StagedContext {
    dir: TempDir,
}

impl StagedContext {
    /// 一時ディレクトリを作成し、Dockerfileを `Dockerfile` としてコピー
    pub fn stage(dockerfile_path: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir()
            .map_err(|source| BuildError::Staging {
                path: std::env::temp_dir(),
                source,
            })?;

        tracing::debug!("Staging {} into {}", dockerfile_path.display(), dir.path().display());

        std::fs::copy(dockerfile_path, dir.path().join(CONTEXT_DOCKERFILE)).map_err(
            |source| BuildError::Staging {
                path: dockerfile_path.to_path_buf(),
                source,
            },
        )?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// ステージしたディレクトリをパッケージング
    pub fn package(&self) -> Result<Bytes> {
        ContextBuilder::package(self.path())
    }

    /// 明示的に削除（ドロップと同じだがエラーを確認できる）
    pub fn close(self) -> Result<()> {
        let path: PathBuf = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|source| BuildError::Staging { path, source })
    }
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// ディレクトリをtar.gzアーカイブとしてパッケージング
    pub fn package(context_path: &Path) -> Result<Bytes> {
        tracing::debug!("Creating build context from: {}", context_path.display());

        let packaging_error = |source| BuildError::Packaging {
            path: context_path.to_path_buf(),
            source,
        };

        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = Builder::new(encoder);

            // 相対パスを保ったまま再帰的に追加
            tar.append_dir_all(".", context_path)
                .map_err(packaging_error)?;

            tar.into_inner()
                .and_then(|encoder| encoder.finish())
                .map_err(packaging_error)?;
        }

        tracing::debug!("Build context created: {} bytes", archive_data.len());

        Self::check_context_size(archive_data.len());

        Ok(Bytes::from(archive_data))
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）",
                size / 1024 / 1024
            );
        }
    }
}
