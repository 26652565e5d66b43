use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// ビルド中のスピナー（stderrに描画、端末でなければ表示されない）
pub struct BuildProgress {
    progress_bar: ProgressBar,
}

impl BuildProgress {
    pub fn new(target: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Building {}...", target));
        pb.enable_steady_tick(Duration::from_millis(120));

        Self { progress_bar: pb }
    }

    /// 何も描画しない（テスト・ライブラリ利用向け）
    pub fn hidden() -> Self {
        Self {
            progress_bar: ProgressBar::hidden(),
        }
    }

    pub fn set_message(&self, msg: &str) {
        self.progress_bar.set_message(msg.to_string());
    }

    pub fn finish_success(&self, image_id: &str) {
        self.progress_bar
            .finish_with_message(format!("Build completed ✓ {}", image_id));
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("Build failed: {}", error));
    }
}
