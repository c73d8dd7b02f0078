use indicatif::{HumanBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// ビルドコンテキスト送信の進捗表示
#[derive(Clone)]
pub struct UploadProgress {
    progress_bar: ProgressBar,
    quiet: bool,
}

impl UploadProgress {
    /// `quiet` の場合は何も表示しない（送信量の集計はする）
    pub fn new(quiet: bool) -> Self {
        let pb = if quiet {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        } else {
            ProgressBar::new_spinner()
        };
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg} {bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("Sending build context to daemon");

        Self {
            progress_bar: pb,
            quiet,
        }
    }

    pub fn inc(&self, bytes: u64) {
        self.progress_bar.inc(bytes);
    }

    /// 送信済みのバイト数
    pub fn sent(&self) -> u64 {
        self.progress_bar.position()
    }

    pub fn finish(&self) {
        let message = format!("Sent build context to daemon ({})", HumanBytes(self.sent()));
        // 端末でなければ合計だけを出す
        if !self.quiet && self.progress_bar.is_hidden() {
            eprintln!("{}", message);
        }
        self.progress_bar.finish_with_message(message);
    }

    pub fn finish_error(&self) {
        self.progress_bar.abandon_with_message("Sending build context failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_progress_still_counts() {
        let progress = UploadProgress::new(true);
        progress.inc(10);
        progress.clone().inc(5);
        assert_eq!(progress.sent(), 15);
        progress.finish();
    }
}
