use crate::docker;
use clap::{ArgAction, Args};
use colored::Colorize;
use keel_build::options::{
    parse_build_args, parse_bytes, parse_key_values, parse_swap, validate_extra_host,
};
use keel_build::{BuildError, BuildOptions, ContextLocator, ImageBuilder, RegistryAuth};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// ビルドコンテキスト（ディレクトリ、Git URL、tarball の URL、または - で stdin）
    #[arg(value_name = "PATH | URL | -")]
    pub context: String,

    /// イメージ名とタグ（name:tag 形式、複数指定可）
    #[arg(short = 't', long = "tag", value_name = "NAME[:TAG]")]
    pub tags: Vec<String>,

    /// Dockerfileのパス（- で stdin から読む）
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    pub file: Option<String>,

    /// ビルド引数（KEY=VALUE、KEY のみなら環境変数の値）
    #[arg(long = "build-arg", value_name = "KEY[=VALUE]")]
    pub build_args: Vec<String>,

    /// イメージのラベル
    #[arg(long = "label", value_name = "KEY[=VALUE]")]
    pub labels: Vec<String>,

    /// /etc/hosts に追加するエントリ（host:ip）
    #[arg(long = "add-host", value_name = "HOST:IP")]
    pub add_hosts: Vec<String>,

    /// キャッシュとして使うイメージ
    #[arg(long = "cache-from", value_name = "IMAGE")]
    pub cache_from: Vec<String>,

    /// メモリ上限（例: 512m, 2g）
    #[arg(short = 'm', long)]
    pub memory: Option<String>,

    /// メモリとスワップの合計上限（-1 で無制限）
    #[arg(long, allow_hyphen_values = true)]
    pub memory_swap: Option<String>,

    /// /dev/shm のサイズ
    #[arg(long)]
    pub shm_size: Option<String>,

    /// CPU シェア（相対的な重み）
    #[arg(short = 'c', long)]
    pub cpu_shares: Option<u64>,

    /// CFS の周期
    #[arg(long)]
    pub cpu_period: Option<u64>,

    /// CFS のクォータ
    #[arg(long)]
    pub cpu_quota: Option<u64>,

    /// 実行を許可する CPU（0-3, 0,1）
    #[arg(long)]
    pub cpuset_cpus: Option<String>,

    /// RUN 命令のネットワークモード
    #[arg(long)]
    pub network: Option<String>,

    /// ビルドするステージ
    #[arg(long)]
    pub target: Option<String>,

    /// プラットフォーム（例: linux/amd64）
    #[arg(long)]
    pub platform: Option<String>,

    /// 新しいレイヤーを 1 つにまとめる
    #[arg(long)]
    pub squash: bool,

    /// キャッシュを使わない
    #[arg(long)]
    pub no_cache: bool,

    /// ベースイメージを常に pull する
    #[arg(long)]
    pub pull: bool,

    /// ビルド成功後に中間コンテナを削除
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub rm: bool,

    /// 中間コンテナを常に削除
    #[arg(long)]
    pub force_rm: bool,

    /// ビルド出力を抑え、成功時はイメージ ID のみ表示
    #[arg(short, long)]
    pub quiet: bool,

    /// ビルドコンテキストを gzip で圧縮して送信
    #[arg(long)]
    pub compress: bool,

    /// イメージ ID を書き出すファイル
    #[arg(long, value_name = "PATH")]
    pub iidfile: Option<PathBuf>,

    /// コンテンツトラストを無効にする（DOCKER_CONTENT_TRUST より優先）
    #[arg(long)]
    pub disable_content_trust: bool,
}

impl BuildArgs {
    /// フラグを検証して BuildOptions にする
    pub fn to_options(&self) -> Result<BuildOptions, BuildError> {
        let options = BuildOptions {
            build_args: parse_build_args(self.build_args.iter().map(String::as_str))?,
            labels: parse_key_values(self.labels.iter().map(String::as_str))?,
            extra_hosts: self
                .add_hosts
                .iter()
                .map(String::as_str)
                .map(validate_extra_host)
                .collect::<Result<_, _>>()?,
            cache_from: self.cache_from.clone(),
            memory: self.memory.as_deref().map(parse_bytes).transpose()?,
            memory_swap: self.memory_swap.as_deref().map(parse_swap).transpose()?,
            shm_size: self.shm_size.as_deref().map(parse_bytes).transpose()?,
            cpu_shares: self.cpu_shares,
            cpu_period: self.cpu_period,
            cpu_quota: self.cpu_quota,
            cpuset_cpus: self.cpuset_cpus.clone(),
            network: self.network.clone(),
            target: self.target.clone(),
            platform: self.platform.clone().or_else(keel_config::default_platform),
            squash: self.squash,
            no_cache: self.no_cache,
            pull: self.pull,
            rm: self.rm,
            force_rm: self.force_rm,
            quiet: self.quiet,
            compress: self.compress,
            iidfile: self.iidfile.clone(),
            content_trust: keel_config::content_trust_enabled() && !self.disable_content_trust,
            ..Default::default()
        };
        options.with_tags(self.tags.iter().cloned())
    }
}

/// ビルドコマンドを処理
pub async fn handle_build_command(args: BuildArgs) -> anyhow::Result<()> {
    let mut options = args.to_options()?;

    let context = ContextLocator::new()
        .locate(&args.context, args.file.as_deref())
        .await?;

    let docker = docker::init_docker_with_error_handling().await?;
    let auth = RegistryAuth::load()?;
    auth.config()
        .apply_proxy_build_args(&keel_config::daemon_host(), &mut options.build_args);

    if !options.quiet {
        match options.primary_tag() {
            Some(tag) => eprintln!("{} {}", "🔨 Building".green().bold(), tag.cyan()),
            None => eprintln!("{}", "🔨 Building".green().bold()),
        }
    }
    if options.content_trust {
        tracing::info!("Content trust enabled: pinning base images by digest");
    }

    // Ctrl-C でビルドを中断する
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", "⚠ ビルドを中断しています...".yellow());
                cancel.cancel();
            }
        })
    };

    let builder = ImageBuilder::new(docker, auth).with_cancel(cancel);
    let result = builder.build(context, &options).await;
    watcher.abort();
    let outcome = result?;

    if !options.quiet {
        if let Some(id) = &outcome.image_id {
            tracing::info!("Successfully built: {}", id);
        }
        for tag in options.extra_tags() {
            println!("Successfully tagged {}", tag);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: BuildArgs,
    }

    fn parse(args: &[&str]) -> BuildArgs {
        TestCli::try_parse_from(std::iter::once("build").chain(args.iter().copied()))
            .unwrap()
            .args
    }

    #[test]
    fn test_options_from_flags() {
        let args = parse(&[
            "-t",
            "app:1",
            "-m",
            "512m",
            "--memory-swap",
            "-1",
            "--label",
            "team=core",
            "--add-host",
            "db:10.0.0.5",
            "--disable-content-trust",
            ".",
        ]);
        let options = args.to_options().unwrap();

        assert_eq!(options.primary_tag(), Some("app:1"));
        assert_eq!(options.memory, Some(512 * 1024 * 1024));
        assert_eq!(options.memory_swap, Some(-1));
        assert_eq!(options.labels["team"], "core");
        assert_eq!(options.extra_hosts, vec!["db:10.0.0.5"]);
        assert!(options.rm);
        assert!(!options.content_trust);
    }

    #[test]
    fn test_invalid_tag_is_rejected() {
        let args = parse(&["-t", "Bad/Name", "."]);
        assert!(matches!(
            args.to_options(),
            Err(BuildError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_invalid_memory_is_rejected() {
        let args = parse(&["-m", "lots", "."]);
        assert!(matches!(args.to_options(), Err(BuildError::InvalidOption(_))));
    }
}
