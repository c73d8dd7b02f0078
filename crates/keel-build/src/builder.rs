//! イメージビルドの実行
//!
//! 準備済みのコンテキストから tar ストリームを組み立て、デーモンへ送信して
//! ビルド出力を表示します。コンテンツトラストが有効な場合は Dockerfile の
//! `FROM` をダイジェストに固定し、ビルド後に元のタグを付け直します。

use crate::archive::{ArchiveBuilder, validate_context_directory};
use crate::auth::RegistryAuth;
use crate::context::{ContextSource, PreparedContext};
use crate::dockerignore::Excludes;
use crate::error::{BuildError, Result};
use crate::options::BuildOptions;
use crate::pipe::{CHUNK_SIZE, PipeReader, into_build_error, spawn_transform};
use crate::progress::UploadProgress;
use crate::reference::{DEFAULT_TAG, Reference};
use crate::splice::TrustSplicer;
use crate::transform::{add_dockerfile_to_context, compress};
use crate::trust::{DockerfileRewriter, RegistryResolver, ResolvedTag, TrustResolver};
use bollard::Docker;
use bollard::auth::DockerCredentials;
#[allow(deprecated)]
use bollard::image::{BuildImageOptions, TagImageOptions};
use bollard::models::{BuildInfo, ImageId};
use colored::Colorize;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// ビルド結果
#[derive(Debug, Clone, Default)]
pub struct BuildOutcome {
    /// デーモンが返したイメージ ID
    pub image_id: Option<String>,
    /// コンテンツトラストで固定したベースイメージ
    pub resolved: Vec<ResolvedTag>,
}

/// デーモンのビルド出力を集約する
#[derive(Debug, Default)]
struct BuildOutput {
    quiet: bool,
    image_id: Option<String>,
    /// quiet 時に失敗したら表示する出力
    buffered: String,
}

impl BuildOutput {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            ..Default::default()
        }
    }

    /// ビルド出力の処理
    fn handle(&mut self, output: BuildInfo) -> Result<()> {
        if let Some(ImageId { id: Some(id) }) = output.aux {
            tracing::debug!("Image ID: {}", id);
            self.image_id = Some(id);
        }

        if let Some(detail) = output.error_detail {
            let message = detail
                .message
                .or(output.error)
                .unwrap_or_else(|| "Unknown build error".to_string());
            return Err(BuildError::daemon(message, detail.code));
        }

        if let Some(error) = output.error {
            return Err(BuildError::daemon(error, None));
        }

        if let Some(stream) = output.stream {
            // ビルドステップの出力
            if self.quiet {
                self.buffered.push_str(&stream);
            } else {
                print!("{}", stream);
            }
        }

        if let Some(status) = output.status {
            // ステータスメッセージ（pull 等）
            let line = match (output.id, output.progress) {
                (Some(id), Some(progress)) => format!("{}: {} {}", id, status, progress),
                (Some(id), None) => format!("{}: {}", id, status),
                (None, _) => status,
            };
            if self.quiet {
                self.buffered.push_str(&line);
                self.buffered.push('\n');
            } else {
                println!("{}", line.cyan());
            }
        }

        Ok(())
    }

    /// quiet 時に溜めた出力を stderr へ書き出す
    fn flush_buffered(&mut self) {
        if !self.buffered.is_empty() {
            eprint!("{}", std::mem::take(&mut self.buffered));
        }
    }
}

pub struct ImageBuilder<R = RegistryResolver> {
    docker: Docker,
    credentials: HashMap<String, DockerCredentials>,
    splicer: TrustSplicer<R>,
    cancel: CancellationToken,
}

impl ImageBuilder<RegistryResolver> {
    /// `config.json` の認証情報を使い、レジストリでベースイメージを解決する
    pub fn new(docker: Docker, auth: RegistryAuth) -> Self {
        let credentials = auth.all_credentials();
        let resolver = RegistryResolver::new(docker.clone(), auth);
        Self::with_resolver(docker, credentials, resolver)
    }
}

impl<R: TrustResolver + 'static> ImageBuilder<R> {
    pub fn with_resolver(
        docker: Docker,
        credentials: HashMap<String, DockerCredentials>,
        resolver: R,
    ) -> Self {
        Self {
            docker,
            credentials,
            splicer: TrustSplicer::new(DockerfileRewriter::new(resolver)),
            cancel: CancellationToken::new(),
        }
    }

    /// キャンセル用のトークンを差し替える（Ctrl-C 連携など）
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// イメージをビルド
    pub async fn build(
        &self,
        context: PreparedContext,
        options: &BuildOptions,
    ) -> Result<BuildOutcome> {
        if let Some(iidfile) = &options.iidfile {
            remove_stale_iidfile(iidfile)?;
        }

        let (source, dockerfile_name, external_dockerfile, _checkout) = context.into_parts();
        let cancel = self.cancel.child_token();
        // 途中で失敗しても生産側のタスクを止める
        let _guard = cancel.clone().drop_guard();

        let (mut reader, mut dockerfile_name) = match source {
            ContextSource::Directory(dir) => {
                let outside = external_dockerfile.is_some();
                let reader = self
                    .archive_directory(dir, &dockerfile_name, outside, &cancel)
                    .await?;
                (reader, dockerfile_name)
            }
            ContextSource::Archive(data) => (stream_bytes(data, &cancel), dockerfile_name),
        };

        if let Some(dockerfile) = external_dockerfile {
            let (name, next, _) = add_dockerfile_to_context(reader, dockerfile, &cancel);
            dockerfile_name = name;
            reader = next;
        }

        let mut trusted: Option<JoinHandle<Option<Vec<ResolvedTag>>>> = None;
        if options.content_trust {
            let (next, handle) = self.splicer.splice(reader, &dockerfile_name, &cancel);
            reader = next;
            trusted = Some(handle);
        }

        if options.compress {
            reader = compress(reader, &cancel).0;
        }

        let mut output = BuildOutput::new(options.quiet);
        let result = self
            .run_build(reader, &dockerfile_name, options, &mut output)
            .await;
        if result.is_err() {
            output.flush_buffered();
        }
        result?;

        let image_id = output.image_id.take();
        if options.quiet {
            if let Some(id) = &image_id {
                println!("{}", id);
            }
        }

        if let Some(iidfile) = &options.iidfile {
            let id = image_id
                .as_deref()
                .ok_or_else(|| BuildError::MissingImageId(iidfile.clone()))?;
            std::fs::write(iidfile, id).map_err(|source| BuildError::Path {
                context: format!("Cannot write {}", iidfile.display()),
                source,
            })?;
        }

        if let Some(source) = image_id.as_deref().or(options.primary_tag()) {
            self.tag_extra(source, options.extra_tags()).await?;
        }

        let mut resolved = Vec::new();
        if let Some(handle) = trusted {
            resolved = handle
                .await
                .map_err(|e| BuildError::Archive(format!("content trust task failed: {}", e)))?
                .unwrap_or_default();
            self.tag_trusted(&resolved).await?;
        }

        Ok(BuildOutcome { image_id, resolved })
    }

    /// ローカルディレクトリを tar ストリームにする
    async fn archive_directory(
        &self,
        dir: std::path::PathBuf,
        dockerfile_name: &str,
        dockerfile_outside: bool,
        cancel: &CancellationToken,
    ) -> Result<PipeReader> {
        let dockerfile_name = dockerfile_name.to_string();
        let builder = tokio::task::spawn_blocking(move || -> Result<ArchiveBuilder> {
            let mut excludes = Excludes::read(&dir)?;
            excludes.trim_build_files(&dockerfile_name, dockerfile_outside)?;
            validate_context_directory(&dir, &excludes)?;
            Ok(ArchiveBuilder::new(dir, excludes))
        })
        .await
        .map_err(|e| BuildError::InvalidContext(format!("failed to scan build context: {}", e)))??;

        tracing::debug!("Archiving build context: {}", builder.context_dir().display());
        Ok(builder.spawn(cancel).0)
    }

    /// コンテキストを送信し、ビルド出力を最後まで処理する
    async fn run_build(
        &self,
        reader: PipeReader,
        dockerfile_name: &str,
        options: &BuildOptions,
        output: &mut BuildOutput,
    ) -> Result<()> {
        let progress = UploadProgress::new(options.quiet);
        let upload_error: Arc<Mutex<Option<io::Error>>> = Arc::new(Mutex::new(None));

        // 生成側のエラーは本文のエラーとして返し、リクエストごと中断させる
        // （元のエラーは表示用に取っておく）
        let body = {
            let slot = Arc::clone(&upload_error);
            let progress = progress.clone();
            reader.map(move |chunk| match chunk {
                Ok(bytes) => {
                    progress.inc(bytes.len() as u64);
                    Ok(bytes)
                }
                Err(err) => {
                    let aborted = io::Error::new(err.kind(), err.to_string());
                    if let Ok(mut slot) = slot.lock() {
                        slot.get_or_insert(err);
                    }
                    Err(aborted)
                }
            })
        };

        let build_options = to_build_image_options(dockerfile_name, options);
        tracing::debug!("Build options: {:?}", build_options);

        let credentials = (!self.credentials.is_empty()).then(|| self.credentials.clone());
        let mut stream = self.docker.build_image(
            build_options,
            credentials,
            Some(bollard::body_try_stream(body)),
        );

        let daemon_result = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    progress.finish_error();
                    return Err(BuildError::Cancelled);
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(info)) => {
                    if let Err(err) = output.handle(info) {
                        break Err(err);
                    }
                }
                Some(Err(err)) => break Err(BuildError::DockerConnection(err)),
                None => break Ok(()),
            }
        };

        // コンテキストの生成に失敗していれば、デーモン側のエラーより優先する
        let upload_error = upload_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(err) = upload_error {
            progress.finish_error();
            return Err(into_build_error(err));
        }
        if daemon_result.is_err() {
            progress.finish_error();
        } else {
            progress.finish();
        }
        daemon_result
    }

    /// イメージにタグを付ける
    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let reference = Reference::parse_normalized(target)?;
        #[allow(deprecated)]
        let options = TagImageOptions {
            repo: reference.name(),
            tag: reference.tag().unwrap_or(DEFAULT_TAG).to_string(),
        };
        self.docker.tag_image(source, Some(options)).await?;
        Ok(())
    }

    /// 2 つ目以降の `-t` を付ける
    async fn tag_extra(&self, source: &str, tags: &[String]) -> Result<()> {
        for tag in tags {
            self.tag(source, tag).await.map_err(|e| {
                BuildError::daemon(format!("failed to tag {}: {}", tag, e), None)
            })?;
        }
        Ok(())
    }

    /// 固定したダイジェスト参照に元のタグを付け直す
    async fn tag_trusted(&self, resolved: &[ResolvedTag]) -> Result<()> {
        for ResolvedTag { tagged, canonical } in resolved {
            let digest_ref = canonical.familiar();
            let tag_ref = tagged.familiar();
            eprintln!("Tagging {} as {}", digest_ref, tag_ref);

            #[allow(deprecated)]
            let options = TagImageOptions {
                repo: tagged.name(),
                tag: tagged.tag().to_string(),
            };
            self.docker
                .tag_image(&canonical.to_string(), Some(options))
                .await
                .map_err(|e| BuildError::TrustTag {
                    digest_ref,
                    tag_ref,
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// メモリ上の tar をパイプ越しに流す
fn stream_bytes(data: Vec<u8>, cancel: &CancellationToken) -> PipeReader {
    spawn_transform(cancel, move |writer| {
        for chunk in data.chunks(CHUNK_SIZE) {
            writer.write_all(chunk)?;
        }
        Ok(())
    })
    .0
}

fn remove_stale_iidfile(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(BuildError::Path {
            context: format!("Removing image ID file {}", path.display()),
            source,
        }),
    }
}

#[allow(deprecated)]
fn to_build_image_options(dockerfile_name: &str, options: &BuildOptions) -> BuildImageOptions<String> {
    BuildImageOptions {
        dockerfile: dockerfile_name.to_string(),
        t: options.primary_tag().unwrap_or_default().to_string(),
        extrahosts: (!options.extra_hosts.is_empty()).then(|| options.extra_hosts.join(",")),
        q: options.quiet,
        nocache: options.no_cache,
        cachefrom: options.cache_from.clone(),
        pull: options.pull,
        rm: options.rm,
        forcerm: options.force_rm,
        memory: options.memory,
        memswap: options.memory_swap,
        cpushares: options.cpu_shares,
        cpusetcpus: options.cpuset_cpus.clone().unwrap_or_default(),
        cpuperiod: options.cpu_period,
        cpuquota: options.cpu_quota,
        buildargs: options.build_args.clone(),
        shmsize: options.shm_size,
        squash: options.squash,
        labels: options.labels.clone(),
        networkmode: options.network.clone().unwrap_or_default(),
        platform: options.platform.clone().unwrap_or_default(),
        target: options.target.clone().unwrap_or_default(),
        ..Default::default()
    }
}
