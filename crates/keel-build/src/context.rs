//! ビルドコンテキストの特定と準備
//!
//! `keel build` に渡されたパス・URL・`-` を分類し、ローカルディレクトリか
//! tar アーカイブのどちらかとして扱える形に準備します。

use crate::error::{BuildError, Result};
use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tempfile::TempDir;

/// Dockerfile のデフォルト名
pub const DEFAULT_DOCKERFILE_NAME: &str = "Dockerfile";

/// stdin を表す引数
pub const STDIN_ARG: &str = "-";

const TAR_BLOCK_SIZE: usize = 512;

static GIT_URL_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.git(?:#.+)?$").expect("valid git url regex"));

/// ビルドコンテキストの種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextType {
    Stdin,
    Local(PathBuf),
    Git(String),
    Remote(String),
}

impl ContextType {
    /// 引数からコンテキストの種類を判定
    pub fn detect(arg: &str) -> Result<Self> {
        if arg == STDIN_ARG {
            return Ok(ContextType::Stdin);
        }
        let path = Path::new(arg);
        if path.is_dir() {
            return Ok(ContextType::Local(path.to_path_buf()));
        }
        if is_git_url(arg) {
            return Ok(ContextType::Git(arg.to_string()));
        }
        if is_url(arg) {
            return Ok(ContextType::Remote(arg.to_string()));
        }
        Err(BuildError::ContextNotFound(format!(
            "path \"{}\" not found",
            arg
        )))
    }
}

pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

pub fn is_git_url(s: &str) -> bool {
    if is_url(s) && GIT_URL_SUFFIX_RE.is_match(s) {
        return true;
    }
    ["git://", "github.com/", "git@"]
        .iter()
        .any(|prefix| s.starts_with(prefix))
}

/// コンテキストの中身
#[derive(Debug)]
pub enum ContextSource {
    /// ローカル（または clone した）ディレクトリ
    Directory(PathBuf),
    /// 非圧縮の tar アーカイブ
    Archive(Vec<u8>),
}

/// 準備済みのビルドコンテキスト
///
/// git の clone 先など一時ディレクトリを所有し、drop 時に削除する。
#[derive(Debug)]
pub struct PreparedContext {
    source: ContextSource,
    dockerfile_name: String,
    external_dockerfile: Option<Vec<u8>>,
    _checkout: Option<TempDir>,
}

impl PreparedContext {
    pub fn source(&self) -> &ContextSource {
        &self.source
    }

    /// コンテキスト内での Dockerfile の相対パス（スラッシュ区切り）
    pub fn dockerfile_name(&self) -> &str {
        &self.dockerfile_name
    }

    /// コンテキスト外（または stdin）から読み込んだ Dockerfile
    pub fn external_dockerfile(&self) -> Option<&[u8]> {
        self.external_dockerfile.as_deref()
    }

    /// 所有権ごと分解する（一時ディレクトリのガードも返す）
    pub fn into_parts(self) -> (ContextSource, String, Option<Vec<u8>>, Option<TempDir>) {
        (
            self.source,
            self.dockerfile_name,
            self.external_dockerfile,
            self._checkout,
        )
    }
}

/// ビルドコンテキストを特定して準備する
pub struct ContextLocator {
    stdin: Option<Box<dyn Read + Send>>,
    http: reqwest::Client,
}

impl Default for ContextLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextLocator {
    /// プロセスの stdin を使う
    pub fn new() -> Self {
        Self::with_stdin(std::io::stdin())
    }

    pub fn with_stdin(stdin: impl Read + Send + 'static) -> Self {
        Self {
            stdin: Some(Box::new(stdin)),
            http: reqwest::Client::new(),
        }
    }

    /// コンテキストと Dockerfile を準備
    ///
    /// `dockerfile` は `-f` の値。ローカルコンテキストではカレントディレクトリ
    /// からの相対パス、git コンテキストでは clone 先からの相対パス。
    pub async fn locate(
        &mut self,
        context: &str,
        dockerfile: Option<&str>,
    ) -> Result<PreparedContext> {
        let dockerfile = dockerfile.filter(|d| !d.is_empty());
        if context == STDIN_ARG && dockerfile == Some(STDIN_ARG) {
            return Err(BuildError::StdinConflict);
        }

        let mut prepared = match ContextType::detect(context)? {
            ContextType::Stdin => {
                tracing::debug!("Reading build context from stdin");
                let data = self.read_stdin().await?;
                from_raw_context(data, dockerfile)?
            }
            ContextType::Local(dir) => {
                let cwd = std::env::current_dir()?;
                let dockerfile = dockerfile.map(|d| {
                    if d == STDIN_ARG {
                        PathBuf::from(d)
                    } else {
                        cwd.join(d)
                    }
                });
                from_local_dir(&dir, dockerfile.as_deref(), None)?
            }
            ContextType::Git(url) => {
                let (checkout, dir) = clone_git(&url).await?;
                let dockerfile = dockerfile.map(PathBuf::from);
                from_local_dir(&dir, dockerfile.as_deref(), Some(checkout))?
            }
            ContextType::Remote(url) => {
                let data = self.download(&url).await?;
                from_raw_context(data, dockerfile)?
            }
        };

        if dockerfile == Some(STDIN_ARG) {
            tracing::debug!("Reading Dockerfile from stdin");
            prepared.external_dockerfile = Some(self.read_stdin().await?);
        }

        tracing::debug!(
            "Prepared build context (dockerfile: {})",
            prepared.dockerfile_name
        );
        Ok(prepared)
    }

    async fn read_stdin(&mut self) -> Result<Vec<u8>> {
        let mut stdin = self.stdin.take().ok_or(BuildError::StdinConflict)?;
        let data = tokio::task::spawn_blocking(move || {
            let mut data = Vec::new();
            stdin.read_to_end(&mut data).map(|_| data)
        })
        .await
        .map_err(|e| BuildError::InvalidContext(format!("failed to read stdin: {}", e)))??;
        Ok(data)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        tracing::info!("Downloading build context from remote url: {}", url);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(url, e))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| download_error(url, e))?;

        tracing::debug!("Downloaded {} bytes of build context", body.len());
        Ok(body.to_vec())
    }
}

fn download_error(url: &str, err: reqwest::Error) -> BuildError {
    BuildError::ContextNotFound(format!("unable to download {}: {}", url, err))
}

/// stdin やリモートから取得したデータをコンテキストとして解釈
fn from_raw_context(data: Vec<u8>, dockerfile: Option<&str>) -> Result<PreparedContext> {
    let (archive, dockerfile_name) = match context_from_bytes(data)? {
        RawContext::Archive(archive) => (
            archive,
            dockerfile
                .filter(|d| *d != STDIN_ARG)
                .unwrap_or(DEFAULT_DOCKERFILE_NAME)
                .to_string(),
        ),
        RawContext::Dockerfile(content) => (
            dockerfile_archive(&content)?,
            DEFAULT_DOCKERFILE_NAME.to_string(),
        ),
    };

    Ok(PreparedContext {
        source: ContextSource::Archive(archive),
        dockerfile_name,
        external_dockerfile: None,
        _checkout: None,
    })
}

/// ローカルディレクトリをコンテキストとして準備
///
/// `dockerfile` が相対パスの場合はコンテキストディレクトリからの相対パス。
fn from_local_dir(
    dir: &Path,
    dockerfile: Option<&Path>,
    checkout: Option<TempDir>,
) -> Result<PreparedContext> {
    let context_dir = dir.canonicalize().map_err(|e| {
        BuildError::ContextNotFound(format!(
            "unable to get absolute context directory of \"{}\": {}",
            dir.display(),
            e
        ))
    })?;
    if !context_dir.is_dir() {
        return Err(BuildError::ContextNotFound(format!(
            "context must be a directory: {}",
            context_dir.display()
        )));
    }

    // Dockerfile を stdin から読む場合、コンテキスト内には存在しなくてよい
    if dockerfile.is_some_and(|d| d == Path::new(STDIN_ARG)) {
        return Ok(PreparedContext {
            source: ContextSource::Directory(context_dir),
            dockerfile_name: DEFAULT_DOCKERFILE_NAME.to_string(),
            external_dockerfile: None,
            _checkout: checkout,
        });
    }

    let candidate = match dockerfile {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => context_dir.join(path),
        None => default_dockerfile(&context_dir),
    };
    let absolute = candidate
        .canonicalize()
        .map_err(|_| BuildError::DockerfileNotFound(candidate.clone()))?;

    let (dockerfile_name, external_dockerfile) = match absolute.strip_prefix(&context_dir) {
        Ok(relative) => (slash_path(relative), None),
        Err(_) => {
            tracing::debug!(
                "Dockerfile {} is outside of the build context",
                absolute.display()
            );
            let content = std::fs::read(&absolute).map_err(|source| BuildError::Path {
                context: format!("unable to read {}", absolute.display()),
                source,
            })?;
            (DEFAULT_DOCKERFILE_NAME.to_string(), Some(content))
        }
    };

    Ok(PreparedContext {
        source: ContextSource::Directory(context_dir),
        dockerfile_name,
        external_dockerfile,
        _checkout: checkout,
    })
}

/// `Dockerfile` が無ければ小文字の `dockerfile` を探す
fn default_dockerfile(context_dir: &Path) -> PathBuf {
    let default = context_dir.join(DEFAULT_DOCKERFILE_NAME);
    if default.symlink_metadata().is_err() {
        let alternative = context_dir.join(DEFAULT_DOCKERFILE_NAME.to_lowercase());
        if alternative.symlink_metadata().is_ok() {
            return alternative;
        }
    }
    default
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// stdin やリモートから得たデータの中身
#[derive(Debug, PartialEq, Eq)]
pub enum RawContext {
    /// 非圧縮の tar アーカイブ
    Archive(Vec<u8>),
    /// Dockerfile そのもの
    Dockerfile(Vec<u8>),
}

/// バイト列が tar（gzip 圧縮を含む）か Dockerfile かを判定
pub fn context_from_bytes(data: Vec<u8>) -> Result<RawContext> {
    match detect_compression(&data) {
        Compression::Gzip => {
            let mut decoded = Vec::new();
            GzDecoder::new(&data[..]).read_to_end(&mut decoded)?;
            if is_tar(&decoded) {
                Ok(RawContext::Archive(decoded))
            } else {
                Err(BuildError::InvalidContext(
                    "gzip-compressed build context is not a tar archive".to_string(),
                ))
            }
        }
        Compression::Other(name) => Err(BuildError::InvalidContext(format!(
            "{} compressed build contexts are not supported, use gzip or an uncompressed tar",
            name
        ))),
        Compression::None if is_tar(&data) => Ok(RawContext::Archive(data)),
        Compression::None => Ok(RawContext::Dockerfile(data)),
    }
}

/// Dockerfile だけを含む tar を作る
pub fn dockerfile_archive(content: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o600);
    builder.append_data(&mut header, DEFAULT_DOCKERFILE_NAME, content)?;
    Ok(builder.into_inner()?)
}

enum Compression {
    None,
    Gzip,
    Other(&'static str),
}

fn detect_compression(data: &[u8]) -> Compression {
    const MAGICS: [(&[u8], &str); 3] = [
        (b"BZh", "bzip2"),
        (&[0xfd, b'7', b'z', b'X', b'Z', 0x00], "xz"),
        (&[0x28, 0xb5, 0x2f, 0xfd], "zstd"),
    ];

    if data.starts_with(&[0x1f, 0x8b, 0x08]) {
        return Compression::Gzip;
    }
    MAGICS
        .iter()
        .find(|(magic, _)| data.starts_with(magic))
        .map(|(_, name)| Compression::Other(*name))
        .unwrap_or(Compression::None)
}

/// 先頭ブロックが正しい tar ヘッダーか（チェックサムで判定）
fn is_tar(data: &[u8]) -> bool {
    if data.len() < TAR_BLOCK_SIZE {
        return false;
    }
    let block = &data[..TAR_BLOCK_SIZE];
    if block.iter().all(|b| *b == 0) {
        return false;
    }

    let header = tar::Header::from_byte_slice(block);
    let Ok(expected) = header.cksum() else {
        return false;
    };
    let actual: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { u32::from(b' ') } else { u32::from(*b) })
        .sum();
    expected == actual
}

/// git リポジトリを一時ディレクトリへ clone する
///
/// URL の `#ref:subdir` フラグメントでブランチ（タグ）とサブディレクトリを指定できる。
async fn clone_git(url: &str) -> Result<(TempDir, PathBuf)> {
    let (remote, fragment) = match url.split_once('#') {
        Some((remote, fragment)) => (remote, fragment),
        None => (url, ""),
    };
    let (git_ref, subdir) = match fragment.split_once(':') {
        Some((git_ref, subdir)) => (git_ref, subdir),
        None => (fragment, ""),
    };
    let remote = if remote.starts_with("github.com/") {
        format!("https://{}", remote)
    } else {
        remote.to_string()
    };

    let checkout = tempfile::Builder::new().prefix("keel-build-git").tempdir()?;

    let mut command = tokio::process::Command::new("git");
    command
        .args(["clone", "--depth", "1", "--recurse-submodules"])
        .env("GIT_TERMINAL_PROMPT", "0");
    if !git_ref.is_empty() {
        command.args(["--branch", git_ref]);
    }
    command.arg(&remote).arg(checkout.path());

    tracing::debug!("Cloning {} into {}", remote, checkout.path().display());
    let output = command.output().await.map_err(|source| BuildError::Path {
        context: "unable to run git".to_string(),
        source,
    })?;
    if !output.status.success() {
        return Err(BuildError::InvalidContext(format!(
            "unable to clone {}: {}",
            remote,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let root = checkout.path().canonicalize()?;
    let dir = if subdir.is_empty() {
        root.clone()
    } else {
        root.join(subdir).canonicalize().map_err(|_| {
            BuildError::InvalidContext(format!("subdirectory {} not found in {}", subdir, remote))
        })?
    };
    if !dir.starts_with(&root) {
        return Err(BuildError::InvalidContext(format!(
            "subdirectory {} is outside of the repository",
            subdir
        )));
    }
    if !dir.is_dir() {
        return Err(BuildError::InvalidContext(format!(
            "subdirectory {} is not a directory",
            subdir
        )));
    }

    Ok((checkout, dir))
}
