//! ビルドコンテキストの tar アーカイブ作成

use crate::dockerignore::Excludes;
use crate::error::{BuildError, Result};
use crate::pipe::{PipeReader, spawn_transform};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header, HeaderMode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// これを超えるコンテキストには警告を出す
const MAX_CONTEXT_SIZE: u64 = 500 * 1024 * 1024;

/// コンテキストディレクトリ内の 1 エントリ
#[derive(Debug, Clone)]
struct ContextEntry {
    path: PathBuf,
    /// コンテキストからのスラッシュ区切り相対パス
    name: String,
    file_type: fs::FileType,
}

/// ディレクトリからビルドコンテキストの tar を作成する
///
/// エントリはディレクトリごとにファイル名順、親ディレクトリが子より先。
/// 所有者は uid/gid 0 に正規化される。
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    context_dir: PathBuf,
    excludes: Excludes,
}

impl ArchiveBuilder {
    pub fn new(context_dir: impl Into<PathBuf>, excludes: Excludes) -> Self {
        Self {
            context_dir: context_dir.into(),
            excludes,
        }
    }

    pub fn context_dir(&self) -> &Path {
        &self.context_dir
    }

    /// tar を書き出し、ファイル内容の合計バイト数を返す
    pub fn write_to<W: Write>(&self, writer: W) -> Result<u64> {
        let mut builder = Builder::new(writer);
        let mut total = 0u64;

        walk_context(&self.context_dir, &self.excludes, |entry| {
            total += append_entry(&mut builder, entry)?;
            Ok(())
        })?;

        builder.finish()?;

        tracing::debug!("Build context archived: {} bytes of file content", total);
        check_context_size(total);
        Ok(total)
    }

    /// blocking タスクで tar を作成し、パイプ越しに読めるようにする
    pub fn spawn(self, cancel: &CancellationToken) -> (PipeReader, JoinHandle<Option<u64>>) {
        spawn_transform(cancel, move |writer| self.write_to(writer))
    }
}

/// 除外されていない全ての通常ファイルが読めることを確認する
pub fn validate_context_directory(context_dir: &Path, excludes: &Excludes) -> Result<()> {
    walk_context(context_dir, excludes, |entry| {
        if entry.file_type.is_file() {
            File::open(&entry.path).map_err(|source| BuildError::Path {
                context: format!("can't access '{}'", entry.path.display()),
                source,
            })?;
        }
        Ok(())
    })
}

/// 除外パターンを考慮してコンテキストを走査する
fn walk_context<F>(context_dir: &Path, excludes: &Excludes, mut visit: F) -> Result<()>
where
    F: FnMut(&ContextEntry) -> Result<()>,
{
    let mut walker = WalkDir::new(context_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(next) = walker.next() {
        let dir_entry = next.map_err(|err| {
            let context = match err.path() {
                Some(path) => format!("can't stat '{}'", path.display()),
                None => "can't walk build context".to_string(),
            };
            BuildError::Path {
                context,
                source: io::Error::from(err),
            }
        })?;
        if dir_entry.depth() == 0 {
            continue;
        }

        let name = relative_name(context_dir, dir_entry.path())?;
        let file_type = dir_entry.file_type();

        if excludes.matches(&name) {
            // `!` パターンで取り戻される可能性がなければ中を見ない
            if file_type.is_dir() && !excludes.may_include_under(&name) {
                walker.skip_current_dir();
            }
            continue;
        }

        visit(&ContextEntry {
            path: dir_entry.path().to_path_buf(),
            name,
            file_type,
        })?;
    }

    Ok(())
}

fn relative_name(base: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        BuildError::InvalidContext(format!(
            "{} is outside of {}",
            path.display(),
            base.display()
        ))
    })?;

    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(components.join("/"))
}

/// エントリを tar に追加し、追加したファイル内容のバイト数を返す
fn append_entry<W: Write>(builder: &mut Builder<W>, entry: &ContextEntry) -> Result<u64> {
    let metadata = fs::symlink_metadata(&entry.path).map_err(|source| BuildError::Path {
        context: format!("can't stat '{}'", entry.path.display()),
        source,
    })?;

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&metadata, HeaderMode::Complete);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;

    if entry.file_type.is_dir() {
        builder.append_data(&mut header, &entry.name, io::empty())?;
        Ok(0)
    } else if entry.file_type.is_symlink() {
        let target = fs::read_link(&entry.path)?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder.append_link(&mut header, &entry.name, target)?;
        Ok(0)
    } else if entry.file_type.is_file() {
        let file = File::open(&entry.path).map_err(|source| BuildError::Path {
            context: format!("can't open '{}'", entry.path.display()),
            source,
        })?;
        builder.append_data(&mut header, &entry.name, file)?;
        Ok(metadata.len())
    } else {
        tracing::debug!("Skipping special file in build context: {}", entry.name);
        Ok(0)
    }
}

/// コンテキストサイズのチェックと警告
fn check_context_size(size: u64) {
    if size > MAX_CONTEXT_SIZE {
        tracing::warn!(
            "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
             .dockerignoreファイルで不要なファイルを除外することを推奨します。",
            size / 1024 / 1024
        );
    }
}
