//! ビルドコンテキスト tar のストリーム変換
//!
//! いずれも blocking タスクで入力を読みながら新しい tar を書き出し、
//! 結果をパイプ越しに返します。

use crate::dockerignore::{DOCKERIGNORE, clean_path};
use crate::error::{BuildError, Result};
use crate::pipe::{PipeReader, spawn_transform};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tar::{Archive, Builder, Entry, EntryType, Header};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// コンテキスト外の Dockerfile をコンテキストへ追加する
///
/// Dockerfile は `.dockerfile.<ランダム>` という名前で追加され、その名前が返る。
/// `.dockerignore` には追加したファイル自身と `.dockerignore` を追記する
/// （無ければ作成する）ので、どちらもイメージには入らない。
pub fn add_dockerfile_to_context<I>(
    input: I,
    dockerfile: Vec<u8>,
    cancel: &CancellationToken,
) -> (String, PipeReader, JoinHandle<Option<()>>)
where
    I: Read + Send + 'static,
{
    let random_name = format!(
        ".dockerfile.{}",
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    );
    let name = random_name.clone();

    let (reader, handle) = spawn_transform(cancel, move |writer| {
        let mut archive = Archive::new(input);
        let mut builder = Builder::new(writer);
        let mut dockerignore_seen = false;

        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry_name(&entry)? == DOCKERIGNORE {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                append_ignore_entries(&mut content, &random_name);

                let mut header = entry.header().clone();
                header.set_size(content.len() as u64);
                builder.append_data(&mut header, DOCKERIGNORE, &content[..])?;
                dockerignore_seen = true;
            } else {
                copy_entry(&mut builder, entry)?;
            }
        }

        let mut header = regular_header(dockerfile.len());
        builder.append_data(&mut header, &random_name, &dockerfile[..])?;

        if !dockerignore_seen {
            let mut content = Vec::new();
            append_ignore_entries(&mut content, &random_name);
            let mut header = regular_header(content.len());
            builder.append_data(&mut header, DOCKERIGNORE, &content[..])?;
        }

        builder.finish()?;
        Ok(())
    });

    (name, reader, handle)
}

/// gzip 圧縮する（`--compress`）
pub fn compress<I>(input: I, cancel: &CancellationToken) -> (PipeReader, JoinHandle<Option<u64>>)
where
    I: Read + Send + 'static,
{
    spawn_transform(cancel, move |writer| {
        let mut input = input;
        let mut encoder = GzEncoder::new(writer, Compression::default());
        let copied = io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(copied)
    })
}

/// エントリのヘッダーと内容をそのまま書き出す
///
/// 長いパス名やリンク名は書き出し側で改めて拡張ヘッダーに分割される。
/// それ以外の PAX 属性（xattr、大きな uid やサイズなど）は元の値を書き戻す。
pub(crate) fn copy_entry<R: Read, W: Write>(
    builder: &mut Builder<W>,
    mut entry: Entry<'_, R>,
) -> Result<()> {
    let mut header = entry.header().clone();
    let entry_type = header.entry_type();

    if entry_type.is_pax_global_extensions() {
        builder.append(&header, &mut entry)?;
        return Ok(());
    }

    let path = entry.path()?.into_owned();
    let records = pax_records(&mut entry)?;
    if !records.is_empty() {
        append_pax_header(builder, &records)?;
    }
    if matches!(entry_type, EntryType::Symlink | EntryType::Link) {
        let target = entry.link_name()?.map(|t| t.into_owned()).ok_or_else(|| {
            BuildError::Archive(format!("link without target: {}", path.display()))
        })?;
        builder.append_link(&mut header, &path, target)?;
    } else {
        builder.append_data(&mut header, &path, &mut entry)?;
    }
    Ok(())
}

/// path と linkpath を除いた PAX ローカル属性
fn pax_records<R: Read>(entry: &mut Entry<'_, R>) -> Result<Vec<u8>> {
    let mut records = Vec::new();
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(records);
    };
    for extension in extensions {
        let extension = extension?;
        let key = extension.key_bytes();
        if key == b"path" || key == b"linkpath" {
            continue;
        }
        push_pax_record(&mut records, key, extension.value_bytes());
    }
    Ok(records)
}

/// `<長さ> <キー>=<値>\n` を追加する（長さは自身の桁を含む行全体）
fn push_pax_record(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    let rest = key.len() + value.len() + 3;
    let mut len = rest + 1;
    while rest + len.to_string().len() != len {
        len = rest + len.to_string().len();
    }
    out.extend_from_slice(len.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(key);
    out.push(b'=');
    out.extend_from_slice(value);
    out.push(b'\n');
}

/// 次のエントリに掛かる PAX 拡張ヘッダーを書き出す
fn append_pax_header<W: Write>(builder: &mut Builder<W>, records: &[u8]) -> Result<()> {
    const PAX_HEADER_NAME: &[u8] = b"././@PaxHeader";

    let mut header = Header::new_ustar();
    header.as_old_mut().name[..PAX_HEADER_NAME.len()].copy_from_slice(PAX_HEADER_NAME);
    header.set_entry_type(EntryType::XHeader);
    header.set_mode(0o644);
    header.set_size(records.len() as u64);
    header.set_cksum();
    builder.append(&header, records)?;
    Ok(())
}

/// エントリのパス（スラッシュ区切り、`./` は除去）
pub(crate) fn entry_name<R: Read>(entry: &Entry<'_, R>) -> Result<String> {
    let path = entry.path()?;
    Ok(normalize_name(&path))
}

pub(crate) fn normalize_name(path: &Path) -> String {
    clean_path(&path.to_string_lossy().replace('\\', "/"))
}

fn append_ignore_entries(content: &mut Vec<u8>, dockerfile_name: &str) {
    content.extend_from_slice(format!("\n{}\n{}\n", DOCKERIGNORE, dockerfile_name).as_bytes());
}

fn regular_header(size: usize) -> Header {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o600);
    header.set_mtime(now);
    header.set_size(size as u64);
    header
}
