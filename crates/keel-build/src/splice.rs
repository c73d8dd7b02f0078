//! ビルドコンテキスト tar 内の Dockerfile をコンテンツトラスト用に差し替える

use crate::dockerignore::clean_path;
use crate::error::BuildError;
use crate::pipe::{PipeReader, spawn_transform};
use crate::transform::{copy_entry, entry_name};
use crate::trust::{DockerfileRewriter, ResolvedTag, TrustResolver};
use std::io::Read;
use std::sync::Arc;
use tar::{Archive, Builder};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// tar をストリームのまま読み書きし、Dockerfile エントリだけを書き換える
pub struct TrustSplicer<R> {
    rewriter: Arc<DockerfileRewriter<R>>,
}

impl<R> Clone for TrustSplicer<R> {
    fn clone(&self) -> Self {
        Self {
            rewriter: Arc::clone(&self.rewriter),
        }
    }
}

impl<R: TrustResolver + 'static> TrustSplicer<R> {
    pub fn new(rewriter: DockerfileRewriter<R>) -> Self {
        Self {
            rewriter: Arc::new(rewriter),
        }
    }

    /// `input` の tar を読み、`dockerfile_name` のエントリを書き換えた tar を返す
    ///
    /// エントリの順序と数は変わらない。書き換えた `FROM` の記録は
    /// 書き込み側が全て書き終えた後に JoinHandle から受け取る。
    /// 失敗した場合、エラーは読み込み側に届き JoinHandle は None を返す。
    pub fn splice<I>(
        &self,
        input: I,
        dockerfile_name: &str,
        cancel: &CancellationToken,
    ) -> (PipeReader, JoinHandle<Option<Vec<ResolvedTag>>>)
    where
        I: Read + Send + 'static,
    {
        let rewriter = Arc::clone(&self.rewriter);
        let target = clean_path(dockerfile_name);
        let token = cancel.clone();

        spawn_transform(cancel, move |writer| {
            let handle = Handle::current();
            let mut archive = Archive::new(input);
            let mut builder = Builder::new(writer);
            let mut resolved = None;

            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry_name(&entry)? != target {
                    copy_entry(&mut builder, entry)?;
                    continue;
                }

                if resolved.is_some() {
                    return Err(BuildError::Archive(format!(
                        "duplicate Dockerfile entry '{}' in build context",
                        target
                    )));
                }

                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;

                let output = handle.block_on(async {
                    tokio::select! {
                        _ = token.cancelled() => Err(BuildError::Cancelled),
                        output = rewriter.rewrite(&content) => output,
                    }
                })?;

                let mut header = entry.header().clone();
                header.set_size(output.dockerfile.len() as u64);
                let path = entry.path()?.into_owned();
                builder.append_data(&mut header, path, &output.dockerfile[..])?;

                resolved = Some(output.resolved);
            }

            builder.finish()?;

            if resolved.is_none() {
                tracing::debug!("Dockerfile '{}' not found in build context", target);
            }
            Ok(resolved.unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::into_build_error;
    use crate::transform::tests::{collect, make_archive, read_archive};
    use crate::trust::tests::{DIGEST, StaticResolver};
    use futures_util::StreamExt;
    use std::io::{self, Cursor};

    fn splicer(resolver: StaticResolver) -> TrustSplicer<StaticResolver> {
        TrustSplicer::new(DockerfileRewriter::new(resolver))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_splice_rewrites_only_dockerfile() {
        let input = make_archive(&[
            ("app/main.go", &b"package main"[..]),
            ("Dockerfile", &b"FROM alpine:3.18\nRUN echo hi\n"[..]),
            ("README.md", &b"# readme"[..]),
        ]);
        let cancel = CancellationToken::new();

        let (reader, handle) = splicer(StaticResolver::default().with("alpine:3.18", DIGEST))
            .splice(Cursor::new(input), "Dockerfile", &cancel);
        let output = collect(reader).await;
        let resolved = handle.await.unwrap().unwrap();

        let entries = read_archive(&output);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["app/main.go", "Dockerfile", "README.md"]);
        assert_eq!(entries[0].1, b"package main");
        assert_eq!(
            String::from_utf8(entries[1].1.clone()).unwrap(),
            format!("FROM alpine@{}\nRUN echo hi\n", DIGEST)
        );
        assert_eq!(entries[2].1, b"# readme");

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].tagged.familiar(), "alpine:3.18");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_splice_header_size_matches_content() {
        let input = make_archive(&[("build/Dockerfile", &b"FROM alpine:3.18\n"[..])]);
        let cancel = CancellationToken::new();

        let (reader, _handle) = splicer(StaticResolver::default().with("alpine:3.18", DIGEST))
            .splice(Cursor::new(input), "./build/Dockerfile", &cancel);
        let output = collect(reader).await;

        let mut archive = Archive::new(&output[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();

        let expected = format!("FROM alpine@{}\n", DIGEST);
        assert_eq!(content, expected.as_bytes());
        assert_eq!(entry.header().size().unwrap(), expected.len() as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_splice_without_from_changes_nothing() {
        let input = make_archive(&[
            ("Dockerfile", &b"FROM scratch\nCOPY app /\n"[..]),
            ("app", &b"binary"[..]),
        ]);
        let cancel = CancellationToken::new();

        let (reader, handle) = splicer(StaticResolver::default())
            .splice(Cursor::new(input.clone()), "Dockerfile", &cancel);
        let output = collect(reader).await;

        assert_eq!(read_archive(&output), read_archive(&input));
        assert_eq!(handle.await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resolution_failure_reaches_reader() {
        let input = make_archive(&[
            ("Dockerfile", &b"FROM untrusted:1\n"[..]),
            ("big", &vec![0u8; 256 * 1024][..]),
        ]);
        let cancel = CancellationToken::new();

        let (mut reader, handle) = splicer(StaticResolver::default())
            .splice(Cursor::new(input), "Dockerfile", &cancel);

        let mut failure = None;
        while let Some(chunk) = reader.next().await {
            if let Err(err) = chunk {
                failure = Some(into_build_error(err));
                break;
            }
        }

        assert!(matches!(failure, Some(BuildError::Resolve(_))));
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_dockerfile_rejected() {
        let input = make_archive(&[
            ("Dockerfile", &b"FROM scratch\n"[..]),
            ("Dockerfile", &b"FROM scratch\n"[..]),
        ]);
        let cancel = CancellationToken::new();

        let (reader, handle) =
            splicer(StaticResolver::default()).splice(Cursor::new(input), "Dockerfile", &cancel);

        let result = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut data = Vec::new();
            reader.read_to_end(&mut data)
        })
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(matches!(into_build_error(err), BuildError::Archive(_)));
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_archive_reaches_reader() {
        let mut input = make_archive(&[("Dockerfile", &b"FROM scratch\n"[..])]);
        // ヘッダーのチェックサムを壊す
        input[148] = b'X';
        let cancel = CancellationToken::new();

        let (reader, handle) =
            splicer(StaticResolver::default()).splice(Cursor::new(input), "Dockerfile", &cancel);

        let result = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            io::copy(&mut reader, &mut io::sink())
        })
        .await
        .unwrap();

        assert!(result.is_err());
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_stops_producer() {
        let files: Vec<(String, Vec<u8>)> = (0..64)
            .map(|i| (format!("file{:02}", i), vec![b'x'; 4096]))
            .collect();
        let refs: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(n, c)| (n.as_str(), c.as_slice()))
            .collect();
        let input = make_archive(&refs);
        let cancel = CancellationToken::new();

        let (reader, handle) =
            splicer(StaticResolver::default()).splice(Cursor::new(input), "Dockerfile", &cancel);

        // 読み手は何も読まないまま、キャンセルで書き手が解放される
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), None);
        drop(reader);
    }
}
