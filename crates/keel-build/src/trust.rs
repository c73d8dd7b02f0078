//! コンテンツトラスト
//!
//! Dockerfile の `FROM` 行にあるタグ参照を、レジストリで解決した
//! ダイジェスト参照へ書き換えます。書き換えた参照は [`ResolvedTag`] として
//! 記録され、ビルド成功後に元のタグを付け直すために使われます。

use crate::auth::RegistryAuth;
use crate::error::Result;
use crate::reference::{CanonicalReference, Reference, ReferenceError, TaggedReference};
use bollard::Docker;
use regex::bytes::Regex;
use std::future::Future;
use thiserror::Error;

/// ベースイメージ無しを表すトークン
pub const NO_BASE_IMAGE: &str = "scratch";

/// 先頭の空白と大文字小文字を許容し、`FROM` の直後のトークンを捕捉する
const FROM_LINE_PATTERN: &str =
    r"(?i-u)^[\t\n\x0C\r ]*FROM[ \x0C\r\t\x0B]+(?P<image>[^ \x0C\r\t\x0B\n#]+)";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no trust data for {0}")]
    NotFound(String),

    #[error("registry returned an invalid digest for {reference}: {source}")]
    InvalidDigest {
        reference: String,
        #[source]
        source: ReferenceError,
    },

    #[error("failed to look up {reference}: {source}")]
    Registry {
        reference: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// タグ参照をダイジェスト参照へ解決する
///
/// 署名検証などの信頼判断はこの境界の向こう側で行う
pub trait TrustResolver: Send + Sync {
    fn resolve(
        &self,
        reference: &TaggedReference,
    ) -> impl Future<Output = std::result::Result<CanonicalReference, ResolveError>> + Send;
}

/// 書き換えた `FROM` 行 1 つ分の記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTag {
    /// Dockerfile に書かれていたタグ参照（タグ省略時は `latest` 補完後）
    pub tagged: TaggedReference,
    /// 解決されたダイジェスト参照
    pub canonical: CanonicalReference,
}

/// 書き換え結果
#[derive(Debug, Clone, Default)]
pub struct RewriteOutput {
    pub dockerfile: Vec<u8>,
    pub resolved: Vec<ResolvedTag>,
}

/// Dockerfile の `FROM` 行を書き換える
pub struct DockerfileRewriter<R> {
    from_line: Regex,
    resolver: R,
}

impl<R: TrustResolver> DockerfileRewriter<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            from_line: Regex::new(FROM_LINE_PATTERN).expect("valid FROM line regex"),
            resolver,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Dockerfile 全体を書き換える
    ///
    /// 各行は `\n` で終端される（`\r\n` は `\n` に正規化）。
    /// 参照の解析や解決に失敗した場合は書き換え結果を一切返さない。
    pub async fn rewrite(&self, dockerfile: &[u8]) -> Result<RewriteOutput> {
        let mut output = RewriteOutput {
            dockerfile: Vec::with_capacity(dockerfile.len()),
            resolved: Vec::new(),
        };

        for line in lines(dockerfile) {
            match self.rewrite_line(line).await? {
                Some((rewritten, resolved)) => {
                    output.dockerfile.extend_from_slice(&rewritten);
                    output.resolved.push(resolved);
                }
                None => output.dockerfile.extend_from_slice(line),
            }
            output.dockerfile.push(b'\n');
        }

        tracing::debug!(
            "Rewrote Dockerfile: {} base image(s) pinned",
            output.resolved.len()
        );
        Ok(output)
    }

    async fn rewrite_line(&self, line: &[u8]) -> Result<Option<(Vec<u8>, ResolvedTag)>> {
        let Some(caps) = self.from_line.captures(line) else {
            return Ok(None);
        };
        let (Some(whole), Some(image)) = (caps.get(0), caps.name("image")) else {
            return Ok(None);
        };
        if image.as_bytes() == NO_BASE_IMAGE.as_bytes() {
            return Ok(None);
        }

        let token = std::str::from_utf8(image.as_bytes()).map_err(|_| {
            ReferenceError::InvalidFormat(String::from_utf8_lossy(image.as_bytes()).into_owned())
        })?;
        let reference = Reference::parse_normalized(token)?.with_default_tag();

        // ダイジェストのみの参照は既に不変なので解決しない
        let Some(tagged) = reference.to_tagged() else {
            return Ok(None);
        };

        tracing::debug!("Resolving trusted reference for {}", tagged.familiar());
        let canonical = self.resolver.resolve(&tagged).await?;

        let mut rewritten = Vec::with_capacity(line.len() + 72);
        rewritten.extend_from_slice(&line[..whole.start()]);
        rewritten.extend_from_slice(format!("FROM {}", canonical.familiar()).as_bytes());
        rewritten.extend_from_slice(&line[whole.end()..]);

        Ok(Some((rewritten, ResolvedTag { tagged, canonical })))
    }
}

/// 改行で分割した行（行末の `\r` は除去、最終行の改行は任意）
fn lines(input: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = input;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let line = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => {
                let line = &rest[..i];
                rest = &rest[i + 1..];
                line
            }
            None => std::mem::take(&mut rest),
        };
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    })
}

/// レジストリの現在のマニフェストダイジェストで解決する
///
/// デーモンの distribution エンドポイントに問い合わせる
pub struct RegistryResolver {
    docker: Docker,
    auth: RegistryAuth,
}

impl RegistryResolver {
    pub fn new(docker: Docker, auth: RegistryAuth) -> Self {
        Self { docker, auth }
    }
}

impl TrustResolver for RegistryResolver {
    async fn resolve(
        &self,
        reference: &TaggedReference,
    ) -> std::result::Result<CanonicalReference, ResolveError> {
        let credentials = self
            .auth
            .get_credentials(reference.domain())
            .unwrap_or_else(|e| {
                tracing::warn!("{}", e);
                None
            });

        let info = self
            .docker
            .inspect_registry_image(&reference.to_string(), credentials)
            .await
            .map_err(|source| ResolveError::Registry {
                reference: reference.familiar(),
                source,
            })?;

        let digest = info
            .descriptor
            .digest
            .ok_or_else(|| ResolveError::NotFound(reference.familiar()))?;

        reference
            .with_digest(&digest)
            .map_err(|source| ResolveError::InvalidDigest {
                reference: reference.familiar(),
                source,
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::BuildError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub(crate) const DIGEST: &str =
        "sha256:4a1c4b21597c1b4415bdbecb28a3296c6b5e23ca4f9feeb599860a1dac6a0108";

    /// 固定の対応表で解決し、呼び出し順を記録するテスト用リゾルバ
    #[derive(Default)]
    pub(crate) struct StaticResolver {
        digests: HashMap<String, String>,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl StaticResolver {
        pub(crate) fn with(mut self, familiar: &str, digest: &str) -> Self {
            self.digests.insert(familiar.to_string(), digest.to_string());
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TrustResolver for StaticResolver {
        async fn resolve(
            &self,
            reference: &TaggedReference,
        ) -> std::result::Result<CanonicalReference, ResolveError> {
            let familiar = reference.familiar();
            self.calls.lock().unwrap().push(familiar.clone());
            match self.digests.get(&familiar) {
                Some(digest) => reference
                    .with_digest(digest)
                    .map_err(|source| ResolveError::InvalidDigest {
                        reference: familiar,
                        source,
                    }),
                None => Err(ResolveError::NotFound(familiar)),
            }
        }
    }

    fn rewriter(resolver: StaticResolver) -> DockerfileRewriter<StaticResolver> {
        DockerfileRewriter::new(resolver)
    }

    #[tokio::test]
    async fn test_rewrite_pins_base_image() {
        let rewriter = rewriter(StaticResolver::default().with("alpine:3.18", DIGEST));

        let output = rewriter
            .rewrite(b"FROM alpine:3.18\nRUN echo hi\n")
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(output.dockerfile).unwrap(),
            format!("FROM alpine@{}\nRUN echo hi\n", DIGEST)
        );
        assert_eq!(output.resolved.len(), 1);
        assert_eq!(output.resolved[0].tagged.familiar(), "alpine:3.18");
        assert_eq!(
            output.resolved[0].canonical.familiar(),
            format!("alpine@{}", DIGEST)
        );
    }

    #[tokio::test]
    async fn test_lines_without_from_are_unchanged() {
        let rewriter = rewriter(StaticResolver::default());
        let input = b"# syntax comment\nRUN make\r\nCOPY . /src\nCMD [\"run\"]";

        let output = rewriter.rewrite(input).await.unwrap();

        assert_eq!(
            output.dockerfile,
            b"# syntax comment\nRUN make\nCOPY . /src\nCMD [\"run\"]\n"
        );
        assert!(output.resolved.is_empty());
        assert!(rewriter.resolver().calls().is_empty());
    }

    #[tokio::test]
    async fn test_empty_dockerfile() {
        let rewriter = rewriter(StaticResolver::default());
        let output = rewriter.rewrite(b"").await.unwrap();
        assert!(output.dockerfile.is_empty());
    }

    #[tokio::test]
    async fn test_scratch_is_never_resolved() {
        let rewriter = rewriter(StaticResolver::default());
        let input = b"FROM scratch\n  from\tscratch AS base\nfRoM scratch # empty\n";

        let output = rewriter.rewrite(input).await.unwrap();

        assert_eq!(output.dockerfile, input);
        assert!(rewriter.resolver().calls().is_empty());
    }

    #[tokio::test]
    async fn test_resolves_each_from_line_in_order() {
        let other = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
        let rewriter = rewriter(
            StaticResolver::default()
                .with("golang:1.22", DIGEST)
                .with("debian:latest", other),
        );
        let input = b"FROM golang:1.22 AS build\nRUN go build\n\n  from debian # runtime\nCOPY --from=build /app /app\n";

        let output = rewriter.rewrite(input).await.unwrap();

        assert_eq!(
            rewriter.resolver().calls(),
            vec!["golang:1.22", "debian:latest"]
        );
        assert_eq!(
            String::from_utf8(output.dockerfile).unwrap(),
            format!(
                "FROM golang@{} AS build\nRUN go build\n\nFROM debian@{} # runtime\nCOPY --from=build /app /app\n",
                DIGEST, other
            )
        );
        let tags: Vec<String> = output.resolved.iter().map(|r| r.tagged.familiar()).collect();
        assert_eq!(tags, vec!["golang:1.22", "debian:latest"]);
    }

    #[tokio::test]
    async fn test_resolution_failure_aborts_rewrite() {
        let rewriter = rewriter(StaticResolver::default().with("alpine:3.18", DIGEST));
        let input = b"FROM alpine:3.18\nFROM unknown/image:1\nFROM alpine:3.18\n";

        let result = rewriter.rewrite(input).await;

        assert!(matches!(
            result,
            Err(BuildError::Resolve(ResolveError::NotFound(ref name))) if name == "unknown/image:1"
        ));
        // 失敗した行以降は解決されない
        assert_eq!(
            rewriter.resolver().calls(),
            vec!["alpine:3.18", "unknown/image:1"]
        );
    }

    #[tokio::test]
    async fn test_unparseable_reference_aborts_rewrite() {
        let rewriter = rewriter(StaticResolver::default());
        let result = rewriter.rewrite(b"FROM ${BASE}\n").await;
        assert!(matches!(result, Err(BuildError::InvalidReference(_))));

        let result = rewriter.rewrite(b"FROM Alpine:3\n").await;
        assert!(matches!(
            result,
            Err(BuildError::InvalidReference(ReferenceError::NameContainsUppercase(_)))
        ));
    }

    #[tokio::test]
    async fn test_digest_reference_is_left_alone() {
        let rewriter = rewriter(StaticResolver::default());
        let input = format!("FROM alpine@{}\n", DIGEST);

        let output = rewriter.rewrite(input.as_bytes()).await.unwrap();

        assert_eq!(output.dockerfile, input.as_bytes());
        assert!(output.resolved.is_empty());
        assert!(rewriter.resolver().calls().is_empty());
    }

    #[tokio::test]
    async fn test_registry_reference_keeps_domain() {
        let rewriter = rewriter(
            StaticResolver::default().with("registry.example.com:5000/team/app:dev", DIGEST),
        );

        let output = rewriter
            .rewrite(b"FROM registry.example.com:5000/team/app:dev\n")
            .await
            .unwrap();

        assert_eq!(
            String::from_utf8(output.dockerfile).unwrap(),
            format!("FROM registry.example.com:5000/team/app@{}\n", DIGEST)
        );
    }

    #[test]
    fn test_lines_split() {
        let collected: Vec<&[u8]> = lines(b"a\r\nb\n\nc").collect();
        assert_eq!(collected, [&b"a"[..], &b"b"[..], &b""[..], &b"c"[..]]);
        assert_eq!(lines(b"only\n").count(), 1);
    }
}
