//! イメージ参照の解析と正規化
//!
//! `[registry[:port]/]path[:tag][@algorithm:hex]` 形式の参照を解析し、
//! Docker Hub の省略形（`alpine` → `docker.io/library/alpine`）を
//! 正規化された形へ展開します。

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

/// 省略時のレジストリ
pub const DEFAULT_DOMAIN: &str = "docker.io";
/// 旧 Docker Hub ドメイン
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
/// 公式イメージの名前空間
const OFFICIAL_REPO_PREFIX: &str = "library/";
/// タグ省略時のタグ
pub const DEFAULT_TAG: &str = "latest";
/// リポジトリ名の最大長
const NAME_TOTAL_LENGTH_MAX: usize = 255;

static PATH_COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("valid path component regex")
});

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?))*(?::[0-9]+)?$",
    )
    .expect("valid domain regex")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid tag regex"));

static DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]{32,}$").expect("valid digest regex")
});

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{64}$").expect("valid identifier regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("repository name must have at least one component")]
    NameEmpty,

    #[error("repository name must be lowercase: {0}")]
    NameContainsUppercase(String),

    #[error("repository name must not be more than 255 characters")]
    NameTooLong,

    #[error("invalid repository name ({0}), cannot specify 64-byte hexadecimal strings")]
    HexIdentifier(String),

    #[error("invalid tag format: {0}")]
    InvalidTag(String),

    #[error("invalid digest format: {0}")]
    InvalidDigest(String),

    #[error("{0}")]
    InvalidFormat(String),
}

/// 正規化済みのイメージ参照
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// 参照文字列を解析し、Docker Hub の省略形を正規化する
    pub fn parse_normalized(input: &str) -> Result<Self, ReferenceError> {
        if input.is_empty() {
            return Err(ReferenceError::NameEmpty);
        }
        if IDENTIFIER_RE.is_match(input) {
            return Err(ReferenceError::HexIdentifier(input.to_string()));
        }

        let (rest, digest) = match input.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest)?;
                (rest, Some(digest.to_string()))
            }
            None => (input, None),
        };

        // 最後の '/' 以降にある ':' だけがタグの区切り（ポート番号と区別する）
        let last_slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &rest[split + 1..];
                if !TAG_RE.is_match(tag) {
                    return Err(ReferenceError::InvalidTag(tag.to_string()));
                }
                (&rest[..split], Some(tag.to_string()))
            }
            None => (rest, None),
        };

        if name.is_empty() {
            return Err(ReferenceError::NameEmpty);
        }

        let (domain, path) = split_domain(name);
        validate_path(&path, input)?;
        if !DOMAIN_RE.is_match(&domain) {
            return Err(ReferenceError::InvalidFormat(input.to_string()));
        }
        if domain.len() + 1 + path.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ReferenceError::NameTooLong);
        }

        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// 完全修飾のリポジトリ名（例: `docker.io/library/alpine`）
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// 省略形のリポジトリ名（例: `alpine`）
    pub fn familiar_name(&self) -> String {
        if self.domain != DEFAULT_DOMAIN {
            return self.name();
        }
        match self.path.strip_prefix(OFFICIAL_REPO_PREFIX) {
            Some(short) if !short.contains('/') => short.to_string(),
            _ => self.path.clone(),
        }
    }

    /// 省略形の参照文字列（例: `alpine:3.18`）
    pub fn familiar_string(&self) -> String {
        let mut s = self.familiar_name();
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// ダイジェストを落とした省略形の `name:tag`（タグが無ければ None）
    pub fn familiar_name_tag(&self) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{}:{}", self.familiar_name(), tag))
    }

    /// タグもダイジェストも無い場合に `latest` を補う
    pub fn with_default_tag(mut self) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    /// タグ付き参照として取り出す（ダイジェストは落とす）
    pub fn to_tagged(&self) -> Option<TaggedReference> {
        self.tag.as_ref().map(|tag| TaggedReference {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: tag.clone(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// タグ付き参照（可変）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaggedReference {
    domain: String,
    path: String,
    tag: String,
}

impl TaggedReference {
    /// 正規化された `name:tag` を解析（タグ省略時は `latest`）
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let reference = Reference::parse_normalized(input)?.with_default_tag();
        reference
            .to_tagged()
            .ok_or_else(|| ReferenceError::InvalidFormat(input.to_string()))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn familiar(&self) -> String {
        format!("{}:{}", self.as_reference().familiar_name(), self.tag)
    }

    /// 同じリポジトリのダイジェスト参照を作る
    pub fn with_digest(&self, digest: &str) -> Result<CanonicalReference, ReferenceError> {
        validate_digest(digest)?;
        Ok(CanonicalReference {
            domain: self.domain.clone(),
            path: self.path.clone(),
            digest: digest.to_string(),
        })
    }

    fn as_reference(&self) -> Reference {
        Reference {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: Some(self.tag.clone()),
            digest: None,
        }
    }
}

impl fmt::Display for TaggedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.domain, self.path, self.tag)
    }
}

/// ダイジェスト参照（不変）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalReference {
    domain: String,
    path: String,
    digest: String,
}

impl CanonicalReference {
    /// `name@digest` を解析
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let reference = Reference::parse_normalized(input)?;
        match reference.digest {
            Some(digest) => Ok(Self {
                domain: reference.domain,
                path: reference.path,
                digest,
            }),
            None => Err(ReferenceError::InvalidDigest(input.to_string())),
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn familiar(&self) -> String {
        let reference = Reference {
            domain: self.domain.clone(),
            path: self.path.clone(),
            tag: None,
            digest: Some(self.digest.clone()),
        };
        reference.familiar_string()
    }
}

impl fmt::Display for CanonicalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.domain, self.path, self.digest)
    }
}

/// レジストリ部分とパス部分に分割し、Docker Hub 向けに正規化
fn split_domain(name: &str) -> (String, String) {
    let (domain, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains(['.', ':'])
                || first == "localhost"
                || first.to_lowercase() != first =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    let domain = if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    };

    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("{}{}", OFFICIAL_REPO_PREFIX, path)
    } else {
        path
    };

    (domain, path)
}

fn validate_path(path: &str, input: &str) -> Result<(), ReferenceError> {
    for component in path.split('/') {
        if PATH_COMPONENT_RE.is_match(component) {
            continue;
        }
        if component.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ReferenceError::NameContainsUppercase(input.to_string()));
        }
        return Err(ReferenceError::InvalidFormat(input.to_string()));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> Result<(), ReferenceError> {
    if !DIGEST_RE.is_match(digest) {
        return Err(ReferenceError::InvalidDigest(digest.to_string()));
    }
    if let Some(hex) = digest.strip_prefix("sha256:")
        && (hex.len() != 64 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')))
    {
        return Err(ReferenceError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}
