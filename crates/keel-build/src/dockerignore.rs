//! `.dockerignore` の読み込みとパターン照合

use crate::error::{BuildError, Result};
use glob::{MatchOptions, Pattern};
use std::path::Path;

/// `.dockerignore` のファイル名
pub const DOCKERIGNORE: &str = ".dockerignore";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct ExcludePattern {
    source: String,
    pattern: Pattern,
    exclusion: bool,
}

impl ExcludePattern {
    fn matches(&self, path: &str) -> bool {
        self.pattern.matches_with(path, MATCH_OPTIONS)
    }
}

/// ビルドコンテキストから除外するパスのパターン集合
///
/// 後に書かれたパターンが優先され、`!` で始まるパターンは除外を取り消す。
/// パターンはパス自身か、その親ディレクトリのいずれかに一致すれば一致とみなす。
#[derive(Debug, Clone, Default)]
pub struct Excludes {
    patterns: Vec<ExcludePattern>,
}

impl Excludes {
    /// コンテキストディレクトリの `.dockerignore` を読み込む（無ければ空）
    pub fn read(context_dir: &Path) -> Result<Self> {
        let path = context_dir.join(DOCKERIGNORE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| BuildError::Path {
            context: format!("failed to read {}", path.display()),
            source,
        })?;
        Self::parse(&content)
    }

    /// `.dockerignore` の内容を解析
    pub fn parse(content: &str) -> Result<Self> {
        let lines = content.lines().filter_map(|line| {
            if line.starts_with('#') {
                return None;
            }
            let line = line.trim();
            (!line.is_empty()).then_some(line)
        });
        Self::from_patterns(lines)
    }

    /// パターン文字列の列から作成
    pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut excludes = Self::default();
        for pattern in patterns {
            excludes.push(pattern)?;
        }
        Ok(excludes)
    }

    fn push(&mut self, raw: &str) -> Result<()> {
        let (exclusion, body) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, raw),
        };

        let mut cleaned = clean_path(&body.replace('\\', "/"));
        if cleaned.len() > 1 && cleaned.starts_with('/') {
            cleaned.remove(0);
        }

        let pattern = Pattern::new(&cleaned).map_err(|e| {
            BuildError::InvalidContext(format!("invalid .dockerignore pattern '{}': {}", raw, e))
        })?;

        self.patterns.push(ExcludePattern {
            source: if exclusion {
                format!("!{}", cleaned)
            } else {
                cleaned
            },
            pattern,
            exclusion,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// 正規化済みのパターン文字列
    pub fn patterns(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.source.as_str()).collect()
    }

    /// `!` パターンを含むかどうか
    pub fn has_exclusions(&self) -> bool {
        self.patterns.iter().any(|p| p.exclusion)
    }

    /// スラッシュ区切りの相対パスが除外対象か判定
    pub fn matches(&self, path: &str) -> bool {
        let path = clean_path(path);
        let parents: Vec<&str> = match path.rfind('/') {
            Some(i) => path[..i].split('/').collect(),
            None => Vec::new(),
        };

        let mut matched = false;
        for pattern in &self.patterns {
            // 既に一致している場合は `!` パターンだけ、未一致なら通常パターンだけ評価する
            if pattern.exclusion != matched {
                continue;
            }

            let mut hit = pattern.matches(&path);
            if !hit {
                hit = (1..=parents.len()).any(|i| pattern.matches(&parents[..i].join("/")));
            }

            if hit {
                matched = !pattern.exclusion;
            }
        }
        matched
    }

    /// 除外されたディレクトリの中に `!` パターンで取り戻されるパスがあり得るか
    pub fn may_include_under(&self, dir: &str) -> bool {
        let dir_slash = format!("{}/", clean_path(dir));
        self.patterns
            .iter()
            .filter(|p| p.exclusion)
            .any(|p| format!("{}/", &p.source[1..]).starts_with(&dir_slash))
    }

    /// `.dockerignore` と Dockerfile 自体はデーモンが読むので除外しない
    pub fn trim_build_files(&mut self, dockerfile: &str, dockerfile_from_stdin: bool) -> Result<()> {
        if self.matches(DOCKERIGNORE) {
            self.push(&format!("!{}", DOCKERIGNORE))?;
        }
        let dockerfile = dockerfile.replace('\\', "/");
        if !dockerfile_from_stdin && self.matches(&dockerfile) {
            self.push(&format!("!{}", dockerfile))?;
        }
        Ok(())
    }
}

/// スラッシュ区切りパスの正規化（`.` と `..` と重複スラッシュを除去）
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
