//! `keel build` のオプションと値のパース

use crate::error::{BuildError, Result};
use crate::reference::Reference;
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::LazyLock;

/// `--add-host` でホストの IP を指す特殊値
pub const HOST_GATEWAY: &str = "host-gateway";

static BYTES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?) ?([kKmMgGtTpP])?[iI]?[bB]?$").expect("valid size regex")
});

/// イメージビルドのオプション
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// `-t`（先頭がビルド時のタグ、残りはビルド後に付与）
    pub tags: Vec<String>,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub cache_from: Vec<String>,
    pub memory: Option<u64>,
    /// `-1` はスワップ無制限
    pub memory_swap: Option<i64>,
    pub shm_size: Option<u64>,
    pub cpu_shares: Option<u64>,
    pub cpu_period: Option<u64>,
    pub cpu_quota: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub network: Option<String>,
    pub target: Option<String>,
    pub platform: Option<String>,
    pub squash: bool,
    pub no_cache: bool,
    pub pull: bool,
    pub rm: bool,
    pub force_rm: bool,
    pub quiet: bool,
    pub compress: bool,
    pub iidfile: Option<PathBuf>,
    pub content_trust: bool,
}

impl BuildOptions {
    /// タグを検証して設定する
    pub fn with_tags<I, S>(mut self, tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            validate_tag(&tag)?;
            self.tags.push(tag);
        }
        Ok(self)
    }

    /// ビルド時にデーモンへ渡すタグ
    pub fn primary_tag(&self) -> Option<&str> {
        self.tags.first().map(String::as_str)
    }

    /// ビルド成功後に `tag_image` で付与するタグ
    pub fn extra_tags(&self) -> &[String] {
        self.tags.get(1..).unwrap_or_default()
    }
}

/// `-t` の値を検証する（名前は小文字、ダイジェストは不可）
pub fn validate_tag(tag: &str) -> Result<()> {
    let reference = Reference::parse_normalized(tag)?;
    if reference.digest().is_some() {
        return Err(BuildError::InvalidOption(format!(
            "invalid tag '{}': a tag cannot contain a digest",
            tag
        )));
    }
    Ok(())
}

/// `512m` や `1g` のようなサイズ表記をバイト数に変換する（1024 単位）
pub fn parse_bytes(value: &str) -> Result<u64> {
    let invalid = || BuildError::InvalidOption(format!("invalid size: '{}'", value));

    let caps = BYTES_RE.captures(value.trim()).ok_or_else(invalid)?;
    let number: f64 = caps[1].parse().map_err(|_| invalid())?;
    let multiplier: u64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1,
        Some(unit) => match unit.as_str() {
            "k" => 1 << 10,
            "m" => 1 << 20,
            "g" => 1 << 30,
            "t" => 1 << 40,
            "p" => 1 << 50,
            _ => return Err(invalid()),
        },
    };

    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// `--memory-swap` の値（`-1` は無制限）
pub fn parse_swap(value: &str) -> Result<i64> {
    if value.trim() == "-1" {
        return Ok(-1);
    }
    let bytes = parse_bytes(value)?;
    i64::try_from(bytes)
        .map_err(|_| BuildError::InvalidOption(format!("invalid size: '{}'", value)))
}

/// `KEY=VALUE` の並びをマップにする（`=` がなければ値は空）
pub fn parse_key_values<'a>(
    values: impl IntoIterator<Item = &'a str>,
) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for value in values {
        let (key, val) = value.split_once('=').unwrap_or((value, ""));
        if key.is_empty() {
            return Err(BuildError::InvalidOption(format!(
                "invalid key-value pair: '{}'",
                value
            )));
        }
        map.insert(key.to_string(), val.to_string());
    }
    Ok(map)
}

/// `--build-arg` をパースする
///
/// `KEY` のみの場合は環境変数の値を使い、未設定ならその引数は渡さない。
pub fn parse_build_args<'a>(
    values: impl IntoIterator<Item = &'a str>,
) -> Result<HashMap<String, String>> {
    let mut args = HashMap::new();
    for value in values {
        let (key, val) = match value.split_once('=') {
            Some((key, val)) => (key, Some(val.to_string())),
            None => (value, std::env::var(value).ok()),
        };
        if key.is_empty() {
            return Err(BuildError::InvalidOption(format!(
                "invalid build argument: '{}'",
                value
            )));
        }

        let Some(val) = val else {
            tracing::warn!(
                "ビルド引数 '{}' は環境変数にも設定されていないため無視します",
                key
            );
            continue;
        };

        warn_sensitive_build_arg(key);
        args.insert(key.to_string(), val);
    }
    Ok(args)
}

/// ビルド引数の検証（機密情報の警告）
pub fn warn_sensitive_build_arg(key: &str) {
    let sensitive_patterns = ["password", "token", "secret", "api_key", "private_key"];

    let key_lower = key.to_lowercase();
    if sensitive_patterns.iter().any(|p| key_lower.contains(p)) {
        tracing::warn!(
            "警告: ビルド引数 '{}' は機密情報を含む可能性があります。\n\
             ビルド引数はイメージ履歴に記録されます。\n\
             機密情報はビルド引数ではなく、シークレットマウントを使用してください。",
            key
        );
    }
}

/// `--add-host` の値（`name:ip`）を検証する
pub fn validate_extra_host(value: &str) -> Result<String> {
    let invalid = |reason: &str| {
        BuildError::InvalidOption(format!("invalid argument '{}' for --add-host: {}", value, reason))
    };

    let (host, ip) = value
        .split_once(':')
        .ok_or_else(|| invalid("expected name:ip"))?;
    if host.is_empty() {
        return Err(invalid("empty host name"));
    }
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    if ip != HOST_GATEWAY && ip.parse::<IpAddr>().is_err() {
        return Err(invalid("invalid IP address"));
    }
    Ok(format!("{}:{}", host, ip))
}
