//! keel クライアント設定
//!
//! `config.json`（レジストリ認証情報・プロキシ設定）の読み込みと、
//! コンテンツトラストなど環境変数ベースの設定を扱います。

pub mod error;
pub mod proxy;

pub use error::*;
pub use proxy::ProxyConfig;

use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 設定ファイル名
pub const CONFIG_FILE_NAME: &str = "config.json";

/// keel の設定ディレクトリを取得
///
/// 以下の優先順位で解決:
/// 1. 環境変数 KEEL_CONFIG
/// 2. 環境変数 DOCKER_CONFIG
/// 3. ~/.docker
pub fn get_config_dir() -> Result<PathBuf> {
    for var in ["KEEL_CONFIG", "DOCKER_CONFIG"] {
        if let Ok(dir) = std::env::var(var)
            && !dir.is_empty()
        {
            return Ok(PathBuf::from(dir));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".docker"))
        .ok_or(ConfigError::ConfigDirNotFound)
}

/// コンテンツトラストが有効かどうか（DOCKER_CONTENT_TRUST）
pub fn content_trust_enabled() -> bool {
    std::env::var("DOCKER_CONTENT_TRUST")
        .map(|v| {
            let v = v.trim();
            v == "1" || v.eq_ignore_ascii_case("true")
        })
        .unwrap_or(false)
}

/// デフォルトのビルドプラットフォーム（DOCKER_DEFAULT_PLATFORM）
pub fn default_platform() -> Option<String> {
    std::env::var("DOCKER_DEFAULT_PLATFORM")
        .ok()
        .filter(|p| !p.is_empty())
}

/// デーモンのアドレス（プロキシ設定のキーとして使用）
pub fn daemon_host() -> String {
    std::env::var("DOCKER_HOST")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unix:///var/run/docker.sock".to_string())
}

/// `config.json` の内容
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// 認証情報 (レジストリ -> AuthEntry)
    #[serde(default)]
    pub auths: HashMap<String, AuthEntry>,
    /// credential helper 名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    pub creds_store: Option<String>,
    /// プロキシ設定 ("default" またはデーモンホスト -> ProxyConfig)
    #[serde(default)]
    pub proxies: HashMap<String, ProxyConfig>,
}

/// 認証エントリ
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuthEntry {
    /// Base64エンコードされた "username:password"
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default, rename = "identitytoken")]
    pub identity_token: Option<String>,
}

/// デコード済みのレジストリ認証情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

impl ConfigFile {
    /// 設定ディレクトリから `config.json` を読み込む
    ///
    /// ファイルが存在しない場合は空の設定を返す
    pub fn load() -> Result<Self> {
        let dir = get_config_dir()?;
        Self::load_from(&dir.join(CONFIG_FILE_NAME))
    }

    /// 指定したパスの `config.json` を読み込む
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("config.json not found at {}", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `auths` に登録されたレジストリの認証情報をデコード
    pub fn credentials(&self, registry: &str) -> Result<Option<Credentials>> {
        let Some(auth_b64) = self.auths.get(registry).and_then(|e| e.auth.as_deref()) else {
            return Ok(None);
        };
        decode_auth(auth_b64, registry)
    }

    /// `auths` に登録された全レジストリの認証情報
    ///
    /// デコードできないエントリはスキップする
    pub fn all_credentials(&self) -> Vec<Credentials> {
        let mut registries: Vec<&String> = self.auths.keys().collect();
        registries.sort();

        registries
            .into_iter()
            .filter_map(|registry| match self.credentials(registry) {
                Ok(creds) => creds,
                Err(e) => {
                    tracing::warn!("{}", e);
                    None
                }
            })
            .collect()
    }
}

/// Base64エンコードされた認証情報をデコード
fn decode_auth(auth_b64: &str, registry: &str) -> Result<Option<Credentials>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64)
        .map_err(|e| ConfigError::InvalidAuth {
            registry: registry.to_string(),
            message: format!("Failed to decode auth: {}", e),
        })?;

    let auth_str = String::from_utf8(decoded).map_err(|e| ConfigError::InvalidAuth {
        registry: registry.to_string(),
        message: format!("Invalid UTF-8 in auth: {}", e),
    })?;

    Ok(auth_str
        .split_once(':')
        .map(|(username, password)| Credentials {
            username: username.to_string(),
            password: password.to_string(),
            server_address: registry.to_string(),
        }))
}
