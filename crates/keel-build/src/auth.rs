//! レジストリ認証処理
//!
//! `config.json` から認証情報を取得し、Bollard の DockerCredentials に変換します。

use crate::error::BuildResult;
use crate::reference::{DEFAULT_DOMAIN, Reference};
use bollard::auth::DockerCredentials;
use keel_config::{ConfigFile, Credentials};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};

/// `config.json` で Docker Hub の認証情報に使われるキー
const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

/// credential helper からのレスポンス
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// レジストリ認証を管理
#[derive(Debug, Default)]
pub struct RegistryAuth {
    config: ConfigFile,
}

impl RegistryAuth {
    pub fn new(config: ConfigFile) -> Self {
        Self { config }
    }

    /// 設定ディレクトリの `config.json` から作成
    pub fn load() -> BuildResult<Self> {
        Ok(Self::new(ConfigFile::load()?))
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// レジストリの認証情報を取得
    ///
    /// # Returns
    /// * `Ok(Some(credentials))` - 認証情報が見つかった場合
    /// * `Ok(None)` - 認証情報が不要または見つからない場合
    /// * `Err(e)` - `config.json` の認証情報が壊れている場合
    pub fn get_credentials(&self, registry: &str) -> BuildResult<Option<DockerCredentials>> {
        // 1. auths セクションを確認
        for key in config_keys(registry) {
            if let Some(creds) = self.config.credentials(key)? {
                tracing::debug!("Found credentials in auths for {}", registry);
                return Ok(Some(to_docker_credentials(creds)));
            }
        }

        // 2. credential helper を確認
        if let Some(helper) = &self.config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            let server = config_keys(registry)[0];
            if let Some(creds) = self.get_from_helper(helper, server) {
                return Ok(Some(creds));
            }
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }

    /// イメージ名に対応するレジストリの認証情報を取得
    pub fn get_credentials_for_image(&self, image: &str) -> BuildResult<Option<DockerCredentials>> {
        self.get_credentials(&extract_registry(image))
    }

    /// `auths` に登録された全レジストリの認証情報
    ///
    /// ビルド中に Dockerfile が参照するどのレジストリからも pull できるよう、
    /// キーはサーバーアドレス。
    pub fn all_credentials(&self) -> HashMap<String, DockerCredentials> {
        self.config
            .all_credentials()
            .into_iter()
            .map(|creds| (creds.server_address.clone(), to_docker_credentials(creds)))
            .collect()
    }

    /// credential helper から認証情報を取得
    fn get_from_helper(&self, helper: &str, registry: &str) -> Option<DockerCredentials> {
        let helper_cmd = format!("docker-credential-{}", helper);

        let mut child = match Command::new(&helper_cmd)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::debug!("Failed to run {}: {}", helper_cmd, e);
                return None;
            }
        };

        // レジストリ名を stdin に渡す
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(registry.as_bytes()).ok();
        }

        let output = match child.wait_with_output() {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("Credential helper failed: {}", e);
                return None;
            }
        };

        if !output.status.success() {
            // credential helper が認証情報を持っていない場合
            tracing::debug!(
                "Credential helper returned error for {}: {}",
                registry,
                String::from_utf8_lossy(&output.stderr)
            );
            return None;
        }

        match serde_json::from_slice::<CredentialResponse>(&output.stdout) {
            Ok(response) => Some(DockerCredentials {
                username: Some(response.username),
                password: Some(response.secret),
                serveraddress: Some(registry.to_string()),
                ..Default::default()
            }),
            Err(e) => {
                tracing::debug!("Failed to parse credential helper response: {}", e);
                None
            }
        }
    }
}

/// イメージ名からレジストリを抽出
///
/// # Examples
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn extract_registry(image: &str) -> String {
    Reference::parse_normalized(image)
        .map(|r| r.domain().to_string())
        .unwrap_or_else(|_| DEFAULT_DOMAIN.to_string())
}

/// `config.json` の `auths` を引くときのキー候補
fn config_keys(registry: &str) -> Vec<&str> {
    if registry == DEFAULT_DOMAIN {
        vec![DOCKER_HUB_AUTH_KEY, DEFAULT_DOMAIN, "index.docker.io"]
    } else {
        vec![registry]
    }
}

fn to_docker_credentials(creds: Credentials) -> DockerCredentials {
    DockerCredentials {
        username: Some(creds.username),
        password: Some(creds.password),
        serveraddress: Some(creds.server_address),
        ..Default::default()
    }
}
