//! プロキシ設定をビルド引数へ反映する

use crate::ConfigFile;
use serde::Deserialize;
use std::collections::HashMap;

/// `config.json` の `proxies` エントリ
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,
    #[serde(default)]
    pub ftp_proxy: Option<String>,
    #[serde(default)]
    pub all_proxy: Option<String>,
}

impl ProxyConfig {
    fn entries(&self) -> [(&'static str, Option<&str>); 5] {
        [
            ("HTTP_PROXY", self.http_proxy.as_deref()),
            ("HTTPS_PROXY", self.https_proxy.as_deref()),
            ("NO_PROXY", self.no_proxy.as_deref()),
            ("FTP_PROXY", self.ftp_proxy.as_deref()),
            ("ALL_PROXY", self.all_proxy.as_deref()),
        ]
    }
}

impl ConfigFile {
    /// デーモンホストに対応するプロキシ設定をビルド引数へマージ
    ///
    /// ホスト固有の設定がなければ "default" を使う。ユーザーが明示的に
    /// 指定した引数（大文字・小文字それぞれ）は上書きしない。
    pub fn apply_proxy_build_args(&self, host: &str, build_args: &mut HashMap<String, String>) {
        let Some(proxy) = self
            .proxies
            .get(host)
            .or_else(|| self.proxies.get("default"))
        else {
            return;
        };

        for (key, value) in proxy.entries() {
            let Some(value) = value.filter(|v| !v.is_empty()) else {
                continue;
            };
            build_args
                .entry(key.to_string())
                .or_insert_with(|| value.to_string());
            build_args
                .entry(key.to_lowercase())
                .or_insert_with(|| value.to_string());
        }
    }
}
