use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません（KEEL_CONFIG または DOCKER_CONFIG を指定してください）")]
    ConfigDirNotFound,

    #[error("設定ファイルを読み込めません: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("設定ファイルの形式が不正です: {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("レジストリ '{registry}' の認証情報が不正です: {message}")]
    InvalidAuth { registry: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
