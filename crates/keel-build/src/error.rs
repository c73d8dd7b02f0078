use crate::reference::ReferenceError;
use crate::trust::ResolveError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid reference format: {0}")]
    InvalidReference(#[from] ReferenceError),

    #[error("unable to prepare context: {0}")]
    ContextNotFound(String),

    #[error("Cannot locate specified Dockerfile: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("invalid argument: can't use stdin for both build context and dockerfile")]
    StdinConflict,

    #[error("invalid build context: {0}")]
    InvalidContext(String),

    #[error("invalid build option: {0}")]
    InvalidOption(String),

    #[error("content trust resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("malformed build context archive: {0}")]
    Archive(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("{message}")]
    Daemon { message: String, code: i64 },

    #[error("Server did not provide an image ID. Cannot write {0}")]
    MissingImageId(PathBuf),

    #[error("failed to tag {digest_ref} as {tag_ref}: {message}")]
    TrustTag {
        digest_ref: String,
        tag_ref: String,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(#[from] keel_config::ConfigError),

    #[error("{context}: {source}")]
    Path {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// デーモンから返されたエラーを変換（コード未指定の場合は 1）
    pub fn daemon(message: impl Into<String>, code: Option<i64>) -> Self {
        BuildError::Daemon {
            message: message.into(),
            code: code.filter(|c| *c != 0).unwrap_or(1),
        }
    }

    /// プロセスの終了コード
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Daemon { code, .. } => i32::try_from(*code).unwrap_or(1),
            _ => 1,
        }
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::DockerfileNotFound(path) => {
                format!(
                    "Dockerfileが見つかりません: {}\n\
                     \n\
                     解決方法:\n\
                     1. Dockerfileのパスを確認してください\n\
                     2. -f オプションで明示的にパスを指定してください:\n\
                        keel build -f path/to/Dockerfile .",
                    path.display()
                )
            }
            BuildError::ContextNotFound(msg) => {
                format!(
                    "ビルドコンテキストを準備できません: {}\n\
                     \n\
                     ディレクトリ、Git URL、tarball の URL、または - (stdin) を指定してください。",
                    msg
                )
            }
            BuildError::Resolve(err) => {
                format!(
                    "コンテンツトラストの解決に失敗しました: {}\n\
                     \n\
                     信頼できないイメージを使う場合は --disable-content-trust を指定してください。",
                    err
                )
            }
            BuildError::DockerConnection(err) => {
                format!(
                    "Dockerデーモンに接続できません: {}\n\
                     \n\
                     Dockerが起動しているか、DOCKER_HOST が正しいか確認してください。",
                    err
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
pub type Result<T> = BuildResult<T>;
