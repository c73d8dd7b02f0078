//! keel のイメージビルド機能
//!
//! ビルドコンテキストの特定と tar 化、`.dockerignore` の適用、
//! コンテンツトラストによる Dockerfile の `FROM` 固定、
//! デーモンへのビルド要求までを提供します。

pub mod archive;
pub mod auth;
pub mod builder;
pub mod context;
pub mod dockerignore;
pub mod error;
pub mod options;
pub mod pipe;
pub mod progress;
pub mod reference;
pub mod splice;
pub mod transform;
pub mod trust;

pub use archive::ArchiveBuilder;
pub use auth::RegistryAuth;
pub use builder::{BuildOutcome, ImageBuilder};
pub use context::{ContextLocator, ContextSource, ContextType, PreparedContext};
pub use dockerignore::Excludes;
pub use error::{BuildError, BuildResult};
pub use options::BuildOptions;
pub use progress::UploadProgress;
pub use reference::{CanonicalReference, Reference, TaggedReference};
pub use splice::TrustSplicer;
pub use trust::{DockerfileRewriter, RegistryResolver, ResolvedTag, TrustResolver};
