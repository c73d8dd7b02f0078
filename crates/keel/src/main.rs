mod commands;
mod docker;
mod formatter;
mod inspect;

use clap::{Parser, Subcommand};
use colored::Colorize;
use keel_build::BuildError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "コンテナイメージのビルドとサービス管理のためのクライアント", long_about = None)]
struct Cli {
    /// デバッグログを出力
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dockerfileからイメージをビルド
    Build(commands::build::BuildArgs),
    /// Swarmサービスを管理
    #[command(subcommand)]
    Service(ServiceCommands),
    /// バージョン情報を表示
    Version,
}

#[derive(Subcommand)]
enum ServiceCommands {
    /// サービスの一覧を表示
    #[command(visible_alias = "list")]
    Ls(commands::service::ListArgs),
    /// サービスの詳細を表示
    Inspect(commands::service::InspectArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(err) = run(cli).await {
        eprintln!("{} {}", "✗".red().bold(), error_message(&err));
        std::process::exit(exit_code(&err));
    }
}

/// ログは stderr へ（stdout はビルド出力や一覧に使う）
fn init_tracing(debug: bool) {
    let default_level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Build(args) => commands::build::handle_build_command(args).await,
        Commands::Service(ServiceCommands::Ls(args)) => {
            commands::service::handle_list_command(args).await
        }
        Commands::Service(ServiceCommands::Inspect(args)) => {
            commands::service::handle_inspect_command(args).await
        }
        Commands::Version => {
            println!("keel {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn error_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<BuildError>() {
        Some(build_err) => build_err.user_message(),
        None => format!("{:#}", err),
    }
}

/// デーモンが返したビルドエラーはそのコードで終了する
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<BuildError>()
        .map(BuildError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_daemon_error() {
        let err = anyhow::Error::from(BuildError::daemon("failed", Some(3)));
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn test_cli_parses_build_flags() {
        let cli = Cli::try_parse_from([
            "keel", "-D", "build", "-t", "app:1", "-t", "app:latest", "--build-arg", "A=1",
            "--rm=false", "-q", ".",
        ])
        .unwrap();
        assert!(cli.debug);
        let Commands::Build(args) = cli.command else {
            panic!("expected build command");
        };
        assert_eq!(args.context, ".");
        assert_eq!(args.tags, vec!["app:1", "app:latest"]);
        assert!(!args.rm);
        assert!(args.quiet);
    }

    #[test]
    fn test_rm_defaults_to_true() {
        let cli = Cli::try_parse_from(["keel", "build", "."]).unwrap();
        let Commands::Build(args) = cli.command else {
            panic!("expected build command");
        };
        assert!(args.rm);
    }

    #[test]
    fn test_service_inspect_args() {
        let cli = Cli::try_parse_from(["keel", "service", "inspect", "--pretty", "web", "api"])
            .unwrap();
        let Commands::Service(ServiceCommands::Inspect(args)) = cli.command else {
            panic!("expected service inspect");
        };
        assert!(args.pretty);
        assert_eq!(args.services, vec!["web", "api"]);
        assert!(Cli::try_parse_from(["keel", "service", "inspect"]).is_err());
    }

    #[test]
    fn test_service_ls_alias() {
        let cli = Cli::try_parse_from(["keel", "service", "list", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Service(ServiceCommands::Ls(_))
        ));
    }
}
