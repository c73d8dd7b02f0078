use crate::docker;
use crate::formatter::{ListFormat, TABLE_FORMAT, render_services};
use crate::inspect::{InspectFormat, render_inspect};
use anyhow::Context as _;
use bollard::Docker;
use bollard::models::Service;
use clap::Args;
use std::collections::{BTreeSet, HashMap};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// 条件で絞り込む（例: name=web, label=env=prod, mode=global）
    #[arg(short = 'f', long = "filter", value_name = "KEY=VALUE")]
    pub filters: Vec<String>,

    /// 出力形式（table, raw, json, またはテンプレート）
    #[arg(long, default_value = TABLE_FORMAT)]
    pub format: String,

    /// ID のみ表示
    #[arg(short, long)]
    pub quiet: bool,
}

/// `--filter` をデーモンに渡す形にまとめる
pub fn parse_filters(filters: &[String]) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for filter in filters {
        let (key, value) = filter.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("フィルタの形式が正しくありません: '{}'（KEY=VALUE）", filter)
        })?;
        map.entry(key.trim().to_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(map)
}

/// サービス一覧コマンドを処理
pub async fn handle_list_command(args: ListArgs) -> anyhow::Result<()> {
    let filters = parse_filters(&args.filters)?;
    let format = ListFormat::parse(&args.format);

    let docker = docker::init_docker_with_error_handling().await?;

    #[allow(deprecated)]
    let options = bollard::service::ListServicesOptions {
        filters,
        status: true,
    };

    #[allow(deprecated)]
    let services = docker.list_services(Some(options)).await?;
    tracing::debug!("Listed {} service(s)", services.len());

    print!("{}", render_services(&services, &format, args.quiet)?);
    Ok(())
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// サービス名または ID
    #[arg(required = true, value_name = "SERVICE")]
    pub services: Vec<String>,

    /// 人が読みやすい形式で表示
    #[arg(long)]
    pub pretty: bool,

    /// 出力形式（pretty、またはテンプレート）
    #[arg(short = 'f', long)]
    pub format: Option<String>,
}

/// サービス詳細コマンドを処理
pub async fn handle_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let format = InspectFormat::from_flags(args.pretty, args.format.as_deref())?;

    let docker = docker::init_docker_with_error_handling().await?;

    let mut services = Vec::with_capacity(args.services.len());
    for name in &args.services {
        let service = docker
            .inspect_service(name, None::<bollard::query_parameters::InspectServiceOptions>)
            .await
            .with_context(|| format!("サービス '{}' を取得できませんでした", name))?;
        services.push(service);
    }

    let network_names = if format == InspectFormat::Pretty {
        resolve_networks(&docker, &services).await
    } else {
        HashMap::new()
    };

    print!("{}", render_inspect(&services, &format, &network_names)?);
    Ok(())
}

/// タスクのネットワーク ID を名前に解決する（解決できないものは含めない）
async fn resolve_networks(docker: &Docker, services: &[Service]) -> HashMap<String, String> {
    let targets: BTreeSet<&str> = services
        .iter()
        .filter_map(|s| s.spec.as_ref())
        .filter_map(|s| s.task_template.as_ref())
        .flat_map(|t| t.networks.iter().flatten())
        .filter_map(|n| n.target.as_deref())
        .collect();

    let mut names = HashMap::new();
    for target in targets {
        match docker
            .inspect_network(target, None::<bollard::query_parameters::InspectNetworkOptions>)
            .await
        {
            Ok(network) => {
                if let (Some(id), Some(name)) = (network.id, network.name) {
                    names.insert(id, name);
                }
            }
            Err(e) => tracing::debug!("Cannot resolve network {}: {}", target, e),
        }
    }
    names
}
