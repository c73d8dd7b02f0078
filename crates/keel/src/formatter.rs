//! `keel service ls` の出力整形

use anyhow::Context as _;
use bollard::models::{EndpointPortConfigPublishModeEnum, Service};
use keel_build::Reference;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::LazyLock;
use tera::{Context, Tera};

pub const TABLE_FORMAT: &str = "table";
pub const RAW_FORMAT: &str = "raw";
pub const JSON_FORMAT: &str = "json";

/// ID の表示桁数
const SHORT_ID_LENGTH: usize = 12;

/// 列の間の空白
const COLUMN_PADDING: usize = 3;

const HEADERS: [&str; 6] = ["ID", "NAME", "MODE", "REPLICAS", "IMAGE", "PORTS"];

/// `{{.Name}}` や `{{.Spec.Name}}` 形式のフィールド参照
static FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.([\w.]+)\s*\}\}").expect("valid field regex"));

/// 一覧の 1 行
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRow {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub mode: String,
    pub replicas: String,
    pub image: String,
    pub ports: String,
}

impl ServiceRow {
    pub fn from_service(service: &Service) -> Self {
        let spec = service.spec.as_ref();
        let mode = service_mode(service);

        let ports = service
            .endpoint
            .as_ref()
            .and_then(|e| e.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| PortConfig {
                        protocol: p
                            .protocol
                            .as_ref()
                            .map(|proto| proto.to_string())
                            .unwrap_or_default(),
                        published: port_number(p.published_port),
                        target: port_number(p.target_port),
                        ingress: p.publish_mode == Some(EndpointPortConfigPublishModeEnum::INGRESS),
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let image = spec
            .and_then(|s| s.task_template.as_ref())
            .and_then(|t| t.container_spec.as_ref())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();

        Self {
            id: truncate_id(service.id.as_deref().unwrap_or_default()),
            name: spec.and_then(|s| s.name.clone()).unwrap_or_default(),
            replicas: replicas(service, mode),
            mode: mode.to_string(),
            image: display_image(&image),
            ports: format_ports(ports),
        }
    }
}

/// `docker service` のモード
fn service_mode(service: &Service) -> &'static str {
    let Some(mode) = service.spec.as_ref().and_then(|s| s.mode.as_ref()) else {
        return "";
    };
    if mode.global.is_some() {
        "global"
    } else if mode.replicated.is_some() {
        "replicated"
    } else if mode.replicated_job.is_some() {
        "replicated job"
    } else if mode.global_job.is_some() {
        "global job"
    } else {
        ""
    }
}

fn replicas(service: &Service, mode: &str) -> String {
    let status = service.service_status.as_ref();
    let running = status.and_then(|s| s.running_tasks).unwrap_or(0);
    let desired = status.and_then(|s| s.desired_tasks).unwrap_or(0);
    let completed = status.and_then(|s| s.completed_tasks).unwrap_or(0);
    let spec = service.spec.as_ref();

    match mode {
        // ジョブでは 1 ノードあたりの上限より進捗を表示する
        "replicated job" => {
            let total = spec
                .and_then(|s| s.mode.as_ref())
                .and_then(|m| m.replicated_job.as_ref())
                .and_then(|j| j.total_completions)
                .unwrap_or(0);
            format!(
                "{}/{} ({}/{} completed)",
                running, desired, completed, total
            )
        }
        // desired はまだ完了していないタスクだけを数える
        "global job" => format!(
            "{}/{} ({}/{} completed)",
            running,
            desired,
            completed,
            desired + completed
        ),
        _ => {
            let max_replicas = spec
                .filter(|_| mode == "replicated")
                .and_then(|s| s.task_template.as_ref())
                .and_then(|t| t.placement.as_ref())
                .and_then(|p| p.max_replicas)
                .unwrap_or(0);
            if max_replicas > 0 {
                format!("{}/{} (max {} per node)", running, desired, max_replicas)
            } else {
                format!("{}/{}", running, desired)
            }
        }
    }
}

fn truncate_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LENGTH).collect()
}

/// タグ付きの参照なら短い `name:tag` に（ダイジェストは落とす）
pub fn display_image(image: &str) -> String {
    match Reference::parse_normalized(image) {
        Ok(reference) => reference
            .familiar_name_tag()
            .unwrap_or_else(|| image.to_string()),
        Err(_) => image.to_string(),
    }
}

fn port_number(port: Option<i64>) -> u32 {
    port.and_then(|p| u32::try_from(p).ok()).unwrap_or(0)
}

/// 公開ポートの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub protocol: String,
    pub published: u32,
    pub target: u32,
    pub ingress: bool,
}

#[derive(Debug, Default)]
struct PortRange {
    pub_start: u32,
    pub_end: u32,
    target_start: u32,
    target_end: u32,
    protocol: String,
}

impl PortRange {
    fn starting_at(port: &PortConfig) -> Self {
        Self {
            pub_start: port.published,
            pub_end: port.published,
            target_start: port.target,
            target_end: port.target,
            protocol: port.protocol.clone(),
        }
    }

    fn render(&self) -> String {
        let published = if self.pub_end > self.pub_start {
            format!("{}-{}", self.pub_start, self.pub_end)
        } else {
            self.pub_start.to_string()
        };
        let target = if self.target_end > self.target_start {
            format!("{}-{}", self.target_start, self.target_end)
        } else {
            self.target_start.to_string()
        };
        format!("*:{}->{}/{}", published, target, self.protocol)
    }
}

/// ingress で公開されたポートを連続する範囲にまとめて表示する
///
/// `80->80, 81->81` は `*:80-81->80-81`、`80->80, 81->80` は `*:80-81->80`。
/// 範囲のターゲットと重なるポートは新しい範囲になる。
pub fn format_ports(mut ports: Vec<PortConfig>) -> String {
    ports.sort_by(|a, b| {
        a.protocol
            .cmp(&b.protocol)
            .then(a.published.cmp(&b.published))
    });

    let mut current = PortRange::default();
    let mut rendered = Vec::new();

    for port in ports.iter().filter(|p| p.ingress) {
        let is_range = current.target_end != current.target_start;
        let overlaps = port.target <= current.target_end;

        if port.protocol != current.protocol
            || port.published.wrapping_sub(current.pub_end) > 1
            || port.target.wrapping_sub(current.target_end) > 1
            || (is_range && overlaps)
        {
            if current.pub_start > 0 {
                rendered.push(current.render());
            }
            current = PortRange::starting_at(port);
            continue;
        }
        current.pub_end = port.published;
        current.target_end = port.target;
    }
    if current.pub_start > 0 {
        rendered.push(current.render());
    }

    rendered.join(", ")
}

/// 数字の並びを数値として比較する
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars().peekable();
    let mut b_chars = b.chars().peekable();

    loop {
        match (a_chars.peek().copied(), b_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let x_digits = take_digits(&mut a_chars);
                let y_digits = take_digits(&mut b_chars);
                let x_trimmed = x_digits.trim_start_matches('0');
                let y_trimmed = y_digits.trim_start_matches('0');
                let ordering = x_trimmed
                    .len()
                    .cmp(&y_trimmed.len())
                    .then_with(|| x_trimmed.cmp(y_trimmed))
                    .then_with(|| x_digits.len().cmp(&y_digits.len()));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a_chars.next();
                b_chars.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}

/// 一覧の出力形式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFormat {
    Table,
    Raw,
    Json,
    /// `table` で始まるテンプレート（見出し付きで列を揃える）
    TableTemplate(String),
    Template(String),
}

impl ListFormat {
    pub fn parse(format: &str) -> Self {
        match format {
            "" | TABLE_FORMAT => ListFormat::Table,
            RAW_FORMAT => ListFormat::Raw,
            JSON_FORMAT => ListFormat::Json,
            other => match other.strip_prefix(TABLE_FORMAT) {
                Some(rest) => ListFormat::TableTemplate(rest.trim_matches(' ').to_string()),
                None => ListFormat::Template(other.to_string()),
            },
        }
    }
}

/// サービス一覧を整形する（名前の自然順）
pub fn render_services(
    services: &[Service],
    format: &ListFormat,
    quiet: bool,
) -> anyhow::Result<String> {
    let mut rows: Vec<ServiceRow> = services.iter().map(ServiceRow::from_service).collect();
    rows.sort_by(|a, b| natural_cmp(&a.name, &b.name));

    match format {
        ListFormat::Table if quiet => Ok(rows.iter().map(|r| format!("{}\n", r.id)).collect()),
        ListFormat::Table => Ok(render_table(&rows)),
        ListFormat::Raw => Ok(rows
            .iter()
            .map(|r| {
                if quiet {
                    format!("id: {}\n", r.id)
                } else {
                    format!(
                        "id: {}\nname: {}\nmode: {}\nreplicas: {}\nimage: {}\nports: {}\n\n",
                        r.id, r.name, r.mode, r.replicas, r.image, r.ports
                    )
                }
            })
            .collect()),
        ListFormat::Json => {
            let mut out = String::new();
            for row in &rows {
                out.push_str(&serde_json::to_string(row)?);
                out.push('\n');
            }
            Ok(out)
        }
        ListFormat::TableTemplate(template) => {
            let header = ServiceRow {
                id: HEADERS[0].to_string(),
                name: HEADERS[1].to_string(),
                mode: HEADERS[2].to_string(),
                replicas: HEADERS[3].to_string(),
                image: HEADERS[4].to_string(),
                ports: HEADERS[5].to_string(),
            };
            let rendered = render_template(template, std::iter::once(&header).chain(&rows))?;
            let lines: Vec<Vec<&str>> = rendered
                .lines()
                .map(|line| line.split('\t').collect())
                .collect();
            Ok(align_columns(&lines))
        }
        ListFormat::Template(template) => render_template(template, &rows),
    }
}

fn render_table(rows: &[ServiceRow]) -> String {
    let cells: Vec<[&str; 6]> = rows
        .iter()
        .map(|r| {
            [
                r.id.as_str(),
                r.name.as_str(),
                r.mode.as_str(),
                r.replicas.as_str(),
                r.image.as_str(),
                r.ports.as_str(),
            ]
        })
        .collect();

    let lines: Vec<Vec<&str>> = std::iter::once(&HEADERS)
        .chain(cells.iter())
        .map(|row| row.to_vec())
        .collect();
    align_columns(&lines)
}

/// 最後の列以外を列幅 + 空白 3 つに揃える
fn align_columns(lines: &[Vec<&str>]) -> String {
    let mut widths: Vec<usize> = Vec::new();
    for line in lines {
        for (i, cell) in line.iter().enumerate().take(line.len().saturating_sub(1)) {
            let width = cell.chars().count();
            match widths.get_mut(i) {
                Some(w) => *w = (*w).max(width),
                None => widths.push(width),
            }
        }
    }

    let mut out = String::new();
    for line in lines {
        let mut text = String::new();
        for (i, cell) in line.iter().enumerate() {
            text.push_str(cell);
            if i + 1 < line.len() {
                let pad = widths[i] + COLUMN_PADDING - cell.chars().count();
                text.push_str(&" ".repeat(pad));
            }
        }
        out.push_str(text.trim_end());
        out.push('\n');
    }
    out
}

/// `--format` の値を tera のテンプレートにする
///
/// `{{.Name}}` は `{{ Name }}` に、`\t` と `\n` の 2 文字は制御文字に置き換える。
pub fn translate_template(format: &str) -> String {
    let format = format.replace(r"\t", "\t").replace(r"\n", "\n");
    FIELD_RE.replace_all(&format, "{{ $1 }}").into_owned()
}

/// tera テンプレートで 1 件ずつ出力する
pub fn render_template<'a, T, I>(template: &str, items: I) -> anyhow::Result<String>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let template = translate_template(template);

    let mut tera = Tera::default();
    tera.add_raw_template("service", &template)
        .context("テンプレートの解析に失敗しました")?;

    let mut out = String::new();
    for row in items {
        let context = Context::from_serialize(row)?;
        out.push_str(
            &tera
                .render("service", &context)
                .context("テンプレートの展開に失敗しました")?,
        );
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        EndpointPortConfig, EndpointPortConfigProtocolEnum, ServiceEndpoint, ServiceServiceStatus,
        ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated, ServiceSpecModeReplicatedJob,
        TaskSpec, TaskSpecContainerSpec, TaskSpecPlacement,
    };

    fn port(protocol: &str, published: u32, target: u32) -> PortConfig {
        PortConfig {
            protocol: protocol.to_string(),
            published,
            target,
            ingress: true,
        }
    }

    fn service(id: &str, name: &str, image: &str) -> Service {
        Service {
            id: Some(id.to_string()),
            spec: Some(ServiceSpec {
                name: Some(name.to_string()),
                mode: Some(ServiceSpecMode {
                    replicated: Some(ServiceSpecModeReplicated { replicas: Some(2) }),
                    ..Default::default()
                }),
                task_template: Some(TaskSpec {
                    container_spec: Some(TaskSpecContainerSpec {
                        image: Some(image.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            service_status: Some(ServiceServiceStatus {
                running_tasks: Some(1),
                desired_tasks: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_consecutive_ports_are_grouped() {
        let ports = vec![
            port("tcp", 80, 80),
            port("tcp", 81, 81),
            port("tcp", 82, 82),
        ];
        assert_eq!(format_ports(ports), "*:80-82->80-82/tcp");
    }

    #[test]
    fn test_many_to_one_ports() {
        let ports = vec![port("tcp", 80, 80), port("tcp", 81, 80)];
        assert_eq!(format_ports(ports), "*:80-81->80/tcp");
    }

    #[test]
    fn test_overlapping_target_starts_new_range() {
        let ports = vec![
            port("tcp", 80, 80),
            port("tcp", 81, 81),
            port("tcp", 82, 80),
        ];
        assert_eq!(format_ports(ports), "*:80-81->80-81/tcp, *:82->80/tcp");
    }

    #[test]
    fn test_ports_sorted_and_split_by_protocol() {
        let ports = vec![
            port("udp", 53, 53),
            port("tcp", 8081, 81),
            port("tcp", 8080, 80),
            port("tcp", 443, 443),
        ];
        assert_eq!(
            format_ports(ports),
            "*:443->443/tcp, *:8080-8081->80-81/tcp, *:53->53/udp"
        );
    }

    #[test]
    fn test_host_mode_and_unpublished_ports_are_hidden() {
        let mut host = port("tcp", 9000, 9000);
        host.ingress = false;
        let ports = vec![host, port("tcp", 0, 8080)];
        assert_eq!(format_ports(ports), "");
    }

    #[test]
    fn test_display_image_strips_digest() {
        let digest = format!("sha256:{}", "a".repeat(64));
        assert_eq!(
            display_image(&format!("nginx:1.25@{}", digest)),
            "nginx:1.25"
        );
        assert_eq!(
            display_image("ghcr.io/org/app:v1"),
            "ghcr.io/org/app:v1"
        );
        // タグがなければそのまま
        let untagged = format!("nginx@{}", digest);
        assert_eq!(display_image(&untagged), untagged);
        assert_eq!(display_image("Not A Ref"), "Not A Ref");
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["web10", "web2", "api", "web1"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["api", "web1", "web2", "web10"]);
    }

    #[test]
    fn test_replicated_row() {
        let row = ServiceRow::from_service(&service(
            "0123456789abcdef0123",
            "web",
            "nginx:1.25",
        ));
        assert_eq!(row.id, "0123456789ab");
        assert_eq!(row.mode, "replicated");
        assert_eq!(row.replicas, "1/2");
        assert_eq!(row.image, "nginx:1.25");
    }

    #[test]
    fn test_max_replicas_per_node() {
        let mut svc = service("id", "web", "nginx:1.25");
        if let Some(template) = svc.spec.as_mut().and_then(|s| s.task_template.as_mut()) {
            template.placement = Some(TaskSpecPlacement {
                max_replicas: Some(3),
                ..Default::default()
            });
        }
        let row = ServiceRow::from_service(&svc);
        assert_eq!(row.replicas, "1/2 (max 3 per node)");
    }

    #[test]
    fn test_replicated_job_progress() {
        let mut svc = service("id", "job", "busybox:latest");
        if let Some(spec) = svc.spec.as_mut() {
            spec.mode = Some(ServiceSpecMode {
                replicated_job: Some(ServiceSpecModeReplicatedJob {
                    max_concurrent: Some(1),
                    total_completions: Some(5),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        svc.service_status = Some(ServiceServiceStatus {
            running_tasks: Some(1),
            desired_tasks: Some(1),
            completed_tasks: Some(3),
            ..Default::default()
        });

        let row = ServiceRow::from_service(&svc);
        assert_eq!(row.mode, "replicated job");
        assert_eq!(row.replicas, "1/1 (3/5 completed)");
    }

    #[test]
    fn test_row_ports_from_endpoint() {
        let mut svc = service("id", "web", "nginx:1.25");
        svc.endpoint = Some(ServiceEndpoint {
            ports: Some(vec![EndpointPortConfig {
                protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                target_port: Some(80),
                published_port: Some(8080),
                publish_mode: Some(EndpointPortConfigPublishModeEnum::INGRESS),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(ServiceRow::from_service(&svc).ports, "*:8080->80/tcp");
    }

    #[test]
    fn test_table_output() {
        let services = vec![
            service("bbbbbbbbbbbbbbbb", "web10", "nginx:1.25"),
            service("aaaaaaaaaaaaaaaa", "web2", "redis:7"),
        ];
        let out = render_services(&services, &ListFormat::Table, false).unwrap();
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID             NAME    MODE"));
        assert!(lines[1].starts_with("aaaaaaaaaaaa   web2"));
        assert!(lines[2].starts_with("bbbbbbbbbbbb   web10"));
    }

    #[test]
    fn test_quiet_table_prints_ids() {
        let services = vec![service("bbbbbbbbbbbbbbbb", "b", "nginx:1.25")];
        let out = render_services(&services, &ListFormat::Table, true).unwrap();
        assert_eq!(out, "bbbbbbbbbbbb\n");
    }

    #[test]
    fn test_json_output() {
        let services = vec![service("abc", "web", "nginx:1.25")];
        let out = render_services(&services, &ListFormat::Json, false).unwrap();
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["ID"], "abc");
        assert_eq!(value["Name"], "web");
        assert_eq!(value["Replicas"], "1/2");
        assert!(value.get("name").is_none());
    }

    #[test]
    fn test_template_output() {
        let services = vec![service("abc", "web", "nginx:1.25")];
        let format = ListFormat::parse("{{.Name}}: {{ Image }}");
        let out = render_services(&services, &format, false).unwrap();
        assert_eq!(out, "web: nginx:1.25\n");
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(ListFormat::parse("table"), ListFormat::Table);
        assert_eq!(ListFormat::parse(""), ListFormat::Table);
        assert_eq!(ListFormat::parse("raw"), ListFormat::Raw);
        assert_eq!(ListFormat::parse("json"), ListFormat::Json);
        assert!(matches!(
            ListFormat::parse("{{ ID }}"),
            ListFormat::Template(_)
        ));
        assert_eq!(
            ListFormat::parse("table {{.ID}}\\t{{.Name}}"),
            ListFormat::TableTemplate("{{.ID}}\\t{{.Name}}".to_string())
        );
    }

    #[test]
    fn test_table_template_renders_headers() {
        let services = vec![
            service("bbbbbbbbbbbbbbbb", "web10", "nginx:1.25"),
            service("aaaaaaaaaaaaaaaa", "db", "postgres:16"),
        ];
        let format = ListFormat::parse(r"table {{.ID}}\t{{.Name}}\t{{.Image}}");
        let out = render_services(&services, &format, false).unwrap();

        assert_eq!(
            out,
            "ID             NAME    IMAGE\n\
             aaaaaaaaaaaa   db      postgres:16\n\
             bbbbbbbbbbbb   web10   nginx:1.25\n"
        );
    }

    #[test]
    fn test_translate_template() {
        assert_eq!(
            translate_template(r"{{.ID}}\t{{ .Spec.Name }}"),
            "{{ ID }}\t{{ Spec.Name }}"
        );
    }
}
