//! `keel service inspect` の出力整形

use crate::formatter::render_template;
use bollard::models::{
    EndpointPortConfig, HealthConfig, Mount, ResourcesUlimits, Service, ServiceSpec,
    ServiceSpecRollbackConfig, ServiceSpecUpdateConfig, ServiceUpdateStatusStateEnum, TaskSpec,
    TaskSpecContainerSpec, TaskSpecResources,
};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

pub const PRETTY_FORMAT: &str = "pretty";

/// 詳細表示の出力形式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectFormat {
    /// JSON の配列（既定）
    Json,
    /// 人が読むための整形
    Pretty,
    Template(String),
}

impl InspectFormat {
    /// `--pretty` と `--format` から出力形式を決める
    pub fn from_flags(pretty: bool, format: Option<&str>) -> anyhow::Result<Self> {
        let format = format.filter(|f| !f.is_empty());
        match (pretty, format) {
            (true, Some(_)) => {
                anyhow::bail!("--format is incompatible with human friendly format")
            }
            (true, None) | (false, Some(PRETTY_FORMAT)) => Ok(InspectFormat::Pretty),
            (false, None) => Ok(InspectFormat::Json),
            (false, Some(template)) => Ok(InspectFormat::Template(template.to_string())),
        }
    }
}

/// サービスの詳細を整形する
///
/// `network_names` はネットワーク ID から名前への対応（解決できたものだけ）
pub fn render_inspect(
    services: &[Service],
    format: &InspectFormat,
    network_names: &HashMap<String, String>,
) -> anyhow::Result<String> {
    match format {
        InspectFormat::Json => {
            let mut out = Vec::new();
            let mut serializer = serde_json::Serializer::with_formatter(
                &mut out,
                PrettyFormatter::with_indent(b"    "),
            );
            services.serialize(&mut serializer)?;
            out.push(b'\n');
            Ok(String::from_utf8(out)?)
        }
        InspectFormat::Pretty => Ok(services
            .iter()
            .map(|service| format!("{}\n", render_pretty(service, network_names)))
            .collect()),
        InspectFormat::Template(template) => {
            let values = services
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            render_template(template, &values)
        }
    }
}

/// `--pretty` の出力（1 サービス分）
pub fn render_pretty(service: &Service, network_names: &HashMap<String, String>) -> String {
    let empty_spec = ServiceSpec::default();
    let spec = service.spec.as_ref().unwrap_or(&empty_spec);
    let empty_task = TaskSpec::default();
    let task = spec.task_template.as_ref().unwrap_or(&empty_task);
    let empty_container = TaskSpecContainerSpec::default();
    let container = task.container_spec.as_ref().unwrap_or(&empty_container);

    let mut out = String::from("\n");
    let _ = write!(out, "ID:\t\t{}", service.id.as_deref().unwrap_or_default());
    let _ = write!(out, "\nName:\t\t{}", spec.name.as_deref().unwrap_or_default());

    if let Some(labels) = spec.labels.as_ref().filter(|l| !l.is_empty()) {
        out.push_str("\nLabels:");
        for (key, value) in sorted(labels) {
            let _ = write!(out, "\n {}", key);
            if !value.is_empty() {
                let _ = write!(out, "={}", value);
            }
        }
    }

    out.push_str("\nService Mode:");
    if let Some(mode) = &spec.mode {
        if mode.global.is_some() {
            out.push_str("\tGlobal");
        } else if let Some(replicated) = &mode.replicated {
            out.push_str("\tReplicated");
            if let Some(replicas) = replicated.replicas {
                let _ = write!(out, "\n Replicas:\t{}", replicas);
            }
        }
    }

    if let Some(status) = &service.update_status {
        if let Some(state) = status.state.filter(|s| *s != ServiceUpdateStatusStateEnum::EMPTY) {
            let _ = write!(out, "\nUpdateStatus:\n State:\t\t{}", state);
            if let Some(started) = &status.started_at {
                let _ = write!(out, "\n Started:\t{}", started);
            }
            if state == ServiceUpdateStatusStateEnum::COMPLETED {
                if let Some(completed) = &status.completed_at {
                    let _ = write!(out, "\n Completed:\t{}", completed);
                }
            }
            let _ = write!(
                out,
                "\n Message:\t{}",
                status.message.as_deref().unwrap_or_default()
            );
        }
    }

    out.push_str("\nPlacement:");
    if let Some(placement) = &task.placement {
        if let Some(constraints) = placement.constraints.as_ref().filter(|c| !c.is_empty()) {
            let _ = write!(out, "\n Constraints:\t{}", go_list(constraints));
        }
        let preferences: Vec<String> = placement
            .preferences
            .iter()
            .flatten()
            .filter_map(|p| p.spread.as_ref())
            .map(|s| format!("spread={}", s.spread_descriptor.as_deref().unwrap_or_default()))
            .collect();
        if !preferences.is_empty() {
            let _ = write!(out, "\n Preferences:   {}", go_list(&preferences));
        }
        if let Some(max) = placement.max_replicas.filter(|m| *m > 0) {
            let _ = write!(out, "\n Max Replicas Per Node:   {}", max);
        }
    }

    if let Some(update) = &spec.update_config {
        write_update_config(&mut out, update);
    }
    if let Some(rollback) = &spec.rollback_config {
        write_rollback_config(&mut out, rollback);
    }

    write_container_spec(&mut out, container);

    if let Some(log_driver) = &task.log_driver {
        out.push_str("\nLog Driver:");
        if let Some(name) = log_driver.name.as_deref().filter(|n| !n.is_empty()) {
            let _ = write!(out, "\n Name:\t\t{}", name);
        }
        if let Some(options) = log_driver.options.as_ref().filter(|o| !o.is_empty()) {
            out.push_str("\n LogOpts:");
            for (key, value) in sorted(options) {
                let _ = write!(out, "\n  {}", key);
                if !value.is_empty() {
                    let _ = write!(out, ":       {}", value);
                }
            }
        }
        out.push('\n');
    }

    write_resources(&mut out, task.resources.as_ref());

    let networks: Vec<&str> = task
        .networks
        .iter()
        .flatten()
        .filter_map(|n| n.target.as_deref())
        .map(|target| {
            network_names
                .get(target)
                .map(String::as_str)
                .unwrap_or(target)
        })
        .collect();
    if !networks.is_empty() {
        out.push_str("\nNetworks:");
        for network in networks {
            let _ = write!(out, " {}", network);
        }
        out.push(' ');
    }

    let endpoint_mode = spec
        .endpoint_spec
        .as_ref()
        .and_then(|e| e.mode)
        .map(|m| m.to_string())
        .unwrap_or_default();
    let _ = write!(out, "\nEndpoint Mode:\t{}", endpoint_mode);

    let ports = service
        .endpoint
        .as_ref()
        .and_then(|e| e.ports.as_ref())
        .filter(|p| !p.is_empty());
    if let Some(ports) = ports {
        out.push_str("\nPorts:");
        for port in ports {
            write_port(&mut out, port);
        }
        out.push(' ');
    }

    if let Some(health) = &container.health_check {
        write_healthcheck(&mut out, health);
    }

    out.push('\n');
    out
}

fn write_update_config(out: &mut String, update: &ServiceSpecUpdateConfig) {
    let _ = write!(
        out,
        "\nUpdateConfig:\n Parallelism:\t{}",
        update.parallelism.unwrap_or_default()
    );
    if let Some(delay) = update.delay.filter(|d| *d > 0) {
        let _ = write!(out, "\n Delay:\t\t{}", go_duration(delay));
    }
    let _ = write!(
        out,
        "\n On failure:\t{}",
        update.failure_action.map(|a| a.to_string()).unwrap_or_default()
    );
    if let Some(monitor) = update.monitor.filter(|m| *m > 0) {
        let _ = write!(out, "\n Monitoring Period: {}", go_duration(monitor));
    }
    let _ = write!(
        out,
        "\n Max failure ratio: {}",
        update.max_failure_ratio.unwrap_or_default()
    );
    let _ = write!(
        out,
        "\n Update order:      {}",
        update.order.map(|o| o.to_string()).unwrap_or_default()
    );
}

fn write_rollback_config(out: &mut String, rollback: &ServiceSpecRollbackConfig) {
    let _ = write!(
        out,
        "\nRollbackConfig:\n Parallelism:\t{}",
        rollback.parallelism.unwrap_or_default()
    );
    if let Some(delay) = rollback.delay.filter(|d| *d > 0) {
        let _ = write!(out, "\n Delay:\t\t{}", go_duration(delay));
    }
    let _ = write!(
        out,
        "\n On failure:\t{}",
        rollback.failure_action.map(|a| a.to_string()).unwrap_or_default()
    );
    if let Some(monitor) = rollback.monitor.filter(|m| *m > 0) {
        let _ = write!(out, "\n Monitoring Period: {}", go_duration(monitor));
    }
    let _ = write!(
        out,
        "\n Max failure ratio: {}",
        rollback.max_failure_ratio.unwrap_or_default()
    );
    let _ = write!(
        out,
        "\n Rollback order:    {}",
        rollback.order.map(|o| o.to_string()).unwrap_or_default()
    );
}

fn write_container_spec(out: &mut String, container: &TaskSpecContainerSpec) {
    let _ = write!(
        out,
        "\nContainerSpec:\n Image:\t\t{}",
        container.image.as_deref().unwrap_or_default()
    );
    if let Some(args) = container.args.as_ref().filter(|a| !a.is_empty()) {
        out.push_str("\n Args:\t\t");
        for arg in args {
            let _ = write!(out, "{} ", arg);
        }
    }
    if let Some(env) = container.env.as_ref().filter(|e| !e.is_empty()) {
        out.push_str("\n Env:\t\t");
        for var in env {
            let _ = write!(out, "{} ", var);
        }
    }
    if let Some(dir) = container.dir.as_deref().filter(|d| !d.is_empty()) {
        let _ = write!(out, "\n Dir:\t\t{}", dir);
    }
    if let Some(init) = container.init {
        let _ = write!(out, "\n Init:\t\t{}", init);
    }
    if let Some(user) = container.user.as_deref().filter(|u| !u.is_empty()) {
        let _ = write!(out, "\n User: {}", user);
    }

    let cap_add = container.capability_add.as_deref().unwrap_or_default();
    let cap_drop = container.capability_drop.as_deref().unwrap_or_default();
    if !cap_add.is_empty() || !cap_drop.is_empty() {
        out.push_str("\nCapabilities:");
        if !cap_add.is_empty() {
            let _ = write!(out, "\n Add: {}", cap_add.join(", "));
        }
        if !cap_drop.is_empty() {
            let _ = write!(out, "\n Drop: {}", cap_drop.join(", "));
        }
    }

    if let Some(sysctls) = container.sysctls.as_ref().filter(|s| !s.is_empty()) {
        out.push_str("\nSysCtls:");
        for (key, value) in sorted(sysctls) {
            let _ = write!(out, "\n {}", key);
            if !value.is_empty() {
                let _ = write!(out, ": {}", value);
            }
        }
    }

    let ulimits = ulimits(container.ulimits.as_deref().unwrap_or_default());
    if !ulimits.is_empty() {
        out.push_str("\nUlimits:");
        for (name, limit) in &ulimits {
            let _ = write!(out, "\n {}: {}", name, limit);
        }
    }

    let mounts = container.mounts.as_deref().unwrap_or_default();
    if !mounts.is_empty() {
        out.push_str("\nMounts:");
        for mount in mounts {
            write_mount(out, mount);
        }
    }

    if let Some(configs) = container.configs.as_ref().filter(|c| !c.is_empty()) {
        out.push_str("\nConfigs:");
        for config in configs {
            let target = config.file.as_ref().and_then(|f| f.name.as_deref());
            let _ = write!(
                out,
                "\n Target:\t{}\n  Source:\t{}",
                target.unwrap_or_default(),
                config.config_name.as_deref().unwrap_or_default()
            );
        }
    }

    if let Some(secrets) = container.secrets.as_ref().filter(|s| !s.is_empty()) {
        out.push_str("\nSecrets:");
        for secret in secrets {
            let target = secret.file.as_ref().and_then(|f| f.name.as_deref());
            let _ = write!(
                out,
                "\n Target:\t{}\n  Source:\t{}",
                target.unwrap_or_default(),
                secret.secret_name.as_deref().unwrap_or_default()
            );
        }
    }
}

fn write_mount(out: &mut String, mount: &Mount) {
    let _ = write!(
        out,
        "\n Target:\t{}\n  Source:\t{}\n  ReadOnly:\t{}\n  Type:\t\t{}",
        mount.target.as_deref().unwrap_or_default(),
        mount.source.as_deref().unwrap_or_default(),
        mount.read_only.unwrap_or_default(),
        mount.typ.map(|t| t.to_string()).unwrap_or_default()
    );
}

fn write_resources(out: &mut String, resources: Option<&TaskSpecResources>) {
    let limit_pids = resources
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.pids)
        .unwrap_or_default();

    if let Some(resources) = resources {
        out.push_str("\nResources:");

        if let Some(reservations) = &resources.reservations {
            let cpus = reservations.nano_cpus.unwrap_or_default();
            let memory = reservations.memory_bytes.unwrap_or_default();
            if cpus > 0 || memory > 0 {
                out.push_str("\n Reservations:");
                if cpus > 0 {
                    let _ = write!(out, "\n  CPU:\t\t{}", nano_cpus(cpus));
                }
                if memory > 0 {
                    let _ = write!(out, "\n  Memory:\t{}", bytes_size(memory));
                }
            }
        }

        if let Some(limits) = &resources.limits {
            let cpus = limits.nano_cpus.unwrap_or_default();
            let memory = limits.memory_bytes.unwrap_or_default();
            if cpus > 0 || memory > 0 || limit_pids > 0 {
                out.push_str("\n Limits:");
                if cpus > 0 {
                    let _ = write!(out, "\n  CPU:\t\t{}", nano_cpus(cpus));
                }
                if memory > 0 {
                    let _ = write!(out, "\n  Memory:\t{}", bytes_size(memory));
                }
            }
        }
    }

    if limit_pids > 0 {
        let _ = write!(out, "\n  PIDs:\t\t{}", limit_pids);
    }
}

fn write_port(out: &mut String, port: &EndpointPortConfig) {
    let _ = write!(
        out,
        "\n PublishedPort = {}\n  Protocol = {}\n  TargetPort = {}\n  PublishMode = {}",
        port.published_port.unwrap_or_default(),
        port.protocol.map(|p| p.to_string()).unwrap_or_default(),
        port.target_port.unwrap_or_default(),
        port.publish_mode.map(|m| m.to_string()).unwrap_or_default()
    );
}

fn write_healthcheck(out: &mut String, health: &HealthConfig) {
    let _ = write!(
        out,
        "\n Healthcheck:\n  Interval = {}\n  Retries = {}\n  StartPeriod =\t{}\n  Timeout =\t{}",
        go_duration(health.interval.unwrap_or_default()),
        health.retries.unwrap_or_default(),
        go_duration(health.start_period.unwrap_or_default()),
        go_duration(health.timeout.unwrap_or_default())
    );
    if let Some(tests) = health.test.as_ref().filter(|t| !t.is_empty()) {
        out.push_str("\n  Tests:");
        for test in tests {
            let _ = write!(out, "\n\t Test = {}", test);
        }
        out.push(' ');
    }
}

fn sorted(map: &HashMap<String, String>) -> BTreeMap<&str, &str> {
    map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

/// 名前ごとの `soft:hard`
fn ulimits(ulimits: &[ResourcesUlimits]) -> BTreeMap<String, String> {
    ulimits
        .iter()
        .map(|u| {
            (
                u.name.clone().unwrap_or_default(),
                format!("{}:{}", u.soft.unwrap_or_default(), u.hard.unwrap_or_default()),
            )
        })
        .collect()
}

/// `[a b]` 形式のリスト
fn go_list(items: &[String]) -> String {
    format!("[{}]", items.join(" "))
}

fn nano_cpus(nano: i64) -> f64 {
    nano as f64 / 1e9
}

/// 1024 単位で 4 桁に丸めたサイズ（`100MiB`、`1.5GiB`）
pub fn bytes_size(bytes: i64) -> String {
    const UNITS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }

    let integer_digits = (size.trunc() as u64).to_string().len();
    let decimals = 4usize.saturating_sub(integer_digits);
    let mut number = format!("{:.*}", decimals, size);
    if number.contains('.') {
        number = number.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{}{}", number, UNITS[unit])
}

/// ナノ秒を `1m30s` や `500ms` の形で表す
pub fn go_duration(nanos: i64) -> String {
    if nanos == 0 {
        return "0s".to_string();
    }
    let sign = if nanos < 0 { "-" } else { "" };
    let nanos = nanos.unsigned_abs();

    if nanos < 1_000_000_000 {
        let (value, scale, unit) = match nanos {
            n if n < 1_000 => return format!("{}{}ns", sign, n),
            n if n < 1_000_000 => (n, 1_000, "µs"),
            n => (n, 1_000_000, "ms"),
        };
        return format!("{}{}{}{}", sign, value / scale, fraction(value % scale, scale), unit);
    }

    let hours = nanos / 3_600_000_000_000;
    let minutes = nanos / 60_000_000_000 % 60;
    let seconds = nanos / 1_000_000_000 % 60;
    let rest = nanos % 1_000_000_000;

    let seconds = format!("{}{}s", seconds, fraction(rest, 1_000_000_000));
    match (hours, minutes) {
        (0, 0) => format!("{}{}", sign, seconds),
        (0, m) => format!("{}{}m{}", sign, m, seconds),
        (h, m) => format!("{}{}h{}m{}", sign, h, m, seconds),
    }
}

/// 小数部（末尾の 0 は落とす）
fn fraction(rest: u64, scale: u64) -> String {
    if rest == 0 {
        return String::new();
    }
    let width = scale.to_string().len() - 1;
    let digits = format!("{:0width$}", rest, width = width);
    format!(".{}", digits.trim_end_matches('0'))
}
