//! Built-in collectors
//!
//! Small read-only probes so the CLI works out of the box:
//! - `resources`: CPU samples, memory, top processes (sysinfo)
//! - `disk`: free space per volume (sysinfo), health via SMART output
//! - `drivers` / `eventlog` / `network`: fixed read-only commands

use crate::collector::{
    Collector, CollectorError, CollectorOptions, CollectorRegistry, InvestigationStep,
};
use crate::config::MedicConfig;
use crate::shell::ShellRunner;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};

/// Default samples for a sustained CPU reading
const DEFAULT_CPU_SAMPLES: u64 = 3;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;

/// Look-back window accepted for log queries
const MAX_HOURS: u64 = 24 * 30;

/// Block device path or a bare Windows disk number
static DEVICE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(?:/dev/[A-Za-z0-9]+(?:/[A-Za-z0-9]+)*|\d{1,2})$").ok());

/// Build the registry used by the CLI
pub fn standard_registry(config: &MedicConfig, shell: Arc<dyn ShellRunner>) -> CollectorRegistry {
    let overrides = &config.collectors.commands;
    CollectorRegistry::new()
        .with(Arc::new(ResourceCollector))
        .with(Arc::new(DiskCollector::new(shell.clone(), overrides)))
        .with(Arc::new(CommandCollector::new(
            "drivers",
            shell.clone(),
            default_commands("drivers"),
            overrides,
        )))
        .with(Arc::new(CommandCollector::new(
            "eventlog",
            shell.clone(),
            default_commands("eventlog"),
            overrides,
        )))
        .with(Arc::new(CommandCollector::new(
            "network",
            shell,
            default_commands("network"),
            overrides,
        )))
}

#[cfg(windows)]
fn default_commands(collector: &str) -> BTreeMap<String, String> {
    let pairs: &[(&str, &str)] = match collector {
        "drivers" => &[(
            "list",
            "Get-CimInstance Win32_PnPSignedDriver | Where-Object DeviceName | Select-Object DeviceName,DriverVersion,DriverDate | Format-Table -AutoSize",
        )],
        "eventlog" => &[(
            "recent",
            "Get-WinEvent -FilterHashtable @{LogName='System';Level=2;StartTime=(Get-Date).AddHours(-{hours})} -MaxEvents 200 -ErrorAction SilentlyContinue | Format-Table -AutoSize TimeCreated,Id,ProviderName,Message",
        )],
        "network" => &[(
            "status",
            "Get-NetAdapter | Format-Table -AutoSize Name,Status,LinkSpeed; Get-DnsClientServerAddress -AddressFamily IPv4 | Format-Table -AutoSize",
        )],
        "disk" => &[
            ("health", "Get-PhysicalDisk | Format-Table -AutoSize FriendlyName,HealthStatus"),
            (
                "bad_blocks",
                "(Get-WinEvent -FilterHashtable @{LogName='System';Id=7;StartTime=(Get-Date).AddHours(-{hours})} -ErrorAction SilentlyContinue | Measure-Object).Count",
            ),
        ],
        _ => &[],
    };
    to_map(pairs)
}

#[cfg(not(windows))]
fn default_commands(collector: &str) -> BTreeMap<String, String> {
    let pairs: &[(&str, &str)] = match collector {
        "drivers" => &[("list", "lsmod")],
        "eventlog" => &[(
            "recent",
            "journalctl -p err --since '-{hours} hours' --no-pager -n 200",
        )],
        "network" => &[("status", "ip -brief addr; ip route; cat /etc/resolv.conf")],
        "disk" => &[
            ("health", "smartctl -H {device}"),
            (
                "bad_blocks",
                "journalctl -k --since '-{hours} hours' --no-pager | grep -ciE 'bad block|i/o error'",
            ),
        ],
        _ => &[],
    };
    to_map(pairs)
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Apply `"<collector>.<action>"` overrides on top of the defaults
fn merge_overrides(
    collector: &str,
    mut commands: BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let prefix = format!("{}.", collector);
    for (key, command) in overrides {
        if let Some(action) = key.strip_prefix(&prefix) {
            commands.insert(action.to_string(), command.clone());
        }
    }
    commands
}

/// Model-supplied placeholder value, checked before it reaches a shell
fn template_value(collector: &str, key: &str, step: &InvestigationStep) -> Result<String, CollectorError> {
    let default = TEMPLATE_DEFAULTS
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();
    let raw = match step.config.get(key) {
        None | Some(serde_json::Value::Null) => return Ok(default),
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    };
    let valid = match key {
        "hours" => raw
            .parse::<u64>()
            .map(|h| (1..=MAX_HOURS).contains(&h))
            .unwrap_or(false),
        "device" => DEVICE.as_ref().is_some_and(|re| re.is_match(&raw)),
        _ => false,
    };
    if valid {
        Ok(raw)
    } else {
        Err(CollectorError::InvalidArgument {
            collector: collector.to_string(),
            key: key.to_string(),
            value: raw,
        })
    }
}

/// Substitute `{key}` placeholders from the step config
fn render_template(
    collector: &str,
    template: &str,
    step: &InvestigationStep,
) -> Result<String, CollectorError> {
    let mut rendered = template.to_string();
    for (key, _) in TEMPLATE_DEFAULTS {
        let placeholder = format!("{{{}}}", key);
        if rendered.contains(&placeholder) {
            let value = template_value(collector, key, step)?;
            rendered = rendered.replace(&placeholder, &value);
        }
    }
    Ok(rendered)
}

const TEMPLATE_DEFAULTS: &[(&str, &str)] = &[("hours", "24"), ("device", "/dev/sda")];

// ============================================================================
// Resources
// ============================================================================

/// CPU / memory / process snapshot
pub struct ResourceCollector;

#[async_trait]
impl Collector for ResourceCollector {
    fn name(&self) -> &str {
        "resources"
    }

    async fn investigate(
        &self,
        step: &InvestigationStep,
        options: &CollectorOptions,
    ) -> Result<serde_json::Value, CollectorError> {
        if step.action != "usage" {
            return Err(CollectorError::UnsupportedAction {
                collector: self.name().to_string(),
                action: step.action.clone(),
            });
        }

        let samples = step.config_u64("samples").unwrap_or(DEFAULT_CPU_SAMPLES).clamp(1, 10);
        let interval = Duration::from_millis(
            step.config_u64("intervalMs")
                .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS)
                .max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.as_millis() as u64),
        );
        let max_items = options.max_items;

        tokio::task::spawn_blocking(move || sample_resources(samples, interval, max_items))
            .await
            .map_err(|e| CollectorError::Failed {
                collector: "resources".to_string(),
                message: e.to_string(),
            })
    }
}

fn sample_resources(samples: u64, interval: Duration, max_items: usize) -> serde_json::Value {
    let mut sys = System::new();
    sys.refresh_cpu();

    let mut cpu_samples = Vec::new();
    for _ in 0..samples {
        std::thread::sleep(interval);
        sys.refresh_cpu();
        cpu_samples.push(sys.global_cpu_info().cpu_usage() as f64);
    }

    sys.refresh_memory();
    sys.refresh_processes();

    let mut processes: Vec<_> = sys.processes().values().collect();
    processes.sort_by(|a, b| {
        b.cpu_usage()
            .partial_cmp(&a.cpu_usage())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let findings: Vec<serde_json::Value> = processes
        .iter()
        .take(max_items.min(10))
        .map(|p| {
            json!({
                "process": p.name(),
                "cpuPercent": p.cpu_usage(),
                "memoryMb": p.memory() / (1024 * 1024),
            })
        })
        .collect();

    let total = sys.total_memory();
    let used_pct = if total > 0 {
        sys.used_memory() as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let mut recommendations = Vec::new();
    if crate::evidence::is_cpu_sustained_high(&cpu_samples) {
        recommendations.push("CPU usage is sustained above 80%".to_string());
    }
    if used_pct > 90.0 {
        recommendations.push("Memory usage is above 90%".to_string());
    }

    json!({
        "findings": findings,
        "recommendations": recommendations,
        "metrics": {
            "cpuSamples": cpu_samples,
            "memoryUsedPercent": used_pct,
            "processCount": sys.processes().len(),
        }
    })
}

// ============================================================================
// Disk
// ============================================================================

/// Disk space (sysinfo) and health (SMART / storage health output)
pub struct DiskCollector {
    shell: Arc<dyn ShellRunner>,
    commands: BTreeMap<String, String>,
}

impl DiskCollector {
    pub fn new(shell: Arc<dyn ShellRunner>, overrides: &BTreeMap<String, String>) -> Self {
        Self {
            shell,
            commands: merge_overrides("disk", default_commands("disk"), overrides),
        }
    }

    fn command(&self, action: &str) -> Result<&String, CollectorError> {
        self.commands
            .get(action)
            .ok_or_else(|| CollectorError::UnsupportedAction {
                collector: "disk".to_string(),
                action: action.to_string(),
            })
    }

    async fn health(
        &self,
        step: &InvestigationStep,
        options: &CollectorOptions,
    ) -> Result<serde_json::Value, CollectorError> {
        let device = template_value("disk", "device", step)?;
        let health_cmd = render_template("disk", self.command("health")?, step)?;
        let output = self
            .shell
            .run(&health_cmd, options.timeout)
            .await
            .map_err(|e| CollectorError::Failed {
                collector: "disk".to_string(),
                message: e.to_string(),
            })?;
        let text = output.combined();
        let is_healthy = parse_health_flag(&text);

        // Bad-block counting is best effort; a failure leaves it unknown
        let bad_blocks = match self.command("bad_blocks") {
            Ok(template) => {
                let cmd = render_template("disk", template, step)?;
                match self.shell.run(&cmd, options.timeout).await {
                    Ok(out) => out.stdout.trim().parse::<u64>().ok(),
                    Err(e) => {
                        tracing::debug!("bad block count unavailable: {}", e);
                        None
                    }
                }
            }
            Err(_) => None,
        };

        let findings: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(options.max_items)
            .map(String::from)
            .collect();

        let mut recommendations = Vec::new();
        if is_healthy == Some(false) {
            recommendations.push(format!("{} reports an unhealthy status; back up data", device));
        }

        Ok(json!({
            "findings": findings,
            "recommendations": recommendations,
            "metrics": {
                "disks": [{
                    "name": device,
                    "isHealthy": is_healthy,
                    "badBlockEvents": bad_blocks,
                }]
            }
        }))
    }

    async fn space(&self) -> Result<serde_json::Value, CollectorError> {
        let volumes = tokio::task::spawn_blocking(|| {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|d| d.total_space() > 0)
                .map(|d| {
                    let free_pct = d.available_space() as f64 / d.total_space() as f64 * 100.0;
                    json!({
                        "mount": d.mount_point().display().to_string(),
                        "name": d.name().to_string_lossy(),
                        "totalGb": d.total_space() / 1_000_000_000,
                        "freeGb": d.available_space() / 1_000_000_000,
                        "freePercent": free_pct,
                    })
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CollectorError::Failed {
            collector: "disk".to_string(),
            message: e.to_string(),
        })?;

        let recommendations: Vec<String> = volumes
            .iter()
            .filter(|v| {
                v["freePercent"]
                    .as_f64()
                    .map(crate::evidence::is_low_disk_space)
                    .unwrap_or(false)
            })
            .map(|v| format!("{} has less than 10% free space", v["mount"].as_str().unwrap_or("?")))
            .collect();

        Ok(json!({
            "findings": volumes,
            "recommendations": recommendations,
            "metrics": { "volumes": volumes },
        }))
    }
}

/// Output of a probe that never reached the disk
const PROBE_FAILURES: &[&str] = &[
    "permission denied",
    "access is denied",
    "open device",
    "unable to detect device",
    "command not found",
    "is not recognized",
];

/// Interpret SMART / storage-health text. `None` when inconclusive.
///
/// Only verdict tokens count: smartctl's `result: PASSED|FAILED`, its SCSI
/// `Health Status: OK`, and the `HealthStatus` column of Get-PhysicalDisk.
pub fn parse_health_flag(text: &str) -> Option<bool> {
    let lower = text.to_lowercase();
    if PROBE_FAILURES.iter().any(|marker| lower.contains(marker)) {
        return None;
    }

    for line in lower.lines() {
        if let Some((_, verdict)) = line.split_once("result:") {
            let verdict = verdict.trim();
            if verdict.starts_with("passed") {
                return Some(true);
            }
            if verdict.starts_with("failed") {
                return Some(false);
            }
        }
        if let Some((_, status)) = line.split_once("health status:") {
            return Some(status.trim().starts_with("ok"));
        }
    }

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if words.iter().any(|w| *w == "unhealthy" || *w == "warning") {
        Some(false)
    } else if words.contains(&"healthy") {
        Some(true)
    } else {
        None
    }
}

#[async_trait]
impl Collector for DiskCollector {
    fn name(&self) -> &str {
        "disk"
    }

    async fn investigate(
        &self,
        step: &InvestigationStep,
        options: &CollectorOptions,
    ) -> Result<serde_json::Value, CollectorError> {
        match step.action.as_str() {
            "health" => self.health(step, options).await,
            "space" => self.space().await,
            other => Err(CollectorError::UnsupportedAction {
                collector: "disk".to_string(),
                action: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Command-backed collectors
// ============================================================================

/// Runs one fixed read-only command per action and reports its output lines
pub struct CommandCollector {
    name: String,
    shell: Arc<dyn ShellRunner>,
    commands: BTreeMap<String, String>,
}

impl CommandCollector {
    pub fn new(
        name: &str,
        shell: Arc<dyn ShellRunner>,
        defaults: BTreeMap<String, String>,
        overrides: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            shell,
            commands: merge_overrides(name, defaults, overrides),
        }
    }
}

#[async_trait]
impl Collector for CommandCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn investigate(
        &self,
        step: &InvestigationStep,
        options: &CollectorOptions,
    ) -> Result<serde_json::Value, CollectorError> {
        let template =
            self.commands
                .get(&step.action)
                .ok_or_else(|| CollectorError::UnsupportedAction {
                    collector: self.name.clone(),
                    action: step.action.clone(),
                })?;
        let command = render_template(&self.name, template, step)?;

        let output = self
            .shell
            .run(&command, options.timeout)
            .await
            .map_err(|e| CollectorError::Failed {
                collector: self.name.clone(),
                message: e.to_string(),
            })?;

        if !output.success() && output.stdout.trim().is_empty() {
            return Err(CollectorError::Failed {
                collector: self.name.clone(),
                message: output.combined(),
            });
        }

        let lines: Vec<&str> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        Ok(json!({
            "findings": lines.iter().take(options.max_items).collect::<Vec<_>>(),
            "recommendations": [],
            "metrics": {
                "lineCount": lines.len(),
                "exitCode": output.exit_code,
            }
        }))
    }
}
