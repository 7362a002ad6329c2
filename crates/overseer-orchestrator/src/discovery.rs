//! Finding worker processes already running on this host.
//!
//! The scan itself sits behind [`ProcessScanner`] so tests can feed a fixed
//! process table; [`SysinfoScanner`] reads the real one.

use crate::config::DiscoveryConfig;
use crate::registry::RegistrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{AgentRole, OverseerError, OverseerResult, ProcessInfo};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::sync::Arc;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Enumerates processes on the host.
#[async_trait]
pub trait ProcessScanner: Send + Sync {
    /// Every visible process with its command line.
    async fn scan(&self) -> OverseerResult<Vec<ProcessInfo>>;
}

/// Reads the host process table through `sysinfo`.
pub struct SysinfoScanner;

#[async_trait]
impl ProcessScanner for SysinfoScanner {
    async fn scan(&self) -> OverseerResult<Vec<ProcessInfo>> {
        tokio::task::spawn_blocking(read_process_table)
            .await
            .map_err(|e| OverseerError::Discovery(format!("process scan aborted: {e}")))
    }
}

fn read_process_table() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    system
        .processes()
        .iter()
        .map(|(pid, process)| {
            let args: Vec<String> = process
                .cmd()
                .iter()
                .map(|arg| {
                    let arg: &OsStr = arg.as_ref();
                    arg.to_string_lossy().into_owned()
                })
                .collect();
            let command_line = if args.is_empty() {
                let name: &OsStr = process.name().as_ref();
                name.to_string_lossy().into_owned()
            } else {
                args.join(" ")
            };
            let start_time = i64::try_from(process.start_time())
                .ok()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
            ProcessInfo {
                pid: pid.as_u32(),
                command_line,
                start_time,
            }
        })
        .collect()
}

/// A worker process recognised on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredAgent {
    /// From `--agent-id`, or the id prefix plus the pid.
    pub agent_id: String,
    /// From `--capabilities`, or the configured defaults.
    pub capabilities: BTreeSet<String>,
    /// From `--role`, slave by default.
    pub role: AgentRole,
    /// The matching process.
    pub process: ProcessInfo,
}

/// Summary of one discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    /// Processes looked at.
    pub scanned: usize,
    /// Processes matching the worker pattern.
    pub matched: usize,
    /// Agents newly registered.
    pub registered: Vec<String>,
    /// Agents already in the registry.
    pub skipped_existing: Vec<String>,
    /// Agent id and reason.
    pub rejected: Vec<(String, String)>,
    /// Set when the scan failed; the other fields hold what was gathered.
    pub error: Option<String>,
}

/// Worker discovery by command-line pattern.
pub struct Discovery {
    pattern: Regex,
    id_prefix: String,
    default_capabilities: BTreeSet<String>,
    own_pid: u32,
    scanner: Arc<dyn ProcessScanner>,
}

impl Discovery {
    /// Compile the worker pattern and capture the settings.
    pub fn from_config(
        config: &DiscoveryConfig,
        scanner: Arc<dyn ProcessScanner>,
    ) -> OverseerResult<Self> {
        let pattern = Regex::new(&config.worker_pattern).map_err(|e| {
            OverseerError::Config(format!("discovery.worker_pattern is invalid: {e}"))
        })?;
        Ok(Self {
            pattern,
            id_prefix: config.id_prefix.clone(),
            default_capabilities: config.default_capabilities.iter().cloned().collect(),
            own_pid: std::process::id(),
            scanner,
        })
    }

    /// Exclude a different pid than the current process.
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Whether a command line looks like a worker.
    pub fn matches(&self, command_line: &str) -> bool {
        self.pattern.is_match(command_line)
    }

    /// Derive identity, capabilities and role from a worker's arguments.
    ///
    /// Understands `--agent-id`, `--capabilities` (comma separated) and
    /// `--role`, each as `--flag value` or `--flag=value`.
    pub fn parse_command_line(&self, process: &ProcessInfo) -> DiscoveredAgent {
        let mut agent_id = None;
        let mut capabilities = None;
        let mut role = AgentRole::Slave;

        let mut tokens = process.command_line.split_whitespace();
        while let Some(token) = tokens.next() {
            let (flag, inline) = match token.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (token, None),
            };
            if !matches!(flag, "--agent-id" | "--capabilities" | "--role") {
                continue;
            }
            let Some(value) = inline.or_else(|| tokens.next()) else {
                break;
            };
            match flag {
                "--agent-id" => agent_id = Some(value.to_string()),
                "--capabilities" => {
                    capabilities = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .map(String::from)
                            .collect::<BTreeSet<_>>(),
                    );
                }
                _ => match value.parse::<AgentRole>() {
                    Ok(parsed) => role = parsed,
                    Err(e) => debug!(pid = process.pid, error = %e, "Ignoring worker role"),
                },
            }
        }

        DiscoveredAgent {
            agent_id: agent_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("{}-{}", self.id_prefix, process.pid)),
            capabilities: capabilities.unwrap_or_else(|| self.default_capabilities.clone()),
            role,
            process: process.clone(),
        }
    }

    /// Worker processes currently on the host, excluding this one.
    pub async fn scan(&self) -> OverseerResult<Vec<DiscoveredAgent>> {
        self.scan_counted().await.map(|(_, workers)| workers)
    }

    async fn scan_counted(&self) -> OverseerResult<(usize, Vec<DiscoveredAgent>)> {
        let processes = self.scanner.scan().await?;
        let scanned = processes.len();
        let mut workers: Vec<DiscoveredAgent> = processes
            .iter()
            .filter(|p| p.pid != self.own_pid && self.matches(&p.command_line))
            .map(|p| self.parse_command_line(p))
            .collect();
        workers.sort_by_key(|w| w.process.pid);
        Ok((scanned, workers))
    }

    /// Scan and hand each worker to `admit`. Never fails: a scanner error
    /// ends up in [`DiscoveryReport::error`].
    pub async fn discover<F>(&self, mut admit: F) -> DiscoveryReport
    where
        F: FnMut(&DiscoveredAgent) -> Result<(), RegistrationError>,
    {
        let mut report = DiscoveryReport::default();
        let (scanned, workers) = match self.scan_counted().await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Process scan failed");
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.scanned = scanned;
        report.matched = workers.len();

        for worker in &workers {
            match admit(worker) {
                Ok(()) => report.registered.push(worker.agent_id.clone()),
                Err(RegistrationError::Duplicate(id)) => report.skipped_existing.push(id),
                Err(e) => {
                    warn!(agent_id = %worker.agent_id, pid = worker.process.pid, error = %e, "Discovered worker rejected");
                    report.rejected.push((worker.agent_id.clone(), e.to_string()));
                }
            }
        }

        info!(
            scanned = report.scanned,
            matched = report.matched,
            registered = report.registered.len(),
            "Discovery pass finished"
        );
        report
    }
}
