//! Tool Process Supervisor
//!
//! Owns the lifecycle of auxiliary tool processes used by the local tier
//! (filesystem, git, fetch, memory, database, browser, search, messaging).
//! The supervisor starts, stops and reports on them; it never speaks the
//! tool's own protocol.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Time a tool gets to exit after the terminate signal
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Launch description for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values may reference `${VAR}` from the process environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// `[[tool]]` entries of the tool table
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolTable {
    #[serde(default, rename = "tool")]
    pub tools: Vec<ToolSpec>,
}

impl ToolTable {
    pub fn parse(content: &str) -> Result<Self, ToolError> {
        toml::from_str(content).map_err(|e| ToolError::Table(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ToolError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ToolError::Table(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }
}

/// Tool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Stopped,
    Running,
    Error,
}

/// Point-in-time view of one tool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInfo {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
}

/// Supervisor errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Tool {name} unavailable: {message}")]
    Launch { name: String, message: String },

    #[error("Invalid tool table: {0}")]
    Table(String),
}

/// Expand `${VAR}` / `$VAR` references against `env`.
///
/// Names missing from `env` expand to an empty string.
pub fn expand_template(template: &str, env: &HashMap<String, String>) -> String {
    shellexpand::env_with_context_no_errors(template, |name: &str| {
        Some(env.get(name).map(String::as_str).unwrap_or(""))
    })
    .into_owned()
}

struct ToolEntry {
    id: String,
    spec: ToolSpec,
    status: ToolStatus,
    child: Option<Child>,
    last_error: Option<String>,
}

impl ToolEntry {
    /// Notice a process that exited on its own
    fn refresh(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(exit)) => {
                warn!("Tool '{}' exited unexpectedly: {}", self.spec.name, exit);
                self.child = None;
                if exit.success() {
                    self.status = ToolStatus::Stopped;
                } else {
                    self.status = ToolStatus::Error;
                    self.last_error = Some(format!("exited with {}", exit));
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Tool '{}' status check failed: {}", self.spec.name, e),
        }
    }
}

/// Starts, stops and reports on tool processes
pub struct ToolSupervisor {
    tools: Mutex<BTreeMap<String, ToolEntry>>,
    env: HashMap<String, String>,
    grace_period: Duration,
}

impl ToolSupervisor {
    /// Supervise `specs`, expanding templates against `env`
    pub fn new(specs: Vec<ToolSpec>, env: HashMap<String, String>) -> Self {
        let tools = specs
            .into_iter()
            .map(|spec| {
                let entry = ToolEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    spec: spec.clone(),
                    status: ToolStatus::Stopped,
                    child: None,
                    last_error: None,
                };
                (spec.name, entry)
            })
            .collect();

        Self {
            tools: Mutex::new(tools),
            env,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Supervise `specs` against the current process environment
    pub fn from_process_env(specs: Vec<ToolSpec>) -> Self {
        Self::new(specs, std::env::vars().collect())
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn build_command(&self, spec: &ToolSpec) -> Command {
        let mut cmd = Command::new(expand_template(&spec.command, &self.env));
        cmd.args(spec.args.iter().map(|a| expand_template(a, &self.env)))
            .envs(
                spec.env
                    .iter()
                    .map(|(k, v)| (k.clone(), expand_template(v, &self.env))),
            )
            // stdin stays open for the tool's lifetime; stdout has no reader
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Launch a tool. No-op when it is already running.
    ///
    /// A launch failure leaves the tool in `Error` and is returned, never panics.
    pub fn start(&self, name: &str) -> Result<(), ToolError> {
        let mut tools = self.tools.lock();
        let entry = tools
            .get_mut(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        entry.refresh();
        if entry.status == ToolStatus::Running {
            debug!("Tool '{}' already running", name);
            return Ok(());
        }

        match self.build_command(&entry.spec).spawn() {
            Ok(mut child) => {
                if let Some(stderr) = child.stderr.take() {
                    let tool = name.to_string();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            debug!(tool = %tool, "{}", line);
                        }
                    });
                }
                info!("Started tool '{}' (pid {:?})", name, child.id());
                entry.child = Some(child);
                entry.status = ToolStatus::Running;
                entry.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to start tool '{}': {}", name, e);
                entry.status = ToolStatus::Error;
                entry.last_error = Some(e.to_string());
                Err(ToolError::Launch {
                    name: name.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Terminate, wait out the grace period, then force-kill
    pub async fn stop(&self, name: &str) -> Result<(), ToolError> {
        let child = {
            let mut tools = self.tools.lock();
            let entry = tools
                .get_mut(name)
                .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
            entry.child.take()
        };

        if let Some(mut child) = child {
            terminate(&mut child);
            match tokio::time::timeout(self.grace_period, child.wait()).await {
                Ok(Ok(exit)) => debug!("Tool '{}' exited: {}", name, exit),
                Ok(Err(e)) => warn!("Tool '{}' wait failed: {}", name, e),
                Err(_) => {
                    warn!("Tool '{}' ignored terminate, killing", name);
                    if let Err(e) = child.kill().await {
                        warn!("Tool '{}' kill failed: {}", name, e);
                    }
                }
            }
            info!("Stopped tool '{}'", name);
        }

        if let Some(entry) = self.tools.lock().get_mut(name) {
            entry.status = ToolStatus::Stopped;
        }
        Ok(())
    }

    /// Start every tool; failures are independent of each other
    pub fn start_all(&self) -> Vec<(String, Result<(), ToolError>)> {
        self.names()
            .into_iter()
            .map(|name| {
                let result = self.start(&name);
                (name, result)
            })
            .collect()
    }

    /// Stop every tool; failures are independent of each other
    pub async fn stop_all(&self) {
        for name in self.names() {
            if let Err(e) = self.stop(&name).await {
                warn!("Failed to stop tool '{}': {}", name, e);
            }
        }
    }

    pub fn status(&self) -> Vec<ToolInfo> {
        let mut tools = self.tools.lock();
        tools
            .values_mut()
            .map(|entry| {
                entry.refresh();
                ToolInfo {
                    id: entry.id.clone(),
                    name: entry.spec.name.clone(),
                    status: entry.status,
                    pid: entry.child.as_ref().and_then(|c| c.id()),
                    last_error: entry.last_error.clone(),
                }
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.lock().keys().cloned().collect()
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to {} failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_template() {
        let env = HashMap::from([
            ("WORKSPACE".to_string(), "/srv/work".to_string()),
            ("TOKEN".to_string(), "abc".to_string()),
        ]);
        assert_eq!(expand_template("--root=${WORKSPACE}", &env), "--root=/srv/work");
        assert_eq!(expand_template("$TOKEN", &env), "abc");
        assert_eq!(expand_template("key=${MISSING}", &env), "key=");
        assert_eq!(expand_template("plain", &env), "plain");
    }

    #[test]
    fn test_parse_table() {
        let table = ToolTable::parse(
            r#"
            [[tool]]
            name = "filesystem"
            command = "mcp-filesystem"
            args = ["--root", "${WORKSPACE}"]
            [tool.env]
            TOKEN = "${FS_TOKEN}"

            [[tool]]
            name = "git"
            command = "mcp-git"
            "#,
        )
        .unwrap();

        assert_eq!(table.tools.len(), 2);
        assert_eq!(table.tools[0].env["TOKEN"], "${FS_TOKEN}");
        assert!(table.tools[1].args.is_empty());

        assert!(matches!(ToolTable::parse("[[tool]]\nname = 1"), Err(ToolError::Table(_))));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let sup = ToolSupervisor::new(vec![], HashMap::new());
        assert_eq!(sup.start("ghost"), Err(ToolError::NotFound("ghost".into())));
        assert!(sup.stop("ghost").await.is_err());
    }
}
