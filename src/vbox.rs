//! Gateway to the external `VBoxManage` command.
//!
//! All knowledge of the manager's command-line grammar and textual output
//! conventions lives here: quoted-token list parsing, `key=value` info
//! records, and the NAT forwarding-rule tuple format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::{Error, Result};

const DEFAULT_MANAGE_CMD: &str = "/usr/bin/VBoxManage";

static LIST_RE: OnceLock<Regex> = OnceLock::new();
static SUGGESTED_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// A named option on a `VBoxManage` invocation.
///
/// Rendering rules: `Flag` becomes a bare `--name`, `Value` becomes
/// `--name value`, `Pair` becomes `--name a b`. A false boolean option is
/// never constructed; it is simply not added to the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    Flag,
    Value(String),
    Pair(String, String),
}

impl OptValue {
    pub fn value(v: impl Into<String>) -> Self {
        Self::Value(v.into())
    }

    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self::Pair(a.into(), b.into())
    }
}

/// One `VBoxManage` command line: a verb, positional arguments in order, and
/// long-form options rendered per [`OptValue`].
#[derive(Debug, Clone)]
pub struct VboxCmd {
    verb: &'static str,
    args: Vec<String>,
    opts: Vec<(String, OptValue)>,
}

impl VboxCmd {
    pub fn new(verb: &'static str) -> Self {
        Self {
            verb,
            args: Vec::new(),
            opts: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds a bare `--name` when `on` is true, nothing otherwise.
    pub fn flag(mut self, name: &str, on: bool) -> Self {
        if on {
            self.opts.push((name.to_string(), OptValue::Flag));
        }
        self
    }

    pub fn opt(mut self, name: &str, value: OptValue) -> Self {
        self.opts.push((name.to_string(), value));
        self
    }

    pub fn render(&self) -> Vec<String> {
        let mut argv = vec![self.verb.to_string()];
        argv.extend(self.args.iter().cloned());
        for (name, value) in &self.opts {
            argv.push(format!("--{name}"));
            match value {
                OptValue::Flag => {}
                OptValue::Value(v) => argv.push(v.clone()),
                OptValue::Pair(a, b) => {
                    argv.push(a.clone());
                    argv.push(b.clone());
                }
            }
        }
        argv
    }
}

/// A NAT port-forwarding rule as reported in machine info, e.g.
/// `ssh,tcp,,5555,,22`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub name: String,
    pub proto: String,
    pub host_ip: String,
    pub host_port: u16,
    pub client_ip: String,
    pub client_port: u16,
}

impl FromStr for NatRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(',').collect();
        let [name, proto, host_ip, host_port, client_ip, client_port] = fields[..] else {
            return Err(Error::Parse(format!("malformed forwarding rule {s:?}")));
        };
        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| Error::Parse(format!("bad port {p:?} in forwarding rule {s:?}")))
        };
        Ok(Self {
            name: name.to_string(),
            proto: proto.to_string(),
            host_ip: host_ip.to_string(),
            host_port: parse_port(host_port)?,
            client_ip: client_ip.to_string(),
            client_port: parse_port(client_port)?,
        })
    }
}

/// Handle on the external virtualization manager.
///
/// Command dispatch is synchronous with respect to the child process; it is
/// never invoked concurrently for the same machine.
#[derive(Debug, Clone)]
pub struct Vbox {
    cmd: PathBuf,
}

impl Default for Vbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Vbox {
    /// Uses `VBOX_MANAGE_CMD` from the environment when set.
    pub fn new() -> Self {
        let cmd = std::env::var_os("VBOX_MANAGE_CMD")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MANAGE_CMD));
        Self { cmd }
    }

    pub fn with_command(cmd: impl Into<PathBuf>) -> Self {
        Self { cmd: cmd.into() }
    }

    /// Runs one manager command and returns its combined stdout/stderr.
    async fn run(&self, cmd: VboxCmd) -> Result<String> {
        let argv = cmd.render();
        debug!("Running {} {}", self.cmd.display(), argv.join(" "));

        let gateway_err = |output: String| Error::Gateway {
            command: argv.join(" "),
            output,
        };

        let output = tokio::process::Command::new(&self.cmd)
            .args(&argv)
            .output()
            .await
            .map_err(|e| gateway_err(format!("failed to execute {}: {e}", self.cmd.display())))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(gateway_err(combined));
        }
        Ok(combined)
    }

    /// Names of all machines in the catalog.
    pub async fn vms(&self) -> Result<Vec<String>> {
        let output = self.run(VboxCmd::new("list").arg("vms")).await?;
        Ok(quoted_names(&output))
    }

    /// Names of all currently running machines.
    pub async fn running(&self) -> Result<Vec<String>> {
        let output = self.run(VboxCmd::new("list").arg("runningvms")).await?;
        Ok(quoted_names(&output))
    }

    /// Imports an appliance image and returns the name the manager chose.
    pub async fn import_image(&self, path: &Path) -> Result<String> {
        let path = tokio::fs::canonicalize(path).await.map_err(|_| Error::NotFound {
            what: format!("image {}", path.display()),
        })?;
        let output = self
            .run(VboxCmd::new("import").arg(path.to_string_lossy()))
            .await?;
        suggested_name(&output).ok_or_else(|| Error::Gateway {
            command: format!("import {}", path.display()),
            output: format!("no suggested VM name in import output:\n{output}"),
        })
    }

    /// Machine-readable info as a `key=value` map. Malformed lines are skipped.
    pub async fn info(&self, name: &str) -> Result<HashMap<String, String>> {
        let output = self
            .run(
                VboxCmd::new("showvminfo")
                    .arg(name)
                    .flag("machinereadable", true),
            )
            .await?;
        Ok(parse_info(&output))
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.run(
            VboxCmd::new("startvm")
                .arg(name)
                .opt("type", OptValue::value("headless")),
        )
        .await?;
        Ok(())
    }

    pub async fn poweroff(&self, name: &str) -> Result<()> {
        self.run(VboxCmd::new("controlvm").arg(name).arg("poweroff"))
            .await?;
        Ok(())
    }

    /// Applies configuration changes. A running machine's configuration is
    /// immutable, so this refuses before touching the manager.
    pub async fn modify(&self, name: &str, opts: Vec<(String, OptValue)>) -> Result<()> {
        if self.running().await?.iter().any(|n| n == name) {
            return Err(Error::Precondition(format!(
                "{name} is running; configuration is immutable until stopped"
            )));
        }
        let mut cmd = VboxCmd::new("modifyvm").arg(name);
        for (opt, value) in opts {
            cmd = cmd.opt(&opt, value);
        }
        self.run(cmd).await?;
        Ok(())
    }

    pub async fn unregister(&self, name: &str, delete_files: bool) -> Result<()> {
        self.run(
            VboxCmd::new("unregistervm")
                .arg(name)
                .flag("delete", delete_files),
        )
        .await?;
        Ok(())
    }

    pub async fn export(&self, name: &str, output: &Path) -> Result<()> {
        self.run(
            VboxCmd::new("export")
                .arg(name)
                .opt("output", OptValue::value(output.to_string_lossy())),
        )
        .await?;
        Ok(())
    }
}

/// Every double-quoted substring in a listing is a candidate identifier.
fn quoted_names(output: &str) -> Vec<String> {
    let re = LIST_RE.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("valid regex"));
    re.captures_iter(output).map(|c| c[1].to_string()).collect()
}

fn suggested_name(output: &str) -> Option<String> {
    let re = SUGGESTED_NAME_RE
        .get_or_init(|| Regex::new(r#"Suggested VM name "([^"]+)""#).expect("valid regex"));
    re.captures(output).map(|c| c[1].to_string())
}

fn parse_info(output: &str) -> HashMap<String, String> {
    let mut info = HashMap::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        info.insert(
            key.trim().trim_matches('"').to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    info
}
