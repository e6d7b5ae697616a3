//! Provisioning plans: the resolved configuration the lifecycle and
//! transfer machinery consumes, a small directive language to produce one,
//! and a runner that drives a machine through the plan's steps.
//!
//! Directive lines are `keyword arg...`. Single-valued directives take
//! exactly one argument (a repeat replaces the earlier value), `run` takes
//! one or more and repeats accumulate in order, `push`/`pull` take exactly
//! two and accumulate, `destroy` takes none. Unknown keywords are errors.
//! Directives never seen keep their declared defaults.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::ssh::{Session, SshAuth, SshConfig};
use crate::transfer::Transfer;
use crate::vbox::Vbox;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run(String),
    Push { local: PathBuf, remote: PathBuf },
    Pull { remote: PathBuf, local: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Plan {
    /// Appliance image to import when the named box is absent.
    pub image: Option<PathBuf>,
    /// Catalog name of an existing box.
    pub name: Option<String>,
    pub user: String,
    pub password: Option<String>,
    pub identity: Option<PathBuf>,
    pub port: Option<u16>,
    pub cpus: Option<u32>,
    pub memory: Option<u32>,
    /// Provisioning steps, in declaration order.
    pub steps: Vec<Step>,
    /// Tear the box down completely after a successful run.
    pub destroy: bool,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            image: None,
            name: None,
            user: "root".to_string(),
            password: None,
            identity: None,
            port: None,
            cpus: None,
            memory: None,
            steps: Vec::new(),
            destroy: false,
        }
    }
}

impl Plan {
    /// Parse a plan from directive lines. Blank lines and `#` comments are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_filtered(text, None)
    }

    /// Like [`Plan::parse`], but only lines starting with `prefix` are
    /// considered directives (after stripping it); everything else is
    /// ignored. This lets a plan ride along inside another file.
    pub fn parse_filtered(text: &str, prefix: Option<&str>) -> Result<Self> {
        let mut plan = Self::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = match prefix {
                Some(prefix) => match raw.trim_start().strip_prefix(prefix) {
                    Some(rest) => rest,
                    None => continue,
                },
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            let args: Vec<&str> = words.collect();
            plan.apply(keyword, &args)
                .map_err(|e| Error::Parse(format!("line {}: {e}", idx + 1)))?;
        }
        if plan.name.is_none() && plan.image.is_none() {
            return Err(Error::Parse(
                "plan names neither a box nor an image to load".to_string(),
            ));
        }
        Ok(plan)
    }

    fn apply(&mut self, keyword: &str, args: &[&str]) -> std::result::Result<(), String> {
        match keyword {
            "image" => self.image = Some(one(keyword, args)?.into()),
            "box" => self.name = Some(one(keyword, args)?.to_string()),
            "user" => self.user = one(keyword, args)?.to_string(),
            "password" => self.password = Some(one(keyword, args)?.to_string()),
            "identity" => self.identity = Some(one(keyword, args)?.into()),
            "port" => self.port = Some(parsed(keyword, one(keyword, args)?)?),
            "cpus" => self.cpus = Some(parsed(keyword, one(keyword, args)?)?),
            "memory" => self.memory = Some(parsed(keyword, one(keyword, args)?)?),
            "run" => {
                if args.is_empty() {
                    return Err("run takes at least one argument".to_string());
                }
                self.steps.push(Step::Run(args.join(" ")));
            }
            "push" => {
                let (local, remote) = two(keyword, args)?;
                self.steps.push(Step::Push {
                    local: local.into(),
                    remote: remote.into(),
                });
            }
            "pull" => {
                let (remote, local) = two(keyword, args)?;
                self.steps.push(Step::Pull {
                    remote: remote.into(),
                    local: local.into(),
                });
            }
            "destroy" => {
                if !args.is_empty() {
                    return Err("destroy takes no arguments".to_string());
                }
                self.destroy = true;
            }
            other => return Err(format!("unknown directive {other:?}")),
        }
        Ok(())
    }

    /// Drive a machine through the whole plan: load or find, configure while
    /// stopped, start, execute every step in order, stop, optionally destroy.
    ///
    /// The first failing step aborts the remaining sequence; the machine is
    /// still stopped on the way out.
    pub async fn run(&self, vbox: &Vbox, ssh: SshConfig) -> Result<()> {
        let mut machine = self.resolve(vbox, &ssh).await?;

        if let Some(cpus) = self.cpus {
            machine.set_cpus(cpus).await?;
        }
        if let Some(memory) = self.memory {
            machine.set_memory(memory).await?;
        }

        machine.start(self.port).await?;
        machine.sync().await?;

        let auth = SshAuth {
            user: self.user.clone(),
            password: self.password.clone(),
            key_path: self.identity.clone(),
        };
        let session = machine.session(auth)?;
        let transfer = Transfer::new(&session)?;

        let result = self.run_steps(&session, &transfer).await;

        machine.stop().await?;
        if self.destroy {
            machine.destroy().await?;
        }
        result
    }

    async fn run_steps(&self, session: &Session, transfer: &Transfer<'_>) -> Result<()> {
        for step in &self.steps {
            match step {
                Step::Run(command) => {
                    info!("Provisioning: {command}");
                    let mut stdout = tokio::io::stdout();
                    let mut stderr = tokio::io::stderr();
                    let code = session
                        .run(
                            command,
                            Option::<tokio::io::Empty>::None,
                            &mut stdout,
                            &mut stderr,
                            CancellationToken::new(),
                        )
                        .await?;
                    if code != 0 {
                        return Err(Error::Execution(format!(
                            "{command:?} exited with status {code}"
                        )));
                    }
                }
                Step::Push { local, remote } => transfer.push(local, remote, None).await?,
                Step::Pull { remote, local } => transfer.pull(remote, local, None).await?,
            }
        }
        Ok(())
    }

    async fn resolve(&self, vbox: &Vbox, ssh: &SshConfig) -> Result<Machine> {
        if let Some(name) = &self.name {
            if vbox.vms().await?.iter().any(|n| n == name) {
                return Machine::find(vbox.clone(), ssh.clone(), name).await;
            }
        }
        if let Some(image) = &self.image {
            return Machine::load(vbox.clone(), ssh.clone(), image).await;
        }
        Err(Error::NotFound {
            what: match &self.name {
                Some(name) => format!("virtual machine {name} (and no image to load)"),
                None => "a box name or image in the plan".to_string(),
            },
        })
    }
}

fn one<'a>(keyword: &str, args: &[&'a str]) -> std::result::Result<&'a str, String> {
    match args {
        [value] => Ok(value),
        _ => Err(format!(
            "{keyword} takes exactly one argument, got {}",
            args.len()
        )),
    }
}

fn two<'a>(keyword: &str, args: &[&'a str]) -> std::result::Result<(&'a str, &'a str), String> {
    match args {
        [a, b] => Ok((a, b)),
        _ => Err(format!(
            "{keyword} takes exactly two arguments, got {}",
            args.len()
        )),
    }
}

fn parsed<T: std::str::FromStr>(keyword: &str, value: &str) -> std::result::Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{keyword}: could not parse {value:?}"))
}
