//! Remote command execution over SSH.
//!
//! A [`Session`] is bound to one `(host, port, credentials)` tuple and opens a
//! fresh underlying connection for every command, so a stale channel from an
//! earlier command can never be reused. Output draining, stdin streaming and
//! exit-status collection all run concurrently inside one channel event loop;
//! the only cancellation primitive is a shared [`CancellationToken`].

use std::{io::ErrorKind, path::PathBuf, sync::Arc, time::Duration};

use russh::{
    ChannelMsg, Disconnect,
    keys::{PrivateKeyWithHashAlg, load_secret_key},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Window size for stdin streaming and output copies.
const WINDOW_SIZE: usize = 32 * 1024;

#[derive(Clone, Debug)]
pub struct SshAuth {
    pub user: String,
    pub password: Option<String>,
    /// Private key file; preferred over the password when both are set.
    pub key_path: Option<PathBuf>,
}

impl SshAuth {
    pub fn with_key(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            password: None,
            key_path: Some(key_path.into()),
        }
    }

    pub fn with_password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Some(password.into()),
            key_path: None,
        }
    }
}

/// Timing knobs for connection, readiness and command execution.
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// Bound on establishing one authenticated connection.
    pub connect_timeout: Duration,
    /// Sleep between connection attempts and state re-checks.
    pub poll_interval: Duration,
    /// Overall bound on one remote command; `None` means no limit.
    pub command_timeout: Option<Duration>,
    /// Bound on the post-boot readiness probe; `None` skips the probe.
    pub ready_timeout: Option<Duration>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            command_timeout: None,
            ready_timeout: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone)]
struct SshClient {}

impl russh::client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

fn retryable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::NetworkUnreachable
            | ErrorKind::AddrNotAvailable
    )
}

/// One remote-shell endpoint. Cheap to construct; connects on use.
#[derive(Clone, Debug)]
pub struct Session {
    host: String,
    port: u16,
    auth: SshAuth,
    config: SshConfig,
}

impl Session {
    pub fn new(host: impl Into<String>, port: u16, auth: SshAuth, config: SshConfig) -> Self {
        Self {
            host: host.into(),
            port,
            auth,
            config,
        }
    }

    /// Establish an authenticated connection, retrying while the guest's
    /// shell service is still coming up.
    async fn connect(&self) -> Result<russh::client::Handle<SshClient>> {
        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(5)),
            ..<_>::default()
        });
        let addr = format!("{}:{}", self.host, self.port);
        let now = Instant::now();
        debug!("Connecting to {addr}");

        let mut session = loop {
            if now.elapsed() > self.config.connect_timeout {
                return Err(Error::Connection(format!(
                    "timed out connecting to {addr} after {:?}",
                    self.config.connect_timeout
                )));
            }

            let stream = match TcpStream::connect(&addr).await {
                Ok(s) => s,
                Err(e) if retryable(e.kind()) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
                Err(e) => return Err(Error::Connection(format!("{addr}: {e}"))),
            };

            match russh::client::connect_stream(config.clone(), stream, SshClient {}).await {
                Ok(x) => break x,
                // The guest may accept TCP before sshd is ready; keep trying.
                Err(russh::Error::IO(ref e)) if retryable(e.kind()) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(russh::Error::Disconnect) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => return Err(Error::Connection(format!("{addr}: {e}"))),
            }
        };

        debug!("Authenticating as {}", self.auth.user);
        let auth_res = if let Some(key_path) = &self.auth.key_path {
            let key = load_secret_key(key_path, None)
                .map_err(|e| Error::Connection(format!("could not load key {key_path:?}: {e}")))?;
            session
                .authenticate_publickey(
                    &self.auth.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await
                .map_err(|e| Error::Connection(e.to_string()))?
        } else if let Some(password) = &self.auth.password {
            session
                .authenticate_password(&self.auth.user, password)
                .await
                .map_err(|e| Error::Connection(e.to_string()))?
        } else {
            return Err(Error::Connection(format!(
                "no key or password configured for {}@{addr}",
                self.auth.user
            )));
        };

        if !auth_res.success() {
            return Err(Error::Connection(format!(
                "authentication failed for {}@{addr}",
                self.auth.user
            )));
        }

        Ok(session)
    }

    /// Run `command`, draining stdout/stderr into the given sinks while
    /// streaming `stdin` (when present) in fixed-size windows, and return the
    /// remote exit status.
    ///
    /// Both sinks hold the complete output before this returns; no ordering
    /// is guaranteed between the two streams.
    pub async fn run<I, O, E>(
        &self,
        command: &str,
        stdin: Option<I>,
        stdout: &mut O,
        stderr: &mut E,
        cancel: CancellationToken,
    ) -> Result<u32>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let session = self.connect().await?;
        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| Error::Execution(e.to_string()))?;

        debug!("Running {command:?} on {}:{}", self.host, self.port);
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Execution(e.to_string()))?;

        let result = match self.config.command_timeout {
            Some(limit) => {
                match timeout(
                    limit,
                    self.drive(command, &mut channel, stdin, stdout, stderr, cancel),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(Error::Execution(format!(
                        "command {command:?} timed out after {limit:?}"
                    ))),
                }
            }
            None => {
                self.drive(command, &mut channel, stdin, stdout, stderr, cancel)
                    .await
            }
        };

        // Best effort; the command's outcome is already decided.
        let _ = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;

        result
    }

    /// The channel event loop: output frames to sinks, stdin windows to the
    /// channel as its flow control allows, exit status collected, all
    /// concurrently. Keeps draining after the status arrives until the
    /// channel closes, so no already-produced output is lost.
    async fn drive<I, O, E>(
        &self,
        command: &str,
        channel: &mut russh::Channel<russh::client::Msg>,
        stdin: Option<I>,
        stdout: &mut O,
        stderr: &mut E,
        cancel: CancellationToken,
    ) -> Result<u32>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let exec_err = |e: russh::Error| Error::Execution(e.to_string());

        let mut input = stdin;
        let mut window = vec![0u8; WINDOW_SIZE];
        let mut code = None;
        let mut signal = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // One final pass for frames the server already sent.
                    while let Ok(Some(msg)) =
                        timeout(self.config.poll_interval, channel.wait()).await
                    {
                        match msg {
                            ChannelMsg::Data { ref data } => stdout.write_all(data).await?,
                            ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                                stderr.write_all(data).await?
                            }
                            _ => {}
                        }
                    }
                    stdout.flush().await?;
                    stderr.flush().await?;
                    info!("Command {command:?} cancelled");
                    return Err(Error::Execution(format!("command {command:?} cancelled")));
                }

                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            stdout.write_all(data).await?;
                            stdout.flush().await?;
                        }
                        Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                            stderr.write_all(data).await?;
                            stderr.flush().await?;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            code = Some(exit_status);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            signal = Some(signal_name);
                        }
                        Some(_) => {}
                        // Channel closed; everything produced has been drained.
                        None => break,
                    }
                }

                read = read_window(&mut input, &mut window), if input.is_some() => {
                    match read {
                        Ok(0) => {
                            channel.eof().await.map_err(exec_err)?;
                            input = None;
                            debug!("Done sending stdin for {command:?}");
                        }
                        Ok(n) => {
                            // A send failure usually means the remote command
                            // stopped reading; its exit status tells the real
                            // story, so keep draining instead of bailing.
                            if let Err(e) = channel.data(&window[..n]).await {
                                debug!("Stopped sending stdin for {command:?}: {e}");
                                input = None;
                            }
                        }
                        Err(e) => return Err(Error::Execution(
                            format!("reading input for {command:?}: {e}"),
                        )),
                    }
                }
            }
        }

        stdout.flush().await?;
        stderr.flush().await?;

        match (code, signal) {
            (Some(code), _) => {
                debug!("Command {command:?} exited with status {code}");
                Ok(code)
            }
            (None, Some(signal)) => Err(Error::Execution(format!(
                "command {command:?} terminated by signal {signal:?}"
            ))),
            (None, None) => Err(Error::Execution(format!(
                "channel closed without exit status for {command:?}"
            ))),
        }
    }

    /// Run `command` and capture its output.
    pub async fn output(&self, command: &str) -> Result<(u32, Vec<u8>, Vec<u8>)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let code = self
            .run(
                command,
                Option::<tokio::io::Empty>::None,
                &mut stdout,
                &mut stderr,
                CancellationToken::new(),
            )
            .await?;
        Ok((code, stdout, stderr))
    }
}

async fn read_window<I: AsyncRead + Unpin>(
    input: &mut Option<I>,
    window: &mut [u8],
) -> std::io::Result<usize> {
    match input.as_mut() {
        Some(reader) => reader.read(window).await,
        None => Ok(0),
    }
}

/// Block until an SSH handshake succeeds on `host:port`, or fail after
/// `ready_timeout`. This replaces a fixed post-boot settle delay: a completed
/// handshake proves the guest's shell service is actually up.
pub async fn wait_for_ssh(
    host: &str,
    port: u16,
    ready_timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let config = Arc::new(russh::client::Config::default());
    let addr = format!("{host}:{port}");
    let now = Instant::now();
    info!("Waiting for sshd on {addr}");

    loop {
        if now.elapsed() > ready_timeout {
            return Err(Error::Connection(format!(
                "timed out after {ready_timeout:?} waiting for sshd on {addr}"
            )));
        }
        tokio::time::sleep(poll_interval).await;

        let Ok(stream) = TcpStream::connect(&addr).await else {
            continue;
        };
        match russh::client::connect_stream(config.clone(), stream, SshClient {}).await {
            Ok(session) => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
                debug!("sshd on {addr} is ready after {:?}", now.elapsed());
                return Ok(());
            }
            // Still booting; banner or key exchange not up yet.
            Err(e) => {
                debug!("sshd on {addr} not ready yet: {e}");
            }
        }
    }
}
