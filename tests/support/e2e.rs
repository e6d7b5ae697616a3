use std::path::PathBuf;

use testbox::{Session, SshAuth, SshConfig};

/// Gate tests that need a real, reachable sshd.
/// Enable by running:
/// `TESTBOX_RUN_E2E=1 TESTBOX_SSH_ADDR=127.0.0.1:2222 cargo test --test remote_exec -- --nocapture`
pub fn e2e_enabled() -> bool {
    matches!(
        std::env::var("TESTBOX_RUN_E2E").as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

fn ssh_target() -> Option<(String, u16)> {
    let addr = std::env::var("TESTBOX_SSH_ADDR").ok()?;
    let (host, port) = addr.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

/// A session against the machine named by the environment, or `None` (with a
/// SKIP note) when the environment doesn't provide one.
pub fn session() -> Option<Session> {
    if !e2e_enabled() {
        eprintln!("SKIP: E2E SSH tests disabled. Set TESTBOX_RUN_E2E=1 to enable.");
        return None;
    }
    let Some((host, port)) = ssh_target() else {
        eprintln!("SKIP: TESTBOX_SSH_ADDR not set (expected host:port).");
        return None;
    };

    let user = std::env::var("TESTBOX_SSH_USER").unwrap_or_else(|_| "root".to_string());
    let auth = match (
        std::env::var("TESTBOX_SSH_IDENTITY").ok(),
        std::env::var("TESTBOX_SSH_PASSWORD").ok(),
    ) {
        (Some(identity), _) => SshAuth::with_key(user, PathBuf::from(identity)),
        (None, Some(password)) => SshAuth::with_password(user, password),
        (None, None) => {
            eprintln!("SKIP: set TESTBOX_SSH_IDENTITY or TESTBOX_SSH_PASSWORD.");
            return None;
        }
    };

    Some(Session::new(host, port, auth, SshConfig::default()))
}
