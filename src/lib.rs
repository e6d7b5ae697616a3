use std::future::Future;
use std::pin::Pin;

mod error;
mod machine;
mod plan;
mod ssh;
mod transfer;
mod utils;
mod vbox;

// Re-export public types and functions
pub use error::Error;
pub use error::Result;
pub use machine::Machine;
pub use machine::SHELL_PORT;
pub use machine::SHELL_RULE;
pub use plan::Plan;
pub use plan::Step;
pub use ssh::Session;
pub use ssh::SshAuth;
pub use ssh::SshConfig;
pub use ssh::wait_for_ssh;
pub use transfer::ProgressFn;
pub use transfer::Transfer;
pub use utils::TestboxDirs;
pub use vbox::NatRule;
pub use vbox::OptValue;
pub use vbox::Vbox;
pub use vbox::VboxCmd;

/// Find `name` in the manager's catalog, start it, hand it to `f`, and stop
/// it again afterwards regardless of what `f` returned.
pub async fn with_machine<'a, F, R>(vbox: &'a Vbox, name: &'a str, ssh: SshConfig, f: F) -> Result<R>
where
    F: for<'b> FnOnce(&'b mut Machine) -> Pin<Box<dyn Future<Output = Result<R>> + 'b>>,
{
    let mut machine = Machine::find(vbox.clone(), ssh, name).await?;
    machine.start(None).await?;
    let result = f(&mut machine).await;
    machine.stop().await?;

    result
}
