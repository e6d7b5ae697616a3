//! Hermetic lifecycle tests against a recorded fake `VBoxManage`.

#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use testbox::{Error, Machine, SshConfig};

#[path = "support/fake_vbox.rs"]
mod fake_vbox;
#[path = "support/logging.rs"]
mod logging;

use fake_vbox::FakeVbox;
use logging::tracing_subscriber_init;

/// Config for tests: no readiness probe (there is no guest to probe) and a
/// short poll interval so stop() converges quickly.
fn test_ssh_config() -> SshConfig {
    SshConfig {
        poll_interval: Duration::from_millis(10),
        ready_timeout: None,
        ..SshConfig::default()
    }
}

const BOX1_INFO: &str = "\
name=\"box1\"
Forwarding(0)=\"ssh,tcp,,5555,,22\"
memory=2048
cpus=2
";

fn seeded_running_box1() -> FakeVbox {
    let fake = FakeVbox::new();
    fake.add_vm("box1");
    fake.set_running("box1");
    fake.write_info("box1", BOX1_INFO);
    fake
}

#[tokio::test]
async fn find_missing_box_is_not_found() -> Result<()> {
    tracing_subscriber_init();
    let fake = FakeVbox::new();

    let result = Machine::find(fake.vbox(), test_ssh_config(), "ghost").await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn sync_reads_back_port_cpus_and_memory() -> Result<()> {
    tracing_subscriber_init();
    let fake = seeded_running_box1();

    let machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    assert_eq!(machine.port(), Some(5555));
    assert_eq!(machine.memory(), Some(2048));
    assert_eq!(machine.cpus(), Some(2));
    Ok(())
}

#[tokio::test]
async fn start_is_idempotent_when_already_running() -> Result<()> {
    tracing_subscriber_init();
    let fake = seeded_running_box1();

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    machine.start(None).await?;
    machine.start(None).await?;

    assert_eq!(machine.port(), Some(5555));
    assert!(!fake.calls().iter().any(|c| c.starts_with("startvm")));
    Ok(())
}

#[tokio::test]
async fn start_installs_forwarding_rule_then_boots() -> Result<()> {
    tracing_subscriber_init();
    let fake = FakeVbox::new();
    fake.add_vm("box1");
    fake.write_info("box1", "name=\"box1\"\nmemory=2048\ncpus=2\n");

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    assert_eq!(machine.port(), None);

    machine.start(Some(4242)).await?;
    assert_eq!(machine.port(), Some(4242));
    assert!(machine.is_running().await?);

    let calls = fake.calls();
    let modify = calls
        .iter()
        .position(|c| c == "modifyvm box1 --natpf1 ssh,tcp,,4242,,22")
        .expect("forwarding rule installed");
    let start = calls
        .iter()
        .position(|c| c == "startvm box1 --type headless")
        .expect("vm started headless");
    assert!(modify < start, "rule must be installed before boot");

    // Gateway truth agrees after a refresh.
    machine.sync().await?;
    assert_eq!(machine.port(), Some(4242));
    Ok(())
}

#[tokio::test]
async fn stop_is_synchronous_and_idempotent() -> Result<()> {
    tracing_subscriber_init();
    let fake = seeded_running_box1();

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    machine.stop().await?;

    assert!(!machine.is_running().await?);
    assert_eq!(machine.port(), None);

    machine.stop().await?;
    let poweroffs = fake
        .calls()
        .iter()
        .filter(|c| c.starts_with("controlvm"))
        .count();
    assert_eq!(poweroffs, 1, "second stop must be a no-op");
    Ok(())
}

#[tokio::test]
async fn set_port_deletes_old_rule_before_installing_new_one() -> Result<()> {
    tracing_subscriber_init();
    let fake = FakeVbox::new();
    fake.add_vm("box1");
    fake.write_info("box1", BOX1_INFO);

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    assert_eq!(machine.port(), Some(5555));

    machine.set_port(Some(7777)).await?;
    assert_eq!(machine.port(), Some(7777));

    let calls = fake.calls();
    let delete = calls
        .iter()
        .position(|c| c == "modifyvm box1 --natpf1 delete ssh")
        .expect("old rule deleted");
    let install = calls
        .iter()
        .position(|c| c == "modifyvm box1 --natpf1 ssh,tcp,,7777,,22")
        .expect("new rule installed");
    assert!(delete < install);

    // Exactly one rule remains in gateway state.
    let info = fake.info("box1");
    assert_eq!(info.matches("Forwarding(").count(), 1);
    machine.sync().await?;
    assert_eq!(machine.port(), Some(7777));
    Ok(())
}

#[tokio::test]
async fn set_port_none_removes_the_shell_rule() -> Result<()> {
    tracing_subscriber_init();
    let fake = FakeVbox::new();
    fake.add_vm("box1");
    fake.write_info("box1", BOX1_INFO);

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    machine.set_port(None).await?;

    assert!(!fake.info("box1").contains("Forwarding("));
    machine.sync().await?;
    assert_eq!(machine.port(), None);
    Ok(())
}

#[tokio::test]
async fn setters_refuse_while_running_and_change_nothing() -> Result<()> {
    tracing_subscriber_init();
    let fake = seeded_running_box1();

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    let result = machine.set_cpus(8).await;
    assert!(matches!(result, Err(Error::Precondition(_))));
    assert_eq!(machine.cpus(), Some(2), "in-memory value must not change");

    let result = machine.set_memory(4096).await;
    assert!(matches!(result, Err(Error::Precondition(_))));

    // Gateway-observed configuration is untouched.
    machine.sync().await?;
    assert_eq!(machine.cpus(), Some(2));
    assert_eq!(machine.memory(), Some(2048));
    assert!(!fake.calls().iter().any(|c| c.starts_with("modifyvm")));
    Ok(())
}

#[tokio::test]
async fn setters_apply_while_stopped() -> Result<()> {
    tracing_subscriber_init();
    let fake = FakeVbox::new();
    fake.add_vm("box1");
    fake.write_info("box1", BOX1_INFO);

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    machine.set_cpus(4).await?;
    machine.set_memory(4096).await?;

    machine.sync().await?;
    assert_eq!(machine.cpus(), Some(4));
    assert_eq!(machine.memory(), Some(4096));
    Ok(())
}

#[tokio::test]
async fn destroy_stops_unregisters_and_is_idempotent() -> Result<()> {
    tracing_subscriber_init();
    let fake = seeded_running_box1();

    let mut machine = Machine::find(fake.vbox(), test_ssh_config(), "box1").await?;
    machine.destroy().await?;

    assert!(fake.running().is_empty());
    assert!(fake.vms().is_empty());
    assert!(
        fake.calls()
            .iter()
            .any(|c| c == "unregistervm box1 --delete")
    );

    machine.destroy().await?;
    let unregisters = fake
        .calls()
        .iter()
        .filter(|c| c.starts_with("unregistervm"))
        .count();
    assert_eq!(unregisters, 1, "second destroy must be a no-op");
    Ok(())
}

#[tokio::test]
async fn load_imports_an_image_and_syncs() -> Result<()> {
    tracing_subscriber_init();
    let fake = FakeVbox::new();
    let image = fake.path().join("appliance.ova");
    std::fs::write(&image, b"not a real ova")?;

    let machine = Machine::load(fake.vbox(), test_ssh_config(), &image).await?;
    assert_eq!(machine.name(), "imported-box");
    assert_eq!(machine.cpus(), Some(1));
    assert_eq!(machine.memory(), Some(1024));
    assert_eq!(machine.port(), None);
    Ok(())
}

#[tokio::test]
async fn load_with_missing_image_is_not_found() -> Result<()> {
    tracing_subscriber_init();
    let fake = FakeVbox::new();

    let result = Machine::load(
        fake.vbox(),
        test_ssh_config(),
        std::path::Path::new("/does/not/exist.ova"),
    )
    .await;
    assert!(matches!(result, Err(Error::NotFound { .. })));
    assert!(fake.calls().is_empty(), "nothing must reach the manager");
    Ok(())
}
