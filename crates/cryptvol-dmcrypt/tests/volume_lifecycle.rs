mod common;

use common::FakeHost;
use cryptvol_core::identity::IdentityStore;
use cryptvol_core::mounts::MountTable;
use cryptvol_core::{derive_volume_key, CryptvolConfig, RetryPolicy, Volume, VolumeOptions};
use cryptvol_dmcrypt::{CryptsetupContext, CryptsetupEngine, HostError, SystemHostTools};
use cryptvol_provider::HostTools;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;

struct Setup {
    host: FakeHost,
    engine: CryptsetupEngine,
    tools: SystemHostTools,
    device: PathBuf,
    mount_point: PathBuf,
    options: VolumeOptions,
}

fn setup(root: &std::path::Path) -> Setup {
    let host = FakeHost::new(root).unwrap();
    let timeout = Duration::from_secs(5);
    let engine = CryptsetupEngine::new(host.cryptsetup().unwrap(), timeout, &host.mapper);
    let tools = SystemHostTools::new(
        host.mkfs().unwrap(),
        host.mount().unwrap(),
        host.umount().unwrap(),
        timeout,
    );
    let device = root.join("disk.img");
    fs::write(&device, vec![0u8; 64 * 1024]).unwrap();
    let mount_point = root.join("mnt");
    fs::create_dir_all(&mount_point).unwrap();

    let options = VolumeOptions {
        mapper_dir: host.mapper.clone(),
        mount_table: MountTable::new(&host.table),
        unmount_retry: RetryPolicy::new(20, Duration::from_millis(1)),
        ..VolumeOptions::default()
    };

    Setup {
        host,
        engine,
        tools,
        device,
        mount_point,
        options,
    }
}

fn open_volume(s: &Setup) -> Volume<CryptsetupContext, SystemHostTools> {
    Volume::initialize(
        &s.engine,
        s.tools.clone(),
        &s.device,
        &s.mount_point,
        s.options.clone(),
    )
    .unwrap()
}

#[test]
fn full_cycle_through_system_adapters() {
    let dir = tempdir().unwrap();
    let s = setup(dir.path());

    let mut volume = open_volume(&s);
    let name = volume.mapping_name().to_string();
    assert_eq!(
        IdentityStore::for_device(&s.device).load().unwrap(),
        Some(name.clone())
    );

    volume.set_passphrase(b"correct horse").unwrap();
    assert_eq!(
        s.host.stored_key(&name),
        Some(derive_volume_key(b"correct horse").as_bytes().to_vec())
    );

    assert!(!volume.is_formatted().unwrap());
    assert!(volume.format().unwrap());
    assert_eq!(
        fs::read_to_string(s.host.state.join("mkfs.stdin")).unwrap(),
        "y\n".repeat(8)
    );

    assert!(volume.mount().unwrap());
    assert!(volume.is_mounted());

    assert!(volume.unmount().unwrap());
    assert_eq!(volume.last_unmount_attempts(), 1);
    assert!(!volume.is_mounted());
    assert!(!s.host.mapper.join(&name).exists());

    volume.teardown();
    assert!(volume.is_released());

    let calls = s.host.calls();
    let mapped = s.host.mapper.join(&name);
    assert!(calls.contains(&format!("mkfs -t ext3 {}", mapped.display())));
    assert!(calls.contains(&format!(
        "mount -t ext3 {} {}",
        mapped.display(),
        s.mount_point.display()
    )));
    assert!(calls.contains(&format!("umount {}", s.mount_point.display())));
}

#[test]
fn reactivation_finds_existing_filesystem() {
    let dir = tempdir().unwrap();
    let s = setup(dir.path());

    let name = {
        let mut volume = open_volume(&s);
        volume.set_passphrase(b"pw").unwrap();
        assert!(volume.format().unwrap());
        volume.mapping_name().to_string()
    };
    assert!(!s.host.mapper.join(&name).exists());

    let mut volume = open_volume(&s);
    assert_eq!(volume.mapping_name(), name);
    volume.set_passphrase(b"pw").unwrap();
    assert!(volume.is_formatted().unwrap());
}

#[test]
fn busy_unmount_is_retried_until_clear() {
    let dir = tempdir().unwrap();
    let s = setup(dir.path());

    let mut volume = open_volume(&s);
    volume.set_passphrase(b"pw").unwrap();
    assert!(volume.format().unwrap());
    assert!(volume.mount().unwrap());

    fs::write(s.host.state.join("busy"), "3").unwrap();
    assert!(volume.unmount().unwrap());
    assert_eq!(volume.last_unmount_attempts(), 2);
    assert!(!volume.is_mounted());
}

#[test]
fn unmount_gives_up_after_retry_bound() {
    let dir = tempdir().unwrap();
    let mut s = setup(dir.path());
    s.options.unmount_retry = RetryPolicy::new(3, Duration::from_millis(1));

    let mut volume = open_volume(&s);
    volume.set_passphrase(b"pw").unwrap();
    assert!(volume.mount().unwrap());

    fs::write(s.host.state.join("busy"), "1000").unwrap();
    assert!(!volume.unmount().unwrap());
    assert_eq!(volume.last_unmount_attempts(), 3);
    assert!(volume.is_mounted());

    fs::write(s.host.state.join("busy"), "0").unwrap();
    assert!(volume.unmount().unwrap());
}

#[test]
fn host_tool_failures_carry_exit_status() {
    let dir = tempdir().unwrap();
    let s = setup(dir.path());

    let err = s.tools.unmount(&s.mount_point).unwrap_err();
    match err {
        HostError::Failed { tool, status, diagnostic } => {
            assert_eq!(tool, "umount");
            assert_eq!(status, 32);
            assert!(diagnostic.contains("not mounted"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// mkfs stand-in that takes about a second, like formatting a real disk.
fn install_slow_mkfs(s: &Setup) -> PathBuf {
    s.host
        .install(
            "mkfs-slow",
            "#!/bin/sh\ncat > /dev/null\nsleep 1\necho done > \"@STATE@/mkfs.done\"\n",
        )
        .unwrap()
}

fn slow_mkfs_tools(s: &Setup, tool_timeout: Duration) -> SystemHostTools {
    let mkfs = install_slow_mkfs(s);
    SystemHostTools::new(
        mkfs,
        s.host.mount().unwrap(),
        s.host.umount().unwrap(),
        tool_timeout,
    )
}

#[test]
fn mkfs_outlives_the_shared_tool_timeout() {
    let dir = tempdir().unwrap();
    let s = setup(dir.path());
    let tools = slow_mkfs_tools(&s, Duration::from_millis(200));

    tools.make_filesystem("ext3", &s.device).unwrap();
    assert!(s.host.state.join("mkfs.done").exists());
}

#[test]
fn explicit_mkfs_timeout_is_enforced() {
    let dir = tempdir().unwrap();
    let s = setup(dir.path());
    let tools = slow_mkfs_tools(&s, Duration::from_secs(5))
        .with_mkfs_timeout(Some(Duration::from_millis(200)));

    match tools.make_filesystem("ext3", &s.device).unwrap_err() {
        HostError::Spawn { tool, source } => {
            assert_eq!(tool, "mkfs");
            assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!s.host.state.join("mkfs.done").exists());
}

#[test]
fn host_tools_from_config_apply_mkfs_timeout() {
    let dir = tempdir().unwrap();
    let s = setup(dir.path());
    let mkfs = install_slow_mkfs(&s);

    let mut config = CryptvolConfig::default();
    config.crypto.timeout_secs = 1;
    config.tools.mkfs_path = Some(mkfs.to_string_lossy().into_owned());
    config.tools.mount_path = Some(s.host.bin.join("mount").to_string_lossy().into_owned());
    config.tools.umount_path = Some(s.host.bin.join("umount").to_string_lossy().into_owned());
    let tools = SystemHostTools::from_config(&config).unwrap();
    tools.make_filesystem("ext3", &s.device).unwrap();
    assert!(s.host.state.join("mkfs.done").exists());

    config.tools.mkfs_timeout_secs = Some(3600);
    assert!(SystemHostTools::from_config(&config).is_ok());
}
