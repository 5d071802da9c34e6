//! Integration tests for the instance supervisor.
//!
//! Real child processes are `/bin/sh` scripts started through a test
//! launcher, and packages are zip archives written into a temp directory.

#![cfg(unix)]

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use kiln_instance::{
    BindingPool, Instance, InstanceEvents, InstanceManager, Package, ProcessLauncher,
    ServerProperties,
};
use kiln_protocol::{InstanceConfiguration, InstanceStatus};
use parking_lot::Mutex;

// =========================================================================
// Helpers
// =========================================================================

/// Prints a ready banner, echoes every line and exits on `stop`.
const COOPERATIVE: &str = r#"
echo "[12:00:00] [Server thread/INFO]: Starting minecraft server"
echo "[12:00:01] [Server thread/INFO]: Done (0.5s)! For help, type \"help\""
while read line; do
  echo "got $line"
  if [ "$line" = "stop" ]; then exit 0; fi
done
"#;

/// Becomes ready but never honours `stop`.
const STUBBORN: &str = r#"
echo "Done (0.1s)!"
while read line; do echo "ignoring $line"; done
"#;

struct ShellLauncher(&'static str);

impl ProcessLauncher for ShellLauncher {
    fn launch(&self, _configuration: &InstanceConfiguration, dir: &Path) -> io::Result<Child> {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(self.0)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
    }
}

struct FailingLauncher;

impl ProcessLauncher for FailingLauncher {
    fn launch(&self, _configuration: &InstanceConfiguration, _dir: &Path) -> io::Result<Child> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no java here"))
    }
}

#[derive(Default)]
struct Recorder {
    statuses: Mutex<Vec<InstanceStatus>>,
    lines: Mutex<Vec<String>>,
}

impl InstanceEvents for Recorder {
    fn on_status(&self, _instance_id: &str, status: InstanceStatus) {
        self.statuses.lock().push(status);
    }

    fn on_log(&self, _instance_id: &str, _time: SystemTime, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}

fn write_package(dir: &Path) -> PathBuf {
    let path = dir.join("test.zip");
    let mut zip = zip::ZipWriter::new(File::create(&path).expect("should create archive"));
    let options = zip::write::SimpleFileOptions::default();
    zip.start_file("server.properties", options).expect("should add file");
    zip.write_all(b"motd=From package\nlevel-name=world\n")
        .expect("should write");
    zip.start_file("server.jar", options).expect("should add file");
    zip.write_all(b"not really a jar").expect("should write");
    zip.finish().expect("should finish archive");
    path
}

// Field order matters: the manager shuts its instances down before the
// temp directory is removed.
struct Fixture {
    manager: InstanceManager,
    recorder: Arc<Recorder>,
    package: Package,
    root: tempfile::TempDir,
}

fn fixture(launcher: impl ProcessLauncher + 'static) -> Fixture {
    let root = tempfile::tempdir().expect("should create temp dir");
    let archive = write_package(root.path());
    let manager = InstanceManager::builder(root.path())
        .max_concurrent(2)
        .bindings(BindingPool::from_entries(["0.0.0.0:25565", "127.0.0.1:25566"]).unwrap())
        .launcher(launcher)
        .stop_grace(Duration::from_millis(50))
        .shutdown_timeout(Duration::from_secs(2))
        .build();
    let recorder = Arc::new(Recorder::default());
    manager.add_listener(recorder.clone());
    Fixture {
        manager,
        recorder,
        package: Package::new("Test", archive),
        root,
    }
}

fn wait_for_status(instance: &Instance, status: InstanceStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while instance.status() != status {
        assert!(
            Instant::now() < deadline,
            "instance stuck in {} waiting for {status}",
            instance.status()
        );
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

// =========================================================================
// Lifecycle
// =========================================================================

#[test]
fn test_full_lifecycle() {
    let fx = fixture(ShellLauncher(COOPERATIVE));
    let instance = fx
        .manager
        .create_and_start(fx.package.clone(), InstanceConfiguration::default())
        .expect("should start");
    assert_eq!(instance.status(), InstanceStatus::Starting);

    wait_for_status(&instance, InstanceStatus::Running);

    // Working directory prepared before the process started.
    let dir = fx.root.path().join("instances").join(instance.id());
    assert_eq!(
        fs::read_to_string(dir.join("eula.txt")).unwrap(),
        "eula=true\r\n"
    );
    let props = ServerProperties::load(dir.join("server.properties")).unwrap();
    assert_eq!(props.get("motd"), Some("Minecraft"));
    assert_eq!(props.get("level-name"), Some("world"));
    assert_eq!(props.get("server-ip"), Some(""));
    assert_eq!(props.get("server-port"), Some("25565"));
    assert!(dir.join("server.jar").is_file());

    // Prefixes are stripped before lines are stored.
    let log: Vec<_> = instance.last_log(10).into_iter().map(|e| e.text).collect();
    assert_eq!(log[0], "Starting minecraft server");

    assert!(fx.manager.post_command(instance.id(), "say hi"));
    wait_until("command echo", || {
        fx.recorder.lines.lock().iter().any(|l| l == "got say hi")
    });

    assert!(fx.manager.post_shutdown(instance.id()));
    wait_for_status(&instance, InstanceStatus::Stopped);
    assert_eq!(
        *fx.recorder.statuses.lock(),
        [
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::Stopping,
            InstanceStatus::Stopped,
        ]
    );

    // Terminal instances refuse everything.
    assert!(!instance.post_command("say late"));
    assert!(!instance.post_shutdown());
    assert!(!instance.terminate());

    wait_until("directory removal", || !dir.exists());
    assert_eq!(fx.manager.remove_dead_instances(), 1);
    assert!(fx.manager.is_empty());
    assert_eq!(fx.manager.bindings().available(), 2);
}

#[test]
fn test_terminate_while_stopping() {
    let fx = fixture(ShellLauncher(STUBBORN));
    let instance = fx
        .manager
        .create_and_start(fx.package.clone(), InstanceConfiguration::default())
        .expect("should start");
    wait_for_status(&instance, InstanceStatus::Running);

    assert!(instance.post_shutdown());
    wait_for_status(&instance, InstanceStatus::Stopping);

    assert!(!instance.post_command("say hi"));
    assert!(!instance.post_shutdown());
    assert!(instance.terminate(), "terminate must still reach a stubborn process");
    wait_for_status(&instance, InstanceStatus::Stopped);
}

#[test]
fn test_terminate_while_running() {
    let fx = fixture(ShellLauncher(STUBBORN));
    let instance = fx
        .manager
        .create_and_start(fx.package.clone(), InstanceConfiguration::default())
        .expect("should start");
    wait_for_status(&instance, InstanceStatus::Running);

    assert!(fx.manager.terminate(instance.id()));
    wait_for_status(&instance, InstanceStatus::Stopped);
}

#[test]
fn test_missing_archive_is_error() {
    let fx = fixture(ShellLauncher(COOPERATIVE));
    let package = Package::new("Gone", fx.root.path().join("gone.zip"));
    let instance = fx
        .manager
        .create_and_start(package, InstanceConfiguration::default())
        .expect("validation passes, failure is asynchronous");

    wait_for_status(&instance, InstanceStatus::Error);
    assert!(instance.last_error().unwrap().contains("gone.zip"));
    assert!(!instance.post_command("say hi"));

    assert_eq!(fx.manager.remove_dead_instances(), 1);
    assert_eq!(fx.manager.bindings().available(), 2);
}

#[test]
fn test_spawn_failure_is_error_and_cleans_up() {
    let fx = fixture(FailingLauncher);
    let instance = fx
        .manager
        .create_and_start(fx.package.clone(), InstanceConfiguration::default())
        .expect("should start worker");

    wait_for_status(&instance, InstanceStatus::Error);
    assert!(instance.last_error().unwrap().contains("no java here"));
    let dir = fx.root.path().join("instances").join(instance.id());
    wait_until("directory removal", || !dir.exists());
}

#[test]
fn test_custom_ready_predicate() {
    let root = tempfile::tempdir().unwrap();
    let archive = write_package(root.path());
    let manager = InstanceManager::builder(root.path())
        .max_concurrent(1)
        .bindings(BindingPool::from_entries(["127.0.0.1:30000"]).unwrap())
        .launcher(ShellLauncher(
            "echo 'Done (0.1s)!'; echo 'READY'; while read line; do :; done",
        ))
        .ready_predicate(|line: &str| line == "READY")
        .stop_grace(Duration::from_millis(50))
        .shutdown_timeout(Duration::from_millis(500))
        .build();

    let instance = manager
        .create_and_start(Package::new("Test", archive), InstanceConfiguration::default())
        .unwrap();
    wait_for_status(&instance, InstanceStatus::Running);
    let log: Vec<_> = instance.last_log(5).into_iter().map(|e| e.text).collect();
    assert!(log.contains(&"READY".to_string()));
    manager.shutdown();
    assert_eq!(manager.bindings().available(), 1);
}

#[test]
fn test_second_start_rejected() {
    let fx = fixture(ShellLauncher(COOPERATIVE));
    let instance = fx
        .manager
        .create(fx.package.clone(), InstanceConfiguration::default())
        .unwrap();
    instance.start().expect("first start");
    assert!(instance.start().is_err());
}

#[test]
fn test_undeletable_directory_does_not_stall_reaper() {
    use std::os::unix::fs::PermissionsExt;

    let fx = fixture(ShellLauncher(COOPERATIVE));
    let instance = fx
        .manager
        .create_and_start(fx.package.clone(), InstanceConfiguration::default())
        .expect("should start");
    wait_for_status(&instance, InstanceStatus::Running);

    // A read-only parent keeps the working directory from being unlinked.
    let instances = fx.root.path().join("instances");
    let set_mode = |mode| {
        fs::set_permissions(&instances, fs::Permissions::from_mode(mode))
            .expect("should set permissions");
    };
    set_mode(0o555);
    let privileged = File::create(instances.join("write-check")).is_ok();
    if privileged {
        // Permission bits do not bind this user.
        set_mode(0o755);
        return;
    }

    assert!(fx.manager.post_shutdown(instance.id()));
    wait_for_status(&instance, InstanceStatus::Stopped);

    let started = Instant::now();
    assert_eq!(fx.manager.remove_dead_instances(), 1);
    assert!(
        started.elapsed() < Duration::from_secs(15),
        "reaper took {:?}",
        started.elapsed()
    );
    assert_eq!(fx.manager.bindings().available(), 2);
    assert!(instances.join(instance.id()).exists());

    set_mode(0o755);
}
