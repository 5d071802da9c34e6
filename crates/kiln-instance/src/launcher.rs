//! Starting the server process for an instance.

use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use kiln_protocol::InstanceConfiguration;

/// Spawns the child process for an instance. The returned child must have
/// piped stdin and stdout.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, configuration: &InstanceConfiguration, working_dir: &Path) -> io::Result<Child>;
}

/// Runs `java -Xmx..M -Xms..M -jar <jar> nogui` directly, without a shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct JavaLauncher;

impl JavaLauncher {
    pub fn command(configuration: &InstanceConfiguration, working_dir: &Path) -> Command {
        let mut command = Command::new(&configuration.java_executable);
        command
            .arg(format!("-Xmx{}M", configuration.java_maximum_memory_mb))
            .arg(format!("-Xms{}M", configuration.java_initial_memory_mb))
            .arg("-jar")
            .arg(&configuration.jar_filename)
            .arg("nogui")
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        command
    }
}

impl ProcessLauncher for JavaLauncher {
    fn launch(&self, configuration: &InstanceConfiguration, working_dir: &Path) -> io::Result<Child> {
        Self::command(configuration, working_dir).spawn()
    }
}

impl<T: ProcessLauncher + ?Sized> ProcessLauncher for Box<T> {
    fn launch(&self, configuration: &InstanceConfiguration, working_dir: &Path) -> io::Result<Child> {
        (**self).launch(configuration, working_dir)
    }
}
