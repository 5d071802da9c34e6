//! One supervised server process and its worker thread.
//!
//! The worker owns the child process. Everything else talks to it through
//! three wake-up channels (command queued, graceful shutdown, terminate)
//! plus a shared command queue; the worker waits on all of them with a
//! short timeout so it also notices the child exiting on its own.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{self, Receiver, Sender};
use kiln_protocol::{InstanceConfiguration, InstanceStatus, InstanceSummary};
use parking_lot::Mutex;

use crate::console::{ConsoleFilter, strip_console_prefix};
use crate::events::Listeners;
use crate::log::{InstanceLog, LogEntry};
use crate::{BindingEndpoint, InstanceError, Package, ProcessLauncher, ReadyPredicate};

/// How long the worker blocks before re-checking the child.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Gap between failed attempts to delete a working directory.
const DELETE_RETRY: Duration = Duration::from_millis(500);
/// Removal attempts before a working directory is abandoned.
const DELETE_ATTEMPTS: u32 = 10;
/// How long to wait for trailing console output after the child exits.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Collaborators shared by every instance of one manager.
pub(crate) struct Context {
    pub(crate) instances_dir: PathBuf,
    pub(crate) launcher: Arc<dyn ProcessLauncher>,
    pub(crate) ready: Arc<dyn ReadyPredicate>,
    pub(crate) console: ConsoleFilter,
    pub(crate) listeners: Listeners,
    pub(crate) stop_grace: Duration,
}

struct Shared {
    status: Mutex<InstanceStatus>,
    last_error: Mutex<Option<String>>,
    log: Mutex<InstanceLog>,
    commands: Mutex<Vec<String>>,
}

#[derive(Clone)]
struct Signals {
    command: Sender<()>,
    shutdown: Sender<()>,
    terminate: Sender<()>,
}

struct Wakeups {
    command: Receiver<()>,
    shutdown: Receiver<()>,
    terminate: Receiver<()>,
}

/// What woke the supervision loop.
enum Wake {
    Commands,
    Shutdown,
    Terminate,
    Line(String),
    OutputClosed,
    Idle,
}

/// A supervised server process.
pub struct Instance {
    id: String,
    package: Package,
    binding: BindingEndpoint,
    configuration: InstanceConfiguration,
    shared: Arc<Shared>,
    signals: Signals,
    wakeups: Mutex<Option<Wakeups>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ctx: Arc<Context>,
}

impl Instance {
    pub(crate) fn new(
        id: String,
        package: Package,
        binding: BindingEndpoint,
        configuration: InstanceConfiguration,
        ctx: Arc<Context>,
    ) -> Self {
        // Capacity one: setting an already-set signal is a no-op.
        let (command_tx, command_rx) = channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = channel::bounded(1);
        let (terminate_tx, terminate_rx) = channel::bounded(1);
        Self {
            id,
            package,
            binding,
            configuration,
            shared: Arc::new(Shared {
                status: Mutex::new(InstanceStatus::Idle),
                last_error: Mutex::new(None),
                log: Mutex::new(InstanceLog::default()),
                commands: Mutex::new(Vec::new()),
            }),
            signals: Signals {
                command: command_tx,
                shutdown: shutdown_tx,
                terminate: terminate_tx,
            },
            wakeups: Mutex::new(Some(Wakeups {
                command: command_rx,
                shutdown: shutdown_rx,
                terminate: terminate_rx,
            })),
            worker: Mutex::new(None),
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn binding(&self) -> &BindingEndpoint {
        &self.binding
    }

    pub fn configuration(&self) -> &InstanceConfiguration {
        &self.configuration
    }

    pub fn status(&self) -> InstanceStatus {
        *self.shared.status.lock()
    }

    /// What went wrong, once the instance is in `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            status: self.status(),
            package_name: self.package.name.clone(),
            configuration: self.configuration.clone(),
        }
    }

    /// Up to `max` most recent console lines, oldest first.
    pub fn last_log(&self, max: usize) -> Vec<LogEntry> {
        self.shared.log.lock().last(max)
    }

    /// Records a line in the console history without it coming from the
    /// process (for example an operator's echoed command).
    pub fn append_log(&self, text: impl Into<String>) {
        self.shared.log.lock().push(SystemTime::now(), text);
    }

    /// Validates the configuration and starts the worker thread.
    ///
    /// The instance is `Starting` when this returns `Ok`.
    pub fn start(&self) -> Result<(), InstanceError> {
        self.configuration.validate()?;

        let Some(wakeups) = self.wakeups.lock().take() else {
            return Err(self.invalid_state("start"));
        };
        if !set_status(&self.shared, &self.ctx, &self.id, InstanceStatus::Starting) {
            return Err(self.invalid_state("start"));
        }

        let worker = Worker {
            id: self.id.clone(),
            package: self.package.clone(),
            binding: self.binding.clone(),
            configuration: self.configuration.clone(),
            shared: Arc::clone(&self.shared),
            ctx: Arc::clone(&self.ctx),
            wakeups,
            _signals: self.signals.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("instance-{}", self.id))
            .spawn(move || worker.run())
            .map_err(InstanceError::Spawn)?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Queues one console command. Refused unless `Starting` or `Running`.
    pub fn post_command(&self, command: impl Into<String>) -> bool {
        if !self.status().accepts_commands() {
            return false;
        }
        self.shared.commands.lock().push(command.into());
        let _ = self.signals.command.try_send(());
        true
    }

    /// Requests a graceful stop. Refused unless `Starting` or `Running`.
    pub fn post_shutdown(&self) -> bool {
        if !self.status().accepts_commands() {
            return false;
        }
        let _ = self.signals.shutdown.try_send(());
        true
    }

    /// Kills the process. Also accepted while `Stopping`, since the
    /// process may be ignoring the stop command.
    pub fn terminate(&self) -> bool {
        let status = self.status();
        if !status.accepts_commands() && status != InstanceStatus::Stopping {
            return false;
        }
        let _ = self.signals.terminate.try_send(());
        true
    }

    /// Stops the worker and waits for it. Escalates to a kill if the
    /// process has not exited after `grace`.
    pub(crate) fn dispose(&self, grace: Duration) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let _ = self.signals.shutdown.try_send(());
        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if !handle.is_finished() {
            tracing::warn!(instance_id = %self.id, "instance did not stop in time, killing");
            let _ = self.signals.terminate.try_send(());
        }
        if handle.join().is_err() {
            tracing::error!(instance_id = %self.id, "instance worker panicked");
        }
    }

    fn invalid_state(&self, action: &'static str) -> InstanceError {
        InstanceError::InvalidState {
            id: self.id.clone(),
            status: self.status(),
            action,
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("package", &self.package.name)
            .field("binding", &self.binding)
            .field("status", &self.status())
            .finish()
    }
}

/// Applies a legal transition and notifies listeners. Returns `false` if
/// the transition is not allowed from the current status.
fn set_status(shared: &Shared, ctx: &Context, id: &str, target: InstanceStatus) -> bool {
    {
        let mut status = shared.status.lock();
        if *status == target {
            return true;
        }
        if !status.can_transition_to(target) {
            tracing::debug!(instance_id = %id, from = %*status, to = %target, "ignoring status change");
            return false;
        }
        *status = target;
    }
    tracing::info!(instance_id = %id, status = %target, "instance status changed");
    ctx.listeners.status(id, target);
    true
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    id: String,
    package: Package,
    binding: BindingEndpoint,
    configuration: InstanceConfiguration,
    shared: Arc<Shared>,
    ctx: Arc<Context>,
    wakeups: Wakeups,
    // Held so the wake-up channels never disconnect under the worker.
    _signals: Signals,
}

impl Worker {
    fn run(self) {
        let dir = self.ctx.instances_dir.join(&self.id);

        if !self.package.archive.is_file() {
            let err = InstanceError::PackageMissing(self.package.archive.clone());
            self.fail(&err);
            return;
        }

        let result = self.prepare(&dir).and_then(|()| self.supervise(&dir));
        match result {
            Ok(()) => {
                tracing::info!(instance_id = %self.id, "instance stopped");
                self.set_status(InstanceStatus::Stopped);
            }
            Err(e) => self.fail(&e),
        }

        self.shared.log.lock().clear();
        remove_dir_with_retry(&self.id, &dir);
    }

    fn fail(&self, err: &InstanceError) {
        tracing::error!(
            instance_id = %self.id,
            package = %self.package.name,
            error = %err,
            "instance failed"
        );
        *self.shared.last_error.lock() = Some(err.to_string());
        self.set_status(InstanceStatus::Error);
    }

    fn set_status(&self, target: InstanceStatus) -> bool {
        set_status(&self.shared, &self.ctx, &self.id, target)
    }

    /// Materializes the working directory: archive contents, EULA marker
    /// and merged server properties.
    fn prepare(&self, dir: &Path) -> Result<(), InstanceError> {
        fs::create_dir_all(dir)?;
        self.package.extract_to(dir)?;
        fs::write(dir.join("eula.txt"), "eula=true\r\n")?;

        let mut properties =
            crate::ServerProperties::load(dir.join(crate::properties::PROPERTIES_FILE))?;
        properties.apply(&self.configuration, &self.binding);
        properties.save()?;
        Ok(())
    }

    fn supervise(&self, dir: &Path) -> Result<(), InstanceError> {
        let mut child = self
            .ctx
            .launcher
            .launch(&self.configuration, dir)
            .map_err(InstanceError::Spawn)?;
        tracing::info!(
            instance_id = %self.id,
            pid = child.id(),
            binding = %self.binding,
            "instance process started"
        );

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_and_reap(&mut child);
            return Err(InstanceError::Spawn(io::Error::other(
                "launcher did not pipe stdin and stdout",
            )));
        };

        let (line_tx, line_rx) = channel::unbounded();
        let reader = match thread::Builder::new()
            .name(format!("instance-{}-stdout", self.id))
            .spawn(move || read_lines(stdout, line_tx))
        {
            Ok(reader) => reader,
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(InstanceError::Spawn(e));
            }
        };

        let result = self.pump(&mut child, stdin, line_rx);
        if result.is_err() {
            kill_and_reap(&mut child);
        }
        let _ = reader.join();
        result
    }

    /// The supervision loop. Returns once the child has exited.
    fn pump(
        &self,
        child: &mut Child,
        mut stdin: ChildStdin,
        mut output: Receiver<String>,
    ) -> Result<(), InstanceError> {
        let mut stop_at: Option<Instant> = None;
        let mut stop_sent = false;

        loop {
            if let Some(exit) = child.try_wait()? {
                tracing::debug!(instance_id = %self.id, %exit, "instance process exited");
                while let Ok(line) = output.recv_timeout(OUTPUT_DRAIN) {
                    self.on_line(&line);
                }
                return Ok(());
            }

            if !stop_sent && stop_at.is_some_and(|at| Instant::now() >= at) {
                stop_sent = true;
                tracing::warn!(instance_id = %self.id, "sending stop command");
                writeln!(stdin, "stop")?;
                stdin.flush()?;
                self.set_status(InstanceStatus::Stopping);
            }

            let wake = crossbeam::select! {
                recv(self.wakeups.command) -> _ => Wake::Commands,
                recv(self.wakeups.shutdown) -> _ => Wake::Shutdown,
                recv(self.wakeups.terminate) -> _ => Wake::Terminate,
                recv(output) -> line => line.map_or(Wake::OutputClosed, Wake::Line),
                default(POLL_INTERVAL) => Wake::Idle,
            };

            match wake {
                Wake::Commands => {
                    let commands = std::mem::take(&mut *self.shared.commands.lock());
                    for command in commands {
                        tracing::debug!(instance_id = %self.id, %command, "writing command");
                        writeln!(stdin, "{command}")?;
                    }
                    stdin.flush()?;
                }
                Wake::Shutdown => {
                    if stop_at.is_none() {
                        stop_at = Some(Instant::now() + self.ctx.stop_grace);
                    }
                }
                Wake::Terminate => {
                    tracing::warn!(instance_id = %self.id, "instance forcefully killed");
                    if let Err(e) = child.kill() {
                        if e.kind() != io::ErrorKind::InvalidInput {
                            return Err(e.into());
                        }
                    }
                }
                Wake::Line(line) => self.on_line(&line),
                Wake::OutputClosed => output = channel::never(),
                Wake::Idle => {}
            }
        }
    }

    fn on_line(&self, raw: &str) {
        let text = strip_console_prefix(raw);
        let now = SystemTime::now();
        self.shared.log.lock().push(now, text);

        if !self.ctx.console.is_ignored(text) {
            tracing::info!(target: "kiln::instance::console", instance_id = %self.id, "{text}");
        }
        self.ctx.listeners.log(&self.id, now, text);

        if *self.shared.status.lock() == InstanceStatus::Starting && self.ctx.ready.is_ready(text) {
            self.set_status(InstanceStatus::Running);
        }
    }
}

/// Forwards stdout line by line. Invalid UTF-8 is replaced, not fatal.
fn read_lines(stdout: ChildStdout, lines: Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if lines.send(line.to_string()).is_err() {
                    return;
                }
            }
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Deletes the working directory, retrying while the platform still
/// holds handles into it. Gives up after [`DELETE_ATTEMPTS`] so the
/// worker always finishes.
fn remove_dir_with_retry(id: &str, dir: &Path) {
    retry_remove(id, dir, DELETE_ATTEMPTS, DELETE_RETRY, |dir| fs::remove_dir_all(dir));
}

fn retry_remove(
    id: &str,
    dir: &Path,
    attempts: u32,
    delay: Duration,
    mut remove: impl FnMut(&Path) -> io::Result<()>,
) -> bool {
    for attempt in 1..=attempts {
        match remove(dir) {
            Ok(()) => return true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) if attempt == attempts => {
                tracing::error!(instance_id = %id, path = %dir.display(), error = %e, attempts, "giving up on instance directory");
            }
            Err(e) => {
                if attempt == 1 {
                    tracing::warn!(instance_id = %id, path = %dir.display(), error = %e, "could not remove instance directory, retrying");
                }
                thread::sleep(delay);
            }
        }
    }
    false
}
