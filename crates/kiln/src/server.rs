//! `KilnServer` builder and server loop.
//!
//! Ties the layers together: the instance manager, the binary listener
//! for the control panel and the optional browser listener. Everything
//! socket-related runs on the thread that calls [`KilnServer::run`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use kiln_instance::{InstanceManager, PackageCatalog, ProcessLauncher};
use kiln_transport::{Server, WebSocketConfig, WebSocketLayer};

use crate::KilnError;
use crate::auth::{Authorizer, StaticAuthorizer};
use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::events::EventFanout;
use crate::jobs::JobQueue;
use crate::service::HostService;
use crate::web::WebService;

/// How often finished instances are swept.
pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for a [`KilnServer`].
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
///
/// use kiln::config::Settings;
/// use kiln::KilnServer;
///
/// let settings = Settings::load(Path::new("kiln.toml"))?;
/// let mut server = KilnServer::builder(settings).build()?;
/// server.run();
/// # Ok::<(), kiln::KilnError>(())
/// ```
pub struct KilnServerBuilder {
    settings: Settings,
    catalog: Option<Arc<dyn PackageCatalog>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    launcher: Option<Box<dyn ProcessLauncher>>,
}

impl KilnServerBuilder {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            catalog: None,
            authorizer: None,
            launcher: None,
        }
    }

    /// Replaces the package list from the settings file.
    pub fn catalog(mut self, catalog: Arc<dyn PackageCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replaces the user list from the settings file.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Replaces the default `java -jar` launcher.
    pub fn launcher(mut self, launcher: impl ProcessLauncher + 'static) -> Self {
        self.launcher = Some(Box::new(launcher));
        self
    }

    /// Resolves the instance root and binds both listeners.
    pub fn build(self) -> Result<KilnServer, KilnError> {
        let settings = self.settings;
        settings.validate()?;
        let root = settings.resolve_root()?;

        let mut manager = InstanceManager::builder(root.clone())
            .max_concurrent(settings.service.max_concurrent_instances)
            .bindings(settings.binding_pool()?)
            .console_filter(settings.console_filter()?);
        if let Some(launcher) = self.launcher {
            manager = manager.launcher(launcher);
        }
        let manager = Arc::new(manager.build());

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(settings.catalog(&root)),
        };
        let authorizer = match self.authorizer {
            Some(authorizer) => authorizer,
            None => Arc::new(StaticAuthorizer::new(settings.users.iter().cloned())),
        };

        let service = HostService::new(Arc::clone(&manager), Arc::clone(&catalog));
        let binary = Server::bind(settings.service_addr()?, service.into_dispatcher())?
            .with_idle_timeout(Duration::from_secs(settings.service.idle_timeout_secs));

        let web = match (&settings.websocket, settings.websocket_addr()?) {
            (Some(ws), Some(addr)) => {
                let app = WebService::new(
                    Arc::clone(&manager),
                    catalog,
                    authorizer,
                    ws.public_hostname.clone(),
                    settings.default_configuration(),
                );
                let config = WebSocketConfig {
                    trust_forwarded_for: ws.trust_forwarded_for,
                    ..WebSocketConfig::default()
                };
                let mut server = Server::bind(addr, WebSocketLayer::with_config(app, config))?;
                let peers = server.handle();
                server.handler_mut().app_mut().set_peers(peers);
                Some(server)
            }
            _ => None,
        };

        let (events, sink) = EventFanout::new(binary.handle(), web.as_ref().map(Server::handle));
        manager.add_listener(Arc::new(sink));

        tracing::info!(
            root = %root.display(),
            max_instances = settings.service.max_concurrent_instances,
            "host service ready"
        );

        Ok(KilnServer {
            manager,
            binary,
            web,
            events,
            jobs: JobQueue::new(),
            reaping: Arc::new(AtomicBool::new(false)),
            last_reap: Instant::now(),
            poll_interval: Duration::from_millis(settings.service.poll_interval_ms),
            running: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// Stops a running [`KilnServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// The host service.
pub struct KilnServer {
    manager: Arc<InstanceManager>,
    binary: Server<Dispatcher<HostService>>,
    web: Option<Server<WebSocketLayer<WebService>>>,
    events: EventFanout,
    jobs: JobQueue,
    reaping: Arc<AtomicBool>,
    last_reap: Instant,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl KilnServer {
    pub fn builder(settings: Settings) -> KilnServerBuilder {
        KilnServerBuilder::new(settings)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.binary.local_addr()
    }

    pub fn websocket_addr(&self) -> Option<SocketAddr> {
        self.web.as_ref().map(Server::local_addr)
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// One pass: both listeners, queued events, and the reaper when due.
    pub fn process(&mut self) {
        self.binary.process();
        if let Some(web) = &mut self.web {
            web.process();
        }
        self.events.flush();

        if self.last_reap.elapsed() >= REAP_INTERVAL {
            self.last_reap = Instant::now();
            self.schedule_reap();
        }
    }

    fn schedule_reap(&self) {
        if self.reaping.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let reaping = Arc::clone(&self.reaping);
        let queued = self.jobs.run(move || {
            let removed = manager.remove_dead_instances();
            if removed > 0 {
                tracing::debug!(removed, "reaped finished instances");
            }
            reaping.store(false, Ordering::Release);
        });
        if !queued {
            self.reaping.store(false, Ordering::Release);
        }
    }

    /// Processes until [`ShutdownHandle::shutdown`] is called, then stops.
    pub fn run(&mut self) {
        tracing::info!(addr = %self.local_addr(), "kiln running");
        while self.running.load(Ordering::Acquire) {
            self.process();
            thread::sleep(self.poll_interval);
        }
        self.shutdown();
    }

    /// Stops every instance, flushes their final events and closes both
    /// listeners.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        tracing::info!("shutting down");
        self.manager.shutdown();
        self.events.flush();
        self.jobs.shutdown();
        self.binary.shutdown();
        if let Some(web) = &mut self.web {
            web.shutdown();
        }
    }
}
