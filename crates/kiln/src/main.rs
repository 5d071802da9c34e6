//! `kiln` host service binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kiln::KilnError;
use kiln::config::{ConfigError, Settings};
use kiln::server::KilnServer;
use kiln_transport::TransportError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "kiln", version, about = "Game-server instance host")]
struct Args {
    /// Settings file.
    #[arg(short, long, default_value = "kiln.toml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match Settings::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            setup_logging("info");
            tracing::error!(path = %args.config.display(), error = %e, "could not load settings");
            return exit_code(&KilnError::Config(e));
        }
    };
    setup_logging(&settings.logging.level);

    let mut server = match KilnServer::builder(settings).build() {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "could not start host service");
            return exit_code(&e);
        }
    };

    let stop = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.shutdown()) {
        tracing::warn!(error = %e, "could not install signal handler");
    }

    server.run();
    ExitCode::SUCCESS
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_thread_names(true))
        .init();
}

/// Distinct codes per startup failure.
fn exit_code(error: &KilnError) -> ExitCode {
    let code = match error {
        KilnError::Config(ConfigError::RootNotSet | ConfigError::RootMissing(_)) => 2,
        KilnError::Config(ConfigError::InvalidBinding { .. } | ConfigError::InstanceBindings(_)) => 3,
        KilnError::Transport(TransportError::Bind { .. }) => 4,
        _ => 1,
    };
    ExitCode::from(code)
}
