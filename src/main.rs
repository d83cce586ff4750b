use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use logheal::config::AppConfig;
use logheal::{logging, RunOptions};

/// Watch a log store for errors and apply gated remediation plans.
#[derive(Debug, Parser)]
#[command(name = "logheal", version, about)]
struct Cli {
    /// YAML configuration file.
    #[arg(long, default_value = "config/logheal.yaml")]
    config: PathBuf,

    /// Dotenv file for `${VAR}` placeholders the process environment leaves unset.
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Run one detection cycle and exit.
    #[arg(long)]
    once: bool,

    /// Do not start the background cleanup task.
    #[arg(long)]
    no_cleanup: bool,

    /// Supervise a `kubectl port-forward` to the log store for the life of the process.
    #[arg(long)]
    port_forward: bool,
}

fn main() -> ExitCode {
    // Initialize Sentry before anything else so panics during startup are captured.
    // Returns a no-op guard when SENTRY_DSN is absent.
    let _sentry_guard = sentry::init(sentry_options());

    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config, Some(&cli.env_file)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("logheal: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = logging::init(&config.logging);
    if let Some(dir) = &config.logging.directory {
        logging::install_crash_hook(dir);
    }
    tracing::info!(path = %cli.config.display(), "Configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let opts = RunOptions {
        once: cli.once,
        cleanup: !cli.no_cleanup,
        port_forward: cli.port_forward,
    };
    let cancel = CancellationToken::new();

    let result = runtime.block_on(async {
        tokio::spawn(watch_signals(cancel.clone()));
        logheal::run(config, opts, cancel).await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(kind = e.kind(), "Initialization failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Cancel on SIGINT or SIGTERM.
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received, finishing current work");
    cancel.cancel();
}

fn sentry_options() -> sentry::ClientOptions {
    let dsn = std::env::var("SENTRY_DSN")
        .ok()
        .or_else(|| option_env!("SENTRY_DSN").map(str::to_string));
    sentry::ClientOptions {
        dsn: dsn.and_then(|s| s.parse().ok()),
        release: Some(env!("CARGO_PKG_VERSION").into()),
        traces_sample_rate: 0.0,
        send_default_pii: false,
        before_send: Some(std::sync::Arc::new(|mut event| {
            if let Some(ref mut user) = event.user {
                user.email = None;
                user.ip_address = None;
                user.username = None;
            }
            if let Some(ref mut request) = event.request {
                request.data = None;
            }
            Some(event)
        })),
        ..Default::default()
    }
}
