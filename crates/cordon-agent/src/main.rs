use cordon_agent::Supervisor;
use cordon_types::AgentConfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            // tracing isn't initialized yet, so a config error goes to stderr directly.
            eprintln!("invalid configuration: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    init_tracing(config.json_logging);

    info!(node = %config.node_name, "starting agent");

    let supervisor = match Supervisor::bootstrap(config).await {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!(error = %err, "failed to start agent");
            return std::process::ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_termination(shutdown_tx));

    if let Err(err) = supervisor.run(shutdown_rx).await {
        error!(error = %err, "agent exited with an error");
        return std::process::ExitCode::FAILURE;
    }

    info!("agent shut down cleanly");
    std::process::ExitCode::SUCCESS
}

async fn wait_for_termination(shutdown_tx: watch::Sender<bool>) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    let _ = shutdown_tx.send(true);
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
