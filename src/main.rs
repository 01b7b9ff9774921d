use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil::port::find_free_port;
use vigil::probe::{wait_until_ready, HttpProbe};
use vigil::provision::FileSystemProvisioner;
use vigil::{Supervisor, VigilConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        env = "VIGIL_CONFIG",
        value_name = "FILE",
        default_value = "/etc/vigil/config.yml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start servers, print their urls and supervise them until Ctrl-C
    Run {
        /// Servers to start, all configured servers if empty
        names: Vec<String>,
    },
    /// Print a free loopback port
    FreePort,
    /// Wait until a port answers its readiness endpoint
    Probe {
        #[arg(short, long)]
        port: u16,
        #[arg(long, default_value = "/healthz")]
        path: String,
        #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
        interval: Duration,
        #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
        timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    match args.command {
        Commands::Run { names } => {
            let config = VigilConfig::load(&args.config)?;
            init_tracing(&config.log);
            run(config, names).await
        }
        Commands::FreePort => {
            init_tracing("warn");
            let port = find_free_port().await.wrap_err("Failed to allocate port")?;
            println!("{port}");
            Ok(())
        }
        Commands::Probe {
            port,
            path,
            interval,
            timeout,
        } => {
            init_tracing("info");
            let probe = HttpProbe::try_new(path, Duration::from_secs(1))
                .wrap_err("Failed to build probe client")?;
            wait_until_ready(&probe, port, interval, timeout).await?;
            info!(port, "Ready");
            Ok(())
        }
    }
}

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_env("VIGIL_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: VigilConfig, names: Vec<String>) -> Result<()> {
    let selected: Vec<_> = if names.is_empty() {
        config.servers.into_iter().collect()
    } else {
        let mut servers = config.servers;
        names
            .into_iter()
            .map(|name| {
                servers
                    .remove(&name)
                    .map(|server| (name.clone(), server))
                    .ok_or_else(|| eyre!("Undefined server: {}", name))
            })
            .collect::<Result<Vec<_>>>()?
    };
    if selected.is_empty() {
        bail!("No servers configured");
    }

    let supervisors: Vec<Supervisor> = selected
        .into_iter()
        .map(|(name, server)| {
            let provisioner = Arc::new(FileSystemProvisioner::new(server.path_prepend.clone()));
            let supervisor = Supervisor::builder(name, server)
                .provisioner(provisioner)
                .build();
            let name = supervisor.name().to_string();
            supervisor.on_pid_changed(move |pid| match pid {
                Some(pid) => info!(server = %name, pid, "Pid changed"),
                None => info!(server = %name, "Server gone"),
            });
            supervisor
        })
        .collect();

    let results = join_all(supervisors.iter().map(|s| s.ensure_running())).await;
    let mut failed = false;
    for (supervisor, result) in supervisors.iter().zip(results) {
        match result {
            Ok(_) => {
                if let Some(url) = supervisor.url() {
                    println!("{}: {}", supervisor.name(), url);
                }
            }
            Err(err) => {
                failed = true;
                error!(err = ?color_eyre::Report::new(err), "Server failed to start");
            }
        }
    }

    if !failed {
        info!("Supervising, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl-C")?;
    }

    for result in join_all(supervisors.iter().map(|s| s.stop())).await {
        if let Some(result) = result.filter(|r| !r.success) {
            warn!(?result, "Server could not be confirmed stopped");
        }
    }

    if failed {
        bail!("Some servers failed to start");
    }
    Ok(())
}
