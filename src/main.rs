#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kfwd
//!
//! Forward local TCP ports into Kubernetes pod containers.
//!
//! ## Subcommands
//!
//! - `kfwd ports <ns/pod> -c <container>`: list forwardable ports and the
//!   suggested dialog fields derived from the pod's annotation
//! - `kfwd forward <ns/pod> -c <container>`: run the forward until
//!   interrupted or the pod goes away
//!
//! The dialog fields accept the same text as the console: `--remote` takes
//! `name::port`, `port` or a comma list of ports, `--local` takes a port or a
//! matching comma list, `--address` the local bind address.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use kfwd::config::Config;
use kfwd::forward::dialer::KubeDialer;
use kfwd::forward::{ForwardEvent, ForwardHooks, ForwarderKey, Forwarders};
use kfwd::port::{self, ContainerPortSpecs, PreferredPorts};
use kfwd::workload::{list_forwardable, KubeWorkloads};
use kfwd::ForwardError;

/// Forward local ports into pod containers.
#[derive(Parser)]
#[command(name = "kfwd", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show forwardable ports of a container.
    Ports {
        /// Pod path, `namespace/name` or a bare name.
        path: String,
        #[arg(short, long)]
        container: String,
        /// Print the port list as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Forward ports until interrupted.
    Forward {
        path: String,
        #[arg(short, long)]
        container: String,
        /// Container port(s); defaults to the suggested value.
        #[arg(long)]
        remote: Option<String>,
        /// Local port(s); mirrors the remote ports when omitted.
        #[arg(long)]
        local: Option<String>,
        /// Local bind address.
        #[arg(long)]
        address: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("kfwd: {e}");
            std::process::exit(2);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let result = match cli.command {
        Commands::Ports {
            path,
            container,
            json,
        } => show_ports(&config, &path, &container, json).await,
        Commands::Forward {
            path,
            container,
            remote,
            local,
            address,
        } => {
            run_forward(
                &config,
                &path,
                &container,
                remote.as_deref(),
                local.as_deref(),
                address.as_deref(),
            )
            .await
        }
    };

    if let Err(e) = result {
        error!(kind = e.kind(), "{e}");
        std::process::exit(1);
    }
}

/// Fetch the container's ports and the dialog defaults derived from them.
async fn suggest(
    config: &Config,
    client: kube::Client,
    path: &str,
    container: &str,
) -> Result<(ContainerPortSpecs, (String, String)), ForwardError> {
    let workloads = KubeWorkloads::new(client, &config.cluster.namespace);
    let (specs, annotations) = list_forwardable(&workloads, path, container).await?;
    if specs.is_empty() {
        return Err(ForwardError::Workload(format!(
            "container {container} exposes no TCP ports"
        )));
    }

    // A bad annotation degrades to the plain defaults rather than blocking.
    let preferred = annotations.preferred_ports(&specs).unwrap_or_else(|e| {
        warn!(path, container, "ignoring port-forward annotation: {e}");
        PreferredPorts::default()
    });
    let fields = preferred.to_port_spec(&specs);

    Ok((specs, fields))
}

async fn show_ports(config: &Config, path: &str, container: &str, json: bool) -> Result<(), ForwardError> {
    let client = kube::Client::try_default().await?;
    let (specs, (remote, local)) = suggest(config, client, path, container).await?;

    if json {
        let out = serde_json::json!({
            "ports": specs,
            "remote": remote,
            "local": local,
        });
        println!("{out:#}");
    } else {
        print!("{specs}");
        println!("suggested: --remote {remote} --local {local}");
    }
    Ok(())
}

async fn run_forward(
    config: &Config,
    path: &str,
    container: &str,
    remote: Option<&str>,
    local: Option<&str>,
    address: Option<&str>,
) -> Result<(), ForwardError> {
    let client = kube::Client::try_default().await?;
    let (specs, (def_remote, def_local)) = suggest(config, client.clone(), path, container).await?;

    // The suggested local value only applies to the suggested remote value;
    // an explicit remote with no local mirrors itself.
    let (remote, local) = match (remote, local) {
        (Some(r), l) => (r.to_string(), l.unwrap_or_default().to_string()),
        (None, Some(l)) => (def_remote, l.to_string()),
        (None, None) => (def_remote, def_local),
    };
    let tunnels = port::parse(
        address.unwrap_or_default(),
        &remote,
        &local,
        &config.forward.address,
    )?;
    port::check_remote(&remote, &specs)?;
    tunnels.check_available()?;

    let dialer = KubeDialer::new(client, &config.cluster.namespace, config.forward.probe_interval());
    let forwarders = Forwarders::new(&config.forward, Arc::new(dialer));
    let mut events = forwarders.subscribe();

    let hooks = ForwardHooks::new()
        .on_start(|view| {
            for spec in &view.tunnels {
                println!("Forwarding from {spec}");
            }
        })
        .on_stop(|key, cause| match cause {
            Some(e) => warn!(key = %key, "port-forward ended: {e}"),
            None => info!(key = %key, "port-forward closed"),
        });
    let view = forwarders
        .start_tunnels(path, container, tunnels, hooks)
        .await?;
    info!(id = %view.id, "port-forward ready, press Ctrl-C to stop");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                },
                Err(e) => {
                    warn!("unable to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    let key = view.key;
    let failure = tokio::select! {
        () = shutdown => None,
        failure = watch_events(&mut events, &key) => failure,
    };

    forwarders.stop_all().await;
    match failure {
        Some(reason) => Err(ForwardError::Runtime { key, reason }),
        None => Ok(()),
    }
}

/// Wait until the forwarder for `key` leaves the registry on its own.
/// Returns the failure reason, if any.
async fn watch_events(
    events: &mut tokio::sync::broadcast::Receiver<ForwardEvent>,
    key: &ForwarderKey,
) -> Option<String> {
    loop {
        match events.recv().await {
            Ok(ForwardEvent::Failed { view, error }) if view.key == *key => return Some(error),
            Ok(ForwardEvent::Stopped(k)) if k == *key => return None,
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("dropped {n} forward events"),
            Err(RecvError::Closed) => return None,
        }
    }
}
