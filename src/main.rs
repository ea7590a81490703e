use crate::cluster::KubeControlPlane;
use crate::docker::DockerCli;
use crate::driver::Driver;
use crate::secret_string::SecretString;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

mod cluster;
mod config;
mod docker;
mod driver;
mod error;
mod image_reference;
mod image_store;
mod manifest;
mod oci_registry;
mod registry;
mod rollout;
mod secret_string;
#[cfg(test)]
mod testing;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "kube-promote", version)]
#[command(about = "Promote registry images into a local cluster and restart its workloads")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "KUBE_PROMOTE_CONFIG", default_value = "kube-promote.yaml")]
    config: PathBuf,

    /// Wait until both workloads report ready, overriding rollout.waitForReady
    #[arg(long)]
    wait: bool,

    /// Skip pruning dangling images after each promotion
    #[arg(long)]
    no_prune: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    info!("Starting kube-promote {}", env!("CARGO_PKG_VERSION"));

    let mut config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            eprintln!("kube-promote: configuration failed: {:#}", e);
            return ExitCode::from(2);
        }
    };
    config.rollout.wait_for_ready |= cli.wait;
    config.runtime.prune &= !cli.no_prune;

    // Read once, never written anywhere
    let credential = SecretString::from_env(&config.registry.token_env);

    let mut docker = DockerCli::new(&config.runtime.binary, config.runtime.env.clone());
    if config.registry.manifest_probe {
        match oci_registry::create_client() {
            Ok(client) => docker = docker.with_manifest_probe(oci_registry::ManifestProbe::new(client)),
            Err(e) => warn!("Registry manifest probe disabled: {:#}", e),
        }
    }
    let cluster = KubeControlPlane::new(config.cluster.kube_context.clone());
    let driver = Driver::new(&docker, &docker, &cluster);

    let result = tokio::select! {
        result = driver.run(&config, credential.as_ref()) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, remaining steps were not executed");
            eprintln!("kube-promote: interrupted");
            return ExitCode::from(130);
        }
    };

    match result {
        Ok(report) => {
            info!(
                "Promoted {} image(s), applied {} resource(s), restarted {}",
                report.promoted.len(),
                report.applied.resources.len(),
                report
                    .restarted
                    .iter()
                    .map(|w| w.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Promotion aborted during {}: {}", e.stage(), e);
            eprintln!("kube-promote: {} failed: {}", e.stage(), e);
            ExitCode::from(e.exit_code())
        }
    }
}
