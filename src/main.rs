use std::{path::PathBuf, sync::Arc};

use ::tracing::{error, info, info_span, Instrument};
use anyhow::Context;
use clap::{Parser, Subcommand};
use service::Service;
use tokio_util::sync::CancellationToken;

mod config;
mod data_model;
mod executors;
mod http_objects;
mod integration_test;
mod node;
mod processor;
mod routes;
mod runner;
mod service;
mod state_store;
mod tracing;
use tracing::setup_tracing;
mod utils;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(name = "fileflows")]
#[command(version, about = "FileFlows coordinator, processing node and flow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the coordinator.
    Server {
        #[arg(short, long, value_name = "config file", help = "Path to config file")]
        config: Option<PathBuf>,
    },
    /// Runs a processing node that polls the coordinator for work.
    Node {
        #[arg(short, long, value_name = "config file", help = "Path to config file")]
        config: PathBuf,
    },
    /// Executes one claimed file. Launched by a processing node.
    Runner {
        #[arg(short, long, value_name = "FILE")]
        params: PathBuf,
    },
}

fn path_str(path: &std::path::Path) -> anyhow::Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server { config } => {
            let config = match config {
                Some(path) => config::ServerConfig::from_path(path_str(&path)?)?,
                None => config::ServerConfig::default(),
            };
            setup_tracing(config.structured_logging);

            let root_span = info_span!("fileflows", component = "server");
            async move {
                let mut service = Service::new(config).context("Error creating service")?;
                if let Err(err) = service.start().await {
                    error!("Error starting service: {:?}", err);
                    return Err(err);
                }
                Ok(())
            }
            .instrument(root_span)
            .await
        }
        Command::Node { config } => {
            let config = config::NodeConfig::from_path(path_str(&config)?)?;
            setup_tracing(config.structured_logging);

            let root_span = info_span!("fileflows", component = "node", node_uid = %config.node_uid);
            async move {
                let cancel = CancellationToken::new();
                let agent = node::NodeAgent::new(config)?;
                let shutdown = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("signal received, stopping processing node");
                    }
                    shutdown.cancel();
                });
                agent.run(cancel).await
            }
            .instrument(root_span)
            .await
        }
        Command::Runner { params } => {
            let params = data_model::RunnerParameters::load(&params)?;
            setup_tracing(false);

            let root_span = info_span!(
                "fileflows",
                component = "runner",
                runner_uid = %params.runner_uid,
                file_uid = %params.file.uid
            );
            async move {
                let client = Arc::new(runner::client::HttpCoordinatorClient::new(
                    &params.server_addr,
                )?);
                let report = runner::Runner::new(params, client).run().await?;
                info!(status = %report.status, "runner finished");
                Ok(())
            }
            .instrument(root_span)
            .await
        }
    }
}
