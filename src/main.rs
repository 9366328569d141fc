//! PaV agent and plugin entry point
//!
//! One binary, four roles: the controller agent (provisioner registry,
//! admission webhook, and the pod-launching half of the provisioning
//! machine), the node agent (one per node, runs the worker pods and the
//! staging machines), and the per-provisioner CSI controller and node
//! plugins.

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pav::agent;
use pav::crd::PavProvisioner;
use pav::csi::{self, ProvisionerRef};
use pav::registry;

/// PaV - define Kubernetes storage provisioners with pod templates
#[derive(Parser, Debug)]
#[command(name = "pav", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller agent (registry, webhook, pod launcher)
    Controller(ControllerArgs),

    /// Run the node agent on one node
    Node(NodeArgs),

    /// Run the CSI controller plugin of one provisioner
    CsiController(CsiControllerArgs),

    /// Run the CSI node plugin of one provisioner
    CsiNode(CsiNodeArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// PaV image the per-provisioner plugin workloads run
    #[arg(long, env = "PAV_IMAGE")]
    image: String,

    /// Admission webhook listen address
    #[arg(long, default_value = "0.0.0.0:8443")]
    webhook_addr: SocketAddr,
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,
}

#[derive(Parser, Debug)]
struct CsiControllerArgs {
    /// Name of the provisioner this plugin serves
    #[arg(long)]
    provisioner: String,

    /// UID of the provisioner object
    #[arg(long)]
    provisioner_uid: String,
}

#[derive(Parser, Debug)]
struct CsiNodeArgs {
    /// Name of the provisioner this plugin serves
    #[arg(long)]
    provisioner: String,

    /// UID of the provisioner object
    #[arg(long)]
    provisioner_uid: String,

    /// Name of the node this plugin runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", serde_yaml::to_string(&PavProvisioner::crd())?);
        return Ok(());
    }

    let Some(command) = cli.command else {
        anyhow::bail!("a subcommand is required (controller, node, csi-controller, csi-node)");
    };

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    match command {
        Commands::Controller(args) => {
            tracing::info!("PaV controller agent starting");
            tokio::select! {
                result = registry::run(client.clone(), args.image, args.webhook_addr) => result?,
                result = agent::provisioning::run(client, agent::provisioning::Role::Controller) => {
                    result?
                }
            }
        }
        Commands::Node(args) => {
            tracing::info!(node = %args.node_name, "PaV node agent starting");
            agent::run_node_agent(client, args.node_name).await?;
        }
        Commands::CsiController(args) => {
            tracing::info!(provisioner = %args.provisioner, "PaV CSI controller plugin starting");
            csi::serve_controller(
                client,
                ProvisionerRef {
                    name: args.provisioner,
                    uid: args.provisioner_uid,
                },
            )
            .await?;
        }
        Commands::CsiNode(args) => {
            tracing::info!(
                provisioner = %args.provisioner,
                node = %args.node_name,
                "PaV CSI node plugin starting"
            );
            csi::serve_node(
                client,
                ProvisionerRef {
                    name: args.provisioner,
                    uid: args.provisioner_uid,
                },
                args.node_name,
            )
            .await?;
        }
    }

    Ok(())
}
