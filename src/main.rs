//! Fabric Operator - joins Kubernetes clusters to an overlay fabric

use std::io::Read;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Config, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fabric::bundle;
use fabric::controller::{error_policy, reconcile, Context, Roles};
use fabric::crd::Fabric;

/// Fabric Operator - joins Kubernetes clusters to an overlay fabric
#[derive(Parser, Debug)]
#[command(name = "fabric-operator", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Fabric resources, deploys the broker and joins this cluster
    /// according to the enabled roles.
    Controller(ControllerArgs),

    /// Print the Fabric CRD manifest and exit
    Crd,

    /// Encode or decode handshake bundles
    #[command(subcommand)]
    Bundle(BundleCommands),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Namespace of the broker
    #[arg(
        long,
        env = "FABRIC_BROKER_NAMESPACE",
        default_value = fabric::DEFAULT_BROKER_NAMESPACE
    )]
    broker_namespace: String,

    /// Namespace the data-plane resources are written to
    #[arg(
        long,
        env = "FABRIC_OPERATOR_NAMESPACE",
        default_value = fabric::DEFAULT_OPERATOR_NAMESPACE
    )]
    operator_namespace: String,

    /// Deploy the broker from spec.brokerConfig
    #[arg(long, env = "FABRIC_DEPLOY_BROKER")]
    deploy_broker: bool,

    /// Join the broker from spec.joinConfig
    #[arg(long, env = "FABRIC_JOIN_BROKER")]
    join_broker: bool,

    /// API server URL published to joining clusters, defaults to the
    /// client's cluster URL
    #[arg(long, env = "FABRIC_BROKER_URL")]
    broker_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum BundleCommands {
    /// Read bundle JSON from stdin and print its transport string
    Encode,
    /// Decode a transport string and print the bundle JSON
    Decode {
        /// Encoded bundle
        encoded: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Crd) => {
            let crd = serde_yaml::to_string(&Fabric::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("{crd}");
            Ok(())
        }
        Some(Commands::Bundle(cmd)) => run_bundle(cmd),
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_from(["controller"])).await,
    }
}

fn run_bundle(cmd: BundleCommands) -> anyhow::Result<()> {
    match cmd {
        BundleCommands::Encode => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let parsed: bundle::HandshakeBundle = serde_json::from_str(&input)
                .map_err(|e| anyhow::anyhow!("Invalid bundle JSON: {}", e))?;
            println!("{}", bundle::encode(&parsed)?);
        }
        BundleCommands::Decode { encoded } => {
            let decoded = bundle::decode(encoded.trim())?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
    }
    Ok(())
}

/// Ensure the Fabric CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply, so
/// the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(fabric::FIELD_MANAGER).force();

    tracing::info!("Installing Fabric CRD...");
    crds.patch(
        "fabrics.operator.tkestack.io",
        &params,
        &Patch::Apply(&Fabric::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Fabric CRD: {}", e))?;
    Ok(())
}

/// Run in controller mode
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(
        deploy_broker = args.deploy_broker,
        join_broker = args.join_broker,
        "Fabric controller starting..."
    );

    let config = Config::infer()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load Kubernetes config: {}", e))?;
    let broker_url = args
        .broker_url
        .unwrap_or_else(|| config.cluster_url.to_string());
    let client = Client::try_from(config)
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let ctx = Arc::new(
        Context::builder(client.clone())
            .broker_namespace(args.broker_namespace)
            .operator_namespace(args.operator_namespace)
            .broker_url(broker_url)
            .roles(Roles {
                deploy_broker: args.deploy_broker,
                join_broker: args.join_broker,
            })
            .build(),
    );

    let fabrics: Api<Fabric> = Api::all(client);

    tracing::info!("Starting Fabric controller...");
    Controller::new(fabrics, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Fabric reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Fabric reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Fabric controller shutting down");
    Ok(())
}
