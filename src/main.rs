//! UPF operator - reconciles a 5G user-plane function on Kubernetes

use std::time::Duration;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use upf_operator::controller::run_controller;
use upf_operator::crd::UserPlaneFunction;
use upf_operator::settings::OperatorSettings;
use upf_operator::telemetry::{init_tracing, TelemetryConfig};
use upf_operator::FIELD_MANAGER;

/// UPF operator - drives a bessd user plane and its PFCP agent toward the UserPlaneFunction spec
#[derive(Parser, Debug)]
#[command(name = "upf-operator", version, about, long_about = None)]
struct Cli {
    /// Print the UserPlaneFunction CRD and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "UPF_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default mode)
    Controller(ControllerArgs),
}

#[derive(Parser, Debug, Default)]
struct ControllerArgs {
    /// Total time allowed for the bootstrap command, in seconds
    #[arg(long, env = "UPF_BOOTSTRAP_BUDGET_SECS")]
    bootstrap_budget_secs: Option<u64>,

    /// Timeout of a single command inside the workload, in seconds
    #[arg(long, env = "UPF_COMMAND_TIMEOUT_SECS")]
    command_timeout_secs: Option<u64>,

    /// Metric of the default route toward the core gateway
    #[arg(long, env = "UPF_ROUTE_METRIC")]
    route_metric: Option<u32>,
}

impl ControllerArgs {
    fn settings(&self) -> OperatorSettings {
        let mut settings = OperatorSettings::default();
        if let Some(secs) = self.bootstrap_budget_secs {
            settings.bootstrap_budget = Duration::from_secs(secs);
        }
        if let Some(secs) = self.command_timeout_secs {
            settings.command_timeout = Duration::from_secs(secs);
        }
        if let Some(metric) = self.route_metric {
            settings.route_metric = metric;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&UserPlaneFunction::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(TelemetryConfig {
        json: cli.json_logs,
    })?;

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };
    let settings = args.settings();
    tracing::info!(?settings, "UPF operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    ensure_crd_installed(&client).await?;

    run_controller(client, settings).await
}

/// Server-side apply the UserPlaneFunction CRD
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing UserPlaneFunction CRD...");
    crds.patch(
        "userplanefunctions.sdcore.dev",
        &params,
        &Patch::Apply(&UserPlaneFunction::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install UserPlaneFunction CRD: {}", e))?;
    Ok(())
}
