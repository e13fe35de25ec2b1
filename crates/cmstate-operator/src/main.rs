//! CMState operator - pod admission webhook and CMState controller

mod controller_runner;
mod startup;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cmstate_common::crd::{CMState, CMTemplate};
use cmstate_common::{DEFAULT_WEBHOOK_PORT, TEMPLATE_ANNOTATION};
use cmstate_injector::controller::Context;
use cmstate_injector::{
    run_template_watcher, webhook_router, AdmissionHandler, InjectorConfig, KubeStore,
    OwnerLiveness, TemplateRegistry, WebhookState,
};

use crate::controller_runner::build_cmstate_controller;
use crate::startup::{ensure_crds_installed, serve_webhook, TlsFiles};

/// CMState operator - reference-counted ConfigMaps for pods sharing a template
#[derive(Parser, Debug)]
#[command(name = "cmstate-operator", version, about, long_about = None)]
struct Cli {
    /// Port the mutating webhook listens on
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// PEM certificate for the webhook; plain HTTP when unset
    #[arg(long, env = "TLS_CERT_FILE", requires = "tls_key_file")]
    tls_cert_file: Option<PathBuf>,

    /// PEM private key for the webhook
    #[arg(long, env = "TLS_KEY_FILE", requires = "tls_cert_file")]
    tls_key_file: Option<PathBuf>,

    /// Namespace CMTemplates are read from (usually the operator's own)
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    template_namespace: String,

    /// Pod annotation naming the CMTemplate to join
    #[arg(long, env = "TEMPLATE_ANNOTATION", default_value = TEMPLATE_ANNOTATION)]
    template_annotation: String,

    /// Install or update the CRDs at startup
    #[arg(long)]
    install_crds: bool,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the webhook and controller (default mode)
    Run,
    /// Print CRD manifests and exit
    Crd,
}

impl Cli {
    fn injector_config(&self) -> InjectorConfig {
        InjectorConfig {
            template_annotation: self.template_annotation.clone(),
            ..InjectorConfig::with_template_namespace(self.template_namespace.clone())
        }
    }

    fn tls_files(&self) -> Option<TlsFiles> {
        match (&self.tls_cert_file, &self.tls_key_file) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Some(Commands::Crd) => print_crds(),
        Some(Commands::Run) | None => run(cli).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn print_crds() -> anyhow::Result<()> {
    for crd in [CMState::crd(), CMTemplate::crd()] {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let config = cli.injector_config();
    let store = Arc::new(KubeStore::new(client.clone()));
    let registry = Arc::new(TemplateRegistry::new());

    tokio::spawn(run_template_watcher(
        client.clone(),
        config.template_namespace.clone(),
        registry.clone(),
    ));

    let handler = AdmissionHandler::new(
        store.clone(),
        registry.clone(),
        OwnerLiveness::for_cluster(client.clone()),
        config.clone(),
    );
    let router = webhook_router(Arc::new(WebhookState::new(Arc::new(handler))));
    let ctx = Arc::new(Context::new(store, registry, config));

    tracing::info!(
        template_namespace = %cli.template_namespace,
        annotation = %cli.template_annotation,
        "Starting CMState operator"
    );

    tokio::select! {
        () = build_cmstate_controller(client, ctx) => {
            tracing::info!("Controller stopped, shutting down");
            Ok(())
        }
        result = serve_webhook(router, cli.webhook_port, cli.tls_files()) => result,
    }
}
