use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use keel_catalog::Catalog;
use keel_components::{build_catalog, HelmBackend};
use keel_config::{EffectiveConfigResolver, Manifest, ProfileResolver, Settings};
use keel_core::{Platform, WATCH_LABEL};
use keel_engine::{EngineParts, PlatformProbe, Reconciler, TrackerCache};
use keel_kubehub::{ClusterClient, KubeClusterClient};
use keel_status::{spawn_poller, spawn_status_writer, Handoff, StatusWriter};
use kube::runtime::{watcher, Controller};
use kube::{Api, CustomResourceExt};
use tracing::{debug, info, warn};

mod controller;

use controller::{error_policy, reconcile, watched_trigger, State};

#[derive(Parser, Debug)]
#[command(name = "keel-operator", version, about = "Keel platform operator")]
struct Cli {
    /// Prometheus exporter address (host:port)
    #[arg(long = "metrics-addr", env = "KEEL_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    /// Only watch platforms in this namespace (default: all namespaces)
    #[arg(long = "namespace", global = true)]
    namespace: Option<String>,

    /// Run every lifecycle step without touching component installations
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,

    /// Manifest to use instead of the embedded one
    #[arg(long = "bom", global = true)]
    bom: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller (default)
    Run,
    /// Print the Platform CustomResourceDefinition as YAML
    Crd,
    /// Print the manifest in use and its dependency check
    Manifest,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid metrics address; expected host:port");
    }
}

fn settings_from(cli: &Cli) -> Settings {
    let mut settings = Settings::from_env();
    settings.dry_run |= cli.dry_run;
    if let Some(bom) = &cli.bom {
        settings.bom_path = Some(bom.clone());
    }
    settings
}

fn print_manifest(manifest: &Manifest, catalog: &Catalog) {
    println!("version {}", manifest.version);
    for c in catalog.components() {
        let deps = if c.dependencies().is_empty() { "-".to_string() } else { c.dependencies().join(",") };
        let sound = if catalog.check_dependencies(c.name()) { "ok" } else { "BROKEN" };
        println!("{} • {} • deps {} • {}", c.name(), c.namespace(), deps, sound);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Some(Commands::Crd) = cli.command {
        print!("{}", serde_yaml::to_string(&Platform::crd())?);
        return Ok(());
    }

    let settings = settings_from(&cli);
    let manifest = Arc::new(Manifest::load(settings.bom_path.as_deref())?);

    if let Some(Commands::Manifest) = cli.command {
        let client = keel_kubehub::get_kube_client().await?;
        let backend = Arc::new(HelmBackend::new(settings.helm_bin.clone(), client));
        print_manifest(&manifest, &build_catalog(&manifest, backend, &settings));
        return Ok(());
    }

    init_metrics(cli.metrics_addr.as_deref());
    run(cli.namespace.as_deref(), settings, manifest).await
}

async fn run(namespace: Option<&str>, settings: Settings, manifest: Arc<Manifest>) -> Result<()> {
    let client = keel_kubehub::get_kube_client().await.context("connecting to the cluster")?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let backend = Arc::new(HelmBackend::new(settings.helm_bin.clone(), client.clone()));
    let catalog = Arc::new(build_catalog(&manifest, backend, &settings));
    if !catalog.defects().is_empty() {
        warn!(defects = catalog.defects().len(), "catalog has defects; affected components will not install");
    }
    let resolver: Arc<dyn EffectiveConfigResolver> = Arc::new(ProfileResolver::builtin()?);
    let writer: Arc<dyn StatusWriter> =
        Arc::new(spawn_status_writer(cluster.clone(), settings.status_queue_cap, settings.status_conflict_retries));

    let trackers = Arc::new(TrackerCache::new());
    let handoff = Handoff::new();
    let probe = Arc::new(PlatformProbe::new(
        catalog.clone(),
        cluster.clone(),
        resolver.clone(),
        trackers.clone(),
        settings.dry_run,
    ));
    let poller = spawn_poller(probe, handoff.clone(), writer.clone(), settings.availability_poll);

    let retry = settings.backoff.short_max;
    let parts = EngineParts { catalog, cluster, writer, resolver, manifest, settings };
    let reconciler = Reconciler::new(parts, trackers.clone())?.with_handoff(handoff);
    info!(operator_version = %reconciler.operator_version(), namespace = ?namespace, "keel operator starting");

    let (platforms, configmaps, secrets): (Api<Platform>, Api<ConfigMap>, Api<Secret>) = match namespace {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client.clone()), Api::all(client)),
    };
    let labelled = || watcher::Config::default().labels(WATCH_LABEL);
    let state = Arc::new(State { reconciler, retry });

    Controller::new(platforms, watcher::Config::default())
        .watches(configmaps, labelled(), watched_trigger::<ConfigMap>(trackers.clone()))
        .watches(secrets, labelled(), watched_trigger::<Secret>(trackers))
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(platform = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;

    poller.abort();
    info!("keel operator stopped");
    Ok(())
}
