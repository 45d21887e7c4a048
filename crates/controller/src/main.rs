use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use kbroker_core::decode;
use kbroker_kubehub::{Artifacts, ConfigMapArtifacts};
use kbroker_ops::{KubeOps, PodNotifier, TopicAdmin, TopicProvisioner};
use kbroker_reconcile::controller::{self, Context, CONTROLLER_NAME};
use kbroker_reconcile::events::KubeEventPublisher;
use kbroker_reconcile::resolver::KubeResolver;
use kbroker_reconcile::{ConfigResolver, Configs, Engine, KubeConfigMaps};
use kbroker_store::DefaultsCache;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod args;

const DEFAULTS_WAIT: Duration = Duration::from_secs(10);

use args::{Cli, Commands, Output, Settings};

fn init_tracing() {
    let env = std::env::var("KBROKER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KBROKER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KBROKER_METRICS_ADDR; expected host:port");
        }
    }
}

#[cfg(feature = "kafka")]
fn topic_admin(settings: &Settings) -> Result<Arc<dyn TopicAdmin>> {
    Ok(Arc::new(kbroker_ops::RsKafkaAdmin::new(settings.admin_timeout_ms)))
}

#[cfg(not(feature = "kafka"))]
fn topic_admin(_settings: &Settings) -> Result<Arc<dyn TopicAdmin>> {
    anyhow::bail!("built without the kafka feature; topics cannot be managed")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let configs = cli.settings.configs();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.settings, configs).await,
        Commands::Inspect { output } => inspect(&configs, output).await,
    }
}

async fn run(settings: &Settings, configs: Configs) -> Result<()> {
    let client = kbroker_kubehub::get_kube_client().await?;
    let cancel = CancellationToken::new();

    let defaults = DefaultsCache::shared(settings.topic_detail());
    let mut refreshed = defaults.subscribe();
    let watcher = tokio::spawn(watch_defaults(client.clone(), configs.clone(), defaults.clone(), cancel.clone()));
    match tokio::time::timeout(DEFAULTS_WAIT, refreshed.changed()).await {
        Ok(Ok(())) => info!(revision = defaults.revision(), "cluster defaults loaded"),
        _ => warn!(
            configmap = %configs.defaults_config_map_name,
            "cluster defaults not loaded yet; brokers without a config reference will fail until they are"
        ),
    }

    let engine = build_engine(client.clone(), settings, &configs, defaults)?;
    let ctx = Arc::new(Context { client, engine, cancel: cancel.clone() });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    info!(
        artifact = %configs.data_plane_config_map_as_string(),
        format = %configs.data_plane_config_format,
        system_namespace = %configs.system_namespace,
        "kbroker controller starting"
    );
    controller::run(ctx).await;
    cancel.cancel();
    let _ = watcher.await;
    Ok(())
}

fn build_engine(client: Client, settings: &Settings, configs: &Configs, defaults: Arc<DefaultsCache>) -> Result<Engine> {
    let artifacts = Artifacts::new(
        Arc::new(ConfigMapArtifacts::new(client.clone(), &configs.data_plane_config_map_namespace, &configs.data_plane_config_map_name)),
        configs.data_plane_config_format,
    );
    let notifier = PodNotifier::new(
        Arc::new(KubeOps::new(client.clone())),
        &configs.system_namespace,
        &configs.receiver_selector,
        &configs.dispatcher_selector,
    );
    Ok(Engine::new(
        configs,
        artifacts,
        ConfigResolver::new(defaults, Arc::new(KubeConfigMaps::new(client.clone()))),
        TopicProvisioner::new(topic_admin(settings)?),
        notifier,
        Arc::new(KubeResolver::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
    ))
}

/// Keep the defaults cache in sync with the general ConfigMap, restarting
/// the watch when its stream ends.
async fn watch_defaults(client: Client, configs: Configs, defaults: Arc<DefaultsCache>, cancel: CancellationToken) {
    loop {
        let cache = defaults.clone();
        let watch = kbroker_kubehub::watch_configmap(
            client.clone(),
            &configs.system_namespace,
            &configs.defaults_config_map_name,
            move |cm| {
                cache.apply_configmap(&cm.data.clone().unwrap_or_default());
            },
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = watch => {
                if let Err(e) = res {
                    error!(error = ?e, "defaults watcher failed");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

async fn inspect(configs: &Configs, output: Output) -> Result<()> {
    let client = kbroker_kubehub::get_kube_client().await?;
    let store = ConfigMapArtifacts::new(client, &configs.data_plane_config_map_namespace, &configs.data_plane_config_map_name);
    let Some(handle) = store.fetch().await? else {
        println!("artifact {} does not exist", configs.data_plane_config_map_as_string());
        return Ok(());
    };
    let brokers = decode(handle.payload.as_deref().unwrap_or_default(), configs.data_plane_config_format)
        .with_context(|| format!("decoding {}", configs.data_plane_config_map_as_string()))?;
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&brokers)?),
        Output::Human => {
            println!("volumeGeneration: {}", brokers.volume_generation);
            for b in &brokers.brokers {
                let dls = if b.dead_letter_sink.is_empty() { "-" } else { b.dead_letter_sink.as_str() };
                println!("{} • {} • topic={} • dls={} • triggers={}", b.path, b.id, b.topic, dls, b.triggers.len());
            }
        }
    }
    Ok(())
}
