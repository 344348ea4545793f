//! Rightsizer - vertical pod autoscaling for Kubernetes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{LimitRange, Pod};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rightsizer::admission::{self, AdmissionState, WebhookOptions};
use rightsizer::crd::{AutoscalerCheckpoint, VerticalAutoscaler};
use rightsizer::input::{
    watch_store, ClusterStateFeeder, PodMetricsSource, PrometheusHistoryConfig,
    PrometheusHistoryProvider,
};
use rightsizer::model::ClusterModel;
use rightsizer::recommend::{
    NoopLimitRangeCalculator, Recommender, RecommenderConfig, StoreLimitRangeCalculator,
};
use rightsizer::target::ApiTargetSelectorFetcher;
use rightsizer::telemetry::spawn_metrics_listener;
use rightsizer::update::{
    EvictionConfig, UpdateConfig, Updater, UpdaterConfig,
};
use rightsizer::{
    DEFAULT_RECOMMENDER_INTERVAL_SECS, DEFAULT_UPDATER_INTERVAL_SECS, DEFAULT_WEBHOOK_PORT,
};

/// Rightsizer - recommends and applies container resource requests
#[derive(Parser, Debug)]
#[command(name = "rightsizer", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the recommender loop
    Recommender(RecommenderArgs),

    /// Run the updater loop
    Updater(UpdaterArgs),

    /// Run the admission controller webhook
    AdmissionController(AdmissionArgs),
}

/// Where the recommender's usage history comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Storage {
    /// Persisted AutoscalerCheckpoint objects (default)
    Checkpoint,
    /// A Prometheus server scraping cadvisor
    Prometheus,
}

/// Recommender arguments
#[derive(Parser, Debug)]
struct RecommenderArgs {
    /// How often metrics are fetched and recommendations recomputed
    #[arg(long, default_value_t = DEFAULT_RECOMMENDER_INTERVAL_SECS)]
    recommender_interval_secs: u64,

    /// Budget for writing checkpoints within one iteration
    #[arg(long, default_value = "60")]
    checkpoints_timeout_secs: u64,

    /// Minimum number of checkpoints written per iteration
    #[arg(long, default_value = "10")]
    min_checkpoints: usize,

    /// How often orphaned checkpoints are garbage collected
    #[arg(long, default_value = "600")]
    checkpoints_gc_interval_secs: u64,

    /// Only track pods that have a matching autoscaler
    #[arg(long)]
    memory_saver: bool,

    /// History storage backend
    #[arg(long, value_enum, default_value = "checkpoint")]
    storage: Storage,

    /// Prometheus base address, e.g. http://prometheus.monitoring:9090
    #[arg(long, default_value = "")]
    prometheus_address: String,

    /// How many days of history to query from Prometheus
    #[arg(long, default_value = "8")]
    history_length_days: i64,

    /// Address to expose prometheus metrics on
    #[arg(long, default_value = "0.0.0.0:8942")]
    metrics_address: SocketAddr,

    /// QPS limit for requests to the Kubernetes API server
    #[arg(long, default_value = "5.0")]
    kube_api_qps: f64,

    /// Burst limit for requests to the Kubernetes API server
    #[arg(long, default_value = "10.0")]
    kube_api_burst: f64,
}

/// Updater arguments
#[derive(Parser, Debug)]
struct UpdaterArgs {
    /// How often the updater evaluates pods for eviction
    #[arg(long, default_value_t = DEFAULT_UPDATER_INTERVAL_SECS)]
    updater_interval_secs: u64,

    /// Groups smaller than this are never disrupted
    #[arg(long, default_value = "2")]
    min_replicas: usize,

    /// Fraction of a replica group evictable within one tick
    #[arg(long, default_value = "0.5")]
    eviction_tolerance: f64,

    /// Global evictions per second; 0 or negative disables the limiter
    #[arg(long, default_value = "-1.0", allow_hyphen_values = true)]
    eviction_rate_limit: f64,

    /// Burst of the eviction rate limiter
    #[arg(long, default_value = "1")]
    eviction_rate_burst: usize,

    /// A single-container pod that OOMed within this many seconds of
    /// starting is always evictable
    #[arg(long, default_value = "600")]
    evict_after_oom_secs: i64,

    /// Address to expose prometheus metrics on
    #[arg(long, default_value = "0.0.0.0:8943")]
    metrics_address: SocketAddr,
}

/// Admission controller arguments
#[derive(Parser, Debug)]
struct AdmissionArgs {
    /// HTTPS listen port
    #[arg(long, default_value_t = DEFAULT_WEBHOOK_PORT)]
    port: u16,

    /// Path to the PEM server certificate
    #[arg(long, env = "TLS_CERT_FILE", default_value = "/etc/tls-certs/serverCert.pem")]
    tls_cert_file: std::path::PathBuf,

    /// Path to the PEM private key
    #[arg(long, env = "TLS_KEY_FILE", default_value = "/etc/tls-certs/serverKey.pem")]
    tls_key_file: std::path::PathBuf,

    /// Register the MutatingWebhookConfiguration at startup
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    register_webhook: bool,

    /// Register by URL instead of by service reference
    #[arg(long)]
    register_by_url: bool,

    /// External address of the webhook, for URL registration
    #[arg(long)]
    webhook_address: Option<String>,

    /// Port the API server should dial
    #[arg(long, default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// Service name for service-reference registration
    #[arg(long, default_value = "rightsizer-webhook")]
    webhook_service_name: String,

    /// Namespace of the webhook service
    #[arg(long, env = "NAMESPACE", default_value = "kube-system")]
    webhook_namespace: String,

    /// Address to expose prometheus metrics on
    #[arg(long, default_value = "0.0.0.0:8944")]
    metrics_address: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider for the webhook TLS stack
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let autoscaler = serde_yaml::to_string(&VerticalAutoscaler::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let checkpoint = serde_yaml::to_string(&AutoscalerCheckpoint::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{autoscaler}---\n{checkpoint}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Recommender(args)) => run_recommender(args).await,
        Some(Commands::Updater(args)) => run_updater(args).await,
        Some(Commands::AdmissionController(args)) => run_admission(args).await,
        None => {
            run_recommender(RecommenderArgs::parse_from(["rightsizer-recommender"])).await
        }
    }
}

/// Run the recommender loop until interrupted
async fn run_recommender(args: RecommenderArgs) -> anyhow::Result<()> {
    tracing::info!(
        interval_secs = args.recommender_interval_secs,
        storage = ?args.storage,
        kube_api_qps = args.kube_api_qps,
        kube_api_burst = args.kube_api_burst,
        "rightsizer recommender starting"
    );
    spawn_metrics_listener(args.metrics_address);

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let autoscaler_store = watch_store::<VerticalAutoscaler>(client.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to sync autoscaler cache: {}", e))?;
    let pod_store = watch_store::<Pod>(client.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to sync pod cache: {}", e))?;

    let feeder = ClusterStateFeeder::new(
        client.clone(),
        autoscaler_store,
        pod_store,
        Arc::new(ApiTargetSelectorFetcher::new(client.clone())),
        Box::new(PodMetricsSource::new(client.clone())),
    );

    let use_checkpoints = args.storage != Storage::Prometheus;
    let config = RecommenderConfig {
        checkpoints_timeout: Duration::from_secs(args.checkpoints_timeout_secs),
        min_checkpoints: args.min_checkpoints,
        checkpoints_gc_interval: Duration::from_secs(args.checkpoints_gc_interval_secs),
        use_checkpoints,
    };
    let model = ClusterModel::new(args.memory_saver);
    let mut recommender = Recommender::new(client, feeder, model, config);

    if use_checkpoints {
        recommender
            .init_from_checkpoints()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to init from checkpoints: {}", e))?;
    } else {
        let provider = PrometheusHistoryProvider::new(PrometheusHistoryConfig {
            address: args.prometheus_address.clone(),
            history_length: chrono::Duration::days(args.history_length_days),
            ..Default::default()
        });
        recommender
            .init_from_history(&provider)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to init from history provider: {}", e))?;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.recommender_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => recommender.run_once().await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("rightsizer recommender shutting down");
    Ok(())
}

/// Run the updater loop until interrupted
async fn run_updater(args: UpdaterArgs) -> anyhow::Result<()> {
    tracing::info!(
        interval_secs = args.updater_interval_secs,
        min_replicas = args.min_replicas,
        eviction_tolerance = args.eviction_tolerance,
        "rightsizer updater starting"
    );
    spawn_metrics_listener(args.metrics_address);

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let limit_ranges: Arc<dyn rightsizer::recommend::LimitRangeCalculator> =
        match watch_store::<LimitRange>(client.clone()).await {
            Ok(store) => Arc::new(StoreLimitRangeCalculator::new(store)),
            Err(e) => {
                tracing::error!(error = %e, "limit range cache unavailable, not checking limits");
                Arc::new(NoopLimitRangeCalculator)
            }
        };

    let config = UpdaterConfig {
        eviction: EvictionConfig {
            min_replicas: args.min_replicas,
            tolerance_fraction: args.eviction_tolerance,
        },
        update: UpdateConfig {
            evict_after_oom: chrono::Duration::seconds(args.evict_after_oom_secs),
            ..Default::default()
        },
        eviction_rate_limit: args.eviction_rate_limit,
        eviction_rate_burst: args.eviction_rate_burst,
    };
    let mut updater = Updater::new(
        client.clone(),
        Arc::new(ApiTargetSelectorFetcher::new(client)),
        limit_ranges,
        config,
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(args.updater_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => updater.run_once().await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("rightsizer updater shutting down");
    Ok(())
}

/// Run the admission webhook until interrupted
async fn run_admission(args: AdmissionArgs) -> anyhow::Result<()> {
    tracing::info!(port = args.port, "rightsizer admission controller starting");
    spawn_metrics_listener(args.metrics_address);

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let autoscalers = watch_store::<VerticalAutoscaler>(client.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to sync autoscaler cache: {}", e))?;
    let limit_ranges: Arc<dyn rightsizer::recommend::LimitRangeCalculator> =
        match watch_store::<LimitRange>(client.clone()).await {
            Ok(store) => Arc::new(StoreLimitRangeCalculator::new(store)),
            Err(e) => {
                tracing::error!(error = %e, "limit range cache unavailable, not checking limits");
                Arc::new(NoopLimitRangeCalculator)
            }
        };

    let state = Arc::new(AdmissionState {
        autoscalers,
        selector_fetcher: Arc::new(ApiTargetSelectorFetcher::new(client.clone())),
        limit_ranges,
    });

    let options = WebhookOptions {
        listen: SocketAddr::from(([0, 0, 0, 0], args.port)),
        tls_cert: args.tls_cert_file.clone(),
        tls_key: args.tls_key_file.clone(),
        register: args.register_webhook,
        register_by_url: args.register_by_url,
        webhook_address: args.webhook_address.clone(),
        webhook_port: args.webhook_port,
        service_name: args.webhook_service_name.clone(),
        service_namespace: args.webhook_namespace.clone(),
    };

    if options.register {
        admission::register_webhook(client, &options)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to register webhook: {}", e))?;
    }

    tokio::select! {
        result = admission::serve(state, &options) => {
            result.map_err(|e| anyhow::anyhow!("Webhook server failed: {}", e))?;
        }
        _ = tokio::signal::ctrl_c() => {}
    }

    tracing::info!("rightsizer admission controller shutting down");
    Ok(())
}
