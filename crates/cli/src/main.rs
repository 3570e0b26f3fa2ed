use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use serde::Serialize;
use tabby_controller::{Controller, ControllerConfig, Reconciler};
use tabby_core::{validate_cat, Cat, ObjectKey};
use tabby_kubehub::{reflect, scoped_api, KubeCats, KubeDeployments, KubeRecorder};
use tabby_queue::RateLimitConfig;
use tabby_store::{HasSynced, Store};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tabbyctl", version, about = "Tabby Cat controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", env = "TABBY_NAMESPACE", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until SIGINT/SIGTERM
    Run(RunArgs),
    /// Check a Cat manifest (YAML or JSON) the way the controller would
    Validate {
        /// Path to the manifest
        file: std::path::PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Concurrent reconcile workers
    #[arg(long, env = "TABBY_THREADS", default_value_t = 2)]
    threads: usize,
    /// First retry delay
    #[arg(long = "backoff-base-ms", env = "TABBY_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,
    #[arg(long = "backoff-multiplier", env = "TABBY_BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    backoff_multiplier: f64,
    /// Retry delay cap
    #[arg(long = "backoff-max-secs", env = "TABBY_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,
    /// Overall enqueue rate; 0 disables the limit
    #[arg(long, env = "TABBY_QPS", default_value_t = 10.0)]
    qps: f64,
    #[arg(long, env = "TABBY_BURST", default_value_t = 100)]
    burst: u32,
    /// 0 waits for cache sync without a deadline
    #[arg(long = "cache-sync-timeout-secs", env = "TABBY_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 120)]
    cache_sync_timeout_secs: u64,
}

impl RunArgs {
    fn config(&self) -> Result<ControllerConfig> {
        let rate_limit = RateLimitConfig {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            multiplier: self.backoff_multiplier,
            max_delay: Duration::from_secs(self.backoff_max_secs),
            qps: self.qps,
            burst: self.burst,
        };
        rate_limit.validate().context("invalid rate limit settings")?;
        Ok(ControllerConfig {
            threads: self.threads.max(1),
            rate_limit,
            cache_sync_timeout: (self.cache_sync_timeout_secs > 0)
                .then(|| Duration::from_secs(self.cache_sync_timeout_secs)),
        })
    }
}

fn init_tracing() {
    let env = std::env::var("TABBY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TABBY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TABBY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            run(args, cli.namespace).await
        }
        Commands::Validate { file } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let report = validate_manifest(&text)?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                Output::Human => match &report.error {
                    None => println!("{}: ok", report.cat),
                    Some(e) => println!("{}: invalid: {}", report.cat, e),
                },
            }
            if !report.valid {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
struct ValidationReport {
    cat: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Parse a Cat manifest and run the controller's validation on it.
fn validate_manifest(text: &str) -> Result<ValidationReport> {
    let cat: Cat = serde_yaml::from_str(text).context("parsing Cat manifest")?;
    let error = validate_cat(&cat).err().map(|e| e.to_string());
    Ok(ValidationReport { cat: ObjectKey::from_resource(&cat).to_string(), valid: error.is_none(), error })
}

async fn run(args: RunArgs, namespace: Option<String>) -> Result<()> {
    let config = args.config()?;
    let client = tabby_kubehub::client().await?;
    let cats: Store<Cat> = Store::new("Cat");
    let deployments: Store<Deployment> = Store::new("Deployment");

    let reconciler = Reconciler::new(
        Arc::new(cats.clone()),
        Arc::new(deployments.clone()),
        Arc::new(KubeDeployments::new(client.clone())),
        Arc::new(KubeCats::new(client.clone())),
        Arc::new(KubeRecorder::new(client.clone())),
    );
    let caches: Vec<Arc<dyn HasSynced>> = vec![Arc::new(cats.clone()), Arc::new(deployments.clone())];
    let controller = Controller::new(reconciler, caches, config);
    let shutdown = CancellationToken::new();

    // subscribe before the reflectors apply their first listing
    let router = controller.router(Arc::new(cats.clone()));
    let router_task = tokio::spawn(router.run(cats.subscribe(), deployments.subscribe(), shutdown.clone()));

    let ns = namespace.as_deref();
    info!(ns = ?ns, threads = args.threads, "starting watchers");
    spawn_reflector(reflect(scoped_api::<Cat>(client.clone(), ns), cats.clone()), "Cat");
    spawn_reflector(reflect(scoped_api::<Deployment>(client.clone(), ns), deployments.clone()), "Deployment");

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let result = controller.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = router_task.await {
        error!(error = %e, "router task failed");
    }
    result?;
    Ok(())
}

fn spawn_reflector(task: impl std::future::Future<Output = Result<()>> + Send + 'static, kind: &'static str) {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!(kind, error = %e, "watcher failed");
        }
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_manifest_passes() {
        let yaml = r#"
apiVersion: tabby.dev/v1alpha1
kind: Cat
metadata:
  name: billie
  namespace: ns1
spec:
  name: billie
  breed: maine-coone
"#;
        let report = validate_manifest(yaml).unwrap();
        assert!(report.valid);
        assert_eq!(report.cat, "ns1/billie");
    }

    #[test]
    fn empty_name_is_reported() {
        let yaml = "apiVersion: tabby.dev/v1alpha1\nkind: Cat\n\
                    metadata:\n  name: billie\n  namespace: ns1\n\
                    spec:\n  name: \"\"\n";
        let report = validate_manifest(yaml).unwrap();
        assert!(!report.valid);
        assert!(report.error.unwrap().contains("spec.name"));
    }

    #[test]
    fn unknown_breed_fails_to_parse() {
        let yaml = "apiVersion: tabby.dev/v1alpha1\nkind: Cat\n\
                    metadata:\n  name: billie\n\
                    spec:\n  name: billie\n  breed: sphynx\n";
        assert!(validate_manifest(yaml).is_err());
    }

    #[test]
    fn run_flags_map_to_controller_config() {
        let cfg = run_args(&["--threads", "4", "--backoff-max-secs", "30", "--cache-sync-timeout-secs", "0"])
            .config()
            .unwrap();
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.rate_limit.max_delay, Duration::from_secs(30));
        assert_eq!(cfg.rate_limit.base_delay, Duration::from_millis(5));
        assert!(cfg.cache_sync_timeout.is_none());
    }

    #[test]
    fn unusable_backoff_settings_are_rejected() {
        assert!(run_args(&["--backoff-multiplier=-2"]).config().is_err());
        assert!(run_args(&["--backoff-multiplier", "0.5"]).config().is_err());
        assert!(run_args(&["--qps", "1e-320"]).config().is_err());
        assert!(run_args(&["--qps", "0"]).config().is_ok());
    }

    fn run_args(flags: &[&str]) -> RunArgs {
        let argv = ["tabbyctl", "run"].iter().chain(flags);
        let cli = Cli::try_parse_from(argv).unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        args
    }
}
