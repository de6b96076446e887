//! extask worker daemon

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use extask_client::{HttpClientConfig, HttpLeaseClient, LeaseClient};
use extask_core::{BackoffPolicy, Topic, WorkerId};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use extask_worker::{
    http, ConfigError, EchoHandler, HandlerRegistry, PollLoop, RetryBudget, WorkerConfig,
    WorkerPool,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Polls an external task broker and runs the built-in echo handler on every
/// leased task.
#[derive(Parser, Debug)]
#[command(name = "extask-worker")]
#[command(about = "External task worker", long_about = None)]
struct Args {
    /// Broker API base URL
    #[arg(long, env = "EXTASK_BROKER_URL", default_value = "http://localhost:5601/abada/api/v1")]
    broker_url: String,

    /// Worker identity (generated when omitted)
    #[arg(long, env = "EXTASK_WORKER_ID")]
    worker_id: Option<String>,

    /// Topics to subscribe to
    #[arg(long, env = "EXTASK_TOPICS", value_delimiter = ',', required = true)]
    topics: Vec<String>,

    /// Poll loops to run, each with its own identity
    #[arg(long, env = "EXTASK_INSTANCES", default_value = "1")]
    instances: usize,

    /// Lock duration requested per fetch, in milliseconds
    #[arg(long, env = "EXTASK_LOCK_DURATION_MS", default_value = "10000")]
    lock_duration_ms: u64,

    /// Tasks claimed per fetch
    #[arg(long, env = "EXTASK_MAX_TASKS", default_value = "1")]
    max_tasks: u32,

    /// Tasks processed at the same time per loop
    #[arg(long, env = "EXTASK_MAX_CONCURRENCY", default_value = "4")]
    max_concurrency: usize,

    /// Delay after an empty poll, in milliseconds
    #[arg(long, env = "EXTASK_POLL_INTERVAL_MS", default_value = "2000")]
    poll_interval_ms: u64,

    /// Grow the idle delay exponentially up to this value, in milliseconds
    #[arg(long, env = "EXTASK_IDLE_BACKOFF_MAX_MS")]
    idle_backoff_max_ms: Option<u64>,

    /// First delay after a failed poll, in milliseconds
    #[arg(long, env = "EXTASK_ERROR_BACKOFF_MS", default_value = "5000")]
    error_backoff_ms: u64,

    /// Longest delay after repeated failed polls, in milliseconds
    #[arg(long, env = "EXTASK_ERROR_BACKOFF_MAX_MS", default_value = "60000")]
    error_backoff_max_ms: u64,

    /// Lease time kept free for the outcome call, in milliseconds
    #[arg(long, env = "EXTASK_REPORT_MARGIN_MS", default_value = "2000")]
    report_margin_ms: u64,

    /// Retries requested on failure when the broker sends no countdown
    #[arg(long, env = "EXTASK_DEFAULT_RETRIES", default_value = "0")]
    default_retries: u32,

    /// Delay before a failed task is retried, in milliseconds
    #[arg(long, env = "EXTASK_RETRY_TIMEOUT_MS", default_value = "1000")]
    retry_timeout_ms: u64,

    /// Attempts per outcome call while the broker is unreachable
    #[arg(long, env = "EXTASK_REPORT_ATTEMPTS", default_value = "3")]
    report_attempts: u32,

    /// Time in-flight tasks get after a stop signal, in milliseconds
    #[arg(long, env = "EXTASK_SHUTDOWN_GRACE_MS", default_value = "5000")]
    shutdown_grace_ms: u64,

    /// Timeout of complete/failure calls, in milliseconds
    #[arg(long, env = "EXTASK_REQUEST_TIMEOUT_MS", default_value = "10000")]
    request_timeout_ms: u64,

    /// How long the broker may hold a fetch open, in milliseconds
    #[arg(long, env = "EXTASK_LONG_POLL_TIMEOUT_MS", default_value = "30000")]
    long_poll_timeout_ms: u64,

    /// Serve /health and /metrics on this address
    #[arg(long, env = "EXTASK_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, env = "EXTASK_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Args {
    fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            long_poll_timeout: Duration::from_millis(self.long_poll_timeout_ms),
            ..HttpClientConfig::default()
        }
    }

    fn worker_configs(&self) -> Result<Vec<WorkerConfig>, ConfigError> {
        let topics = self
            .topics
            .iter()
            .map(|t| Topic::parse(t))
            .collect::<Result<Vec<_>, _>>()?;

        let poll_interval = Duration::from_millis(self.poll_interval_ms);
        let idle_backoff = match self.idle_backoff_max_ms {
            Some(max) => BackoffPolicy::exponential(poll_interval, 2.0, Duration::from_millis(max))
                .with_jitter(0.1),
            None => BackoffPolicy::fixed(poll_interval),
        };
        let error_backoff = BackoffPolicy::exponential(
            Duration::from_millis(self.error_backoff_ms),
            2.0,
            Duration::from_millis(self.error_backoff_max_ms),
        )
        .with_jitter(0.2);

        let base_id = match &self.worker_id {
            Some(id) => WorkerId::new(id.trim()),
            None => WorkerId::generate(),
        };

        let instances = self.instances.max(1);
        let configs = (0..instances)
            .map(|n| {
                let worker_id = if instances == 1 {
                    base_id.clone()
                } else {
                    WorkerId::new(format!("{base_id}-{n}"))
                };
                let mut config = WorkerConfig::new(worker_id, topics.clone())
                    .with_lock_duration(Duration::from_millis(self.lock_duration_ms))
                    .with_limits(self.max_tasks, self.max_concurrency)
                    .with_backoff(idle_backoff.clone(), error_backoff.clone())
                    .with_report_margin(Duration::from_millis(self.report_margin_ms));
                config.retry = RetryBudget {
                    default_retries: self.default_retries,
                    retry_backoff: BackoffPolicy::fixed(Duration::from_millis(
                        self.retry_timeout_ms,
                    )),
                };
                config.report_attempts = self.report_attempts;
                config.shutdown_grace = Duration::from_millis(self.shutdown_grace_ms);
                config
            })
            .collect();
        Ok(configs)
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("extask=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let configs = args.worker_configs()?;
    let http_client = HttpLeaseClient::with_config(&args.broker_url, args.client_config());

    info!(
        broker = %http_client.base_url(),
        topics = ?args.topics,
        instances = configs.len(),
        "Starting extask worker"
    );

    match http_client.health().await {
        Ok(true) => info!("Broker is healthy"),
        Ok(false) => warn!("Broker health check did not succeed"),
        Err(e) => warn!(error = %e, "Broker health check failed"),
    }

    let client: Arc<dyn LeaseClient> = Arc::new(http_client);
    let handlers = Arc::new(HandlerRegistry::new().with_fallback(Arc::new(EchoHandler)));
    let loops = configs
        .into_iter()
        .map(|config| PollLoop::new(config, client.clone(), handlers.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(loops, shutdown.clone());

    let server = match args.metrics_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            Some(tokio::spawn(http::serve(
                listener,
                pool.metrics(),
                shutdown.clone(),
            )))
        }
        None => None,
    };

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, finishing in-flight tasks");
        trigger.cancel();
    });

    let results = pool.join().await;
    shutdown.cancel();

    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Metrics server error"),
            Err(e) => error!(error = %e, "Metrics server task failed"),
        }
    }

    let mut failure = None;
    for (worker_id, result) in results {
        match result {
            Ok(summary) => info!(
                worker_id = %worker_id,
                completed = summary.completed,
                business_failures = summary.business_failures,
                technical_errors = summary.technical_errors,
                lease_lost = summary.lease_lost,
                report_failures = summary.report_failures,
                "Worker stopped"
            ),
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Worker failed");
                failure = Some(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
