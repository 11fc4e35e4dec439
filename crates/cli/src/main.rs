use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tether_convert::{ConversionReview, Converter};
use tether_core::{ConditionType, ControllerConfig, Kind, Reference};
use tether_kubehub::{KubeEvents, KubeStore};
use tether_reconcile::{Controller, Reconciler};
use tether_remote::HttpConnector;
use tether_resolve::{extract, ExtractFn, ResolutionRequest, Resolver};
use tether_store::Store;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether DevOps resource controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all for run/ls, current context otherwise)
    #[arg(long = "ns", global = true, env = "TETHER_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run controllers until interrupted
    Run {
        /// Kinds to reconcile (default: every managed kind)
        #[arg(long = "kinds", value_delimiter = ',')]
        kinds: Vec<String>,
        #[arg(long = "workers", env = "TETHER_WORKERS")]
        workers: Option<usize>,
        #[arg(long = "poll-secs", env = "TETHER_POLL_SECS", value_parser = clap::value_parser!(u64).range(1..))]
        poll_secs: Option<u64>,
        #[arg(long = "base-delay-ms", env = "TETHER_BASE_DELAY_MS")]
        base_delay_ms: Option<u64>,
        #[arg(long = "max-delay-secs", env = "TETHER_MAX_DELAY_SECS", value_parser = clap::value_parser!(u64).range(1..))]
        max_delay_secs: Option<u64>,
        #[arg(long = "pass-timeout-secs", env = "TETHER_PASS_TIMEOUT_SECS", value_parser = clap::value_parser!(u64).range(1..))]
        pass_timeout_secs: Option<u64>,
    },
    /// Answer a ConversionReview read from a JSON or YAML file
    Convert {
        #[arg(long = "file")]
        file: PathBuf,
    },
    /// List objects of a kind with readiness and external id
    Ls {
        /// Kind name or plural, e.g. "GitRepository" or "pipelines"
        kind: String,
    },
    /// Show the external id and name a reference resolves to
    Resolve { kind: String, name: String },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_kinds(raw: &[String]) -> Result<Vec<Kind>> {
    if raw.is_empty() {
        return Ok(Kind::managed().collect());
    }
    raw.iter().map(|s| Kind::from_str(s.trim()).map_err(|e| anyhow!(e))).collect()
}

fn read_review(file: &Path) -> Result<ConversionReview> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let yaml = matches!(file.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
    if yaml {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {} as YAML", file.display()))
    } else {
        serde_json::from_str(&text).with_context(|| format!("parsing {} as JSON", file.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Run { kinds, workers, poll_secs, base_delay_ms, max_delay_secs, pass_timeout_secs } => {
            let mut cfg = ControllerConfig::from_env();
            cfg.namespace = cli.namespace.clone();
            if let Some(n) = workers {
                cfg.workers = n.max(1);
            }
            if let Some(s) = poll_secs {
                cfg.poll_interval = Duration::from_secs(s);
            }
            if let Some(ms) = base_delay_ms {
                cfg.base_delay = Duration::from_millis(ms);
            }
            if let Some(s) = max_delay_secs {
                cfg.max_delay = Duration::from_secs(s);
            }
            if let Some(s) = pass_timeout_secs {
                cfg.pass_timeout = Duration::from_secs(s);
            }
            let kinds = parse_kinds(&kinds)?;
            info!(?kinds, workers = cfg.workers, poll = ?cfg.poll_interval, ns = ?cfg.namespace, "run invoked");

            let store = Arc::new(KubeStore::try_default().await?);
            let events = Arc::new(KubeEvents::new(store.client().clone(), std::env::var("POD_NAME").ok()));
            let connector = Arc::new(HttpConnector::new()?);
            let reconciler = Arc::new(Reconciler::new(store.clone(), store, connector, events, cfg));

            let shutdown = CancellationToken::new();
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                match signal::ctrl_c().await {
                    Ok(()) => info!("interrupt received; draining"),
                    Err(e) => error!(error = %e, "signal handler failed; shutting down"),
                }
                on_signal.cancel();
            });
            Controller::new(reconciler).run(kinds, shutdown).await?;
        }
        Commands::Convert { file } => {
            let review = read_review(&file)?;
            let store = Arc::new(KubeStore::try_default().await?);
            let out = tether_convert::review(&Converter::new(store), review).await;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
                Output::Human => {
                    let resp = out.response.ok_or_else(|| anyhow!("review produced no response"))?;
                    println!("{} • {} • {} objects", resp.uid, resp.result.status, resp.converted_objects.len());
                    if let Some(msg) = resp.result.message {
                        println!("{}", msg);
                    }
                }
            }
        }
        Commands::Ls { kind } => {
            let kind = Kind::from_str(&kind)?;
            info!(kind = kind.as_str(), ns = ?ns, "ls invoked");
            let store = KubeStore::try_default().await?;
            let objs = store.list(kind, ns, None).await?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&objs)?),
                Output::Human => {
                    println!("{:<20} {:<32} {:<8} {:<38} REASON", "NAMESPACE", "NAME", "READY", "EXTERNAL-ID");
                    for o in objs {
                        let ready = o.status.condition(ConditionType::Ready);
                        println!(
                            "{:<20} {:<32} {:<8} {:<38} {}",
                            o.metadata.namespace.as_deref().unwrap_or("-"),
                            o.metadata.name,
                            if o.is_ready() { "True" } else { "False" },
                            o.status.external_id.as_deref().unwrap_or("-"),
                            ready.map(|c| c.reason.as_str()).unwrap_or("-"),
                        );
                    }
                }
            }
        }
        Commands::Resolve { kind, name } => {
            let kind = Kind::from_str(&kind)?;
            let resolver = Resolver::new(Arc::new(KubeStore::try_default().await?));
            let r = Reference { name: name.clone(), namespace: ns.map(|s| s.to_string()) };
            let req = |extract: ExtractFn| ResolutionRequest {
                current_value: None,
                reference: Some(&r),
                selector: None,
                target_kind: kind,
                namespace: ns,
                extract,
            };
            let id = resolver.resolve(&req(extract::external_id)).await?;
            let external_name = resolver.resolve(&req(extract::external_name)).await.ok().map(|res| res.resolved_value);
            match cli.output {
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "kind": kind.as_str(),
                        "name": name,
                        "externalId": id.resolved_value,
                        "externalName": external_name,
                    }))?
                ),
                Output::Human => {
                    println!("{}/{} • id {} • name {}", kind, name, id.resolved_value, external_name.as_deref().unwrap_or("-"))
                }
            }
        }
    }

    Ok(())
}
