//! FeedKit Smoke Harness
//!
//! Registers a cache controller against a live origin, sends it the build
//! version, then fetches a list of paths through it and prints one JSON line
//! per result. Useful for checking pre-warm, routing and offline fallback
//! against a real deployment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use feedkit_common::{init_logging, FeedKitError, LogConfig, LogFormat};
use feedkit_net::{
    Connectivity, Fetcher, LoaderConfig, NetworkStatus, Request, ResourceLoader, ResponseSource,
};
use feedkit_sw::{
    CacheBackend, CacheStorage, ControllerConfig, ControllerEnv, FetchOutcome, RegisterOutcome,
    RegistrationOptions, ServiceWorkerContainer,
};
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;

/// Parse command line arguments
struct Args {
    origin: String,
    version: Option<String>,
    config: Option<PathBuf>,
    snapshot: Option<PathBuf>,
    log_format: LogFormat,
    log_filter: Option<String>,
    verbose: bool,
    offline: bool,
    paths: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        Self::parse_from(std::env::args().skip(1)).unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        })
    }

    fn parse_from(args: impl IntoIterator<Item = String>) -> Result<Self, FeedKitError> {
        let mut args = args.into_iter();
        let mut origin = "http://localhost:3000".to_string();
        let mut version = None;
        let mut config = None;
        let mut snapshot = None;
        let mut log_format = LogFormat::Pretty;
        let mut log_filter = None;
        let mut verbose = false;
        let mut offline = false;
        let mut paths = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--origin" => {
                    if let Some(val) = args.next() {
                        origin = val;
                    }
                }
                "--version" => {
                    version = args.next();
                }
                "--config" => {
                    config = args.next().map(PathBuf::from);
                }
                "--snapshot" => {
                    snapshot = args.next().map(PathBuf::from);
                }
                "--log-format" => {
                    if let Some(val) = args.next() {
                        log_format = val.parse()?;
                    }
                }
                "--log-filter" => {
                    log_filter = args.next();
                }
                "--verbose" => {
                    verbose = true;
                }
                "--offline" => {
                    offline = true;
                }
                other if !other.starts_with("--") => {
                    paths.push(other.to_string());
                }
                _ => {}
            }
        }

        if paths.is_empty() {
            paths = vec![
                "/".to_string(),
                "/globals.css".to_string(),
                "/offline.html".to_string(),
            ];
        }

        Ok(Self {
            origin,
            version,
            config,
            snapshot,
            log_format,
            log_filter,
            verbose,
            offline,
            paths,
        })
    }
}

/// Paths without an extension are fetched as page navigations.
fn build_request(url: Url) -> Request {
    let is_page = url
        .path()
        .rsplit('/')
        .next()
        .map_or(true, |segment| !segment.contains('.'));
    if is_page {
        Request::navigate(url)
    } else {
        Request::get(url)
    }
}

fn source_name(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::Synthesized => "synthesized",
    }
}

async fn load_storage(snapshot: Option<&PathBuf>) -> Result<CacheStorage, FeedKitError> {
    match snapshot {
        Some(path) if path.exists() => Ok(CacheStorage::load_snapshot(path).await?),
        _ => Ok(CacheStorage::new()),
    }
}

async fn run(args: &Args) -> Result<bool, FeedKitError> {
    let origin = Url::parse(&args.origin)
        .map_err(|e| FeedKitError::config_with_source("invalid --origin", e))?;
    let scope = origin
        .join("/")
        .map_err(|e| FeedKitError::config_with_source("invalid --origin", e))?;
    let script_url = origin
        .join("/sw.js")
        .map_err(|e| FeedKitError::config_with_source("invalid --origin", e))?;

    let config = match &args.config {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };

    let loader: Arc<dyn Fetcher> = Arc::new(ResourceLoader::new(LoaderConfig::default())?);
    let status = Arc::new(NetworkStatus::unknown());
    if args.offline {
        status.set_online(false);
    }
    let storage = Arc::new(load_storage(args.snapshot.as_ref()).await?);

    let env = ControllerEnv::new(
        Arc::clone(&loader),
        Arc::clone(&status) as Arc<dyn Connectivity>,
        Arc::clone(&storage) as Arc<dyn CacheBackend>,
    );
    let (container, _events) = ServiceWorkerContainer::new(config, env);

    if let Some(version) = &args.version {
        let message = json!({ "type": "SET_BUILD_VERSION", "version": version }).to_string();
        container.post_message(scope.as_str(), &message).await?;
    } else {
        warn!("No --version given, the controller will install cold");
    }

    let script = format!("feedkit-smoke {}", args.version.as_deref().unwrap_or_default());
    let outcome = container
        .register(script_url.as_str(), &script, RegistrationOptions::default())
        .await?;
    match &outcome {
        RegisterOutcome::Installed {
            controller,
            install,
            activate,
        } => println!(
            "{}",
            json!({
                "event": "registered",
                "controller": controller.to_string(),
                "version": install.version,
                "cached": install.cached,
                "failed": install.failed,
                "deleted": activate.deleted,
            })
        ),
        other => info!(?other, "Registration did not install a new controller"),
    }

    let mut failures = 0usize;
    for path in &args.paths {
        let url = origin
            .join(path)
            .map_err(|e| FeedKitError::InvalidArgument(format!("{}: {}", path, e)))?;
        let start = Instant::now();

        let (route, result) = match container.handle_fetch(None, build_request(url.clone())).await {
            FetchOutcome::Respond(response) => ("intercepted", Ok(response)),
            FetchOutcome::NetworkError(err) => ("intercepted", Err(err)),
            FetchOutcome::PassThrough => ("pass-through", loader.fetch(Request::get(url)).await),
        };

        let line = match result {
            Ok(response) => json!({
                "path": path,
                "route": route,
                "status": response.status.as_u16(),
                "source": source_name(response.source),
                "bytes": response.body.len(),
                "elapsed_ms": start.elapsed().as_millis(),
            }),
            Err(err) => {
                failures += 1;
                json!({
                    "path": path,
                    "route": route,
                    "error": err.to_string(),
                    "elapsed_ms": start.elapsed().as_millis(),
                })
            }
        };
        println!("{}", line);
    }

    if let Some(controller) = container.active_controller(scope.as_str()).await {
        for _ in 0..100 {
            if controller.pending_revalidations() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    if let Some(path) = &args.snapshot {
        storage.save_snapshot(path).await?;
        info!(path = %path.display(), "Saved cache snapshot");
    }

    Ok(failures == 0)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut log_config = if args.verbose {
        LogConfig::debug()
    } else if args.log_format == LogFormat::Json {
        LogConfig::production()
    } else {
        LogConfig::default()
    }
    .with_format(args.log_format);
    if let Some(filter) = &args.log_filter {
        log_config = log_config.with_filter(filter.as_str());
    }

    if let Err(e) = init_logging(log_config) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    info!(
        origin = %args.origin,
        version = ?args.version,
        offline = args.offline,
        paths = args.paths.len(),
        "Starting FeedKit smoke harness"
    );

    match run(&args).await {
        Ok(true) => println!("{}", json!({ "status": "pass" })),
        Ok(false) => {
            println!("{}", json!({ "status": "fail", "reason": "fetch_errors" }));
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, category = e.category(), "Smoke run failed");
            println!("{}", json!({ "status": "fail", "reason": e.to_string() }));
            std::process::exit(1);
        }
    }
}
