use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use proxy_monitor::{
    database::{ProxyDatabase, ProxyStore},
    logging,
    proxy::{
        CheckScheduler, CheckerConfig, CountCache, ProxyCatalog, ProxyChecker, ProxyParser,
        ProxyType, RegisterRequest, Sort, StatsEngine,
    },
    Config, Error,
};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Keeps a catalog of proxies and continuously re-checks their health
#[derive(Parser)]
#[command(name = "proxy-monitor")]
#[command(about = "Keeps a catalog of proxies and continuously re-checks their health")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file path
    #[arg(short, long, env = "DATABASE_URL", default_value = "proxies.db")]
    database: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-check proxies in the background until interrupted
    Serve {
        /// Seconds between two checks
        #[arg(short, long, env = "CHECK_INTERVAL", default_value = "60")]
        interval: f64,
        /// Checker executable
        #[arg(long, env = "CHECKER_PATH", default_value = "proxyshiva")]
        checker: String,
        /// Let the checker skip reserved address ranges
        #[arg(long, env = "SKIP_RESERVED", default_value_t = true, action = ArgAction::Set)]
        skip_reserved: bool,
        /// Let the checker accept any TLS certificate
        #[arg(long, env = "ANY_CERT")]
        skip_cert: bool,
        /// Per-check timeout passed to the checker
        #[arg(long, env = "TIMEOUT")]
        timeout: Option<u64>,
    },
    /// Register every combination of schemes, addresses and ports
    Add {
        /// Schemes (http, https, socks4, socks5)
        #[arg(short, long = "scheme", default_value = "http", value_delimiter = ',')]
        schemes: Vec<String>,
        /// First address of the range
        #[arg(long)]
        from: Ipv4Addr,
        /// Last address of the range (defaults to --from)
        #[arg(long)]
        to: Option<Ipv4Addr>,
        /// Port or inclusive port range, e.g. 8080 or 8000-8080
        #[arg(short, long)]
        ports: String,
    },
    /// Register proxies written as scheme://address:port
    Import {
        /// Proxies to register
        proxies: Vec<String>,
        /// File with one proxy per line
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print one page of proxies as JSON
    List {
        /// Page index, starting at 0
        #[arg(default_value = "0")]
        page: u64,
        /// Only proxies with a successful check in the window
        #[arg(short, long)]
        good_only: bool,
        /// Sort key (recency, speed, uptime)
        #[arg(short, long, default_value = "recency")]
        sort: String,
        /// Sort order (asc, desc)
        #[arg(short, long, default_value = "desc")]
        order: String,
        /// Proxies per page
        #[arg(long, env = "PROXIES_PER_PAGE", default_value = "10")]
        page_size: u64,
    },
    /// Print the number of proxies
    Count {
        /// Only count good proxies
        #[arg(short, long)]
        good_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    let cli = Cli::parse();

    let mut config = Config {
        database_url: cli.database,
        ..Config::default()
    };

    let db = ProxyDatabase::new(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    let store: Arc<dyn ProxyStore> = Arc::new(db);
    let counts = Arc::new(CountCache::default());

    match cli.command {
        Commands::Serve {
            interval,
            checker,
            skip_reserved,
            skip_cert,
            timeout,
        } => {
            config.check_interval = Duration::try_from_secs_f64(interval)
                .map_err(|_| anyhow!("invalid check interval: {}", interval))?;
            config.checker = CheckerConfig::new()
                .with_program(checker)
                .with_skip_reserved(skip_reserved)
                .with_skip_cert(skip_cert)
                .with_timeout(timeout);

            serve(&config, store, counts).await?;
        }
        Commands::Add {
            schemes,
            from,
            to,
            ports,
        } => {
            let request = RegisterRequest {
                schemes: parse_schemes(&schemes)?,
                addresses: (from, to.unwrap_or(from)),
                ports: ProxyParser::parse_port_range(&ports)?,
            };
            let catalog = ProxyCatalog::new(store, counts, config.page_size);
            let summary = catalog.register(&request).await?;

            println!(
                "[{}] Registered {} proxies, skipped {} duplicates, {} failed",
                summary.http_status(),
                summary.inserted,
                summary.duplicates,
                summary.failed
            );
        }
        Commands::Import { proxies, file } => {
            let mut lines = proxies;
            if let Some(path) = file {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {:?}", path))?;
                lines.extend(content.lines().map(str::to_string));
            }

            let mut ids = Vec::new();
            for line in &lines {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    continue;
                }
                match ProxyParser::parse_url(trimmed) {
                    Some(id) => ids.push(id),
                    None => eprintln!("Skipping invalid proxy: {}", trimmed),
                }
            }

            let catalog = ProxyCatalog::new(store, counts, config.page_size);
            let summary = catalog.register_ids(ids).await;
            println!(
                "[{}] Registered {} proxies, skipped {} duplicates, {} failed",
                summary.http_status(),
                summary.inserted,
                summary.duplicates,
                summary.failed
            );
        }
        Commands::List {
            page,
            good_only,
            sort,
            order,
            page_size,
        } => {
            config.page_size = page_size;
            let catalog = ProxyCatalog::new(store, counts, config.page_size);
            let result = catalog
                .get_page(page, good_only, Sort::parse_or_default(&sort, &order))
                .await?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.proxies.is_empty() {
                eprintln!(
                    "[{}] No proxies on page {} of {}",
                    result.status.http_status(),
                    result.page,
                    result.total_pages
                );
            }
        }
        Commands::Count { good_only } => {
            let catalog = ProxyCatalog::new(store, counts, config.page_size);
            println!("{}", catalog.count(good_only).await?);
        }
    }

    Ok(())
}

async fn serve(config: &Config, store: Arc<dyn ProxyStore>, counts: Arc<CountCache>) -> Result<()> {
    let engine = Arc::new(StatsEngine::new(store.clone(), counts));

    let checker = match ProxyChecker::spawn(&config.checker, engine) {
        Ok(checker) => Arc::new(checker),
        Err(Error::CheckerNotFound(program)) => {
            error!(
                %program,
                "checker executable not found; install it or point --checker at it"
            );
            std::process::exit(1);
        }
        Err(err) => {
            error!(%err, "unknown critical error while starting the checker");
            std::process::exit(1);
        }
    };

    let scheduler = CheckScheduler::start(config.check_interval, store, checker.clone());
    info!(
        database = %config.database_url,
        checker_pid = ?checker.pid(),
        "proxy monitor running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    scheduler.stop();
    info!("proxy monitor shutting down");

    Ok(())
}

fn parse_schemes(schemes: &[String]) -> Result<Vec<ProxyType>> {
    schemes
        .iter()
        .map(|s| {
            s.parse::<ProxyType>()
                .map_err(|_| anyhow!("Invalid proxy type: {}. Use: http, https, socks4, socks5", s))
        })
        .collect()
}
