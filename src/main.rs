//! tun-intercept: TUN capture with an in-stack DNS responder
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./tun-intercept
//!
//! # Run with custom configuration
//! sudo ./tun-intercept -c /path/to/config.json
//!
//! # Run with environment overrides
//! TUN_INTERCEPT_LOG_LEVEL=debug sudo ./tun-intercept
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::signal;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use tun_intercept::config::{load_config_with_env, Config};
use tun_intercept::{AdapterConfig, DnsHandler, TunAdapter, UpstreamForwarder};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/tun-intercept/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tun-intercept v{}", tun_intercept::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"tun-intercept v{}

TUN capture with an in-stack DNS responder.

USAGE:
    tun-intercept [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/tun-intercept/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    TUN_INTERCEPT_DEVICE         Override device locator (dev://name[?mtu=N] or fd://N)
    TUN_INTERCEPT_DNS_LISTEN     Override DNS listen address (host:port, port 0 disables)
    TUN_INTERCEPT_LOG_LEVEL      Override log level (trace, debug, info, warn, error)

REQUIREMENTS:
    - /dev/net/tun (Linux) or utun (macOS)
    - CAP_NET_ADMIN capability (or root) when opening by name

EXAMPLE:
    sudo tun-intercept -c /etc/tun-intercept/config.json
    ip addr add 198.18.0.1/16 dev tun0 && ip link set tun0 up
    dig @198.18.0.2 example.com
"#,
        tun_intercept::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["ipstack=warn", "tokio=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        tun_intercept::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration from {:?}: {}", args.config_path, e))?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("tun-intercept v{}", tun_intercept::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let adapter_config = AdapterConfig {
        stack: config.stack.stack_config(),
        dns: config.dns.service_config(),
    };
    let adapter = TunAdapter::open(&config.device, adapter_config)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", config.device, e))?;

    let resolver: Arc<dyn DnsHandler> = Arc::new(UpstreamForwarder::new(
        config.upstream.servers.clone(),
        config.upstream.timeout(),
    ));
    adapter.create_dns_server(Some(resolver), &config.dns.listen)?;

    // No proxy layer in the standalone binary: unclaimed flows are dropped
    let drain = adapter.unclaimed_flows().map(|mut rx| {
        tokio::spawn(async move {
            while let Some(flow) = rx.recv().await {
                debug!(id = %flow.id(), protocol = %flow.protocol(), "Dropping unclaimed flow");
            }
        })
    });

    info!(
        "Startup complete in {:.2}ms (device: {}, dns: {})",
        start_time.elapsed().as_secs_f64() * 1000.0,
        adapter.device_name(),
        adapter.dns_listen()
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    info!("Shutting down...");
    if let Some(stats) = adapter.dns_stats() {
        info!(
            "Final DNS stats: {} queries, {} responses, {} decode errors, {} flows timed out",
            stats.queries_received, stats.responses_written, stats.decode_errors, stats.flows_timed_out
        );
    }
    let stack_stats = adapter.stack_stats();
    info!(
        "Final stack stats: {} TCP flows, {} UDP flows, {} claimed, {} dropped",
        stack_stats.tcp_flows, stack_stats.udp_flows, stack_stats.flows_claimed, stack_stats.flows_dropped
    );

    adapter.close();
    if let Some(drain) = drain {
        drain.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
