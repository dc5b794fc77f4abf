//! tlsmux - Main entry point
//!
//! Serves HTTPS for `*.local.dev` style hosts and forwards each request to a
//! local port picked from its subdomain. `tlsmux setup` creates the
//! certificate the proxy presents.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tlsmux::certificate::{parse_start_date, validity_days, DEFAULT_HOSTS, DEFAULT_RSA_BITS};
use tlsmux::proxy::DEFAULT_TLS_PORT;
use tlsmux::{
    CertificateManager, CertificateRequest, Curve, KeySpec, ProxyConfig, ProxyServer,
    SelfSignedAuthority,
};
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// tlsmux - A very simple HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "tlsmux")]
#[command(author = "tlsmux Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A very simple HTTPS reverse proxy for local development")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the certificate used by the proxy
    Setup(SetupArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Mappings of subdomains to ports, e.g. '*:3000,someapp:4000'
    #[arg(short = 'm', long = "map", env = "TLSMUX_MAP")]
    mappings: Option<String>,

    /// Path to the certificate [default: ~/.tlsmux/cert.pem]
    #[arg(long, env = "TLSMUX_CERT")]
    cert: Option<PathBuf>,

    /// Path to the certificate key [default: ~/.tlsmux/key.pem]
    #[arg(long, env = "TLSMUX_KEY")]
    key: Option<PathBuf>,

    /// TLS listening port
    #[arg(long, env = "TLSMUX_SPORT", default_value_t = DEFAULT_TLS_PORT)]
    sport: u16,

    /// Plain HTTP listening port, 0 disables it
    #[arg(long, env = "TLSMUX_PORT", default_value_t = 0)]
    port: u16,
}

#[derive(Args, Debug)]
struct SetupArgs {
    /// Comma-separated hostnames and IPs to generate a certificate for
    #[arg(long, default_value = DEFAULT_HOSTS)]
    host: String,

    /// Directory to write cert.pem and key.pem to [default: ~/.tlsmux]
    #[arg(long)]
    path: Option<PathBuf>,

    /// Creation date formatted as 'Jan 1 15:04:05 2011' (UTC)
    #[arg(long)]
    start_date: Option<String>,

    /// Number of days the certificate is valid for
    #[arg(long, default_value_t = 365)]
    duration: u64,

    /// Whether this cert should be its own Certificate Authority
    #[arg(long)]
    ca: bool,

    /// Size of RSA key to generate. Ignored if --ecdsa-curve is set
    #[arg(long, default_value_t = DEFAULT_RSA_BITS)]
    rsa_bits: usize,

    /// ECDSA curve to use to generate a key. Valid values are P224, P256, P384, P521
    #[arg(long)]
    ecdsa_curve: Option<Curve>,
}

fn default_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tlsmux")
}

/// `RUST_LOG` directives, when set and valid, override `--log-level`
fn log_filter(rust_log: Option<&str>, level: &str) -> EnvFilter {
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::default().add_directive(LevelFilter::from_level(log_level).into()))
}

fn init_logging(level: &str) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    FmtSubscriber::builder()
        .with_env_filter(log_filter(rust_log.as_deref(), level))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

fn setup(args: SetupArgs) -> Result<()> {
    let dir = args.path.unwrap_or_else(default_dir);
    let manager = CertificateManager::in_dir(&dir);

    let mut request = CertificateRequest::new(&args.host);
    request.valid_from = args.start_date.as_deref().map(parse_start_date).transpose()?;
    request.valid_for = validity_days(args.duration)?;
    request.is_ca = args.ca;
    request.key = KeySpec::from_options(args.rsa_bits, args.ecdsa_curve);

    info!("Generating certificates in {}", dir.display());
    manager.generate(&SelfSignedAuthority, &request)?;

    Ok(())
}

async fn serve(args: ServeArgs) -> Result<()> {
    let dir = default_dir();
    let defaults = CertificateManager::in_dir(&dir);
    let certificates = CertificateManager::new(
        args.cert.unwrap_or_else(|| defaults.cert_path().to_path_buf()),
        args.key.unwrap_or_else(|| defaults.key_path().to_path_buf()),
    );

    let mut config = ProxyConfig::new(args.mappings.unwrap_or_default(), &certificates);
    config.tls_port = args.sport;
    config.http_port = Some(args.port);

    let server = ProxyServer::initialize(config)?;

    info!("tlsmux started");

    server.run().await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Some(Command::Setup(args)) => setup(args),
        None => serve(cli.serve).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_becomes_filter() {
        assert_eq!(log_filter(None, "debug").to_string(), "debug");
        assert_eq!(log_filter(None, "nonsense").to_string(), "info");
    }

    #[test]
    fn test_rust_log_overrides_level() {
        assert_eq!(log_filter(Some("tlsmux=trace"), "info").to_string(), "tlsmux=trace");
        assert_eq!(log_filter(Some("tlsmux=loud"), "warn").to_string(), "warn");
    }
}
