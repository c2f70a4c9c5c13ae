use anyhow::{Context, bail};
use clap::Parser;
use log::{error, info, warn};
use splice_proxy::ca::{CertificateAuthority, ensure_root_files};
use splice_proxy::config::{Config, LogFormat, TunnelMode};
use splice_proxy::config_validation::ConfigValidator;
use splice_proxy::error::{ProxyError, describe_error};
use splice_proxy::headers::parse_header_arg;
use splice_proxy::logging::{CustomLogger, init_fallback, parse_log_format, parse_log_level};
use splice_proxy::monitoring::{log_final, spawn_reporter};
use splice_proxy::proxy::ProxyServer;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    version,
    about = "HTTP forward proxy that terminates CONNECT tunnels and injects request headers"
)]
struct Args {
    #[arg(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[arg(short, long, env = "PORT", help = "Port to listen on (next ports are tried if taken)")]
    port: Option<u16>,

    #[arg(long, env = "PROXY_HOST", value_name = "ADDR", help = "Address to bind")]
    host: Option<IpAddr>,

    #[arg(long, env = "CA_CERT_PATH", value_name = "FILE", help = "Root certificate PEM")]
    ca_cert: Option<PathBuf>,

    #[arg(long, env = "CA_KEY_PATH", value_name = "FILE", help = "Root private key PEM (PKCS#8 or PKCS#1 RSA)")]
    ca_key: Option<PathBuf>,

    #[arg(long, value_name = "MODE", help = "CONNECT handling: intercept or opaque")]
    tunnel_mode: Option<TunnelMode>,

    #[arg(
        short = 'H',
        long = "header",
        value_name = "NAME:VALUE",
        help = "Header to inject into forwarded requests (repeatable)"
    )]
    headers: Vec<String>,

    #[arg(long, help = "Create the root certificate if it does not exist")]
    init_ca: bool,

    #[arg(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[arg(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[arg(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[arg(long, help = "Log request headers after injection")]
    log_headers: bool,

    #[arg(long, value_name = "SECONDS", help = "Interval between statistics lines, 0 to disable")]
    stats_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    let validation = ConfigValidator::new(&config).validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("Suggestion: {}", suggestion);
    }
    if !validation.is_valid {
        for err in &validation.errors {
            error!("{}", err);
        }
        bail!("Invalid configuration: {}", validation.errors.join("; "));
    }

    if args.init_ca {
        let created = ensure_root_files(&config.ca_cert_path, &config.ca_key_path)
            .context("Failed to create the root certificate")?;
        if created {
            info!(
                "Install {} in your client's trust store to avoid certificate warnings",
                config.ca_cert_path.display()
            );
        }
    }

    let ca = CertificateAuthority::load(&config.ca_key_path, &config.ca_cert_path)
        .context("Cannot start without a root certificate (run with --init-ca to create one)")?
        .with_leaf_validity_days(config.leaf_validity_days);

    if !config.injected_headers.is_empty() {
        info!("Injecting {} header(s) into forwarded requests", config.injected_headers.len());
    }

    let server = ProxyServer::builder(config.clone(), Arc::new(ca))
        .bind()
        .await
        .context("Failed to start the proxy listener")?;
    info!("Root certificate download: http://{}/cert", server.local_addr());

    let stats = server.stats();
    let cache = server.leaf_cache();
    let shutdown = server.shutdown_token();
    let reporter = (config.stats_interval_secs > 0).then(|| {
        spawn_reporter(
            Arc::clone(&stats),
            Arc::clone(&cache),
            Duration::from_secs(config.stats_interval_secs),
            shutdown.clone(),
        )
    });

    let mut server_handle = tokio::spawn(server.run());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, shutting down gracefully...");
            shutdown.cancel();
            settle(server_handle.await.context("Server task panicked")?)?;
        }
        result = &mut server_handle => {
            shutdown.cancel();
            settle(result.context("Server task panicked")?)?;
        }
    }

    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    log_final(&stats, &cache);
    info!("Proxy server stopped");
    Ok(())
}

/// Fatal errors end the process with a failure; anything else is logged so
/// the final statistics still get written.
fn settle(result: Result<(), ProxyError>) -> anyhow::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e).context("Server error"),
        Err(e) => {
            error!("Server stopped after error: {}", describe_error(&e));
            Ok(())
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };

    config.apply_env()?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.listen_host = host;
    }
    if let Some(path) = &args.ca_cert {
        config.ca_cert_path = path.clone();
    }
    if let Some(path) = &args.ca_key {
        config.ca_key_path = path.clone();
    }
    if let Some(mode) = args.tunnel_mode {
        config.tunnel_mode = mode;
    }
    for header in &args.headers {
        let (name, value) = parse_header_arg(header)?;
        config.injected_headers.insert(name, value);
    }
    if args.log_headers {
        config.log_headers = true;
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval_secs = interval;
    }

    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> anyhow::Result<()> {
    let cli_level = args.log_level.as_deref().map(parse_log_level).transpose()?;
    let cli_format = args.log_format.as_deref().map(parse_log_format).transpose()?;

    match config.logging.clone() {
        Some(mut logging) => {
            if cli_level.is_some() {
                logging.level = cli_level;
            }
            if cli_format.is_some() {
                logging.format = cli_format;
            }
            CustomLogger::init(logging)?;
        }
        None => {
            let level = cli_level.unwrap_or_default().to_string();
            init_fallback(&level, cli_format.unwrap_or(LogFormat::Text))?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let mut sample = Config {
        listen_host: "127.0.0.1".parse()?,
        ..Config::default()
    };
    sample
        .injected_headers
        .insert("X-Proxy-Client".to_string(), "splice-proxy".to_string());
    sample.to_file(file_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_only_fails_on_fatal_errors() {
        assert!(settle(Ok(())).is_ok());
        assert!(settle(Err(ProxyError::Upstream("refused".into()))).is_ok());

        let err = settle(Err(ProxyError::BindConflict { first_port: 8080, last_port: 8089 }))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("All ports 8080-8089 are in use"));
    }
}
