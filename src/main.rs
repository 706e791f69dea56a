use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use slimprox::mitm::CaMaterial;
use slimprox::{
    CompressResponder, ImageShrinkResponder, LimitBytesResponder, NoscriptResponder, Options,
    Proxy,
};

/// Bandwidth-reducing forward proxy with optional TLS interception.
#[derive(Debug, Parser)]
#[command(name = "slimprox", version)]
struct Cli {
    /// Proxy listen address(es)
    #[arg(long = "addr", value_name = "HOST:PORT")]
    addr: Vec<String>,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Skip upstream TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// Block the hosts found in this file, one per line or in /etc/hosts
    /// format (repeatable)
    #[arg(long = "block-hosts-file", value_name = "FILE")]
    block_hosts_file: Vec<PathBuf>,

    /// Man-in-the-middle for HTTP CONNECT connections (port 80)
    #[arg(long = "connect-mitm", default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    connect_mitm: bool,

    /// Man-in-the-middle for HTTPS CONNECT connections (port 443)
    #[arg(long = "https-mitm")]
    https_mitm: bool,

    /// CA certificate file for HTTPS MITM
    #[arg(long, value_name = "FILE")]
    cacert: Option<PathBuf>,

    /// CA private key file for HTTPS MITM
    #[arg(long, value_name = "FILE")]
    cakey: Option<PathBuf>,

    /// Proxy authentication, user:pass
    #[arg(long, value_name = "USER:PASS", default_value = "")]
    auth: String,

    /// Remove JavaScript from HTML content (only applies to CONNECT if
    /// MITM enabled)
    #[arg(long)]
    noscript: bool,

    /// Compress highly compressible content (only applies to CONNECT if
    /// MITM enabled)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    compress: bool,

    /// Limit content size in bytes to minimize excessive memory usage, 0
    /// disables (only applies to CONNECT if MITM enabled)
    #[arg(long = "limit-content", value_name = "BYTES", default_value_t = 1024 * 1024 * 100)]
    limit_content: i64,

    /// Make images/pictures smaller (only applies to CONNECT if MITM
    /// enabled)
    #[arg(long = "shrink-images")]
    shrink_images: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "slimprox=debug" } else { "slimprox=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut opts = Options {
        verbose: cli.verbose,
        addresses: cli.addr.clone(),
        insecure_skip_verify: cli.insecure,
        connect_mitm: cli.connect_mitm,
        https_mitm: cli.https_mitm,
        auth: cli.auth.clone(),
        ..Default::default()
    };
    if opts.addresses.is_empty() {
        opts.addresses.push("127.0.0.1:8080".to_string());
    }

    for path in &cli.block_hosts_file {
        let hosts = slimprox::load_hosts_file(path)
            .with_context(|| format!("--block-hosts-file {}", path.display()))?;
        opts.block_hosts.extend(hosts);
    }

    if cli.cacert.is_some() || cli.cakey.is_some() {
        if !cli.https_mitm {
            anyhow::bail!("--cacert and --cakey require --https-mitm");
        }
        let (Some(cacert), Some(cakey)) = (&cli.cacert, &cli.cakey) else {
            anyhow::bail!("--cacert and --cakey must be given together");
        };
        let ca = CaMaterial::from_pem_files(cacert, cakey).context("loading CA material")?;
        opts.ca = Some(Arc::new(ca));
    }

    let limiter = Arc::new(LimitBytesResponder::new());
    limiter.set_limit(cli.limit_content);

    let image_shrinker = Arc::new(ImageShrinkResponder::new());
    image_shrinker.toggle.set_enabled(cli.shrink_images);

    let noscript = Arc::new(NoscriptResponder::new());
    noscript.toggle.set_enabled(cli.noscript);

    let compressor = Arc::new(CompressResponder::new());
    compressor.toggle.set_enabled(cli.compress);

    let proxy = Arc::new(Proxy::new(opts)?);

    // The limiter goes first so untrusted byte counts are capped before
    // anything downstream buffers them; compression last, since its
    // output cannot feed the image or noscript stages.
    proxy.add_responder(limiter);
    proxy.add_responder(image_shrinker);
    proxy.add_responder(noscript);
    proxy.add_responder(compressor);

    tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                proxy.shutdown(Duration::from_secs(10));
            }
        }
    });

    proxy.listen_and_serve().await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
