use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use nota_core::config::{OtaConfig, StorageBackend};
use nota_core::protocol::constants::{DEFAULT_PORT, DISCOVERY_PORT};
use nota_core::{OtaService, ReplyFormat, StdHost, TcpPort, UpdateKind, Uploader, probe};
use tracing::{error, info, warn};

/// Idle pause between service ticks.
const TICK_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Parser, Debug)]
#[command(author, version, about = "NOTA over-the-air update tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an OTA endpoint on this machine
    Serve(ServeArgs),
    /// Push an image to an endpoint
    Upload(UploadArgs),
    /// Find endpoints on the local network
    Discover {
        /// Seconds to wait for replies
        #[arg(short, long, default_value_t = 3)]
        timeout: u64,

        /// Probe destination
        #[arg(long, default_value_t = SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT)))]
        target: SocketAddr,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    /// Buffer the image and verify its MD5 before committing
    Verifying,
    /// Program a staging region, copy it over on success
    Staged,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    platform: Option<String>,

    #[arg(long)]
    board: Option<String>,

    #[arg(long)]
    fw_version: Option<String>,

    /// Require this password
    #[arg(long)]
    password: Option<String>,

    /// Require the password with this MD5
    #[arg(long, conflicts_with = "password")]
    password_hash: Option<String>,

    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Where the committed program image is written
    #[arg(long)]
    image: Option<String>,

    /// Where the committed filesystem image is written
    #[arg(long)]
    fs_image: Option<String>,

    /// Largest accepted image in bytes
    #[arg(long)]
    capacity: Option<usize>,

    /// Keep running after a successful update
    #[arg(long)]
    no_reboot: bool,

    /// Answer discovery probes
    #[arg(long)]
    discovery: bool,

    /// Advertise only protocol, hostname and platform
    #[arg(long)]
    legacy_reply: bool,
}

#[derive(clap::Args, Debug)]
struct UploadArgs {
    /// Device address
    ip: String,

    /// Image to send
    file: PathBuf,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Device password
    #[arg(short, long)]
    auth: Option<String>,

    /// Send a filesystem image instead of firmware
    #[arg(long)]
    fs: bool,

    /// Only check the password, do not upload
    #[arg(long, requires = "auth")]
    test_auth: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match args.command {
        Command::Serve(serve_args) => serve(serve_args),
        Command::Upload(upload_args) => upload(upload_args),
        Command::Discover { timeout, target } => discover(target, timeout),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &ServeArgs) -> Result<OtaConfig> {
    let mut config = match &args.config {
        Some(path) => OtaConfig::load_from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => OtaConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    for (field, value) in [
        (&mut config.hostname, &args.hostname),
        (&mut config.platform, &args.platform),
        (&mut config.board, &args.board),
        (&mut config.firmware_version, &args.fw_version),
    ] {
        if let Some(value) = value {
            *field = value.clone();
        }
    }
    if args.password.is_some() {
        config.password = args.password.clone();
    }
    if args.password_hash.is_some() {
        config.password = None;
        config.password_hash = args.password_hash.clone();
    }
    if let Some(backend) = args.backend {
        config.storage.backend = match backend {
            Backend::Verifying => StorageBackend::Verifying,
            Backend::Staged => StorageBackend::Staged,
        };
    }
    if args.image.is_some() {
        config.storage.image_path = args.image.clone();
    }
    if args.fs_image.is_some() {
        config.storage.filesystem_path = args.fs_image.clone();
    }
    if let Some(capacity) = args.capacity {
        config.storage.capacity = capacity;
    }
    if args.no_reboot {
        config.reboot_on_success = false;
    }
    if args.discovery {
        config.discovery = true;
    }
    if args.legacy_reply {
        config.reply_format = ReplyFormat::Legacy;
    }
    Ok(config)
}

fn serve(args: ServeArgs) -> Result<()> {
    let config = load_config(&args)?;
    let host = StdHost::new();
    let reboot = host.reboot_flag();

    let mut ota = OtaService::new(TcpPort::new(), config.storage.build(), host);
    ota.apply_config(&config);
    ota.begin()?;
    info!(
        hostname = %ota.hostname(),
        port = ota.settings().port,
        backend = ?config.storage.backend,
        "Serving OTA updates"
    );

    while !reboot.load(Ordering::SeqCst) {
        ota.tick()?;
        thread::sleep(TICK_INTERVAL);
    }
    info!("Update applied, exiting for restart");
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn upload(args: UploadArgs) -> Result<()> {
    let image = std::fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    if image.is_empty() {
        bail!("{} is empty", args.file.display());
    }
    let kind = if args.fs {
        UpdateKind::Filesystem
    } else {
        UpdateKind::Flash
    };
    let name = file_name(&args.file);

    let mut uploader = Uploader::new(&args.ip).with_port(args.port);
    if let Some(password) = &args.auth {
        uploader = uploader.with_password(password);
    }

    if args.test_auth {
        if uploader.check_auth(&name, &image, kind)? {
            info!("Password accepted");
        } else {
            warn!("Device does not require a password");
        }
        return Ok(());
    }

    info!(file = %name, size = image.len(), %kind, "Uploading");
    let mut last_pct = u64::MAX;
    let report = uploader.upload(&name, &image, kind, |sent, total| {
        let pct = sent * 100 / total.max(1);
        if pct / 10 != last_pct / 10 {
            info!(sent, total, "{}%", pct);
            last_pct = pct;
        }
    })?;
    info!(
        bytes = report.bytes,
        md5 = %report.digest,
        device = %report.metadata,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Upload complete"
    );
    Ok(())
}

fn discover(target: SocketAddr, timeout: u64) -> Result<()> {
    let found = probe(target, Duration::from_secs(timeout))?;
    if found.is_empty() {
        warn!("No endpoints answered");
    }
    for (from, reply) in found {
        println!(
            "{}:{}\t{}\t{}\t{}\tv{}\tnota {}\t{}",
            reply.ip, reply.port, reply.n, reply.p, reply.b, reply.v, reply.nota, from
        );
    }
    Ok(())
}
