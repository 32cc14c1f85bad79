use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use scslink_core::protocol::{
    list_ports, Address, ProtocolSession, ResponseCode, SerialTransport, SessionConfig, Transport,
    DEFAULT_BAUD_RATE,
};

/// SCS meter client
#[derive(Parser, Debug)]
#[command(name = "scslink", version, about = "Talk to SCS meters over a serial line")]
struct Cli {
    /// Session config file (JSON)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial port path
    #[arg(
        long,
        global = true,
        value_name = "PORT",
        env = "SCSLINK_PORT",
        default_value = "/dev/ttyUSB0"
    )]
    port: String,

    /// Baud rate (always 8N1)
    #[arg(
        long,
        global = true,
        value_name = "BAUD",
        env = "SCSLINK_BAUD",
        default_value_t = DEFAULT_BAUD_RATE
    )]
    baud: u32,

    /// Log protocol traffic at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,

    /// Wake the meter and print its identity
    Identify(LoginArgs),

    /// Read meter memory
    Upload(UploadArgs),

    /// Write a file into meter memory
    Download(DownloadArgs),
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Security code; log in after identifying
    #[arg(long, env = "SCSLINK_PASSWORD")]
    password: Option<String>,
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// First address (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_address)]
    start: Address,

    /// Bytes to read
    #[arg(long)]
    length: usize,

    /// Write the bytes here instead of printing a hex dump
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    #[command(flatten)]
    login: LoginArgs,
}

#[derive(Args, Debug)]
struct DownloadArgs {
    /// First address (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_address)]
    start: Address,

    /// File whose bytes are written
    #[arg(long, value_name = "FILE")]
    file: PathBuf,

    #[command(flatten)]
    login: LoginArgs,
}

fn parse_address(s: &str) -> Result<Address, String> {
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid address '{}': {}", s, e))?;
    Address::new(value).map_err(|e| e.to_string())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    match &cli.command {
        Commands::Ports => {
            for port in list_ports() {
                match (port.vid, port.pid) {
                    (Some(vid), Some(pid)) => println!(
                        "{}  {:04x}:{:04x}  {}",
                        port.name,
                        vid,
                        pid,
                        port.product.as_deref().unwrap_or("")
                    ),
                    _ => println!("{}", port.name),
                }
            }
            Ok(())
        }
        Commands::Identify(args) => {
            let mut session = connect(&cli, config, args)?;
            let stats = serde_json::to_string(&session.stats())?;
            println!("type:  {}", session.device_type());
            println!("id:    {}", session.device_id());
            println!("start: {}", session.meter_start_address());
            println!("stop:  {}", session.meter_stop_address());
            info!(%stats, "link stats");
            session.logout();
            Ok(())
        }
        Commands::Upload(args) => {
            let mut session = connect(&cli, config, &args.login)?;
            let mut buf = vec![0u8; args.length];
            check(session.upload(args.start, &mut buf)?, "upload")?;
            match &args.out {
                Some(path) => std::fs::write(path, &buf)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => hex_dump(args.start, &buf),
            }
            session.logout();
            Ok(())
        }
        Commands::Download(args) => {
            let data = std::fs::read(&args.file)
                .with_context(|| format!("reading {}", args.file.display()))?;
            let mut session = connect(&cli, config, &args.login)?;
            check(session.download(args.start, &data)?, "download")?;
            info!(bytes = data.len(), start = %args.start, "download complete");
            session.logout();
            Ok(())
        }
    }
}

/// Open the port, wake and identify the meter, and log in if asked to
fn connect(
    cli: &Cli,
    config: SessionConfig,
    login: &LoginArgs,
) -> Result<ProtocolSession<SerialTransport>> {
    let mut transport = SerialTransport::new(cli.baud);
    transport
        .open(&cli.port)
        .with_context(|| format!("opening {}", cli.port))?;

    let mut session = ProtocolSession::new(Arc::new(Mutex::new(transport)), config);
    check(session.wake_up()?, "wake up")?;
    check(session.identify()?, "identify")?;
    if let Some(password) = &login.password {
        check(session.security(password)?, "login")?;
    }
    Ok(session)
}

fn check(code: ResponseCode, what: &str) -> Result<()> {
    if !code.is_ack() {
        bail!("{} failed: meter answered {}", what, code);
    }
    Ok(())
}

fn hex_dump(start: Address, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        let bytes: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
        println!("{:06X}  {}", start.value() as usize + i * 16, bytes.join(" "));
    }
}
