// A command line TFTP client.
//
//   tftp get <host> <remote> [local]
//   tftp put <host> <local> [remote]
//
// Downloads are written to a local file as they arrive. A failed download leaves whatever had
// arrived in place, since the transfer cannot be resumed anyway.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tftp_client::client::{DEFAULT_MAX_TIMEOUTS, DEFAULT_TIMEOUT};
use tftp_client::tftp::DEFAULT_PORT;
use tftp_client::{ClientConfig, FileMode, TftpClient};

#[derive(Parser)]
#[command(name = "tftp")]
#[command(about = "Trivial File Transfer Protocol client", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Milliseconds to wait for each reply before retransmitting
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64, value_name = "MS")]
    timeout: u64,

    /// Timeouts in a row before giving up
    #[arg(short, long, default_value_t = DEFAULT_MAX_TIMEOUTS)]
    retries: u32,

    /// Milliseconds to keep answering a repeated final block after a download
    #[arg(long, default_value_t = 0, value_name = "MS")]
    linger: u64,

    /// Transfer in netascii mode instead of octet
    #[arg(short, long)]
    ascii: bool,

    /// Log every packet
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file from the server
    Get {
        host: String,
        /// File name on the server
        remote: String,
        /// Where to write it (defaults to the remote name)
        local: Option<PathBuf>,
    },
    /// Upload a file to the server
    Put {
        host: String,
        /// File to send
        local: PathBuf,
        /// Name to store it under (defaults to the local file name)
        remote: Option<String>,
    },
}

/// Binds on the wildcard address of the same family as the server.
fn local_ip_for(server: IpAddr) -> IpAddr {
    match server {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn remote_name(local: &Path) -> Result<String> {
    local
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("can't derive a remote name from {}", local.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = ClientConfig {
        port: cli.port,
        timeout: Duration::from_millis(cli.timeout),
        max_timeouts: cli.retries,
        linger: Duration::from_millis(cli.linger),
    };
    let mode = if cli.ascii { FileMode::NetAscii } else { FileMode::Octet };

    match cli.command {
        Commands::Get { host, remote, local } => {
            let server = TftpClient::resolve(&host, config.port)
                .await
                .with_context(|| format!("can't resolve {host}"))?;
            let local = local.unwrap_or_else(|| PathBuf::from(&remote));

            let mut file = tokio::fs::File::create(&local)
                .await
                .with_context(|| format!("can't create {}", local.display()))?;
            let mut client = TftpClient::open(local_ip_for(server.ip()), config)?;
            let received = client
                .receive_file(&remote, mode, &mut file, server.ip(), server.port())
                .await
                .with_context(|| format!("download of '{remote}' from {server} failed"))?;

            println!("Received {} bytes into {}", received, local.display());
        }
        Commands::Put { host, local, remote } => {
            let server = TftpClient::resolve(&host, config.port)
                .await
                .with_context(|| format!("can't resolve {host}"))?;
            let remote = match remote {
                Some(remote) => remote,
                None => remote_name(&local)?,
            };

            let mut file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("can't open {}", local.display()))?;
            let mut client = TftpClient::open(local_ip_for(server.ip()), config)?;
            client
                .send_file(&remote, mode, &mut file, server.ip(), server.port())
                .await
                .with_context(|| format!("upload of '{remote}' to {server} failed"))?;

            println!("Sent {} bytes from {}", client.total_bytes_sent(), local.display());
        }
    }

    Ok(())
}
