use std::{error::Error, process};

use clap::Parser;
use log::LevelFilter;
use pegaflow_rpma::{
    AlignedBuffer, BackendKind, ConnectionConfig, MrUsage, PeerConfig, PeerRole, Session,
    SessionConfig, encode,
};

const KILOBYTE: usize = 1024;

#[derive(Parser, Debug)]
#[command(
    name = "rpma-flush-server",
    about = "Exposes a memory region, waits for one client and prints what it wrote"
)]
struct Cli {
    /// Local address to listen on
    server_address: String,

    /// Port to listen on
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Advertise that writes land directly in persistent memory
    #[arg(long)]
    direct_write_to_pmem: bool,

    /// Use the ibverbs backend instead of the TCP emulation
    #[arg(long)]
    verbs: bool,

    /// RNIC to open with --verbs
    #[arg(long)]
    nic: Option<String>,
}

fn c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|byte| *byte == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = SessionConfig::default().with_log_level(cli.log_level);
    if cli.verbs {
        config = config.with_backend(BackendKind::Verbs);
    }
    if let Some(nic) = cli.nic {
        config = config.with_nic_name(nic);
    }

    let session = Session::open(&cli.server_address, PeerRole::Server, config)?;
    let mr = session.register(
        AlignedBuffer::new(KILOBYTE)?,
        MrUsage::WRITE_DST | MrUsage::READ_SRC,
    )?;
    let peer_cfg = PeerConfig::new().with_direct_write_to_pmem(cli.direct_write_to_pmem);
    let private_data = encode(&mr, &peer_cfg, 0)?;

    let endpoint = session.listen(cli.port)?;
    log::info!("waiting for a client: addr={}", endpoint.local_addr());
    let mut conn = endpoint.accept(Some(&private_data[..]), ConnectionConfig::default())?;
    conn.wait_closed()?;

    println!("New value: {}", c_str(mr.as_slice()));

    drop(conn);
    drop(endpoint);
    mr.deregister()?;
    session.close()?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        eprintln!("Error: {error}");
        process::exit(-1);
    }
}
