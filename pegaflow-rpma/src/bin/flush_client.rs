use std::{error::Error, process};

use clap::Parser;
use log::LevelFilter;
use pegaflow_rpma::{
    AlignedBuffer, BackendKind, CompletionPolicy, ConnectionConfig, FlushType, MrUsage, OpKind,
    PeerRole, Session, SessionConfig,
};

const KILOBYTE: usize = 1024;
const FLUSH_ID: u64 = 0xF01D;

const HELLO_STR_SIZE: usize = KILOBYTE;
/// `[lang: u32][str: HELLO_STR_SIZE bytes, NUL padded]`
const HELLO_STR_OFFSET: usize = 4;
const HELLO_T_SIZE: usize = HELLO_STR_OFFSET + HELLO_STR_SIZE;

const HELLO_STR: [&str; 2] = ["Hello world!", "¡Hola Mundo!"];

#[derive(Parser, Debug)]
#[command(
    name = "rpma-flush-client",
    about = "Writes a greeting into the server's memory and flushes it to persistence"
)]
struct Cli {
    /// Server address
    server_address: String,

    /// Server port
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Use the ibverbs backend instead of the TCP emulation
    #[arg(long)]
    verbs: bool,

    /// RNIC to open with --verbs
    #[arg(long)]
    nic: Option<String>,
}

fn write_hello_str(hello: &mut [u8], lang: usize) {
    hello[..HELLO_STR_OFFSET].copy_from_slice(&(lang as u32).to_le_bytes());
    let text = HELLO_STR[lang].as_bytes();
    let len = text.len().min(HELLO_STR_SIZE - 1);
    let field = &mut hello[HELLO_STR_OFFSET..HELLO_T_SIZE];
    field.fill(0);
    field[..len].copy_from_slice(&text[..len]);
}

fn hello_lang(hello: &[u8]) -> usize {
    let mut raw = [0_u8; HELLO_STR_OFFSET];
    raw.copy_from_slice(&hello[..HELLO_STR_OFFSET]);
    u32::from_le_bytes(raw) as usize % HELLO_STR.len()
}

fn hello_str(hello: &[u8]) -> String {
    let field = &hello[HELLO_STR_OFFSET..HELLO_T_SIZE];
    let end = field.iter().position(|byte| *byte == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn translate(hello: &mut [u8]) {
    println!("translating...");
    let lang = (hello_lang(hello) + 1) % HELLO_STR.len();
    write_hello_str(hello, lang);
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = SessionConfig::default().with_log_level(cli.log_level);
    if cli.verbs {
        config = config.with_backend(BackendKind::Verbs);
    }
    if let Some(nic) = cli.nic {
        config = config.with_nic_name(nic);
    }

    let session = Session::open(&cli.server_address, PeerRole::Client, config)?;
    let mut conn = session.connect(&cli.server_address, cli.port, None, ConnectionConfig::default())?;
    let mut local_mr = session.register(AlignedBuffer::new(HELLO_T_SIZE)?, MrUsage::WRITE_SRC)?;

    let handshake = conn.peer_handshake()?;
    let peer_cfg = handshake.peer_cfg()?;
    conn.apply_remote_peer_cfg(peer_cfg);
    let remote_mr = handshake.remote_mr()?;

    let remote_size = remote_mr.size();
    if remote_size < KILOBYTE as u64 {
        return Err(format!(
            "Remote memory region size too small for writing the data of the assumed size ({remote_size} < {KILOBYTE})"
        )
        .into());
    }

    write_hello_str(local_mr.as_mut_slice(), 0);
    println!("Next value: {}", hello_str(local_mr.as_slice()));

    let remote_offset = usize::from(handshake.data_offset());
    conn.write(
        &remote_mr,
        remote_offset,
        &local_mr,
        HELLO_STR_OFFSET,
        KILOBYTE,
        CompletionPolicy::OnErrorOnly,
        0,
    )?;

    let flush_type = if peer_cfg.direct_write_to_pmem() {
        println!("FlushType::Persistent is supported");
        FlushType::Persistent
    } else {
        println!("FlushType::Persistent is NOT supported, FlushType::Visibility is used instead");
        FlushType::Visibility
    };
    conn.flush(
        &remote_mr,
        remote_offset,
        KILOBYTE,
        flush_type,
        CompletionPolicy::Always,
        FLUSH_ID,
    )?;
    conn.expect_completion(FLUSH_ID, OpKind::Flush)?;

    translate(local_mr.as_mut_slice());
    println!("Translation: {}", hello_str(local_mr.as_slice()));

    conn.disconnect_and_wait()?;
    drop(conn);
    local_mr.deregister()?;
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

#[cfg(test)]
mod tests {
    use super::{HELLO_T_SIZE, hello_lang, hello_str, translate, write_hello_str};

    #[test]
    fn translate_toggles_language() {
        let mut hello = vec![0_u8; HELLO_T_SIZE];
        write_hello_str(&mut hello, 0);
        assert_eq!(hello_str(&hello), "Hello world!");
        translate(&mut hello);
        assert_eq!(hello_lang(&hello), 1);
        assert_eq!(hello_str(&hello), "¡Hola Mundo!");
        translate(&mut hello);
        assert_eq!(hello_str(&hello), "Hello world!");
    }
}
