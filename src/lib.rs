pub mod config;
pub mod logging;

use anyhow::{bail, Context, Result};
use config::{Cli, Config};
use frame::Address;
use session::{Session, SessionManager};

/// Installs the JSON logging façade at the configured level, then either
/// accepts or connects a single session and echoes every message it reads
/// back to the peer.
pub fn run(cli: Cli, config: Config) -> Result<()> {
    logging::JsonLogger::install(config.log.level.as_level(), config.log.queue_capacity)
        .context("installing logging façade")?;

    let options = config.options.to_frame_options();
    let manager = SessionManager::new(options);
    let local_params = config.local.as_params();

    let session = if cli.accept {
        let remote = match &cli.remote {
            Some(addr) => parse_remote(addr)?,
            None => Address::WILDCARD,
        };
        log::info!("accepting on {}:{}", config.local.ip, config.local.port);
        manager.accept(&local_params, remote, options.op_timeout as u64 * options.max_retries as u64)?
    } else {
        let Some(addr) = &cli.remote else {
            bail!("--remote ip:port is required in connect mode");
        };
        let remote = parse_remote(addr)?;
        log::info!("connecting to {addr}");
        manager.connect(&local_params, remote, options.op_timeout as u64 * options.max_retries as u64)?
    };

    echo_loop(&session, cli.echo_chunk)
}

fn echo_loop(session: &Session, chunk: usize) -> Result<()> {
    let mut buf = vec![0u8; chunk];

    loop {
        let n = match session.read(&mut buf, 5000) {
            Ok(n) => n,
            Err(frame::Error::BufferOverflow { required_size }) => {
                buf.resize(required_size, 0);
                continue;
            }
            Err(e) => return Err(e).context("reading from peer"),
        };

        log::debug!("echoing {n} bytes back to peer");
        session.write(&buf[..n], 5000).context("writing to peer")?;
    }
}

fn parse_remote(addr: &str) -> Result<Address> {
    let socket: std::net::SocketAddr = addr.parse().context("parsing --remote as ip:port")?;
    let std::net::IpAddr::V4(ip) = socket.ip() else {
        bail!("only IPv4 remotes are supported");
    };
    Ok(Address::new(u32::from(ip), socket.port()))
}
