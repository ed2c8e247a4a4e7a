//! Per-host arbiter entry point. Launched (and detached) by the first
//! client on a host, or by hand:
//!
//!     dsm_arbiter <nproc> <sid_name> <daemon_addr> <daemon_port> <map_size>

use clap::Parser;
use utils::logging::{self, LogFormat};

use dsm_arbiter::{net, ArbiterConf};

#[derive(Parser)]
#[command(name = "dsm_arbiter", about = "DSM per-host arbiter", version)]
struct Args {
    /// Total number of participating processes.
    nproc: u32,

    /// Session identifier (at most 31 bytes).
    sid_name: String,

    /// Session daemon address.
    daemon_addr: String,

    /// Session daemon port.
    daemon_port: u16,

    /// Shared region size in bytes (multiple of the page size).
    map_size: u64,

    /// Log format: plain or json.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(LogFormat::from_config(&args.log_format)?)?;

    let conf = ArbiterConf {
        nproc: args.nproc,
        sid_name: args.sid_name,
        daemon_addr: args.daemon_addr,
        daemon_port: args.daemon_port,
        map_size: args.map_size,
    };

    // Everything multiplexes on one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(net::run(conf))
}
