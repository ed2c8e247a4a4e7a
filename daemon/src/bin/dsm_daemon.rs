//! Global session daemon entry point.

use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;
use utils::logging::{self, LogFormat};

use dsm_daemon::{net, DaemonConf};

#[derive(Parser)]
#[command(name = "dsm_daemon", about = "DSM global session daemon", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    listen_addr: IpAddr,

    /// Port to listen on.
    #[arg(long, default_value_t = dsm_proto::DSM_DAEMON_PORT)]
    port: u16,

    /// Log format: plain or json.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(LogFormat::from_config(&args.log_format)?)?;

    let conf = DaemonConf {
        listen_addr: args.listen_addr,
        listen_port: args.port,
    };

    // The daemon multiplexes every arbiter link on one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(net::run(conf))
}
