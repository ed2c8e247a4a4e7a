//! Arbiter launch and connect-poll.
//!
//! The first participant on a host is responsible for getting the
//! arbiter running: probe the well-known loopback port, and on refusal
//! spawn `dsm_arbiter` detached into its own session. Whoever spawned
//! it (or raced someone who did), every participant then poll-connects
//! within a fixed budget.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use dsm_proto::DSM_ARB_PORT;

use crate::{Config, DsmError};

/// Connection attempts before giving up on the arbiter.
const MAX_SOCK_POLL: u32 = 15;

/// Pause between attempts.
const SOCK_POLL_RATE: Duration = Duration::from_millis(250);

pub(crate) fn connect_to_arbiter(cfg: &Config) -> Result<TcpStream, DsmError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, DSM_ARB_PORT));

    // Fast path: another participant already brought the arbiter up.
    if let Ok(stream) = TcpStream::connect(addr) {
        return prepare(stream);
    }

    if let Err(e) = launch_arbiter(cfg) {
        // Not yet fatal: the binary may be missing from PATH here while
        // a sibling process is mid-launch; the poll below decides.
        warn!("could not spawn dsm_arbiter: {e}");
    }

    for attempt in 1..=MAX_SOCK_POLL {
        std::thread::sleep(SOCK_POLL_RATE);
        match TcpStream::connect(addr) {
            Ok(stream) => return prepare(stream),
            Err(e) => debug!("arbiter connect attempt {attempt}/{MAX_SOCK_POLL}: {e}"),
        }
    }
    Err(DsmError::Unavailable(MAX_SOCK_POLL))
}

fn prepare(stream: TcpStream) -> Result<TcpStream, DsmError> {
    // Frames are small and latency-sensitive.
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Spawn the arbiter detached: its own session, stdio to /dev/null, no
/// intermediate forks. A reaper thread collects the child status so a
/// short-lived arbiter does not linger as a zombie.
fn launch_arbiter(cfg: &Config) -> std::io::Result<()> {
    let mut cmd = Command::new("dsm_arbiter");
    cmd.arg(cfg.nproc.to_string())
        .arg(&cfg.sid_name)
        .arg(&cfg.d_addr)
        .arg(cfg.d_port.to_string())
        .arg(cfg.map_size.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        });
    }
    let mut child = cmd.spawn()?;
    std::thread::Builder::new()
        .name("dsm-arbiter-reaper".to_string())
        .spawn(move || {
            let _ = child.wait();
        })?;
    Ok(())
}
