//! Global session daemon: composes per-host arbiters into one cohort.
//!
//! The daemon is the cross-host authority of the protocol: it assigns
//! dense gids at check-in, imposes the total order on coherence rounds,
//! aggregates barrier hits, and owns the named-semaphore state. Each
//! arbiter holds one connection to it for the lifetime of a session.

pub mod core;
pub mod net;

use std::net::{IpAddr, Ipv4Addr};

#[derive(Clone, Debug)]
pub struct DaemonConf {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
}

impl Default for DaemonConf {
    fn default() -> Self {
        DaemonConf {
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: dsm_proto::DSM_DAEMON_PORT,
        }
    }
}
