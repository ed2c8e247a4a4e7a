//! Per-host arbiter: owns the shared file for this host, multiplexes
//! every local client plus the daemon link on one thread, and mediates
//! the coherence and coordination protocols.

pub mod core;
pub mod net;

use anyhow::bail;

use dsm_proto::DSM_PAGE_SIZE;

#[derive(Clone, Debug)]
pub struct ArbiterConf {
    /// Total cohort size across all hosts.
    pub nproc: u32,
    /// Session tag, at most 31 bytes.
    pub sid_name: String,
    pub daemon_addr: String,
    pub daemon_port: u16,
    /// Size of the shared region in bytes.
    pub map_size: u64,
}

impl ArbiterConf {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nproc == 0 {
            bail!("cohort size must be at least 1");
        }
        if self.sid_name.is_empty() || self.sid_name.len() > 31 {
            bail!("session name must be 1..=31 bytes");
        }
        if self.map_size == 0 || self.map_size % DSM_PAGE_SIZE as u64 != 0 {
            bail!("map size must be a non-zero multiple of {DSM_PAGE_SIZE}");
        }
        Ok(())
    }
}
