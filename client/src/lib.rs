//! Client-side DSM runtime.
//!
//! `init` checks the process into a session and returns a [`Dsm`]
//! handle owning the mapped shared region, the control socket and the
//! message pump that services it. Reads observe a recent consistent
//! snapshot of the region; writes propagate to every participant
//! through page-grained coherence rounds; [`Dsm::barrier`] and the
//! named-semaphore calls coordinate accesses across the cohort.
//!
//! Write capture comes in two flavors, selected by [`CaptureMode`]:
//! transparent trapping of plain pointer stores (POSIX hosts), or an
//! explicit [`Dsm::publish`]/[`Dsm::write_at`] API that works anywhere.

mod capture;
mod pump;
mod region;
mod runtime;
mod spawn;
mod wire;

pub use capture::CaptureMode;
pub use runtime::{init, init_simple, Dsm};

use dsm_proto::{ProtocolError, DSM_PAGE_SIZE};

/// Session configuration. `Config::simple` fills in the conventional
/// daemon endpoint and the default capture mode.
#[derive(Clone, Debug)]
pub struct Config {
    /// Cohort size across all hosts, at least 1.
    pub nproc: u32,
    /// Session tag, 1..=31 bytes.
    pub sid_name: String,
    /// Session daemon address.
    pub d_addr: String,
    /// Session daemon port.
    pub d_port: u16,
    /// Shared region size: a non-zero multiple of the page size.
    pub map_size: usize,
    /// How local writes are detected.
    pub capture: CaptureMode,
}

impl Config {
    pub fn simple(sid: &str, nproc: u32, map_size: usize) -> Config {
        Config {
            nproc,
            sid_name: sid.to_string(),
            d_addr: "127.0.0.1".to_string(),
            d_port: dsm_proto::DSM_DAEMON_PORT,
            map_size,
            capture: CaptureMode::SignalTrap,
        }
    }

    fn validate(&self) -> Result<(), DsmError> {
        if self.nproc == 0 {
            return Err(DsmError::Argument("cohort size must be at least 1".into()));
        }
        if self.sid_name.is_empty() || self.sid_name.len() > 31 {
            return Err(DsmError::Argument(
                "session name must be 1..=31 bytes".into(),
            ));
        }
        if self.d_addr.is_empty() {
            return Err(DsmError::Argument("daemon address is empty".into()));
        }
        if self.map_size == 0 || self.map_size % DSM_PAGE_SIZE != 0 {
            return Err(DsmError::Argument(format!(
                "map size must be a non-zero multiple of {DSM_PAGE_SIZE}"
            )));
        }
        Ok(())
    }
}

/// Everything that can go wrong on the client side.
#[derive(thiserror::Error, Debug)]
pub enum DsmError {
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("invalid state: {0}")]
    State(&'static str),
    #[error("arbiter unreachable after {0} connection attempts")]
    Unavailable(u32),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<nix::Error> for DsmError {
    fn from(e: nix::Error) -> Self {
        DsmError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_catches_bad_arguments() {
        assert!(Config::simple("ok", 2, DSM_PAGE_SIZE).validate().is_ok());

        let zero_procs = Config::simple("ok", 0, DSM_PAGE_SIZE);
        assert!(matches!(zero_procs.validate(), Err(DsmError::Argument(_))));

        let empty_sid = Config::simple("", 2, DSM_PAGE_SIZE);
        assert!(matches!(empty_sid.validate(), Err(DsmError::Argument(_))));

        let long_sid = Config::simple(&"s".repeat(32), 2, DSM_PAGE_SIZE);
        assert!(matches!(long_sid.validate(), Err(DsmError::Argument(_))));

        let odd_size = Config::simple("ok", 2, DSM_PAGE_SIZE + 1);
        assert!(matches!(odd_size.validate(), Err(DsmError::Argument(_))));

        let no_size = Config::simple("ok", 2, 0);
        assert!(matches!(no_size.validate(), Err(DsmError::Argument(_))));
    }
}
