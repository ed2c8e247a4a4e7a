//! The runtime handle: init, coordination calls, explicit publication,
//! and teardown. Every operation the protocol offers hangs off [`Dsm`];
//! there is no hidden per-process state apart from the trap cell the
//! signal handlers require.

use std::fs::File;
use std::io::Write;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::mman::ProtFlags;
use parking_lot::Mutex;
use tracing::{info, warn};

use dsm_proto::{Frame, SemName, DSM_PAGE_SIZE};

use crate::capture::{source_for, CaptureMode, DirtyPageSource};
use crate::pump::{Pump, Shared};
use crate::region::Region;
use crate::spawn::connect_to_arbiter;
use crate::{Config, DsmError};

/// Initialize the shared memory system and check this process into the
/// cohort. Blocks until every participant has checked in.
pub fn init(cfg: Config) -> Result<Dsm, DsmError> {
    Dsm::init(cfg)
}

/// `init` with the conventional daemon endpoint and default capture.
pub fn init_simple(sid: &str, nproc: u32, map_size: usize) -> Result<Dsm, DsmError> {
    Dsm::init(Config::simple(sid, nproc, map_size))
}

pub struct Dsm {
    pid: u32,
    gid: u32,
    mode: CaptureMode,
    region: Arc<Region>,
    shared: Arc<Shared>,
    writer: Arc<Mutex<TcpStream>>,
    source: Box<dyn DirtyPageSource>,
    pump: Option<JoinHandle<()>>,
    // Self-pipe poking the pump out of poll; read end lives in the pump.
    wake_tx: OwnedFd,
    _wake_rx: OwnedFd,
}

impl Dsm {
    fn init(cfg: Config) -> Result<Dsm, DsmError> {
        cfg.validate()?;
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)?
            .unwrap_or(0) as usize;
        if page_size != DSM_PAGE_SIZE {
            return Err(DsmError::Fatal(format!(
                "OS page size {page_size} does not match the protocol page size {DSM_PAGE_SIZE}"
            )));
        }

        let pid = std::process::id();
        let stream = connect_to_arbiter(&cfg)?;

        // The arbiter truncates the file before it starts listening, so
        // a successful connect guarantees it exists; only the arbiter
        // may create it.
        let path = dsm_proto::shared_file_path(&cfg.sid_name);
        let file = File::options().read(true).write(true).open(&path)?;
        let map_size = file.metadata()?.len() as usize;
        if map_size == 0 || map_size % DSM_PAGE_SIZE != 0 {
            return Err(DsmError::Fatal(format!(
                "shared file {} has unusable size {map_size}",
                path.display()
            )));
        }
        if map_size != cfg.map_size {
            warn!("arbiter mapped {map_size} bytes, config asked for {}", cfg.map_size);
        }

        let region = Arc::new(Region::map(&file, map_size)?);
        let mut source = source_for(cfg.capture)?;

        let (pipe_rd, pipe_wr) = nix::unistd::pipe()?;
        let (wake_rx, wake_tx) = unsafe { (OwnedFd::from_raw_fd(pipe_rd), OwnedFd::from_raw_fd(pipe_wr)) };

        // Protect before attaching: the first store must trap, and the
        // handlers must find a fully-populated cell.
        if cfg.capture == CaptureMode::SignalTrap {
            region.protect_all(ProtFlags::PROT_READ)?;
        }
        source.attach(&region, wake_tx.as_raw_fd())?;

        let shared = Shared::new();
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let pump = Pump {
            stream,
            writer: writer.clone(),
            region: region.clone(),
            shared: shared.clone(),
            wake_fd: wake_rx.as_raw_fd(),
            mode: cfg.capture,
            pid,
        };
        let pump = std::thread::Builder::new()
            .name("dsm-pump".to_string())
            .spawn(move || pump.run())?;

        let mut dsm = Dsm {
            pid,
            gid: 0,
            mode: source.mode(),
            region,
            shared,
            writer,
            source,
            pump: Some(pump),
            wake_tx,
            _wake_rx: wake_rx,
        };

        // Check in; the gid reply doubles as the wait-for-cohort gate.
        dsm.send(Frame::AddPid { pid })?;
        dsm.gid = dsm.shared.wait_gid()?;
        info!("joined session '{}' as gid {}", cfg.sid_name, dsm.gid);
        Ok(dsm)
    }

    /// Global identifier of this participant, dense in `[0, nproc)`.
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Size of the shared region in bytes.
    pub fn map_size(&self) -> usize {
        self.region.len()
    }

    /// Raw pointer to the shared region. Under trap capture, plain
    /// stores through it are captured and broadcast transparently.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    /// Block until every participant has entered the barrier.
    pub fn barrier(&self) -> Result<(), DsmError> {
        self.shared.check_poison()?;
        self.send(Frame::HitBar { pid: self.pid })?;
        self.shared.wait_barrier_release()
    }

    /// Up the named semaphore, creating it on first reference.
    pub fn post_sem(&self, name: &str) -> Result<(), DsmError> {
        self.send(Frame::PostSem {
            pid: self.pid,
            name: checked_name(name)?,
        })
    }

    /// Down the named semaphore; blocks until a post is available.
    pub fn wait_sem(&self, name: &str) -> Result<(), DsmError> {
        self.send(Frame::WaitSem {
            pid: self.pid,
            name: checked_name(name)?,
        })?;
        self.shared.wait_sem_wake()
    }

    /// Snapshot region bytes at `offset` into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), DsmError> {
        self.check_bounds(offset, out.len())?;
        self.region.read_into(offset, out);
        Ok(())
    }

    /// Write `data` at `offset` and broadcast it to the cohort in one
    /// coherence round.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), DsmError> {
        self.check_bounds(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.open_round()?;
        let mut cursor = 0;
        for (chunk_off, chunk_len) in page_chunks(offset, data.len()) {
            let chunk = &data[cursor..cursor + chunk_len];
            cursor += chunk_len;
            // Reprotect before sending so an IO failure cannot leave a
            // silently-writable page behind.
            if self.mode == CaptureMode::SignalTrap {
                self.region.protect_range(
                    chunk_off,
                    chunk_len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                )?;
            }
            self.region.write_from(chunk_off, chunk);
            if self.mode == CaptureMode::SignalTrap {
                self.region
                    .protect_range(chunk_off, chunk_len, ProtFlags::PROT_READ)?;
            }
            self.send(Frame::WriteData {
                offset: chunk_off as u64,
                data: chunk.to_vec().into(),
            })?;
        }
        self.close_round()
    }

    /// Broadcast already-written region bytes. Only meaningful under
    /// explicit capture; trapped stores publish themselves.
    pub fn publish(&self, offset: usize, len: usize) -> Result<(), DsmError> {
        if self.mode != CaptureMode::Explicit {
            return Err(DsmError::State(
                "publish is implicit under signal-trap capture",
            ));
        }
        self.check_bounds(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        self.open_round()?;
        for (chunk_off, chunk_len) in page_chunks(offset, len) {
            let mut bytes = vec![0u8; chunk_len];
            self.region.read_into(chunk_off, &mut bytes);
            self.send(Frame::WriteData {
                offset: chunk_off as u64,
                data: bytes.into(),
            })?;
        }
        self.close_round()
    }

    /// Leave the session: final barrier, goodbye, then local teardown.
    /// Consuming `self` makes a second exit unrepresentable.
    pub fn exit(mut self) -> Result<(), DsmError> {
        self.barrier()?;
        self.send(Frame::Exit)?;
        self.teardown();
        Ok(())
    }

    /// Announce a write intent and block until the cohort is paused and
    /// the global grant arrives.
    fn open_round(&self) -> Result<(), DsmError> {
        self.shared.check_poison()?;
        self.send(Frame::SynReq { pid: self.pid })?;
        self.shared.wait_grant()
    }

    fn close_round(&self) -> Result<(), DsmError> {
        self.send(Frame::SynAck { pid: self.pid })
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<(), DsmError> {
        if offset.checked_add(len).map_or(true, |end| end > self.region.len()) {
            return Err(DsmError::Argument(format!(
                "range {offset}..{} outside the {}-byte region",
                offset + len,
                self.region.len()
            )));
        }
        Ok(())
    }

    fn send(&self, frame: Frame) -> Result<(), DsmError> {
        let buf = frame.pack()?;
        let mut writer = self.writer.lock();
        writer.write_all(&buf[..])?;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.pump.take() {
            self.shared.shutdown.store(true, Ordering::Release);
            let byte = [1u8];
            unsafe { libc::write(self.wake_tx.as_raw_fd(), byte.as_ptr() as *const _, 1) };
            if handle.join().is_err() {
                warn!("pump thread panicked during teardown");
            }
        }
        self.source.detach();
    }
}

impl Drop for Dsm {
    fn drop(&mut self) {
        // Best-effort local cleanup if `exit` was never reached; the
        // arbiter treats the dropped connection as a lost participant.
        self.teardown();
    }
}

fn checked_name(name: &str) -> Result<SemName, DsmError> {
    if name.is_empty() {
        return Err(DsmError::Argument("semaphore name is empty".into()));
    }
    Ok(SemName::new(name))
}

/// Split `offset..offset + len` at page boundaries so no chunk crosses
/// a page.
fn page_chunks(offset: usize, len: usize) -> impl Iterator<Item = (usize, usize)> {
    let mut offset = offset;
    let mut len = len;
    std::iter::from_fn(move || {
        if len == 0 {
            return None;
        }
        let page_end = (offset / DSM_PAGE_SIZE + 1) * DSM_PAGE_SIZE;
        let take = len.min(page_end - offset);
        let item = (offset, take);
        offset += take;
        len -= take;
        Some(item)
    })
}
