//! The control-socket message pump.
//!
//! One pump thread per handle owns every read from the arbiter. It
//! routes wakeups to the blocked API calls (gid wait, semaphore wait,
//! barrier), applies remote page writes, does the STP/CNT pause
//! bookkeeping, and under trap capture runs the coherence round on
//! behalf of the fault handlers.

use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::mman::ProtFlags;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use dsm_proto::framed::ConnectionError;
use dsm_proto::{Frame, ProtocolError, DSM_PAGE_SIZE};

use crate::capture::{trap, CaptureMode};
use crate::region::Region;
use crate::wire::FrameBuf;
use crate::DsmError;

/// Why the session died. Stored once; every later call observes it.
#[derive(Clone, Debug)]
pub(crate) enum Poison {
    Io(String),
    Protocol(String),
}

impl Poison {
    pub fn to_error(&self) -> DsmError {
        match self {
            Poison::Io(msg) => DsmError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                msg.clone(),
            )),
            Poison::Protocol(msg) => DsmError::Fatal(format!("protocol violation: {msg}")),
        }
    }
}

#[derive(Default)]
struct State {
    gid: Option<u32>,
    sem_wakes: u32,
    barrier_releases: u32,
    grants: u32,
    stop_depth: u32,
    poison: Option<Poison>,
}

/// Rendezvous between the pump and the blocking API calls.
pub(crate) struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    pub shutdown: AtomicBool,
}

impl Shared {
    pub fn new() -> Arc<Shared> {
        Arc::new(Shared {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn check_poison(&self) -> Result<(), DsmError> {
        match &self.state.lock().poison {
            Some(p) => Err(p.to_error()),
            None => Ok(()),
        }
    }

    fn wait_on<F: FnMut(&mut State) -> bool>(&self, mut ready: F) -> Result<(), DsmError> {
        let mut state = self.state.lock();
        loop {
            if let Some(p) = &state.poison {
                return Err(p.to_error());
            }
            if ready(&mut state) {
                return Ok(());
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn wait_gid(&self) -> Result<u32, DsmError> {
        let mut gid = 0;
        self.wait_on(|s| match s.gid {
            Some(g) => {
                gid = g;
                true
            }
            None => false,
        })?;
        Ok(gid)
    }

    pub fn wait_sem_wake(&self) -> Result<(), DsmError> {
        self.wait_on(|s| {
            if s.sem_wakes > 0 {
                s.sem_wakes -= 1;
                true
            } else {
                false
            }
        })
    }

    pub fn wait_barrier_release(&self) -> Result<(), DsmError> {
        self.wait_on(|s| {
            if s.barrier_releases > 0 {
                s.barrier_releases -= 1;
                true
            } else {
                false
            }
        })
    }

    pub fn wait_grant(&self) -> Result<(), DsmError> {
        self.wait_on(|s| {
            if s.grants > 0 {
                s.grants -= 1;
                true
            } else {
                false
            }
        })
    }

    fn update<F: FnOnce(&mut State)>(&self, f: F) {
        let mut state = self.state.lock();
        f(&mut state);
        self.cond.notify_all();
    }

    pub fn poison(&self, poison: Poison) {
        error!("session poisoned: {poison:?}");
        self.update(|s| {
            if s.poison.is_none() {
                s.poison = Some(poison);
            }
        });
    }
}

pub(crate) struct Pump {
    pub stream: TcpStream,
    pub writer: Arc<Mutex<TcpStream>>,
    pub region: Arc<Region>,
    pub shared: Arc<Shared>,
    pub wake_fd: RawFd,
    pub mode: CaptureMode,
    pub pid: u32,
}

/// Pump-side view of the in-flight trap round.
#[derive(PartialEq, Eq)]
enum FaultPhase {
    Idle,
    AwaitGrant,
    Granted,
}

impl Pump {
    pub fn run(mut self) {
        let mut frame_buf = FrameBuf::new();
        let mut phase = FaultPhase::Idle;
        if let Err(e) = self.pump_loop(&mut frame_buf, &mut phase) {
            let poison = match e {
                ConnectionError::Io(io) => Poison::Io(io.to_string()),
                ConnectionError::Protocol(pe) => Poison::Protocol(pe.to_string()),
            };
            // A fault handler mid-round would spin forever with nobody
            // to release it; there is no recovering the session anyway.
            if self.mode == CaptureMode::SignalTrap && trap::round_in_progress() {
                error!("control socket died mid write-capture; aborting");
                std::process::abort();
            }
            self.shared.poison(poison);
        } else {
            debug!("pump shut down cleanly");
        }
    }

    fn pump_loop(
        &mut self,
        frame_buf: &mut FrameBuf,
        phase: &mut FaultPhase,
    ) -> Result<(), ConnectionError> {
        loop {
            let mut fds = [
                PollFd::new(self.stream.as_raw_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake_fd, PollFlags::POLLIN),
            ];
            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(ConnectionError::Io(std::io::Error::from_raw_os_error(
                        e as i32,
                    )))
                }
            }

            let wake_ready = fds[1]
                .revents()
                .map_or(false, |r| r.intersects(PollFlags::POLLIN));
            let sock_ready = fds[0].revents().map_or(false, |r| {
                r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            });

            if wake_ready {
                self.drain_wake_pipe();
                if self.shared.shutdown.load(Ordering::Acquire) {
                    return Ok(());
                }
                self.service_trap(phase)?;
            }

            if sock_ready {
                if let Some(frame) = frame_buf.read_some(&mut self.stream)? {
                    self.dispatch(frame, phase)?;
                }
            }
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 16];
        // Level-triggered and written one byte at a time; a single read
        // clears what is there.
        unsafe { libc::read(self.wake_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
    }

    /// A fault handler changed the trap cell and poked us.
    fn service_trap(&mut self, phase: &mut FaultPhase) -> Result<(), ConnectionError> {
        if self.mode != CaptureMode::SignalTrap {
            return Ok(());
        }
        match trap::CELL.state.load(Ordering::Acquire) {
            trap::FAULTED if *phase == FaultPhase::Idle => {
                // Open the round; the handler keeps spinning until the
                // grant comes back from the arbiter.
                *phase = FaultPhase::AwaitGrant;
                self.send(Frame::SynReq { pid: self.pid })?;
            }
            trap::CAPTURED if *phase == FaultPhase::Granted => {
                let page = trap::CELL.page.load(Ordering::Acquire);
                let offset = page * DSM_PAGE_SIZE;
                let bytes = self.region.copy_page(page);
                self.send(Frame::WriteData {
                    offset: offset as u64,
                    data: bytes.into(),
                })?;
                self.region
                    .protect_page(page, ProtFlags::PROT_READ)
                    .map_err(into_conn_err)?;
                self.send(Frame::SynAck { pid: self.pid })?;
                *phase = FaultPhase::Idle;
                trap::CELL.state.store(trap::FLUSHED, Ordering::Release);
            }
            _ => {} // spurious poke
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: Frame, phase: &mut FaultPhase) -> Result<(), ConnectionError> {
        match frame {
            Frame::SetGid { pid, gid } => {
                if pid != self.pid {
                    return Err(protocol_err("gid assignment for a different pid"));
                }
                self.shared.update(|s| s.gid = Some(gid));
            }
            Frame::PostSem { pid, .. } => {
                if pid != self.pid {
                    return Err(protocol_err("semaphore wake for a different pid"));
                }
                self.shared.update(|s| s.sem_wakes += 1);
            }
            Frame::SynAck { .. } => {
                if *phase == FaultPhase::AwaitGrant {
                    // Grant for the trapped store: unprotect the page
                    // and release the spinning handler.
                    let page = trap::CELL.page.load(Ordering::Acquire);
                    self.region
                        .protect_page(page, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
                        .map_err(into_conn_err)?;
                    *phase = FaultPhase::Granted;
                    trap::CELL.state.store(trap::GRANTED, Ordering::Release);
                } else {
                    // Grant for an explicit publish round.
                    self.shared.update(|s| s.grants += 1);
                }
            }
            Frame::WriteData { offset, data } => self.apply_remote(offset as usize, &data)?,
            Frame::StopAll => {
                self.shared.update(|s| s.stop_depth += 1);
            }
            Frame::ContAll => {
                // A resume that closes a pending stop ends a coherence
                // round; an unpaired one releases the barrier.
                self.shared.update(|s| {
                    if s.stop_depth > 0 {
                        s.stop_depth -= 1;
                    } else {
                        s.barrier_releases += 1;
                    }
                });
            }
            other => {
                return Err(ConnectionError::Protocol(ProtocolError::UnexpectedFrame(
                    format!("{other:?} from arbiter"),
                )))
            }
        }
        Ok(())
    }

    /// Copy a remote participant's committed write into our view.
    fn apply_remote(&self, offset: usize, data: &[u8]) -> Result<(), ConnectionError> {
        if offset + data.len() > self.region.len() {
            return Err(protocol_err("remote write outside the shared region"));
        }
        if data.is_empty() {
            return Ok(());
        }
        if self.mode == CaptureMode::SignalTrap {
            self.region
                .protect_range(offset, data.len(), ProtFlags::PROT_READ | ProtFlags::PROT_WRITE)
                .map_err(into_conn_err)?;
        }
        self.region.write_from(offset, data);
        if self.mode == CaptureMode::SignalTrap {
            self.region
                .protect_range(offset, data.len(), ProtFlags::PROT_READ)
                .map_err(into_conn_err)?;
        }
        Ok(())
    }

    fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        use std::io::Write;
        let buf = frame.pack()?;
        let mut writer = self.writer.lock();
        writer.write_all(&buf[..])?;
        Ok(())
    }
}

fn protocol_err(msg: &'static str) -> ConnectionError {
    ConnectionError::Protocol(ProtocolError::BadFrame(msg))
}

fn into_conn_err(e: DsmError) -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        e.to_string(),
    ))
}
