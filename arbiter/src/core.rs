//! Arbiter state machine, socket-free. The net layer feeds it client
//! and daemon events; replies flow through per-connection senders so
//! tests can drive whole sessions over channels.
//!
//! Round sequencing: local write intents queue FIFO. The front intent
//! pauses the other local clients and asks the daemon for the global
//! grant; once granted, the writer's dirty pages are relayed to every
//! other participant, and the writer's closing ack resumes everyone.
//! Rounds originated on remote hosts arrive as daemon STP/WRT/CNT
//! sequences and are fanned out to all local clients.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, Context};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use dsm_proto::{Frame, SemName};

/// Identifies one local client connection.
pub type ConnId = u64;

#[derive(Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Every local client said goodbye; tear the arbiter down cleanly.
    Shutdown,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum RoundState {
    Idle,
    /// Front of the queue announced to the daemon, grant pending.
    AwaitGrant,
    /// Writer holds the grant; its dirty pages are flowing.
    Active,
}

struct Client {
    pid: u32,
    gid: Option<u32>,
    checked_in: bool,
    tx: UnboundedSender<Frame>,
}

pub struct ArbiterCore {
    nproc: u32,
    started: bool,
    daemon_tx: UnboundedSender<Frame>,
    clients: HashMap<ConnId, Client>,
    /// Check-in order; also the order daemon gid replies come back in.
    checkin_order: Vec<ConnId>,
    gid_replies: VecDeque<ConnId>,
    barrier_hits: HashSet<u32>,
    rounds: VecDeque<ConnId>,
    round: RoundState,
    remote_round: bool,
    sem_waiters: HashMap<SemName, VecDeque<ConnId>>,
    exited: HashSet<ConnId>,
}

impl ArbiterCore {
    pub fn new(nproc: u32, daemon_tx: UnboundedSender<Frame>) -> Self {
        ArbiterCore {
            nproc,
            started: false,
            daemon_tx,
            clients: HashMap::new(),
            checkin_order: Vec::new(),
            gid_replies: VecDeque::new(),
            barrier_hits: HashSet::new(),
            rounds: VecDeque::new(),
            round: RoundState::Idle,
            remote_round: false,
            sem_waiters: HashMap::new(),
            exited: HashSet::new(),
        }
    }

    pub fn client_connected(&mut self, conn: ConnId, tx: UnboundedSender<Frame>) {
        debug!("client conn {conn} connected");
        self.clients.insert(
            conn,
            Client {
                pid: 0,
                gid: None,
                checked_in: false,
                tx,
            },
        );
    }

    /// A client connection went away. Losing a participant mid-session
    /// is unrecoverable; losing one that already said goodbye (or was
    /// kicked) is routine.
    pub fn client_closed(&mut self, conn: ConnId) -> anyhow::Result<()> {
        let Some(client) = self.clients.remove(&conn) else {
            return Ok(()); // kicked at check-in, or already gone
        };
        if client.checked_in && !self.exited.contains(&conn) {
            bail!("participant pid {} (conn {conn}) lost", client.pid);
        }
        Ok(())
    }

    pub fn handle_client_frame(&mut self, conn: ConnId, frame: Frame) -> anyhow::Result<Control> {
        if !self.clients.contains_key(&conn) {
            // Frames racing a kick; the socket is already closing.
            warn!("dropping frame from kicked conn {conn}");
            return Ok(Control::Continue);
        }
        match frame {
            Frame::AddPid { pid } => self.handle_checkin(conn, pid)?,
            Frame::HitBar { pid } => self.handle_hit_bar(conn, pid)?,
            Frame::WaitSem { pid, name } => self.handle_wait_sem(conn, pid, name)?,
            Frame::PostSem { pid, name } => {
                if name.is_empty() {
                    bail!("post on empty semaphore name from conn {conn}");
                }
                self.relay_to_daemon(Frame::PostSem { pid, name })?;
            }
            Frame::SynReq { pid } => {
                self.rounds.push_back(conn);
                debug!("write intent from pid {pid}, {} rounds pending", self.rounds.len());
                self.pump_rounds()?;
            }
            Frame::WriteData { offset, data } => {
                if self.round != RoundState::Active || self.rounds.front() != Some(&conn) {
                    bail!("page data from conn {conn} outside its round");
                }
                let frame = Frame::WriteData { offset, data };
                self.broadcast(Some(conn), frame.clone())?;
                self.relay_to_daemon(frame)?;
            }
            Frame::SynAck { .. } => {
                if self.round != RoundState::Active || self.rounds.front() != Some(&conn) {
                    bail!("round ack from conn {conn} outside its round");
                }
                self.rounds.pop_front();
                self.round = RoundState::Idle;
                self.broadcast(Some(conn), Frame::ContAll)?;
                self.relay_to_daemon(Frame::SynAck { pid: 0 })?;
                self.pump_rounds()?;
            }
            Frame::Exit => return self.handle_exit(conn),
            other => bail!("unexpected frame {other:?} from client conn {conn}"),
        }
        Ok(Control::Continue)
    }

    pub fn handle_daemon_frame(&mut self, frame: Frame) -> anyhow::Result<()> {
        match frame {
            Frame::SetGid { pid, gid } => {
                let conn = self
                    .gid_replies
                    .pop_front()
                    .context("gid assignment with no check-in pending")?;
                let client = self.client_mut(conn)?;
                if client.pid != pid {
                    bail!("gid assignment for pid {pid} but conn {conn} is pid {}", client.pid);
                }
                client.gid = Some(gid);
                // Delivery waits for the cohort-ready broadcast.
            }
            Frame::StopAll => {
                if self.remote_round || self.round == RoundState::Active {
                    bail!("remote round opened while another round is active");
                }
                self.remote_round = true;
                self.broadcast(None, Frame::StopAll)?;
            }
            Frame::WriteData { offset, data } => {
                if !self.remote_round {
                    bail!("remote page data outside a remote round");
                }
                self.broadcast(None, Frame::WriteData { offset, data })?;
            }
            Frame::SynAck { .. } => {
                // The global grant for the front of our local queue.
                if self.round != RoundState::AwaitGrant {
                    bail!("write grant without a pending local round");
                }
                let writer = *self.rounds.front().expect("AwaitGrant implies a queued round");
                self.round = RoundState::Active;
                self.send_to(writer, Frame::SynAck { pid: 0 })?;
            }
            Frame::ContAll => {
                if self.remote_round {
                    // Remote round closed.
                    self.remote_round = false;
                    self.broadcast(None, Frame::ContAll)?;
                    self.pump_rounds()?;
                } else if !self.started {
                    self.handle_cohort_ready()?;
                } else {
                    // Global barrier completion.
                    self.barrier_hits.clear();
                    self.broadcast(None, Frame::ContAll)?;
                }
            }
            Frame::PostSem { pid, name } => {
                let conn = self
                    .sem_waiters
                    .get_mut(&name)
                    .and_then(|q| q.pop_front())
                    .with_context(|| format!("semaphore {name} grant with no local waiter"))?;
                let wake_pid = self.client_mut(conn).map(|c| c.pid).unwrap_or(pid);
                self.send_to(conn, Frame::PostSem { pid: wake_pid, name })?;
            }
            other => bail!("unexpected frame {other:?} from daemon"),
        }
        Ok(())
    }

    fn handle_checkin(&mut self, conn: ConnId, pid: u32) -> anyhow::Result<()> {
        if self.started || self.checkin_order.len() as u32 == self.nproc {
            // Cohort overflow: drop the connection, the client observes
            // EOF on its gid wait.
            info!("rejecting pid {pid}: cohort of {} is full", self.nproc);
            self.clients.remove(&conn);
            return Ok(());
        }
        let client = self.client_mut(conn)?;
        if client.checked_in {
            bail!("conn {conn} checked in twice");
        }
        client.pid = pid;
        client.checked_in = true;
        self.checkin_order.push(conn);
        self.gid_replies.push_back(conn);
        self.relay_to_daemon(Frame::AddPid { pid })
    }

    fn handle_cohort_ready(&mut self) -> anyhow::Result<()> {
        self.started = true;
        info!("cohort complete, delivering gids to {} local clients", self.checkin_order.len());
        for &conn in &self.checkin_order.clone() {
            let client = self.client_mut(conn)?;
            let (pid, gid) = (
                client.pid,
                client.gid.context("cohort ready but gid missing")?,
            );
            self.send_to(conn, Frame::SetGid { pid, gid })?;
        }
        Ok(())
    }

    fn handle_hit_bar(&mut self, conn: ConnId, pid: u32) -> anyhow::Result<()> {
        if !self.started {
            bail!("barrier hit from pid {pid} before session start");
        }
        let gid = self
            .client_mut(conn)?
            .gid
            .context("barrier hit from client without gid")?;
        if !self.barrier_hits.insert(gid) {
            bail!("gid {gid} hit the barrier twice in one generation");
        }
        self.relay_to_daemon(Frame::HitBar { pid })
    }

    fn handle_wait_sem(&mut self, conn: ConnId, pid: u32, name: SemName) -> anyhow::Result<()> {
        if name.is_empty() {
            bail!("wait on empty semaphore name from conn {conn}");
        }
        self.sem_waiters.entry(name).or_default().push_back(conn);
        self.relay_to_daemon(Frame::WaitSem { pid, name })
    }

    fn handle_exit(&mut self, conn: ConnId) -> anyhow::Result<Control> {
        if !self.client_mut(conn)?.checked_in {
            bail!("goodbye from conn {conn} before check-in");
        }
        self.exited.insert(conn);
        if self.exited.len() == self.checkin_order.len() {
            info!("all local clients exited");
            self.relay_to_daemon(Frame::Exit)?;
            return Ok(Control::Shutdown);
        }
        Ok(Control::Continue)
    }

    /// Activate the front of the local round queue: pause the other
    /// locals and ask the daemon for the global grant.
    fn pump_rounds(&mut self) -> anyhow::Result<()> {
        if self.round != RoundState::Idle || self.remote_round {
            return Ok(());
        }
        let Some(&writer) = self.rounds.front() else {
            return Ok(());
        };
        self.round = RoundState::AwaitGrant;
        self.broadcast(Some(writer), Frame::StopAll)?;
        let pid = self.client_mut(writer).map(|c| c.pid).unwrap_or(0);
        self.relay_to_daemon(Frame::SynReq { pid })
    }

    fn client_mut(&mut self, conn: ConnId) -> anyhow::Result<&mut Client> {
        self.clients
            .get_mut(&conn)
            .with_context(|| format!("unknown client conn {conn}"))
    }

    fn send_to(&mut self, conn: ConnId, frame: Frame) -> anyhow::Result<()> {
        let client = self.client_mut(conn)?;
        client
            .tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("client conn {conn} is gone"))
    }

    fn relay_to_daemon(&self, frame: Frame) -> anyhow::Result<()> {
        self.daemon_tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("daemon link is gone"))
    }

    /// Send to every checked-in local client except `except`.
    fn broadcast(&mut self, except: Option<ConnId>, frame: Frame) -> anyhow::Result<()> {
        for &conn in &self.checkin_order.clone() {
            if Some(conn) == except || !self.clients.contains_key(&conn) {
                continue;
            }
            self.send_to(conn, frame.clone())?;
        }
        Ok(())
    }
}
