//! Daemon state machine, free of any socket plumbing. The net layer
//! feeds it events and it replies through per-link senders, so tests can
//! drive whole sessions over channels.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, Context};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use dsm_proto::{Frame, SemName};

/// Identifies one arbiter connection.
pub type LinkId = u64;

/// What the event loop should do after an event is processed.
#[derive(Debug, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// A session was torn down abnormally; the listed links must be
    /// closed by the net layer.
    CloseLinks(Vec<LinkId>),
}

/// A counting semaphore: a non-negative count and a FIFO of waiting
/// (link, pid) pairs. At most one of `count > 0` and "waiters present"
/// holds at any time. Lazy creation hands out one token, so the first
/// down on a fresh semaphore succeeds immediately.
struct Semaphore {
    count: u32,
    waiters: VecDeque<(LinkId, u32)>,
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore {
            count: 1,
            waiters: VecDeque::new(),
        }
    }
}

/// Named-semaphore table. Entries are created lazily on first reference
/// and live until the owning session is dropped.
#[derive(Default)]
pub struct SemTable {
    entries: HashMap<SemName, Semaphore>,
}

impl SemTable {
    /// Down. Returns true when the wait is satisfied immediately; false
    /// when the caller was queued.
    pub fn wait(&mut self, name: SemName, link: LinkId, pid: u32) -> bool {
        let sem = self.entries.entry(name).or_default();
        if sem.count > 0 {
            sem.count -= 1;
            true
        } else {
            sem.waiters.push_back((link, pid));
            false
        }
    }

    /// Up. Returns the oldest waiter to wake, or None when the post was
    /// absorbed into the count.
    pub fn post(&mut self, name: SemName) -> Option<(LinkId, u32)> {
        let sem = self.entries.entry(name).or_default();
        match sem.waiters.pop_front() {
            Some(waiter) => Some(waiter),
            None => {
                sem.count += 1;
                None
            }
        }
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        for (name, sem) in &self.entries {
            assert!(
                sem.count == 0 || sem.waiters.is_empty(),
                "semaphore {name}: count {} with {} waiters",
                sem.count,
                sem.waiters.len()
            );
        }
    }
}

/// One cohort scoped by its session identifier.
struct Session {
    nproc: u32,
    started: bool,
    /// Arbiter links in registration order.
    arbiters: Vec<LinkId>,
    next_gid: u32,
    barrier_hits: u32,
    /// Pending coherence rounds, front is active once granted.
    rounds: VecDeque<LinkId>,
    round_granted: bool,
    sems: SemTable,
    exited: HashSet<LinkId>,
}

impl Session {
    fn new(nproc: u32) -> Self {
        Session {
            nproc,
            started: false,
            arbiters: Vec::new(),
            next_gid: 0,
            barrier_hits: 0,
            rounds: VecDeque::new(),
            round_granted: false,
            sems: SemTable::default(),
            exited: HashSet::new(),
        }
    }
}

struct Link {
    tx: UnboundedSender<Frame>,
    /// Set by the announce frame.
    session: Option<SemName>,
}

/// The daemon proper: a registry of sessions and arbiter links.
#[derive(Default)]
pub struct DaemonCore {
    links: HashMap<LinkId, Link>,
    sessions: HashMap<SemName, Session>,
}

impl DaemonCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_connected(&mut self, link: LinkId, tx: UnboundedSender<Frame>) {
        debug!("arbiter link {link} connected");
        self.links.insert(link, Link { tx, session: None });
    }

    pub fn link_closed(&mut self, link: LinkId) -> Control {
        let Some(l) = self.links.remove(&link) else {
            return Control::Continue;
        };
        let Some(sid) = l.session else {
            return Control::Continue;
        };
        let Some(session) = self.sessions.get(&sid) else {
            return Control::Continue;
        };
        if session.exited.contains(&link) {
            // Clean goodbye already processed.
            self.gc_session(sid);
            return Control::Continue;
        }
        // A participant vanished mid-session: no partial recovery, the
        // whole cohort comes down.
        warn!("arbiter link {link} lost, aborting session {sid}");
        let peers: Vec<LinkId> = self
            .sessions
            .remove(&sid)
            .map(|s| s.arbiters)
            .unwrap_or_default();
        for peer in &peers {
            if let Some(l) = self.links.get_mut(peer) {
                l.session = None;
            }
        }
        Control::CloseLinks(peers)
    }

    /// Process one frame from an arbiter.
    pub fn handle_frame(&mut self, link: LinkId, frame: Frame) -> anyhow::Result<Control> {
        let sid = match self.links.get(&link).context("frame from unknown link")? {
            Link { session: None, .. } => {
                // First frame on a link must be the session announce.
                return self.handle_announce(link, frame);
            }
            Link {
                session: Some(sid), ..
            } => *sid,
        };

        match frame {
            Frame::AddPid { pid } => self.handle_checkin(sid, link, pid)?,
            Frame::SynReq { pid } => self.handle_syn_req(sid, link, pid)?,
            Frame::WriteData { offset, data } => {
                self.relay_from_writer(sid, link, Frame::WriteData { offset, data })?
            }
            Frame::SynAck { .. } => self.handle_round_end(sid, link)?,
            Frame::HitBar { pid } => self.handle_hit_bar(sid, link, pid)?,
            Frame::WaitSem { pid, name } => self.handle_wait_sem(sid, link, pid, name)?,
            Frame::PostSem { pid, name } => self.handle_post_sem(sid, link, pid, name)?,
            Frame::Exit => {
                self.session_mut(sid)?.exited.insert(link);
                self.gc_session(sid);
            }
            other => bail!("unexpected frame {other:?} from arbiter link {link}"),
        }
        Ok(Control::Continue)
    }

    /// The announce reuses the sem-op payload: name carries the session
    /// identifier, pid carries the cohort size.
    fn handle_announce(&mut self, link: LinkId, frame: Frame) -> anyhow::Result<Control> {
        let Frame::WaitSem { pid: nproc, name: sid } = frame else {
            bail!("link {link}: expected session announce, got {frame:?}");
        };
        if nproc == 0 {
            bail!("link {link}: session {sid} announced with zero cohort size");
        }
        let session = self
            .sessions
            .entry(sid)
            .or_insert_with(|| Session::new(nproc));
        if session.started {
            bail!("link {link}: session {sid} has already started");
        }
        if session.nproc != nproc {
            bail!(
                "link {link}: session {sid} size mismatch: {} vs announced {nproc}",
                session.nproc
            );
        }
        session.arbiters.push(link);
        self.links
            .get_mut(&link)
            .expect("caller verified the link")
            .session = Some(sid);
        info!("arbiter link {link} joined session {sid} (nproc {nproc})");
        Ok(Control::Continue)
    }

    fn handle_checkin(&mut self, sid: SemName, link: LinkId, pid: u32) -> anyhow::Result<()> {
        let session = self.session_mut(sid)?;
        if session.started || session.next_gid == session.nproc {
            bail!("session {sid}: check-in of pid {pid} overflows the cohort");
        }
        let gid = session.next_gid;
        session.next_gid += 1;
        debug!("session {sid}: pid {pid} assigned gid {gid}");
        self.send_to(link, Frame::SetGid { pid, gid })?;

        let session = self.session_mut(sid)?;
        if session.next_gid == session.nproc {
            session.started = true;
            info!("session {sid}: cohort complete, releasing {} processes", session.nproc);
            self.broadcast(sid, None, Frame::ContAll)?;
        }
        Ok(())
    }

    fn handle_syn_req(&mut self, sid: SemName, link: LinkId, pid: u32) -> anyhow::Result<()> {
        let session = self.session_mut(sid)?;
        session.rounds.push_back(link);
        debug!(
            "session {sid}: round queued for link {link} (pid {pid}), {} pending",
            session.rounds.len()
        );
        self.pump_rounds(sid)
    }

    /// Grant the front of the round queue, pausing everyone else first.
    fn pump_rounds(&mut self, sid: SemName) -> anyhow::Result<()> {
        let session = self.session_mut(sid)?;
        if session.round_granted {
            return Ok(());
        }
        let Some(&writer) = session.rounds.front() else {
            return Ok(());
        };
        session.round_granted = true;
        self.broadcast(sid, Some(writer), Frame::StopAll)?;
        self.send_to(writer, Frame::SynAck { pid: 0 })
    }

    fn relay_from_writer(&mut self, sid: SemName, link: LinkId, frame: Frame) -> anyhow::Result<()> {
        let session = self.session_mut(sid)?;
        if !session.round_granted || session.rounds.front() != Some(&link) {
            bail!("session {sid}: write relay from link {link} outside its round");
        }
        self.broadcast(sid, Some(link), frame)
    }

    fn handle_round_end(&mut self, sid: SemName, link: LinkId) -> anyhow::Result<()> {
        let session = self.session_mut(sid)?;
        if !session.round_granted || session.rounds.front() != Some(&link) {
            bail!("session {sid}: round end from link {link} outside its round");
        }
        session.rounds.pop_front();
        session.round_granted = false;
        self.broadcast(sid, Some(link), Frame::ContAll)?;
        self.pump_rounds(sid)
    }

    fn handle_hit_bar(&mut self, sid: SemName, _link: LinkId, pid: u32) -> anyhow::Result<()> {
        let session = self.session_mut(sid)?;
        if !session.started {
            bail!("session {sid}: barrier hit from pid {pid} before session start");
        }
        session.barrier_hits += 1;
        if session.barrier_hits > session.nproc {
            bail!("session {sid}: more barrier hits than participants");
        }
        if session.barrier_hits == session.nproc {
            session.barrier_hits = 0;
            debug!("session {sid}: barrier complete");
            self.broadcast(sid, None, Frame::ContAll)?;
        }
        Ok(())
    }

    fn handle_wait_sem(
        &mut self,
        sid: SemName,
        link: LinkId,
        pid: u32,
        name: SemName,
    ) -> anyhow::Result<()> {
        if name.is_empty() {
            bail!("session {sid}: wait on empty semaphore name");
        }
        let session = self.session_mut(sid)?;
        if session.sems.wait(name, link, pid) {
            self.send_to(link, Frame::PostSem { pid, name })?;
        }
        Ok(())
    }

    fn handle_post_sem(
        &mut self,
        sid: SemName,
        _link: LinkId,
        pid: u32,
        name: SemName,
    ) -> anyhow::Result<()> {
        if name.is_empty() {
            bail!("session {sid}: post on empty semaphore name");
        }
        let session = self.session_mut(sid)?;
        if let Some((waiter_link, waiter_pid)) = session.sems.post(name) {
            debug!("session {sid}: post {name} by pid {pid} wakes pid {waiter_pid}");
            self.send_to(waiter_link, Frame::PostSem { pid: waiter_pid, name })?;
        }
        Ok(())
    }

    /// Drop a session once every registered arbiter has said goodbye.
    fn gc_session(&mut self, sid: SemName) {
        let done = self
            .sessions
            .get(&sid)
            .map(|s| !s.arbiters.is_empty() && s.arbiters.iter().all(|a| s.exited.contains(a)))
            .unwrap_or(false);
        if done {
            info!("session {sid} complete");
            if let Some(session) = self.sessions.remove(&sid) {
                for link in session.arbiters {
                    if let Some(l) = self.links.get_mut(&link) {
                        l.session = None;
                    }
                }
            }
        }
    }

    fn session_mut(&mut self, sid: SemName) -> anyhow::Result<&mut Session> {
        self.sessions
            .get_mut(&sid)
            .with_context(|| format!("no session {sid}"))
    }

    fn send_to(&self, link: LinkId, frame: Frame) -> anyhow::Result<()> {
        let l = self.links.get(&link).context("send to unknown link")?;
        l.tx.send(frame)
            .map_err(|_| anyhow::anyhow!("arbiter link {link} is gone"))
    }

    fn broadcast(&self, sid: SemName, except: Option<LinkId>, frame: Frame) -> anyhow::Result<()> {
        let session = self.sessions.get(&sid).context("broadcast to no session")?;
        for &link in &session.arbiters {
            if Some(link) == except {
                continue;
            }
            self.send_to(link, frame.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn announce(core: &mut DaemonCore, link: LinkId, sid: &str, nproc: u32) -> UnboundedReceiver<Frame> {
        let (tx, rx) = unbounded_channel();
        core.link_connected(link, tx);
        core.handle_frame(
            link,
            Frame::WaitSem {
                pid: nproc,
                name: SemName::new(sid),
            },
        )
        .expect("announce");
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f);
        }
        out
    }

    #[test]
    fn fresh_semaphore_carries_one_token() {
        let mut sems = SemTable::default();
        let name = SemName::new("s");
        // First down consumes the creation token, second blocks.
        assert!(sems.wait(name, 1, 100));
        assert!(!sems.wait(name, 2, 200));
        sems.check_invariant();
    }

    #[test]
    fn sem_table_wait_then_post_fifo() {
        let mut sems = SemTable::default();
        let name = SemName::new("s");
        assert!(sems.wait(name, 1, 100));
        assert!(!sems.wait(name, 2, 200));
        assert!(!sems.wait(name, 3, 300));
        sems.check_invariant();
        assert_eq!(sems.post(name), Some((2, 200)));
        assert_eq!(sems.post(name), Some((3, 300)));
        assert_eq!(sems.post(name), None);
        sems.check_invariant();
    }

    #[test]
    fn checkins_get_dense_gids_and_release() {
        let mut core = DaemonCore::new();
        let mut rx = announce(&mut core, 1, "foo", 2);

        core.handle_frame(1, Frame::AddPid { pid: 500 }).unwrap();
        core.handle_frame(1, Frame::AddPid { pid: 501 }).unwrap();

        let got = drain(&mut rx);
        assert_eq!(
            got,
            vec![
                Frame::SetGid { pid: 500, gid: 0 },
                Frame::SetGid { pid: 501, gid: 1 },
                Frame::ContAll,
            ]
        );
    }

    #[test]
    fn checkin_overflow_fails_the_link() {
        let mut core = DaemonCore::new();
        let _rx = announce(&mut core, 1, "foo", 1);
        core.handle_frame(1, Frame::AddPid { pid: 1 }).unwrap();
        assert!(core.handle_frame(1, Frame::AddPid { pid: 2 }).is_err());
    }

    #[test]
    fn rounds_are_granted_in_fifo_order() {
        let mut core = DaemonCore::new();
        let mut rx_a = announce(&mut core, 1, "foo", 2);
        let mut rx_b = announce(&mut core, 2, "foo", 2);
        core.handle_frame(1, Frame::AddPid { pid: 10 }).unwrap();
        core.handle_frame(2, Frame::AddPid { pid: 20 }).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        core.handle_frame(1, Frame::SynReq { pid: 10 }).unwrap();
        core.handle_frame(2, Frame::SynReq { pid: 20 }).unwrap();

        // A granted, B paused and still queued.
        assert_eq!(drain(&mut rx_a), vec![Frame::SynAck { pid: 0 }]);
        assert_eq!(drain(&mut rx_b), vec![Frame::StopAll]);

        let page = Frame::WriteData {
            offset: 0,
            data: bytes::Bytes::from_static(b"xy"),
        };
        core.handle_frame(1, page.clone()).unwrap();
        core.handle_frame(1, Frame::SynAck { pid: 10 }).unwrap();

        // B sees the write, its round end, then its own grant.
        assert_eq!(
            drain(&mut rx_b),
            vec![page, Frame::ContAll, Frame::SynAck { pid: 0 }]
        );
        // A is paused for B's round.
        assert_eq!(drain(&mut rx_a), vec![Frame::StopAll]);
    }

    #[test]
    fn write_outside_a_granted_round_is_rejected() {
        let mut core = DaemonCore::new();
        let mut rx = announce(&mut core, 1, "foo", 1);
        core.handle_frame(1, Frame::AddPid { pid: 10 }).unwrap();
        drain(&mut rx);

        let page = Frame::WriteData {
            offset: 0,
            data: bytes::Bytes::from_static(b"z"),
        };
        assert!(core.handle_frame(1, page).is_err());
    }

    #[test]
    fn barrier_completes_at_nproc_hits() {
        let mut core = DaemonCore::new();
        let mut rx_a = announce(&mut core, 1, "bar", 3);
        let mut rx_b = announce(&mut core, 2, "bar", 3);
        core.handle_frame(1, Frame::AddPid { pid: 1 }).unwrap();
        core.handle_frame(1, Frame::AddPid { pid: 2 }).unwrap();
        core.handle_frame(2, Frame::AddPid { pid: 3 }).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        core.handle_frame(1, Frame::HitBar { pid: 1 }).unwrap();
        core.handle_frame(2, Frame::HitBar { pid: 3 }).unwrap();
        assert!(drain(&mut rx_a).is_empty());
        core.handle_frame(1, Frame::HitBar { pid: 2 }).unwrap();
        assert_eq!(drain(&mut rx_a), vec![Frame::ContAll]);
        assert_eq!(drain(&mut rx_b), vec![Frame::ContAll]);
    }

    #[test]
    fn cross_link_semaphore_wakes_the_waiting_arbiter() {
        let mut core = DaemonCore::new();
        let mut rx_a = announce(&mut core, 1, "s", 2);
        let mut rx_b = announce(&mut core, 2, "s", 2);
        core.handle_frame(1, Frame::AddPid { pid: 1 }).unwrap();
        core.handle_frame(2, Frame::AddPid { pid: 2 }).unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let name = SemName::new("mutex");
        // The creation token satisfies the first down on the spot.
        core.handle_frame(1, Frame::WaitSem { pid: 1, name }).unwrap();
        assert_eq!(drain(&mut rx_a), vec![Frame::PostSem { pid: 1, name }]);
        // A second down blocks until the remote host posts.
        core.handle_frame(1, Frame::WaitSem { pid: 1, name }).unwrap();
        assert!(drain(&mut rx_a).is_empty());
        core.handle_frame(2, Frame::PostSem { pid: 2, name }).unwrap();
        assert_eq!(drain(&mut rx_a), vec![Frame::PostSem { pid: 1, name }]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn size_mismatch_rejects_second_arbiter() {
        let mut core = DaemonCore::new();
        let _rx = announce(&mut core, 1, "foo", 2);
        let (tx, _rx2) = unbounded_channel();
        core.link_connected(2, tx);
        assert!(core
            .handle_frame(
                2,
                Frame::WaitSem {
                    pid: 3,
                    name: SemName::new("foo"),
                },
            )
            .is_err());
    }

    #[test]
    fn lost_link_aborts_the_whole_session() {
        let mut core = DaemonCore::new();
        let _rx_a = announce(&mut core, 1, "s", 2);
        let _rx_b = announce(&mut core, 2, "s", 2);
        match core.link_closed(1) {
            Control::CloseLinks(links) => assert_eq!(links, vec![1, 2]),
            c => panic!("expected CloseLinks, got {c:?}"),
        }
    }

    #[test]
    fn clean_exits_drop_the_session() {
        let mut core = DaemonCore::new();
        let _rx = announce(&mut core, 1, "done", 1);
        core.handle_frame(1, Frame::AddPid { pid: 1 }).unwrap();
        core.handle_frame(1, Frame::Exit).unwrap();
        assert!(core.sessions.is_empty());
        assert_eq!(core.link_closed(1), Control::Continue);
    }
}
