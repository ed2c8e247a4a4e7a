//! Socket plumbing for the arbiter: the local listen socket, one
//! reader/writer task pair per client, the daemon link, and the event
//! channel feeding the core task. Also owns the shared backing file:
//! it is created and truncated here before the listener binds (so a
//! client that managed to connect can rely on the file existing) and
//! unlinked on the way out.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;

use anyhow::Context;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use dsm_proto::framed::{Framed, FramedReader, FramedWriter};
use dsm_proto::{shared_file_path, Frame, SemName, DSM_ARB_PORT};

use crate::core::{ArbiterCore, ConnId, Control};
use crate::ArbiterConf;

enum Event {
    Connected { conn: ConnId, tx: UnboundedSender<Frame> },
    ClientFrame { conn: ConnId, frame: Frame },
    ClientClosed { conn: ConnId },
    DaemonFrame(Frame),
    DaemonClosed,
}

pub async fn run(conf: ArbiterConf) -> anyhow::Result<()> {
    conf.validate()?;

    let shared_file = shared_file_path(&conf.sid_name);
    create_shared_file(&shared_file, conf.map_size)?;
    // Unlink the backing file on every exit path.
    let _cleanup = scopeguard::guard(shared_file, |path| {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("failed to unlink {}: {e}", path.display());
        }
    });

    let listen_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, DSM_ARB_PORT);
    let socket = TcpSocket::new_v4()?;
    // Accepted sockets left in TIME_WAIT must not block the next session.
    socket.set_reuseaddr(true)?;
    socket
        .bind(SocketAddr::V4(listen_addr))
        .with_context(|| format!("bind arbiter listener on {listen_addr} (already running?)"))?;
    let listener = socket.listen(64)?;
    info!(
        "arbiter for session '{}' listening on {listen_addr}, map {} bytes",
        conf.sid_name, conf.map_size
    );

    let daemon_stream =
        TcpStream::connect((conf.daemon_addr.as_str(), conf.daemon_port))
            .await
            .with_context(|| {
                format!("dial session daemon at {}:{}", conf.daemon_addr, conf.daemon_port)
            })?;
    let (daemon_reader, daemon_writer) = Framed::new(daemon_stream).split();

    let (daemon_tx, daemon_rx) = unbounded_channel();
    // The announce must be the first frame on the link.
    daemon_tx
        .send(Frame::WaitSem {
            pid: conf.nproc,
            name: SemName::new(&conf.sid_name),
        })
        .expect("fresh channel");

    let (event_tx, event_rx) = unbounded_channel();

    let ev = event_tx.clone();
    utils::task::spawn("daemon link reader", async move {
        let res = read_daemon(daemon_reader, &ev).await;
        let _ = ev.send(Event::DaemonClosed);
        res
    });
    // Keep the handle: the goodbye must drain before we exit.
    let daemon_writer_task = tokio::spawn(write_frames(daemon_writer, daemon_rx));

    let ev = event_tx.clone();
    utils::task::spawn("client accept loop", async move {
        let mut next_conn: ConnId = 0;
        loop {
            let (stream, peer) = listener.accept().await.context("accept client")?;
            let conn = next_conn;
            next_conn += 1;
            spawn_client_tasks(conn, peer, stream, &ev);
        }
    });

    let result = core_loop(ArbiterCore::new(conf.nproc, daemon_tx), event_rx).await;

    // Core (and with it the daemon sender) is gone; wait for the link
    // writer to flush the goodbye.
    match daemon_writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("daemon link writer: {e:#}"),
        Err(e) => error!("daemon link writer panicked: {e}"),
    }
    result
}

fn create_shared_file(path: &Path, map_size: u64) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("create shared file {}", path.display()))?;
    file.set_len(map_size)
        .with_context(|| format!("truncate {} to {map_size}", path.display()))?;
    Ok(())
}

fn spawn_client_tasks(
    conn: ConnId,
    peer: SocketAddr,
    stream: TcpStream,
    event_tx: &UnboundedSender<Event>,
) {
    let (reader, writer) = Framed::new(stream).split();
    let (tx, rx) = unbounded_channel();

    if event_tx.send(Event::Connected { conn, tx }).is_err() {
        return; // shutting down
    }

    let ev = event_tx.clone();
    utils::task::spawn(&format!("client {conn} ({peer}) reader"), async move {
        let res = read_client(conn, reader, &ev).await;
        let _ = ev.send(Event::ClientClosed { conn });
        res
    });

    utils::task::spawn(&format!("client {conn} ({peer}) writer"), async move {
        write_frames(writer, rx).await
    });
}

async fn read_client(
    conn: ConnId,
    mut reader: FramedReader<tokio::io::ReadHalf<TcpStream>>,
    event_tx: &UnboundedSender<Event>,
) -> anyhow::Result<()> {
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("read from client conn {conn}")),
        };
        if event_tx.send(Event::ClientFrame { conn, frame }).is_err() {
            return Ok(());
        }
    }
}

async fn read_daemon(
    mut reader: FramedReader<tokio::io::ReadHalf<TcpStream>>,
    event_tx: &UnboundedSender<Event>,
) -> anyhow::Result<()> {
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e).context("read from daemon link"),
        };
        if event_tx.send(Event::DaemonFrame(frame)).is_err() {
            return Ok(());
        }
    }
}

/// Drain a frame channel onto a stream; half-close when it ends.
async fn write_frames(
    mut writer: FramedWriter<tokio::io::WriteHalf<TcpStream>>,
    mut rx: UnboundedReceiver<Frame>,
) -> anyhow::Result<()> {
    while let Some(frame) = rx.recv().await {
        writer.write_frame(&frame)?;
        writer.flush().await?;
    }
    writer.shutdown().await.ok();
    Ok(())
}

async fn core_loop(
    mut core: ArbiterCore,
    mut event_rx: UnboundedReceiver<Event>,
) -> anyhow::Result<()> {
    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Connected { conn, tx } => core.client_connected(conn, tx),
            Event::ClientFrame { conn, frame } => {
                match core.handle_client_frame(conn, frame)? {
                    Control::Continue => {}
                    Control::Shutdown => return Ok(()),
                }
            }
            Event::ClientClosed { conn } => core.client_closed(conn)?,
            Event::DaemonFrame(frame) => core.handle_daemon_frame(frame)?,
            Event::DaemonClosed => anyhow::bail!("session daemon link lost"),
        }
    }
    Ok(())
}
