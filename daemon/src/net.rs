//! Socket plumbing for the daemon: accept arbiter links, run one reader
//! and one writer task per link, and funnel everything into the single
//! core task that owns all state.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info};

use dsm_proto::framed::{Framed, FramedReader, FramedWriter};
use dsm_proto::Frame;

use crate::core::{Control, DaemonCore, LinkId};
use crate::DaemonConf;

enum Event {
    Connected {
        link: LinkId,
        tx: UnboundedSender<Frame>,
        abort: UnboundedSender<()>,
    },
    Frame {
        link: LinkId,
        frame: Frame,
    },
    Closed {
        link: LinkId,
    },
}

/// Serve sessions until shutdown is requested (`shutdown` resolving) or
/// an accept error occurs. Bound listener is passed in so callers know
/// the port is taken before they commit.
pub async fn serve(
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let (event_tx, event_rx) = unbounded_channel();

    let accept_tx = event_tx.clone();
    utils::task::spawn("daemon accept loop", async move {
        let mut next_link: LinkId = 0;
        loop {
            let (stream, peer) = listener.accept().await.context("accept arbiter link")?;
            let link = next_link;
            next_link += 1;
            spawn_link_tasks(link, peer, stream, &accept_tx);
        }
    });

    tokio::select! {
        res = core_loop(event_rx) => res,
        _ = shutdown => {
            info!("daemon shutting down");
            Ok(())
        }
    }
}

/// Bind and serve until SIGINT/SIGTERM.
pub async fn run(conf: DaemonConf) -> anyhow::Result<()> {
    let addr = SocketAddr::new(conf.listen_addr, conf.listen_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind daemon listener on {addr}"))?;
    info!("session daemon listening on {addr}");
    serve(listener, wait_for_signal()).await
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

fn spawn_link_tasks(
    link: LinkId,
    peer: SocketAddr,
    stream: TcpStream,
    event_tx: &UnboundedSender<Event>,
) {
    let (reader, writer) = Framed::new(stream).split();
    let (tx, rx) = unbounded_channel();
    let (abort_tx, abort_rx) = unbounded_channel();

    if event_tx
        .send(Event::Connected {
            link,
            tx,
            abort: abort_tx,
        })
        .is_err()
    {
        return;
    }

    let read_events = event_tx.clone();
    utils::task::spawn(&format!("link {link} ({peer}) reader"), async move {
        let res = read_link(link, reader, &read_events).await;
        // Ok or not, the core must learn the link is gone.
        let _ = read_events.send(Event::Closed { link });
        res
    });

    utils::task::spawn(&format!("link {link} ({peer}) writer"), async move {
        write_link(writer, rx, abort_rx).await
    });
}

async fn read_link(
    link: LinkId,
    mut reader: FramedReader<tokio::io::ReadHalf<TcpStream>>,
    event_tx: &UnboundedSender<Event>,
) -> anyhow::Result<()> {
    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()), // clean EOF
            Err(e) => return Err(e).with_context(|| format!("read from link {link}")),
        };
        if event_tx.send(Event::Frame { link, frame }).is_err() {
            return Ok(()); // core gone, shutting down
        }
    }
}

/// Drain outbound frames until the channel closes (normal teardown) or
/// an abort is requested (session abort kicks the link).
async fn write_link(
    mut writer: FramedWriter<tokio::io::WriteHalf<TcpStream>>,
    mut rx: UnboundedReceiver<Frame>,
    mut abort_rx: UnboundedReceiver<()>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    writer.write_frame(&frame)?;
                    writer.flush().await?;
                }
                None => {
                    writer.shutdown().await.ok();
                    return Ok(());
                }
            },
            _ = abort_rx.recv() => {
                writer.shutdown().await.ok();
                return Ok(());
            }
        }
    }
}

async fn core_loop(mut event_rx: UnboundedReceiver<Event>) -> anyhow::Result<()> {
    let mut core = DaemonCore::new();
    let mut aborts: std::collections::HashMap<LinkId, UnboundedSender<()>> =
        std::collections::HashMap::new();

    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Connected { link, tx, abort } => {
                core.link_connected(link, tx);
                aborts.insert(link, abort);
            }
            Event::Frame { link, frame } => match core.handle_frame(link, frame) {
                Ok(Control::Continue) => {}
                Ok(Control::CloseLinks(links)) => close_links(&mut aborts, &links),
                Err(e) => {
                    // A misbehaving arbiter poisons only its own session.
                    error!("protocol error on link {link}: {e:#}");
                    match core.link_closed(link) {
                        Control::CloseLinks(links) => close_links(&mut aborts, &links),
                        Control::Continue => close_links(&mut aborts, &[link]),
                    }
                }
            },
            Event::Closed { link } => match core.link_closed(link) {
                Control::CloseLinks(links) => close_links(&mut aborts, &links),
                Control::Continue => {
                    aborts.remove(&link);
                }
            },
        }
    }
    Ok(())
}

fn close_links(
    aborts: &mut std::collections::HashMap<LinkId, UnboundedSender<()>>,
    links: &[LinkId],
) {
    for link in links {
        if let Some(abort) = aborts.remove(link) {
            let _ = abort.send(());
        }
    }
}
