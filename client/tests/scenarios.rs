//! End-to-end scenarios: an in-process session daemon and arbiter plus
//! real client handles on threads, all over loopback sockets and a real
//! mapped shared file. Explicit capture keeps the process-global signal
//! machinery out of multi-handle tests.
//!
//! The arbiter listens on its fixed well-known port, so scenarios
//! serialize on a lock.

use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use dsm_arbiter::ArbiterConf;
use dsm_client::{CaptureMode, Config, Dsm, DsmError};

static PORT_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct Cluster {
    daemon_port: u16,
    daemon_stop: Option<tokio::sync::oneshot::Sender<()>>,
    daemon_thread: Option<thread::JoinHandle<()>>,
    arbiter_thread: Option<thread::JoinHandle<anyhow::Result<()>>>,
    sid: String,
}

impl Cluster {
    fn start(sid: &str, nproc: u32, map_size: usize) -> Cluster {
        let _ = utils::logging::init(utils::logging::LogFormat::Plain);

        // Daemon on an ephemeral port.
        let (port_tx, port_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let daemon_thread = thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("daemon runtime");
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                    .await
                    .expect("bind daemon");
                port_tx
                    .send(listener.local_addr().expect("daemon addr").port())
                    .expect("report port");
                dsm_daemon::net::serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
                .expect("daemon serve");
            });
        });
        let daemon_port = port_rx.recv().expect("daemon port");

        let conf = ArbiterConf {
            nproc,
            sid_name: sid.to_string(),
            daemon_addr: "127.0.0.1".to_string(),
            daemon_port,
            map_size: map_size as u64,
        };
        let arbiter_thread = thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("arbiter runtime");
            rt.block_on(dsm_arbiter::net::run(conf))
        });

        // Wait for the listen socket so client probes never race the
        // bind (a probe connection that is just dropped is harmless).
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match TcpStream::connect((Ipv4Addr::LOCALHOST, dsm_proto::DSM_ARB_PORT)) {
                Ok(_probe) => break,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Err(e) => panic!("arbiter never came up: {e}"),
            }
        }

        Cluster {
            daemon_port,
            daemon_stop: Some(stop_tx),
            daemon_thread: Some(daemon_thread),
            arbiter_thread: Some(arbiter_thread),
            sid: sid.to_string(),
        }
    }

    fn client_config(&self, nproc: u32, map_size: usize) -> Config {
        let mut cfg = Config::simple(&self.sid, nproc, map_size);
        cfg.d_port = self.daemon_port;
        cfg.capture = CaptureMode::Explicit;
        cfg
    }

    /// Join the arbiter (it exits with the session) and stop the daemon.
    fn finish(mut self) {
        let arbiter = self
            .arbiter_thread
            .take()
            .expect("finish called once")
            .join()
            .expect("arbiter thread");
        arbiter.expect("arbiter exited with error");

        // Clean teardown leaves no shared file behind.
        assert!(
            !dsm_proto::shared_file_path(&self.sid).exists(),
            "shared file survived teardown"
        );

        let _ = self.daemon_stop.take().expect("stop once").send(());
        self.daemon_thread
            .take()
            .expect("daemon joined once")
            .join()
            .expect("daemon thread");
    }
}

fn run_clients<F>(cfg: &Config, nproc: u32, body: F)
where
    F: Fn(Dsm) -> Result<(), DsmError> + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let mut handles = Vec::new();
    for _ in 0..nproc {
        let cfg = cfg.clone();
        let body = body.clone();
        handles.push(thread::spawn(move || {
            let dsm = dsm_client::init(cfg)?;
            body(dsm)
        }));
    }
    for handle in handles {
        handle.join().expect("client thread").expect("client failed");
    }
}

#[test]
fn ping_pong_alternates_strictly() {
    let _guard = PORT_LOCK.lock();
    let cluster = Cluster::start("pingpong", 2, 4096);
    let cfg = cluster.client_config(2, 4096);

    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let log_ref = log.clone();
    run_clients(&cfg, 2, move |dsm| {
        if dsm.gid() == 0 {
            dsm.wait_sem("sem_zero")?;
        } else {
            dsm.wait_sem("sem_one")?; // creation token
            dsm.wait_sem("sem_one")?; // blocks until the first ping
        }
        for _ in 0..5 {
            if dsm.gid() == 0 {
                log_ref.lock().push("Ping!");
                dsm.post_sem("sem_one")?;
                dsm.wait_sem("sem_zero")?;
            } else {
                log_ref.lock().push("Pong!");
                dsm.post_sem("sem_zero")?;
                dsm.wait_sem("sem_one")?;
            }
        }
        dsm.post_sem("sem_one")?;
        dsm.exit()
    });

    let got = log.lock().clone();
    assert_eq!(
        got,
        vec!["Ping!", "Pong!", "Ping!", "Pong!", "Ping!", "Pong!", "Ping!", "Pong!", "Ping!", "Pong!"]
    );
    cluster.finish();
}

#[test]
fn single_writer_is_read_by_everyone() {
    let _guard = PORT_LOCK.lock();
    let cluster = Cluster::start("onewriter", 4, 4096);
    let cfg = cluster.client_config(4, 4096);

    let payload: Vec<u8> = (0x01..=0x10).collect();
    let expected = payload.clone();
    run_clients(&cfg, 4, move |dsm| {
        if dsm.gid() == 0 {
            dsm.write_at(0, &payload)?;
        }
        dsm.barrier()?;
        if dsm.gid() != 0 {
            let mut got = vec![0u8; expected.len()];
            dsm.read_at(0, &mut got)?;
            assert_eq!(got, expected);
        }
        dsm.exit()
    });
    cluster.finish();
}

#[test]
fn semaphore_excludes_writers_mutually() {
    let _guard = PORT_LOCK.lock();
    let cluster = Cluster::start("mutex", 3, 4096);
    let cfg = cluster.client_config(3, 4096);

    // Offset 0: the protected counter. Offset 8: an "inside" flag that
    // must never be seen set by a fresh lock holder.
    run_clients(&cfg, 3, move |dsm| {
        dsm.wait_sem("mutex")?;

        let mut inside = [0u8; 1];
        dsm.read_at(8, &mut inside)?;
        assert_eq!(inside[0], 0, "two holders inside the mutex");
        dsm.write_at(8, &[1])?;

        let mut counter = [0u8; 1];
        dsm.read_at(0, &mut counter)?;
        dsm.write_at(0, &[counter[0] + 1])?;

        // Drop the flag through the raw mapping and publish it, the
        // other half of the explicit-capture API.
        unsafe { *dsm.as_mut_ptr().add(8) = 0 };
        dsm.publish(8, 1)?;
        dsm.post_sem("mutex")?;

        dsm.barrier()?;
        let mut total = [0u8; 1];
        dsm.read_at(0, &mut total)?;
        assert_eq!(total[0], 3);
        dsm.exit()
    });
    cluster.finish();
}

#[test]
fn init_times_out_without_an_arbiter() {
    let _guard = PORT_LOCK.lock();

    let cfg = Config::simple("nobody-home", 1, 4096);
    let started = Instant::now();
    let res = dsm_client::init(cfg);
    let elapsed = started.elapsed();

    assert!(matches!(res, Err(DsmError::Unavailable(15))));
    // 15 polls at 250ms each.
    assert!(elapsed >= Duration::from_secs(3), "gave up too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "took too long: {elapsed:?}");
}

#[test]
fn cohort_overflow_closes_the_extra_socket() {
    let _guard = PORT_LOCK.lock();
    let cluster = Cluster::start("overflow", 2, 4096);
    let cfg = cluster.client_config(2, 4096);

    // Fill the cohort.
    let (tx, rx) = std::sync::mpsc::channel();
    let mut joiners = Vec::new();
    for _ in 0..2 {
        let cfg = cfg.clone();
        let tx = tx.clone();
        joiners.push(thread::spawn(move || {
            tx.send(dsm_client::init(cfg).expect("cohort member")).unwrap();
        }));
    }
    let first = rx.recv().expect("first member");
    let second = rx.recv().expect("second member");
    for j in joiners {
        j.join().expect("joiner");
    }

    // One too many: the arbiter closes the socket and the blocked gid
    // wait surfaces it as an IO error.
    let extra_err = dsm_client::init(cfg.clone())
        .err()
        .expect("overflow check-in must fail");
    assert!(matches!(extra_err, DsmError::Io(_)), "got {extra_err:?}");

    // The session itself is unharmed.
    let exits = [first, second].map(|dsm| thread::spawn(move || dsm.exit()));
    for e in exits {
        e.join().expect("exit thread").expect("clean exit");
    }
    cluster.finish();
}
