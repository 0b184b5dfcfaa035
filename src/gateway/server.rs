//! Accept loop and gateway lifecycle.
//!
//! The server owns the two long-lived pieces: the bounded handoff queue and
//! the bus worker thread. Everything else is per-connection and disposable.

use anyhow::{Context, Result};
use flume::Sender;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::GatewayConfig;
use crate::gateway::link::BusOpener;
use crate::gateway::session;
use crate::gateway::transaction::Transaction;
use crate::gateway::worker::RtuWorker;

/// Depth of the session-to-worker handoff queue. Beyond this, clients are
/// answered with a busy exception instead of queueing unboundedly.
const HANDOFF_DEPTH: usize = 32;
/// Accept loop poll interval; bounds shutdown latency.
const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// How long shutdown waits for the worker to finish its current exchange.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    submit: Sender<Transaction>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    cfg: Arc<GatewayConfig>,
}

impl Server {
    /// Open the bus, bind the listener, and start the worker thread.
    ///
    /// Either resource failing to come up is fatal; the caller is expected
    /// to exit nonzero.
    pub fn bind(cfg: GatewayConfig, opener: Box<dyn BusOpener>) -> Result<Self> {
        let link = opener.open()?;

        let addr = cfg.listen_addr();
        let listener =
            TcpListener::bind(&addr).with_context(|| format!("Binding TCP listener at {addr}"))?;
        listener
            .set_nonblocking(true)
            .context("Setting TCP listener non-blocking mode")?;
        let local_addr = listener.local_addr().context("Reading bound address")?;

        let (submit, queue) = flume::bounded(HANDOFF_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker =
            RtuWorker::new(queue, opener, cfg.rtu.clone(), shutdown.clone(), link).spawn();

        Ok(Self {
            listener,
            local_addr,
            submit,
            worker: Some(worker),
            shutdown,
            cfg: Arc::new(cfg),
        })
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Flag that stops the accept loop and the worker when set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Accept clients until the shutdown flag is set, then drain the worker.
    pub fn run(mut self) -> Result<()> {
        log::info!(
            "Listening on {} for {}",
            self.local_addr,
            self.cfg.rtu.port
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            let (stream, _addr) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                Err(err) => {
                    log::warn!("Accept failed: {err}");
                    continue;
                }
            };
            let submit = self.submit.clone();
            let cfg = self.cfg.clone();
            thread::spawn(move || session::run_session(stream, submit, cfg));
        }

        self.drain();
        Ok(())
    }

    /// Stop accepting and give the worker a bounded window to finish.
    fn drain(&mut self) {
        log::info!("Shutting down");
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(worker) = self.worker.take() {
            let started = Instant::now();
            while !worker.is_finished() && started.elapsed() < DRAIN_WAIT {
                thread::sleep(Duration::from_millis(50));
            }
            if worker.is_finished() {
                let _ = worker.join();
                log::info!("RTU worker drained");
            } else {
                // a stuck device can hold a serial read until its timeout;
                // the process exits anyway and the OS reclaims the port
                log::warn!(
                    "RTU worker still busy after {}s, abandoning it",
                    DRAIN_WAIT.as_secs()
                );
            }
        }
        log::info!("Shutdown complete");
    }
}
