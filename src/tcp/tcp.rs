use std::{
    io,
    net::TcpListener,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Result, anyhow, bail};
use log::{debug, error, info};
use tokio::{signal, sync::Notify};

use crate::{config::Config, context::*, pool::WorkerPool, runtime};

/// The proxy server: a listening socket, and a worker pool processing the
/// accepted connections.
pub(crate) struct Server {
    config: Arc<Config>,
    pool: WorkerPool,
    /// Wakes up the accept loop when shutting down.
    stop: Notify,
    stopped: AtomicBool,
}

impl Server {
    pub(crate) fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            pool: WorkerPool::new(config.threads)?,
            config: Arc::new(config),
            stop: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Binds the configured address and serves connections until shut down
    /// (see `shutdown`) or interrupted.
    pub(crate) fn start(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener)
    }

    pub(crate) fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind)
            .map_err(|e| anyhow!("Could not bind to {}: {e}", self.config.bind))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Accepts connections on `listener` and hands them over to the workers.
    /// Returns once the listener is closed and all queued connections were
    /// processed.
    pub(crate) fn serve(&self, listener: TcpListener) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            bail!("Server was shut down");
        }

        let runtime = runtime!()?;
        self.pool.start()?;
        info!(
            "Listening on {} ({} workers)",
            listener.local_addr()?,
            self.pool.size()
        );

        let ret = runtime.block_on(self.accept_loop(listener));

        // The listener is closed by now, drain the pool.
        debug!("Waiting for queued connections");
        self.shutdown();
        info!("Server stopped");

        ret
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<()> {
        let listener = tokio::net::TcpListener::from_std(listener)?;

        loop {
            let (stream, peer) = tokio::select! {
                ret = listener.accept() => match ret {
                    Ok(conn) => conn,
                    // Do not fail on stream errors.
                    Err(e) => {
                        error!("Connection error: {e}");
                        continue;
                    }
                },
                _ = self.stop.notified() => {
                    info!("Closing listener");
                    break;
                }
                ret = signal::ctrl_c() => {
                    match ret {
                        Ok(()) => info!("Interrupted, closing listener"),
                        Err(e) => error!("Could not listen for interrupts, closing listener: {e}"),
                    }
                    break;
                }
            };

            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    match e.kind() {
                        // Even in this small window the client could close the connection.
                        io::ErrorKind::NotConnected => (),
                        _ => error!("Could not get local address: {e}"),
                    }
                    continue;
                }
            };

            let config = Arc::clone(&self.config);
            let job = move || {
                let runtime = match runtime!() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Could not get the runtime: {e}");
                        return;
                    }
                };

                runtime.block_on(with_req_context(
                    ReqContext::from(local, peer),
                    async move {
                        debug!("New connection from client");
                        super::dispatch::handle_stream(&config, stream).await
                    },
                ));
            };

            // A rejected job is dropped along with its connection.
            if let Err(e) = self.pool.schedule(job) {
                error!("Could not handle connection from {peer}: {e}");
            }
        }

        Ok(())
    }

    /// Stops accepting connections and waits for the queued ones to be
    /// processed. Can be called at any time, any number of times.
    pub(crate) fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("Stopping server...");
            self.stop.notify_one();
        }
        self.pool.shutdown();
    }
}
