//! Tokio driver for an [`Engine`].
//!
//! The engine is deterministic and never reads a clock. The driver owns the
//! clock: it feeds wall-clock milliseconds into every call, sleeps until the
//! engine's next deadline and opens a connection when the engine asks.

use std::sync::Arc;
use std::time::Duration;

use tessera_engine::{Delivery, Engine, LinkRequest, Timestamp};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::link::{self, LinkEvent};
use crate::now_millis;

/// Handle to a running engine.
#[derive(Debug)]
pub struct SyncClient {
    engine: Arc<Mutex<Engine>>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl SyncClient {
    /// Spawn the driver task for an engine.
    ///
    /// Must be called from inside a Tokio runtime.
    pub fn start(engine: Engine, config: ClientConfig) -> Self {
        let engine = Arc::new(Mutex::new(engine));
        let wake = Arc::new(Notify::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            engine: engine.clone(),
            config,
            wake: wake.clone(),
            shutdown: shutdown_rx,
            events_tx,
            events_rx,
            generation: 0,
            connection: None,
        };

        Self {
            engine,
            wake,
            shutdown,
            driver: tokio::spawn(driver.run()),
        }
    }

    /// Shared engine. Call [`SyncClient::wake`] after mutating it directly so
    /// new deadlines are picked up before the next tick.
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        self.engine.clone()
    }

    /// Run a closure against the engine with the current time, then wake
    /// the driver.
    pub async fn with_engine<R>(&self, f: impl FnOnce(&mut Engine, Timestamp) -> R) -> R {
        let result = {
            let mut engine = self.engine.lock().await;
            f(&mut engine, now_millis())
        };
        self.wake();
        result
    }

    /// Ask the driver to re-poll the engine now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Close the sync session, stop the driver and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        self.engine.lock().await.close();
        let _ = self.shutdown.send(true);
        self.driver.await?;
        Ok(())
    }
}

struct Driver {
    engine: Arc<Mutex<Engine>>,
    config: ClientConfig,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    generation: u64,
    connection: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self) {
        tracing::info!(session = %self.config.session_id, url = %self.config.url, "sync driver started");

        loop {
            let sleep_for = self.tick().await;

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => self.handle(event).await,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        self.engine.lock().await.close();
        tracing::info!(session = %self.config.session_id, "sync driver stopped");
    }

    /// Poll the engine and return how long to sleep.
    async fn tick(&mut self) -> Duration {
        let now = now_millis();
        let (request, deadline) = {
            let mut engine = self.engine.lock().await;
            let request = engine.poll(now);
            (request, engine.next_deadline())
        };

        if let Some(LinkRequest::Connect) = request {
            self.connect();
        }

        let until_deadline = deadline
            .map(|at| Duration::from_millis(at.saturating_sub(now_millis())))
            .unwrap_or(self.config.tick);
        until_deadline.min(self.config.tick)
    }

    fn connect(&mut self) {
        if let Some(previous) = self.connection.take() {
            previous.abort();
        }
        self.generation += 1;
        tracing::debug!(generation = self.generation, url = %self.config.url, "opening link");
        self.connection = Some(link::connect(
            &self.config,
            self.generation,
            self.events_tx.clone(),
        ));
    }

    async fn handle(&mut self, event: LinkEvent) {
        if event.generation() != self.generation {
            tracing::debug!(generation = event.generation(), current = self.generation, "ignoring stale link event");
            return;
        }

        let now = now_millis();
        let mut engine = self.engine.lock().await;

        match event {
            LinkEvent::Opened { link, .. } => engine.on_open(link, now),
            LinkEvent::Frame { text, .. } => match engine.handle_frame(&text, now) {
                Delivery::Dropped(reason) => {
                    tracing::debug!(?reason, "frame dropped");
                }
                delivery => {
                    tracing::trace!(?delivery, "frame delivered");
                }
            },
            LinkEvent::Closed { .. } => {
                self.connection = None;
                engine.on_close(now);
            }
            LinkEvent::Failed { reason, .. } => {
                self.connection = None;
                engine.on_error(&reason, now);
            }
        }
    }
}
