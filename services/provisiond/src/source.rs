//! Reservation event sources.
//!
//! A source yields an ordered stream of [`SourceEvent`]s. Replaying sources
//! mark the end of their historical backlog with [`SourceEvent::SyncDone`];
//! the engine holds cleanup back until it has seen that sentinel.
//!
//! The engine consumes events one at a time and does not buffer: a slow
//! provision run blocks the source, which is the intended backpressure.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use plfm_gridtypes::Workload;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One event from a reservation source.
#[derive(Debug)]
pub enum SourceEvent {
    /// A workload to provision or decommission.
    Workload(Box<Workload>),

    /// The source finished replaying historical state.
    SyncDone,
}

/// An ordered stream of reservation events.
///
/// The engine selects over `next()` together with its other inputs, so the
/// future must be safe to drop and re-create without losing an event.
/// Channel-backed sources have this for free; [`FifoSource`] does not and is
/// meant to be wrapped in a [`CombinedSource`].
#[async_trait]
pub trait Source: Send {
    /// The next event, or `None` once the source is permanently drained.
    async fn next(&mut self) -> Option<SourceEvent>;
}

/// Decode one wire event. A payload whose `last` field is true is the replay
/// sentinel regardless of what else it carries.
pub fn decode_event(payload: &str) -> Result<SourceEvent, serde_json::Error> {
    #[derive(Deserialize)]
    struct Flags {
        #[serde(default)]
        last: bool,
    }

    if serde_json::from_str::<Flags>(payload)
        .map(|flags| flags.last)
        .unwrap_or(false)
    {
        return Ok(SourceEvent::SyncDone);
    }

    let workload: Workload = serde_json::from_str(payload)?;
    Ok(SourceEvent::Workload(Box::new(workload)))
}

/// Local source reading JSON lines from a named pipe.
///
/// The pipe is created if missing. Writers come and go; the source survives
/// EOF by reopening and waiting for the next writer. It never drains.
pub struct FifoSource {
    path: PathBuf,
    reader: Option<BufReader<pipe::Receiver>>,
}

impl FifoSource {
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        match nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o644)) {
            Ok(()) => info!(path = %path.display(), "created reservation pipe"),
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self { path, reader: None })
    }

    fn open(&self) -> std::io::Result<BufReader<pipe::Receiver>> {
        let receiver = pipe::OpenOptions::new().open_receiver(&self.path)?;
        Ok(BufReader::new(receiver))
    }
}

#[async_trait]
impl Source for FifoSource {
    async fn next(&mut self) -> Option<SourceEvent> {
        loop {
            if self.reader.is_none() {
                match self.open() {
                    Ok(reader) => self.reader = Some(reader),
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "failed to open reservation pipe");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                }
            }

            let reader = self.reader.as_mut().expect("reader opened above");
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                // writer side closed; reopen and wait for the next one
                Ok(0) => {
                    self.reader = None;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(_) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match decode_event(line) {
                        Ok(event) => return Some(event),
                        Err(e) => warn!(error = %e, "dropping undecodable pipe event"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "reservation pipe read failed");
                    self.reader = None;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Polling source over an HTTP reservation endpoint.
///
/// The first successful poll is the historical replay and is closed with
/// [`SourceEvent::SyncDone`]; afterwards the endpoint is re-polled on an
/// interval and the engine's dedup cache collapses the repeats.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    poll_interval: Duration,
    retry_interval: Duration,
    pending: VecDeque<SourceEvent>,
    replayed: bool,
}

impl HttpSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            poll_interval: Duration::from_secs(10 * 60),
            retry_interval: Duration::from_secs(10),
            pending: VecDeque::new(),
            replayed: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn poll(&self) -> anyhow::Result<Vec<Workload>> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("reservation poll failed with status {}", response.status());
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn next(&mut self) -> Option<SourceEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            if self.replayed {
                tokio::time::sleep(self.poll_interval).await;
            }

            match self.poll().await {
                Ok(workloads) => {
                    debug!(count = workloads.len(), url = %self.url, "polled reservations");
                    self.pending.extend(
                        workloads
                            .into_iter()
                            .map(|wl| SourceEvent::Workload(Box::new(wl))),
                    );
                    if !self.replayed {
                        self.pending.push_back(SourceEvent::SyncDone);
                        self.replayed = true;
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "reservation poll failed, will retry");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }
}

/// Merges several sources into one ordered-per-source stream.
///
/// Drains only when every inner source has drained.
pub struct CombinedSource {
    rx: mpsc::Receiver<SourceEvent>,
}

impl CombinedSource {
    pub fn new(sources: Vec<Box<dyn Source>>) -> Self {
        // capacity 1: inner sources block while the engine works an event
        let (tx, rx) = mpsc::channel(1);
        for mut source in sources {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = source.next().await {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }

        Self { rx }
    }
}

#[async_trait]
impl Source for CombinedSource {
    async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }
}

/// Source fed directly from a channel. The test harness's stand-in for the
/// grid.
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceEvent>,
}

/// A `(sender, source)` pair for tests.
pub fn channel_source(buffer: usize) -> (mpsc::Sender<SourceEvent>, ChannelSource) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, ChannelSource { rx })
}

#[async_trait]
impl Source for ChannelSource {
    async fn next(&mut self) -> Option<SourceEvent> {
        self.rx.recv().await
    }
}
