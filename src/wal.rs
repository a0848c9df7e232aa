//! Per-salon write-ahead log.
//!
//! Record layout: `[u32 le: len][bincode Event][u32 le: crc32 of payload]`.
//! A torn or corrupt tail (crash mid-write) ends replay at the last good record.
//!
//! One background task owns the file. Callers talk to it through [`WalHandle`],
//! and appends that arrive together share a single fsync.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};

const CHANNEL_DEPTH: usize = 4096;

fn write_record(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `Ok(None)` on a clean end of file or any damaged record.
fn read_record(input: &mut impl Read) -> io::Result<Option<Event>> {
    let mut word = [0u8; 4];
    if !read_full(input, &mut word)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(word) as usize];
    if !read_full(input, &mut payload)? || !read_full(input, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload).ok())
}

fn read_full(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

pub struct Wal {
    file: File,
    path: PathBuf,
    appends_since_compact: u64,
    /// Write only this many bytes of the next batch, then fail.
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Every intact record in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut input = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(event) = read_record(&mut input)? {
            events.push(event);
        }
        Ok(events)
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.commit(std::slice::from_ref(event))
    }

    /// Rewrite the log as `events`: write a sibling temp file, fsync, rename over.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp = self.path.with_extension("wal.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for event in events {
                write_record(&mut out, event)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a batch and fsync once. A batch is all or nothing: on failure
    /// the file is cut back to where the batch began.
    fn commit(&mut self, events: &[Event]) -> io::Result<()> {
        let mut batch = Vec::new();
        for event in events {
            write_record(&mut batch, event)?;
        }
        let start = self.file.metadata()?.len();
        if let Err(e) = self.write_batch(&batch) {
            if let Err(cut) = self.file.set_len(start).and_then(|()| self.file.sync_all()) {
                tracing::error!("WAL rollback to {start} bytes failed: {cut}");
            }
            return Err(e);
        }
        self.appends_since_compact += events.len() as u64;
        Ok(())
    }

    fn write_batch(&mut self, batch: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(limit) = self.fail_after.take() {
                self.file.write_all(&batch[..limit.min(batch.len())])?;
                return Err(io::Error::other("injected write failure"));
            }
        }
        self.file.write_all(batch)?;
        self.file.sync_all()
    }
}

enum Command {
    Append {
        event: Event,
        done: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        done: oneshot::Sender<io::Result<()>>,
    },
    Stats {
        done: oneshot::Sender<u64>,
    },
}

/// Cloneable sender side of the writer task.
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::Sender<Command>,
}

impl WalHandle {
    /// Move `wal` onto a background task. Must be called inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(writer_loop(wal, rx));
        Self { tx }
    }

    /// Resolves once the record is on disk.
    pub async fn append(&self, event: Event) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Append { event, done }).await?;
        rx.await.map_err(|_| gone())?
    }

    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Compact { events, done }).await?;
        rx.await.map_err(|_| gone())?
    }

    pub async fn appends_since_compact(&self) -> io::Result<u64> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Stats { done }).await?;
        rx.await.map_err(|_| gone())
    }

    async fn send(&self, cmd: Command) -> io::Result<()> {
        self.tx.send(cmd).await.map_err(|_| gone())
    }
}

#[cfg(test)]
impl WalHandle {
    /// A handle whose writer has already exited. Every call fails.
    pub fn closed() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "WAL writer shut down")
}

/// Block for one command; if it is an append, sweep up every append already
/// queued behind it and commit them together. A non-append found while
/// sweeping runs after the batch is answered.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        let mut events = Vec::new();
        let mut waiters = Vec::new();
        let mut deferred = None;

        match cmd {
            Command::Append { event, done } => {
                events.push(event);
                waiters.push(done);
                while let Ok(next) = rx.try_recv() {
                    match next {
                        Command::Append { event, done } => {
                            events.push(event);
                            waiters.push(done);
                        }
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
            }
            other => deferred = Some(other),
        }

        if !events.is_empty() {
            metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(events.len() as f64);
            let started = Instant::now();
            let result = wal.commit(&events);
            metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
            if let Err(e) = &result {
                tracing::error!("WAL commit of {} records failed: {e}", events.len());
            }
            for done in waiters {
                let reply = match &result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                };
                let _ = done.send(reply);
            }
        }

        match deferred {
            Some(Command::Compact { events, done }) => {
                let _ = done.send(wal.compact(&events));
            }
            Some(Command::Stats { done }) => {
                let _ = done.send(wal.appends_since_compact());
            }
            Some(Command::Append { .. }) | None => {}
        }
    }
}
