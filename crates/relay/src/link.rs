//! Relay link (bridge side).
//!
//! A background task keeps a TCP connection to the companion's
//! [`RelayReceiver`](crate::RelayReceiver). Every forwarded payload goes
//! through the task's queue. While the link is up the task writes MESSAGE
//! frames. While it is down it keeps the newest payload in the
//! [`ContextStore`] and pushes it as a CONTEXT frame on next contact, before
//! anything queued after it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::RelayError;
use crate::store::{ContextStore, StoredContext};
use crate::wire::{FrameKind, MAX_PAYLOAD_LEN, RelayFrame, write_frame};
use crate::{LINK_CONNECT_TIMEOUT, RelaySink};

/// [`RelaySink`] that delivers payloads to a companion over TCP.
pub struct PeerRelay {
    queue: mpsc::UnboundedSender<String>,
    reachable: Arc<AtomicBool>,
    store: Arc<ContextStore>,
    cancel: CancellationToken,
}

impl PeerRelay {
    /// Starts the link task towards `addr` (`host:port`).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(addr: impl Into<String>, store: ContextStore, retry_interval: Duration) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let reachable = Arc::new(AtomicBool::new(false));
        let store = Arc::new(store);
        let cancel = CancellationToken::new();

        let link = Link {
            addr: addr.into(),
            queue: queue_rx,
            reachable: reachable.clone(),
            store: store.clone(),
            cancel: cancel.clone(),
            retry_interval,
        };
        tokio::spawn(link.run());

        Self {
            queue,
            reachable,
            store,
            cancel,
        }
    }

    /// Returns `true` while a TCP connection to the companion is up.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// The store holding the value waiting for the companion.
    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Stops the link task. Pending context stays in the store.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl RelaySink for PeerRelay {
    fn forward(&self, payload: &str) {
        if payload.len() > MAX_PAYLOAD_LEN {
            warn!(
                bytes = payload.len(),
                max = MAX_PAYLOAD_LEN,
                "payload too long for the relay link, dropped"
            );
            return;
        }

        match self.queue.send(payload.to_owned()) {
            Ok(()) => trace!(bytes = payload.len(), "queued relay payload"),
            Err(_) => debug!("relay link stopped, payload dropped"),
        }
    }
}

impl Drop for PeerRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Link {
    addr: String,
    queue: mpsc::UnboundedReceiver<String>,
    reachable: Arc<AtomicBool>,
    store: Arc<ContextStore>,
    cancel: CancellationToken,
    retry_interval: Duration,
}

impl Link {
    async fn run(mut self) {
        loop {
            match self.connect().await {
                Ok(stream) => match self.serve(stream).await {
                    Ok(()) | Err(RelayError::Cancelled) if self.cancel.is_cancelled() => return,
                    Ok(()) => info!(addr = %self.addr, "relay link closed by companion"),
                    Err(e) => warn!(addr = %self.addr, error = %e, "relay link failed"),
                },
                Err(RelayError::Cancelled) => return,
                Err(e) => debug!(addr = %self.addr, error = %e, "companion unreachable"),
            }

            let retry = tokio::time::sleep(self.retry_interval);
            tokio::pin!(retry);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = &mut retry => break,
                    msg = self.queue.recv() => match msg {
                        Some(payload) => save_context(&self.store, payload).await,
                        None => return,
                    },
                }
            }
        }
    }

    /// Opens the TCP connection. Payloads forwarded meanwhile are stored.
    async fn connect(&mut self) -> Result<TcpStream, RelayError> {
        let connecting =
            tokio::time::timeout(LINK_CONNECT_TIMEOUT, TcpStream::connect(self.addr.as_str()));
        tokio::pin!(connecting);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                result = &mut connecting => {
                    return match result {
                        Ok(Ok(stream)) => Ok(stream),
                        Ok(Err(e)) => Err(e.into()),
                        Err(_) => Err(RelayError::Timeout),
                    };
                }
                msg = self.queue.recv() => match msg {
                    Some(payload) => save_context(&self.store, payload).await,
                    None => return Err(RelayError::Cancelled),
                },
            }
        }
    }

    /// Runs one connected period. Returns `Ok(())` when the companion hangs up.
    async fn serve(&mut self, stream: TcpStream) -> Result<(), RelayError> {
        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);

        // Whatever is queued now predates the link and joins the context.
        self.stash_queued(None).await;
        if let Some(pending) = self.store.current() {
            let frame = RelayFrame {
                kind: FrameKind::Context,
                payload: pending.message.clone(),
            };
            write_frame(&mut writer, &frame).await?;
            writer.flush().await?;
            debug!(updated_at = %pending.updated_at, "pushed stored context");
            clear_context(&self.store, pending).await;
        }

        self.reachable.store(true, Ordering::SeqCst);
        info!(addr = %self.addr, "relay link up");

        // The companion never writes; reading only detects hang-up.
        let mut scratch = [0u8; 64];
        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Err(RelayError::Cancelled),
                read = reader.read(&mut scratch) => match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => trace!(bytes = n, "ignoring bytes from companion"),
                    Err(e) => break Err(e.into()),
                },
                msg = self.queue.recv() => match msg {
                    Some(payload) => {
                        if let Err(e) = deliver(&mut writer, &payload).await {
                            self.reachable.store(false, Ordering::SeqCst);
                            self.stash_queued(Some(payload)).await;
                            return Err(e);
                        }
                    }
                    None => break Err(RelayError::Cancelled),
                },
            }
        };

        self.reachable.store(false, Ordering::SeqCst);
        self.stash_queued(None).await;
        result
    }

    /// Moves queued payloads into the store, keeping only the newest.
    async fn stash_queued(&mut self, failed: Option<String>) {
        let mut latest = failed;
        while let Ok(payload) = self.queue.try_recv() {
            latest = Some(payload);
        }
        if let Some(payload) = latest {
            save_context(&self.store, payload).await;
        }
    }
}

/// Persists `payload` off the runtime threads.
async fn save_context(store: &Arc<ContextStore>, payload: String) {
    let bytes = payload.len();
    let result = tokio::task::spawn_blocking({
        let store = store.clone();
        move || store.save(&payload)
    })
    .await;
    match result {
        Ok(Ok(())) => debug!(bytes, "companion unreachable, stored context"),
        Ok(Err(e)) => warn!(error = %e, "failed to persist relay context"),
        Err(e) => warn!(error = %e, "context save task failed"),
    }
}

async fn clear_context(store: &Arc<ContextStore>, delivered: StoredContext) {
    let result = tokio::task::spawn_blocking({
        let store = store.clone();
        move || store.clear_if(&delivered)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "failed to clear delivered context"),
        Err(e) => warn!(error = %e, "context clear task failed"),
    }
}

async fn deliver(
    writer: &mut BufWriter<OwnedWriteHalf>,
    payload: &str,
) -> Result<(), RelayError> {
    let frame = RelayFrame {
        kind: FrameKind::Message,
        payload: payload.to_owned(),
    };
    write_frame(writer, &frame).await?;
    writer.flush().await?;
    trace!(bytes = payload.len(), "relayed message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::read_frame;
    use tokio::net::TcpListener;

    const RETRY: Duration = Duration::from_millis(20);
    const WAIT: Duration = Duration::from_secs(5);

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn forwards_message_while_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let relay = PeerRelay::spawn(addr, ContextStore::in_memory(), RETRY);
        let (mut companion, _) = listener.accept().await.unwrap();
        wait_until(|| relay.is_reachable()).await;

        relay.forward("hello");

        let frame = read_frame(&mut companion).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.payload, "hello");
        assert!(relay.store().current().is_none());
    }

    #[tokio::test]
    async fn unreachable_payload_is_pushed_as_context_on_contact() {
        // Reserve a port, then free it so the first attempts are refused.
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let relay = PeerRelay::spawn(addr.to_string(), ContextStore::in_memory(), RETRY);
        relay.forward("stale");
        relay.forward("offline");
        assert!(!relay.is_reachable());
        wait_until(|| relay.store().current().is_some_and(|c| c.message == "offline")).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        let (mut companion, _) = listener.accept().await.unwrap();

        let frame = read_frame(&mut companion).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Context);
        assert_eq!(frame.payload, "offline");

        wait_until(|| relay.is_reachable()).await;
        assert!(relay.store().current().is_none());
    }

    #[tokio::test]
    async fn companion_hangup_falls_back_to_store() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");

        let relay = PeerRelay::spawn(addr, ContextStore::open(&path), Duration::from_secs(60));
        let (companion, _) = listener.accept().await.unwrap();
        wait_until(|| relay.is_reachable()).await;

        drop(companion);
        wait_until(|| !relay.is_reachable()).await;

        relay.forward("while away");
        wait_until(|| path.exists()).await;
        assert_eq!(relay.store().current().unwrap().message, "while away");
        assert_eq!(
            ContextStore::open(&path).current().unwrap().message,
            "while away"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn forwards_during_context_push_keep_order() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let store = ContextStore::in_memory();
        store.save("initial").unwrap();
        let relay = Arc::new(PeerRelay::spawn(addr.to_string(), store, RETRY));

        // Keep forwarding from a plain thread until the link comes up, then a
        // few more so some land while the context push is in flight.
        let forwarder = std::thread::spawn({
            let relay = relay.clone();
            move || {
                let mut n = 0u32;
                while !relay.is_reachable() && n < 50_000 {
                    relay.forward(&format!("m{n}"));
                    n += 1;
                    std::thread::sleep(Duration::from_micros(50));
                }
                for _ in 0..5 {
                    relay.forward(&format!("m{n}"));
                    n += 1;
                }
                n - 1
            }
        });

        let listener = TcpListener::bind(addr).await.unwrap();
        let (mut companion, _) = listener.accept().await.unwrap();
        let last = tokio::task::spawn_blocking(move || forwarder.join().unwrap())
            .await
            .unwrap();

        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(WAIT, read_frame(&mut companion))
                .await
                .expect("companion starved")
                .unwrap()
                .unwrap();
            let done = frame.payload == format!("m{last}");
            frames.push(frame);
            if done {
                break;
            }
        }

        assert_eq!(frames[0].kind, FrameKind::Context);
        assert!(frames[1..].iter().all(|f| f.kind == FrameKind::Message));

        let seq: Vec<u32> = frames
            .iter()
            .filter_map(|f| f.payload.strip_prefix('m'))
            .map(|n| n.parse().unwrap())
            .collect();
        assert!(seq.windows(2).all(|w| w[0] < w[1]), "out of order: {seq:?}");

        assert!(relay.is_reachable());
        assert!(relay.store().current().is_none());
    }

    #[tokio::test]
    async fn context_file_from_previous_run_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        ContextStore::open(&path).save("from last run").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let relay = PeerRelay::spawn(addr, ContextStore::open(&path), RETRY);
        let (mut companion, _) = listener.accept().await.unwrap();

        let frame = read_frame(&mut companion).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Context);
        assert_eq!(frame.payload, "from last run");

        wait_until(|| relay.is_reachable()).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn oversized_payload_is_dropped() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap().to_string();
        drop(reserved);

        let relay = PeerRelay::spawn(addr, ContextStore::in_memory(), RETRY);
        relay.forward(&"x".repeat(MAX_PAYLOAD_LEN + 1));
        assert!(relay.store().current().is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let relay = PeerRelay::spawn(addr, ContextStore::in_memory(), RETRY);
        let (mut companion, _) = listener.accept().await.unwrap();
        wait_until(|| relay.is_reachable()).await;

        relay.shutdown();
        wait_until(|| !relay.is_reachable()).await;

        // The link task drops its socket on exit.
        let end = read_frame(&mut companion).await.unwrap();
        assert!(end.is_none());
    }
}
