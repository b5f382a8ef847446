//! Transport seam for the execution gateway.
//!
//! Strategies talk to `Arc<dyn EngineLink>`; the live implementation speaks
//! line-delimited JSON over a WebSocket, the paper implementation simulates
//! the venue in-process. Writes are serialised through a single writer task;
//! responses are correlated by request id.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::protocol::{parse_inbound, verify_op_contract, CommandEnvelope, EngineEvent};
use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait EngineLink: Send + Sync {
    /// Execute one command and await its correlated response. The caller owns
    /// the idempotency key so a timed-out command can be retried with the same
    /// key for at-most-once effect.
    async fn execute(&self, op: &str, idempotency_key: &str, payload: Value)
        -> EngineResult<Value>;

    /// Subscribe to the inbound engine event stream.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Whether ENGINE_READY has been observed and heartbeats are fresh.
    fn is_ready(&self) -> bool;
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>;

/// Live gateway link over WebSocket.
pub struct WsEngineLink {
    outbound: mpsc::Sender<String>,
    pending: Arc<PendingMap>,
    events: broadcast::Sender<EngineEvent>,
    ready: Arc<AtomicBool>,
    request_seq: AtomicU64,
    timeout_ms: u64,
}

impl WsEngineLink {
    /// Connect and spawn the reader/writer/watchdog tasks.
    pub async fn connect(
        url: &str,
        timeout_ms: u64,
        heartbeat_timeout_ms: u64,
    ) -> anyhow::Result<Arc<Self>> {
        let (ws, _) = connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(1024);
        let (events_tx, _) = broadcast::channel(4096);
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let ready = Arc::new(AtomicBool::new(false));
        let last_heartbeat = Arc::new(AtomicU64::new(0));

        // Writer: single task so command order on the wire matches call order.
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(line)).await {
                    warn!(error = %e, "engine outbound write failed");
                    break;
                }
            }
        });

        // Reader: split responses from events.
        {
            let pending = Arc::clone(&pending);
            let events = events_tx.clone();
            let ready = Arc::clone(&ready);
            let last_heartbeat = Arc::clone(&last_heartbeat);
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let text = match msg {
                        Ok(Message::Text(t)) => t,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(error = %e, "engine stream error");
                            break;
                        }
                    };
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        match parse_inbound(line) {
                            Ok(Err(frame)) => {
                                if let Some(tx) = pending.lock().remove(&frame.request_id) {
                                    let result = if frame.ok {
                                        Ok(frame.result)
                                    } else {
                                        Err(frame
                                            .error
                                            .unwrap_or_else(|| "engine rejected".to_string()))
                                    };
                                    let _ = tx.send(result);
                                }
                            }
                            Ok(Ok(event)) => {
                                match &event {
                                    EngineEvent::Ready { ops } => {
                                        verify_op_contract(ops);
                                        ready.store(true, Ordering::SeqCst);
                                        info!("engine ready");
                                    }
                                    EngineEvent::Heartbeat { .. } => {
                                        last_heartbeat.store(
                                            chrono::Utc::now().timestamp_millis() as u64,
                                            Ordering::SeqCst,
                                        );
                                    }
                                    _ => {}
                                }
                                let _ = events.send(event);
                            }
                            Err(e) => debug!(error = %e, line, "unparseable engine line"),
                        }
                    }
                }
                // Stream gone: fail all pending requests.
                ready.store(false, Ordering::SeqCst);
                for (_, tx) in pending.lock().drain() {
                    let _ = tx.send(Err("engine connection closed".to_string()));
                }
                warn!("engine connection closed");
            });
        }

        // Heartbeat watchdog: stale heartbeats park new starts with NotReady.
        {
            let ready = Arc::clone(&ready);
            let last_heartbeat = Arc::clone(&last_heartbeat);
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(heartbeat_timeout_ms / 2));
                loop {
                    ticker.tick().await;
                    let last = last_heartbeat.load(Ordering::SeqCst);
                    if last == 0 {
                        continue;
                    }
                    let age = chrono::Utc::now().timestamp_millis() as u64 - last;
                    if age > heartbeat_timeout_ms && ready.swap(false, Ordering::SeqCst) {
                        warn!(age_ms = age, "engine heartbeat stale; marking not ready");
                    }
                }
            });
        }

        Ok(Arc::new(Self {
            outbound: outbound_tx,
            pending,
            events: events_tx,
            ready,
            request_seq: AtomicU64::new(1),
            timeout_ms,
        }))
    }
}

#[async_trait]
impl EngineLink for WsEngineLink {
    async fn execute(
        &self,
        op: &str,
        idempotency_key: &str,
        payload: Value,
    ) -> EngineResult<Value> {
        let request_id = self.request_seq.fetch_add(1, Ordering::SeqCst);
        let envelope = CommandEnvelope::new(request_id, idempotency_key.to_string(), op, payload);
        let line = serde_json::to_string(&envelope)
            .map_err(|e| EngineError::Other(anyhow::anyhow!(e)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if self.outbound.send(line).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(EngineError::ChannelClosed);
        }

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(EngineError::Rejected(message)),
            Ok(Err(_)) => Err(EngineError::ChannelClosed),
            Err(_) => {
                // The pending slot is abandoned; a late response is dropped by
                // the reader finding no waiter.
                self.pending.lock().remove(&request_id);
                Err(EngineError::Timeout(self.timeout_ms))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
