//! One channel to the server.
//!
//! A [`Connection`] owns the write half of a transport behind an async mutex and a
//! receive worker that owns the read half. The worker unseals each incoming message,
//! splits compound chains and routes every member by message id to the waiting
//! request. Unsolicited break notifications go to the session's notification queue.
//! When the transport fails, every waiting request is failed with
//! [`Error::ConnectionClosed`] and the credit window is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use smb_msg::{Header, PlainResponse, split_compound};
use smb_transport::{SmbTransport, SmbTransportRead, SmbTransportWrite, TransportError};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credits::CreditWindow;
use crate::transform::TransformProvider;
use crate::{Error, Result};

/// Message id the server uses for unsolicited notifications.
pub const NOTIFICATION_MESSAGE_ID: u64 = u64::MAX;

/// A routed response.
#[derive(Debug)]
pub struct Reply {
    pub message: PlainResponse,
    /// The message bytes as received, kept only when asked for at registration.
    pub raw: Option<Vec<u8>>,
}

/// An unsolicited message from the server, tagged with the channel it came on.
#[derive(Debug)]
pub struct Notification {
    pub channel_id: u32,
    pub message: PlainResponse,
}

/// The receiving side of one registered request.
#[derive(Debug)]
pub struct Registration {
    pub message_id: u64,
    pub rx: oneshot::Receiver<Result<Reply>>,
    /// Zero until an interim response assigns an async id.
    pub async_id: Arc<AtomicU64>,
}

struct PendingReply {
    tx: oneshot::Sender<Result<Reply>>,
    async_id: Arc<AtomicU64>,
    charge: u16,
    interim: bool,
    keep_raw: bool,
}

struct Shared {
    id: u32,
    pending: Mutex<HashMap<u64, PendingReply>>,
    credits: CreditWindow,
    closed: CancellationToken,
    notifications: mpsc::UnboundedSender<Notification>,
    transform: Arc<dyn TransformProvider>,
}

pub struct Connection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Box<dyn SmbTransportWrite>>,
    peer: String,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Splits `transport` and starts the receive worker on the current runtime.
    pub fn start(
        id: u32,
        transport: Box<dyn SmbTransport>,
        credits_backlog: u16,
        transform: Arc<dyn TransformProvider>,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Result<Arc<Connection>> {
        let peer = transport.peer();
        let (reader, writer) = transport.split()?;
        let shared = Arc::new(Shared {
            id,
            pending: Mutex::new(HashMap::new()),
            credits: CreditWindow::new(credits_backlog),
            closed: CancellationToken::new(),
            notifications,
            transform,
        });
        let worker = tokio::spawn(Self::receive_loop(shared.clone(), reader));
        log::debug!("[channel {id}] Connected to {peer}");
        Ok(Arc::new(Connection {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            peer,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn credits(&self) -> &CreditWindow {
        &self.shared.credits
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the channel has failed or been stopped.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Registers interest in the response to `message_id` before the request is sent.
    pub fn register(&self, message_id: u64, charge: u16, keep_raw: bool) -> Result<Registration> {
        let (tx, rx) = oneshot::channel();
        let async_id = Arc::new(AtomicU64::new(0));
        let mut pending = self.shared.lock_pending();
        // Checked under the lock so a concurrent shutdown cannot miss this slot.
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        pending.insert(
            message_id,
            PendingReply {
                tx,
                async_id: async_id.clone(),
                charge,
                interim: false,
                keep_raw,
            },
        );
        Ok(Registration {
            message_id,
            rx,
            async_id,
        })
    }

    /// Drops a registration whose request never made it onto the wire.
    pub fn forget(&self, message_id: u64) {
        if let Some(slot) = self.shared.lock_pending().remove(&message_id) {
            self.shared.credits.on_response(slot.charge, 0);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Writes one message or chain. A fatal transport error closes the channel.
    pub async fn send_raw(&self, message: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let result = self.writer.lock().await.send(message).await;
        if let Err(e) = result {
            if e.is_fatal() {
                log::error!("[channel {}] Send failed, closing: {e}", self.id());
                self.shared.shutdown();
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Stops the worker and fails everything still waiting.
    pub fn stop(&self) {
        self.shared.shutdown();
        if let Some(worker) = self.worker.lock().ok().and_then(|mut w| w.take()) {
            worker.abort();
        }
    }

    async fn receive_loop(shared: Arc<Shared>, mut reader: Box<dyn SmbTransportRead>) {
        loop {
            let received = select! {
                _ = shared.closed.cancelled() => break,
                received = reader.receive() => received,
            };
            match received {
                Ok(message) => shared.dispatch(message),
                Err(TransportError::Closed) => {
                    log::info!("[channel {}] Connection closed by peer", shared.id);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    log::error!("[channel {}] Receive failed: {e}", shared.id);
                    break;
                }
                Err(e) => log::warn!("[channel {}] Ignoring receive error: {e}", shared.id),
            }
        }
        shared.shutdown();
        log::debug!("[channel {}] Receive worker stopped", shared.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingReply>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shutdown(&self) {
        let drained: Vec<PendingReply> = {
            let mut pending = self.lock_pending();
            self.closed.cancel();
            pending.drain().map(|(_, slot)| slot).collect()
        };
        self.credits.close();
        if !drained.is_empty() {
            log::debug!(
                "[channel {}] Failing {} pending requests",
                self.id,
                drained.len()
            );
        }
        for slot in drained {
            let _ = slot.tx.send(Err(Error::ConnectionClosed));
        }
    }

    fn dispatch(&self, message: Vec<u8>) {
        let plain = match self.transform.unseal(message) {
            Ok(plain) => plain,
            Err(e) => {
                log::error!("[channel {}] Dropping message: {e}", self.id);
                return;
            }
        };
        match split_compound(&plain) {
            Ok(members) => members.into_iter().for_each(|m| self.dispatch_one(m)),
            Err(e) => log::error!("[channel {}] Dropping malformed chain: {e}", self.id),
        }
    }

    fn dispatch_one(&self, raw: &[u8]) {
        let header = match Header::parse(raw) {
            Ok(header) => header,
            Err(e) => {
                log::error!("[channel {}] Dropping message with bad header: {e}", self.id);
                return;
            }
        };
        if !header.flags.server_to_redir() {
            log::warn!(
                "[channel {}] Dropping message {} without the response flag",
                self.id,
                header.message_id
            );
            return;
        }
        let decoded = PlainResponse::decode(raw).map_err(Error::from);

        if header.message_id == NOTIFICATION_MESSAGE_ID {
            match decoded {
                Ok(message) => {
                    let notification = Notification {
                        channel_id: self.id,
                        message,
                    };
                    if self.notifications.send(notification).is_err() {
                        log::warn!("[channel {}] Notification queue is gone", self.id);
                    }
                }
                Err(e) => log::error!("[channel {}] Bad notification: {e}", self.id),
            }
            return;
        }

        let mut pending = self.lock_pending();
        let Some(slot) = pending.get_mut(&header.message_id) else {
            log::warn!(
                "[channel {}] No request waits for message id {}",
                self.id,
                header.message_id
            );
            return;
        };

        if let Ok(message) = &decoded {
            if message.is_interim() {
                if let Some(async_id) = message.header.async_id {
                    slot.async_id.store(async_id, Ordering::SeqCst);
                }
                if !slot.interim {
                    slot.interim = true;
                    self.credits.on_response(slot.charge, header.credit_request);
                }
                log::trace!(
                    "[channel {}] Message {} went async",
                    self.id,
                    header.message_id
                );
                return;
            }
        }

        let Some(slot) = pending.remove(&header.message_id) else {
            return;
        };
        drop(pending);
        let charged = if slot.interim { 0 } else { slot.charge };
        self.credits.on_response(charged, header.credit_request);
        let reply = decoded.map(|message| Reply {
            message,
            raw: slot.keep_raw.then(|| raw.to_vec()),
        });
        if slot.tx.send(reply).is_err() {
            log::debug!(
                "[channel {}] Response {} arrived after its waiter left",
                self.id,
                header.message_id
            );
        }
    }
}
