//! Recovery after transport failure.
//!
//! Every operation runs through [`SessionInner::run`], which classifies each
//! attempt. A transport-fatal failure hands over to [`SessionInner::recover`], which
//! rebuilds the channel, session, trees and durable handles, and the attempt is
//! made again with the replay flag set. Recovery is serialized; callers that failed
//! in the same generation wait for the first one and then simply retry.

use std::future::Future;
use std::sync::Arc;

use smb_msg::{CreateContextRequest, CreateRequest, FileId};

use crate::durable::CreateOutcome;
use crate::handle::OpenInner;
use crate::multiplexer::{Channel, ChannelSelector};
use crate::negotiate;
use crate::session::{MAIN_CHANNEL, SessionInner, SessionState};
use crate::{Error, Result};

/// The result of one attempt at an operation.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// The channel failed; recover and try again.
    Retry(Error),
    Fatal(Error),
}

impl<T> Attempt<T> {
    pub fn classify(result: Result<T>) -> Attempt<T> {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(e) if e.is_transport_fatal() => Attempt::Retry(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

impl SessionInner {
    /// Runs `op` until it succeeds or fails with a non-transport error. `op`
    /// receives whether this attempt is a resend after a reconnect.
    pub(crate) async fn run<T, F, Fut>(self: &Arc<Self>, mut op: F) -> Result<T>
    where
        F: FnMut(bool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut replay = false;
        loop {
            let generation = self.mux.generation();
            match Attempt::classify(op(replay).await) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retry(e) => {
                    log::warn!("Request failed in generation {generation}: {e}");
                    self.recover(generation)
                        .await
                        .map_err(|e| Error::Connectivity(Box::new(e)))?;
                    replay = true;
                }
            }
        }
    }

    /// Brings the session back after a failure seen in `generation`.
    pub(crate) async fn recover(self: &Arc<Self>, generation: u64) -> Result<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.is_closed() {
            return Err(Error::InvalidState("the session is closed".into()));
        }
        if self.mux.generation() != generation {
            log::debug!("Already recovered past generation {generation}");
            return Ok(());
        }

        let main = self.main_channel()?;
        let lost_alternates: Vec<Arc<Channel>> = self
            .mux
            .channels()
            .into_iter()
            .filter(|c| c.id() != MAIN_CHANNEL && !c.is_up())
            .collect();
        if main.is_up() && !lost_alternates.is_empty() {
            let info = self.negotiated()?;
            for channel in &lost_alternates {
                self.rebind(channel, &info).await?;
            }
            let generation = self.mux.mark_established();
            log::info!("Alternate channels rebound (generation {generation})");
            return Ok(());
        }
        self.reconnect_main(&main).await
    }

    async fn rebind(&self, channel: &Arc<Channel>, main: &negotiate::NegotiatedInfo) -> Result<()> {
        log::info!("Rebinding channel {}", channel.id());
        channel.connection().stop();
        let staged = self.open_channel(channel.id()).await?;
        match self.bind_channel(&staged, main).await {
            Ok(()) => {
                channel.adopt(&staged);
                Ok(())
            }
            Err(e) => {
                staged.connection().stop();
                Err(e)
            }
        }
    }

    /// The full sequence: negotiate the previous dialect, set up the session again,
    /// validate the negotiation, reconnect trees, then durable handles, then
    /// alternate channels.
    async fn reconnect_main(self: &Arc<Self>, main: &Arc<Channel>) -> Result<()> {
        let previous = main
            .negotiated()
            .ok_or_else(|| Error::InvalidState("main channel was never negotiated".into()))?;
        let previous_session_id = self.mux.session_id();
        log::info!(
            "Reconnecting to {} with {} (session {previous_session_id:#x})",
            self.server,
            previous.dialect
        );

        main.connection().stop();
        let shares = self.live_shares();
        shares.iter().for_each(|s| s.mark_disconnected());

        let staged = self.open_channel(MAIN_CHANNEL).await?;
        let established = async {
            self.set_state(SessionState::Negotiating);
            let info = self
                .negotiate_channel(&staged, &[previous.wire_dialect])
                .await?;
            negotiate::validate_reconnect(&previous, &info)?;
            self.set_state(SessionState::SecurityExchange);
            let session_id = self
                .session_setup(&staged, previous_session_id, false)
                .await?;
            Ok::<_, Error>((info, session_id))
        }
        .await;
        let (info, session_id) = match established {
            Ok(done) => done,
            Err(e) => {
                log::error!("Reconnect to {} failed: {e}", self.server);
                staged.connection().stop();
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };
        main.adopt(&staged);
        self.mux.set_session_id(session_id);
        self.mux.bump_channel_sequence();

        self.validate_negotiate(&info, &[info.wire_dialect]).await?;

        for share in &shares {
            share.reconnect().await?;
        }

        let opens = self.live_opens();
        log::debug!("Reconnecting {} open handles", opens.len());
        for open in &opens {
            self.reconnect_open(open).await;
        }

        for channel in self.mux.channels() {
            if channel.id() == MAIN_CHANNEL {
                continue;
            }
            if let Err(e) = self.rebind(&channel, &info).await {
                log::warn!("Dropping channel {} after a failed rebind: {e}", channel.id());
                self.mux.remove_channel(channel.id());
            }
        }

        self.set_state(SessionState::Established);
        let generation = self.mux.mark_established();
        log::info!(
            "Reconnected to {} (session {session_id:#x}, generation {generation})",
            self.server
        );
        Ok(())
    }

    /// Reclaims one open with a durable reconnect, or revokes it.
    async fn reconnect_open(self: &Arc<Self>, open: &Arc<OpenInner>) {
        if open.is_closed() || open.is_revoked() {
            return;
        }
        let durable = open.durable().clone();
        let lease_key = durable.lease_key();
        let mut record = durable.lock().await;
        if !record.begin_reconnect() {
            drop(record);
            log::warn!("{} was not durable; revoking it", open.path());
            self.revoke(open);
            return;
        }

        let contexts = record.reconnect_contexts(lease_key);
        let reconnected = self.send_reconnect(open, contexts).await.and_then(|response| {
            record.on_reconnect_response(lease_key, &response)
        });
        match reconnected {
            Ok(outcome) => {
                let file_id = record.file_id;
                let lease_gone = record.granted.is_none();
                drop(record);
                open.set_file_id(file_id);
                let registry = &self.engine.registry;
                if lease_gone || outcome == CreateOutcome::Inconsistent {
                    registry.remove(&lease_key);
                } else if !registry.update_file_id(&lease_key, file_id) {
                    log::debug!("{} holds no registered lease", open.path());
                }
                log::debug!("Reconnected {} as {file_id}", open.path());
            }
            Err(e) => {
                record.reconnect_failed();
                drop(record);
                log::warn!("Durable reconnect of {} failed: {e}", open.path());
                self.revoke(open);
            }
        }
    }

    async fn send_reconnect(
        &self,
        open: &Arc<OpenInner>,
        contexts: Vec<CreateContextRequest>,
    ) -> Result<smb_msg::CreateResponse> {
        let tree_id = open.share().tree_id()?;
        let mut contexts = contexts;
        CreateContextRequest::sort_for_assembly(&mut contexts);
        let request = CreateRequest {
            contexts,
            ..open.reconnect_template()
        };
        let request = self
            .mux
            .allocate(request.into(), ChannelSelector::Pinned(MAIN_CHANNEL), true)
            .await?
            .with_tree(tree_id);
        let reply = self.mux.send_recv(request).await?;
        Ok(reply.message.content.to_create()?)
    }

    /// Marks an open unusable and detaches its lease.
    pub(crate) fn revoke(&self, open: &Arc<OpenInner>) {
        let lease_key = open.durable().lease_key();
        open.mark_revoked();
        open.set_file_id(FileId::EMPTY);
        self.engine.registry.remove(&lease_key);
        self.take_deferred(&lease_key);
        self.engine.callbacks.revoked(open.durable().node());
    }
}
