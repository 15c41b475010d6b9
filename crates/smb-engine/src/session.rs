//! Sessions: negotiating channels, the SESSION_SETUP exchange and channel binding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use smb_dtyp::Guid;
use smb_msg::{
    Dialect, EchoRequest, FileId, IoctlRequest, LogoffRequest, NegotiateCapabilities,
    SessionSecurityMode, SessionSetupRequest, SetupRequestFlags, Status,
    ValidateNegotiateInfoRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Connection, Notification};
use crate::engine::EngineShared;
use crate::handle::OpenInner;
use crate::multiplexer::{Channel, ChannelSelector, Multiplexer};
use crate::negotiate::{self, NegotiatedInfo};
use crate::transform::SealMode;
use crate::tree::{self, Share, ShareInner};
use crate::{Error, Result, breaks};

/// Produces the security blobs of one authentication exchange (GSS/SPNEGO or
/// anything else the server accepts).
pub trait Authenticator: Send {
    /// Consumes the server's last token (the negotiate response's on the first
    /// round) and returns the next one to send.
    fn next_token(&mut self, input: &[u8]) -> Result<Vec<u8>>;

    fn is_complete(&self) -> bool;

    fn session_key(&self) -> Option<Vec<u8>>;
}

pub trait AuthenticatorFactory: Send + Sync {
    fn create(&self, server: &str) -> Result<Box<dyn Authenticator>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Negotiating,
    SecurityExchange,
    Established,
}

pub(crate) const MAIN_CHANNEL: u32 = 0;

pub(crate) struct SessionInner {
    pub engine: Arc<EngineShared>,
    pub server: String,
    pub mux: Multiplexer,
    state: Mutex<SessionState>,
    pub shares: Mutex<Vec<Weak<ShareInner>>>,
    pub opens: Mutex<Vec<Weak<OpenInner>>>,
    /// Opens whose CLOSE waits for their handle lease to go, by lease key.
    pub deferred: Mutex<HashMap<Guid, Arc<OpenInner>>>,
    /// Serializes recovery; held across the whole reconnect sequence.
    pub reconnect_lock: tokio::sync::Mutex<()>,
    notifications: mpsc::UnboundedSender<Notification>,
    listener: Mutex<Option<JoinHandle<()>>>,
    next_channel_id: AtomicU32,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionInner {
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.state);
        if *current != state {
            log::debug!("Session {:#x}: {:?} -> {state:?}", self.mux.session_id(), *current);
            *current = state;
        }
    }

    /// Set once the session was closed by its owner; recovery stops here.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn main_channel(&self) -> Result<Arc<Channel>> {
        self.mux
            .channel(MAIN_CHANNEL)
            .ok_or_else(|| Error::InvalidState("session has no main channel".into()))
    }

    /// What the main channel negotiated.
    pub fn negotiated(&self) -> Result<Arc<NegotiatedInfo>> {
        self.main_channel()?
            .negotiated()
            .ok_or_else(|| Error::InvalidState("main channel is not negotiated".into()))
    }

    pub fn live_shares(&self) -> Vec<Arc<ShareInner>> {
        let mut shares = lock(&self.shares);
        shares.retain(|s| s.strong_count() > 0);
        shares.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn track_share(&self, share: &Arc<ShareInner>) {
        lock(&self.shares).push(Arc::downgrade(share));
    }

    pub fn live_opens(&self) -> Vec<Arc<OpenInner>> {
        let mut opens = lock(&self.opens);
        opens.retain(|o| o.strong_count() > 0);
        opens.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn track_open(&self, open: &Arc<OpenInner>) {
        lock(&self.opens).push(Arc::downgrade(open));
    }

    pub fn defer_close(&self, lease_key: Guid, open: Arc<OpenInner>) {
        lock(&self.deferred).insert(lease_key, open);
    }

    pub fn take_deferred(&self, lease_key: &Guid) -> Option<Arc<OpenInner>> {
        lock(&self.deferred).remove(lease_key)
    }

    fn take_all_deferred(&self) -> Vec<Arc<OpenInner>> {
        lock(&self.deferred).drain().map(|(_, open)| open).collect()
    }

    pub fn next_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Connects a fresh transport for channel `id`. The channel is not added to
    /// the multiplexer.
    pub async fn open_channel(&self, id: u32) -> Result<Arc<Channel>> {
        let transport = self.engine.connector.connect(&self.server).await?;
        let conn = Connection::start(
            id,
            transport,
            self.engine.config.credits_backlog,
            self.engine.transform.clone(),
            self.notifications.clone(),
        )?;
        Ok(Channel::new(id, conn, self.engine.config.quantum.clone()))
    }

    pub async fn negotiate_channel(
        &self,
        channel: &Arc<Channel>,
        dialects: &[Dialect],
    ) -> Result<NegotiatedInfo> {
        let config = &self.engine.config;
        let request =
            negotiate::build_request(config, self.engine.client_guid, &self.server, dialects);
        log::debug!("[channel {}] Offering {:?}", channel.id(), request.dialects);
        let request = self
            .mux
            .allocate_on(channel, request.into(), true)
            .await?
            .with_session(0)
            .preauth();
        let reply = self.mux.send_recv(request).await?;
        if let Some(raw) = &reply.raw {
            self.mux.transform().preauth_update(raw);
        }
        let response = reply.message.content.to_negotiate()?;
        let info = negotiate::process_response(config, dialects, &response)?;
        channel.set_negotiated(info.clone());
        Ok(info)
    }

    /// Runs SESSION_SETUP rounds on `channel` until the server accepts.
    ///
    /// When `binding`, the channel joins the existing session; otherwise a new
    /// session id is latched from the first response and returned.
    pub async fn session_setup(
        &self,
        channel: &Arc<Channel>,
        previous_session_id: u64,
        binding: bool,
    ) -> Result<u64> {
        let negotiated = channel
            .negotiated()
            .ok_or_else(|| Error::InvalidState("session setup before negotiate".into()))?;
        let mut session_id = 0;
        if binding {
            session_id = self.mux.session_id();
            if session_id == 0 {
                return Err(Error::InvalidState(
                    "cannot bind a channel to session 0; a reconnect is in progress".into(),
                ));
            }
        }

        let mut auth = self.engine.authenticators.create(&self.server)?;
        let mut input = negotiated.security_buffer.clone();
        let mut round = 0;
        loop {
            round += 1;
            let token = auth.next_token(&input)?;
            // Tokens are never split across requests; one that does not fit is an error.
            if token.len() > negotiated.max_transact_size as usize {
                return Err(Error::AuthenticationError(format!(
                    "security token of {} bytes exceeds the max transact size {}",
                    token.len(),
                    negotiated.max_transact_size
                )));
            }
            let request = SessionSetupRequest {
                flags: SetupRequestFlags::new().with_binding(binding),
                security_mode: SessionSecurityMode::new()
                    .with_signing_enabled(true)
                    .with_signing_required(negotiated.signing_required()),
                capabilities: NegotiateCapabilities::new(),
                previous_session_id,
                buffer: token,
            };
            let mut request = self
                .mux
                .allocate_on(channel, request.into(), true)
                .await?
                .with_session(session_id)
                .preauth();
            if binding {
                request = request.sealed(SealMode::Sign);
            }
            let reply = self.mux.send_recv(request).await?;
            let status = reply.message.header.status;
            if session_id == 0 {
                session_id = reply.message.header.session_id;
                log::debug!("[channel {}] Latched session id {session_id:#x}", channel.id());
            }
            if status == Status::U32_MORE_PROCESSING_REQUIRED {
                if let Some(raw) = &reply.raw {
                    self.mux.transform().preauth_update(raw);
                }
            }
            let response = reply.message.content.to_session_setup()?;
            input = response.buffer;
            if status == Status::U32_SUCCESS {
                if !auth.is_complete() {
                    auth.next_token(&input)?;
                }
                log::info!(
                    "[channel {}] Session {session_id:#x} set up after {round} rounds{}",
                    channel.id(),
                    if response.session_flags.is_guest_or_null_session() {
                        " (guest)"
                    } else {
                        ""
                    }
                );
                break;
            }
        }

        if !binding {
            match auth.session_key() {
                Some(key) => self.mux.transform().session_established(
                    session_id,
                    &key,
                    negotiated.wire_dialect,
                )?,
                None => log::warn!("Session {session_id:#x} has no session key"),
            }
        }
        Ok(session_id)
    }

    /// Negotiates and sets up a session on `channel` as the main channel.
    pub async fn establish_main(
        &self,
        channel: &Arc<Channel>,
        dialects: &[Dialect],
        previous_session_id: u64,
    ) -> Result<NegotiatedInfo> {
        self.set_state(SessionState::Negotiating);
        let info = self.negotiate_channel(channel, dialects).await?;
        self.set_state(SessionState::SecurityExchange);
        let session_id = self
            .session_setup(channel, previous_session_id, false)
            .await?;
        self.mux.set_session_id(session_id);
        Ok(info)
    }

    /// Negotiates `channel` with the main channel's dialect and binds it.
    pub async fn bind_channel(&self, channel: &Arc<Channel>, main: &NegotiatedInfo) -> Result<()> {
        let info = self
            .negotiate_channel(channel, &[main.wire_dialect])
            .await?;
        negotiate::validate_reconnect(main, &info)?;
        self.session_setup(channel, 0, true).await?;
        Ok(())
    }

    /// FSCTL_VALIDATE_NEGOTIATE_INFO over IPC$, on dialects that have it.
    pub async fn validate_negotiate(
        self: &Arc<Self>,
        info: &NegotiatedInfo,
        offered: &[Dialect],
    ) -> Result<()> {
        let config = &self.engine.config;
        if !config.validate_negotiate || !info.dialect.supports_validate_negotiate() {
            return Ok(());
        }
        let (tree_id, _) = tree::connect_tree(self, "IPC$").await?;
        let payload = negotiate::validate_negotiate_request(config, self.engine.client_guid, offered);
        let result = async {
            let ioctl = IoctlRequest::fsctl(FileId::FULL, &payload, 1024)?;
            let request = self
                .mux
                .allocate(ioctl.into(), ChannelSelector::Pinned(MAIN_CHANNEL), true)
                .await?
                .with_tree(tree_id)
                .sealed(SealMode::Sign);
            let reply = self.mux.send_recv(request).await?;
            let response = reply.message.content.to_ioctl()?;
            let validated = response.parse_fsctl::<ValidateNegotiateInfoRequest>()?;
            negotiate::check_validate_negotiate(info, &validated)
        }
        .await;
        if let Err(e) = tree::disconnect_tree(self, tree_id).await {
            log::debug!("IPC$ disconnect after validation failed: {e}");
        }
        match &result {
            Ok(()) => log::debug!("Negotiation validated"),
            Err(e) => log::error!("Negotiate validation failed: {e}"),
        }
        result
    }

    pub fn stop_channels(&self) {
        for channel in self.mux.channels() {
            channel.connection().stop();
        }
    }
}

/// An authenticated session with one server, shared by its shares and handles.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) async fn establish(engine: Arc<EngineShared>, server: &str) -> Result<Session> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(engine.transform.clone(), engine.config.timeout);
        let inner = Arc::new(SessionInner {
            engine,
            server: server.to_string(),
            mux,
            state: Mutex::new(SessionState::Disconnected),
            shares: Mutex::new(Vec::new()),
            opens: Mutex::new(Vec::new()),
            deferred: Mutex::new(HashMap::new()),
            reconnect_lock: tokio::sync::Mutex::new(()),
            notifications: tx,
            listener: Mutex::new(None),
            next_channel_id: AtomicU32::new(MAIN_CHANNEL + 1),
            closed: AtomicBool::new(false),
        });
        *lock(&inner.listener) = Some(breaks::spawn_listener(Arc::downgrade(&inner), rx));
        let session = Session { inner };
        match session.establish_inner().await {
            Ok(()) => Ok(session),
            Err(e) => {
                log::error!("Failed to establish a session with {server}: {e}");
                session.shutdown();
                Err(e)
            }
        }
    }

    async fn establish_inner(&self) -> Result<()> {
        let inner = &self.inner;
        let offered = inner.engine.config.dialects.offered();
        let channel = inner.open_channel(MAIN_CHANNEL).await?;
        inner.mux.add_channel(channel.clone());
        let info = inner.establish_main(&channel, &offered, 0).await?;
        let generation = inner.mux.mark_established();
        inner.set_state(SessionState::Established);
        log::info!(
            "Connected to {} with {} (session {:#x}, generation {generation})",
            inner.server,
            info.dialect,
            inner.mux.session_id()
        );
        inner.validate_negotiate(&info, &offered).await
    }

    pub fn id(&self) -> u64 {
        self.inner.mux.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn server(&self) -> &str {
        &self.inner.server
    }

    pub fn negotiated(&self) -> Result<Arc<NegotiatedInfo>> {
        self.inner.negotiated()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.mux
    }

    /// Bumped by every successful (re)connect.
    pub fn generation(&self) -> u64 {
        self.inner.mux.generation()
    }

    pub fn channel_ids(&self) -> Vec<u32> {
        self.inner.mux.channels().iter().map(|c| c.id()).collect()
    }

    pub async fn tree_connect(&self, name: &str) -> Result<Share> {
        Share::connect(&self.inner, name).await
    }

    /// Opens, negotiates and binds an alternate channel.
    pub async fn add_channel(&self) -> Result<u32> {
        let inner = &self.inner;
        let main = inner.negotiated()?;
        if !inner.engine.config.multichannel || !main.multichannel() {
            return Err(Error::InvalidState(
                "multichannel is not enabled on this session".into(),
            ));
        }
        let id = inner.next_channel_id();
        let channel = inner.open_channel(id).await?;
        match inner.bind_channel(&channel, &main).await {
            Ok(()) => {
                inner.mux.add_channel(channel);
                log::info!("Bound channel {id} to session {:#x}", inner.mux.session_id());
                Ok(id)
            }
            Err(e) => {
                channel.connection().stop();
                Err(e)
            }
        }
    }

    /// Sends a keepalive and returns once it is written.
    pub async fn echo(&self) -> Result<()> {
        let request = self
            .inner
            .mux
            .allocate(EchoRequest {}.into(), ChannelSelector::Any, true)
            .await?;
        self.inner.mux.send_no_reply(request).await
    }

    pub async fn logoff(&self) -> Result<()> {
        let inner = &self.inner;
        let request = inner
            .mux
            .allocate(LogoffRequest {}.into(), ChannelSelector::Any, true)
            .await?;
        inner.mux.send_recv(request).await?;
        inner.mux.transform().session_closed(inner.mux.session_id());
        inner.set_state(SessionState::Disconnected);
        Ok(())
    }

    /// Sends every deferred CLOSE, disconnects the shares, logs off and stops
    /// every channel. The first error is returned after all steps ran.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut first_error = None;
        for open in inner.take_all_deferred() {
            if let Err(e) = open.finish_close().await {
                log::warn!("Deferred close failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        for share in inner.live_shares() {
            if let Err(e) = share.disconnect().await {
                log::warn!("Tree disconnect of {} failed: {e}", share.name());
                first_error.get_or_insert(e);
            }
        }
        if inner.state() == SessionState::Established {
            if let Err(e) = self.logoff().await {
                log::warn!("Logoff failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        self.shutdown();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn shutdown(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.stop_channels();
        if let Some(listener) = lock(&inner.listener).take() {
            listener.abort();
        }
        inner.set_state(SessionState::Disconnected);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.inner.server)
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
