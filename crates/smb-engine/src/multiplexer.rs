//! Request allocation, sending and reply correlation across a session's channels.
//!
//! A [`Request`] is allocated on one channel, which fixes its message id and credit
//! charge. It may be chained with further requests on the same channel into one
//! compound send. [`Multiplexer::send`] registers a reply slot for every member
//! before the bytes reach the transport, then [`Multiplexer::complete`] waits for
//! the matching reply.

use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use smb_msg::{
    CancelRequest, Command, PlainRequest, RequestContent, ResponseContent, Status,
    encode_compound,
};
use tokio::sync::oneshot;

use crate::config::QuantumConfig;
use crate::connection::{Connection, Reply};
use crate::negotiate::NegotiatedInfo;
use crate::quantum::QuantumController;
use crate::transform::{SealMode, TransformProvider};
use crate::{Error, Result};

/// Which channel a request goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelector {
    /// Round-robin over the channels that are up.
    Any,
    Pinned(u32),
}

/// One channel (iod) of a session: its current connection, what was negotiated on
/// it, and its quantum statistics.
pub struct Channel {
    id: u32,
    conn: RwLock<Arc<Connection>>,
    negotiated: RwLock<Option<Arc<NegotiatedInfo>>>,
    quantum: QuantumController,
}

impl Channel {
    pub fn new(id: u32, conn: Arc<Connection>, quantum: QuantumConfig) -> Arc<Channel> {
        Arc::new(Channel {
            id,
            conn: RwLock::new(conn),
            negotiated: RwLock::new(None),
            quantum: QuantumController::new(quantum),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.conn.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn negotiated(&self) -> Option<Arc<NegotiatedInfo>> {
        self.negotiated
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_negotiated(&self, info: NegotiatedInfo) {
        let conn = self.connection();
        conn.credits().set_large_mtu(info.large_mtu());
        *self.negotiated.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(info));
    }

    /// Swaps in a new connection after a reconnect. The old one is stopped.
    pub fn replace_connection(&self, conn: Arc<Connection>) {
        let old = std::mem::replace(
            &mut *self.conn.write().unwrap_or_else(|e| e.into_inner()),
            conn,
        );
        old.stop();
    }

    /// Takes over the connection and negotiation of a channel that was set up
    /// aside, keeping this channel's id and quantum statistics.
    pub fn adopt(&self, staged: &Channel) {
        if let Some(info) = staged.negotiated() {
            *self.negotiated.write().unwrap_or_else(|e| e.into_inner()) = Some(info);
        }
        self.replace_connection(staged.connection());
    }

    pub fn quantum(&self) -> &QuantumController {
        &self.quantum
    }

    pub fn is_up(&self) -> bool {
        !self.connection().is_closed()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

struct Member {
    message: PlainRequest,
    charge: u16,
}

/// A request that holds credits and message ids on one connection.
///
/// Dropping it unsent hands the credits back.
pub struct Request {
    channel: Arc<Channel>,
    conn: Arc<Connection>,
    members: Vec<Member>,
    seal: Option<SealMode>,
    keep_raw: bool,
    preauth: bool,
}

impl Request {
    pub fn channel_id(&self) -> u32 {
        self.channel.id
    }

    pub fn message_ids(&self) -> Vec<u64> {
        self.members
            .iter()
            .map(|m| m.message.header.message_id)
            .collect()
    }

    pub fn with_tree(mut self, tree_id: u32) -> Request {
        for m in &mut self.members {
            m.message.header.tree_id = Some(tree_id);
        }
        self
    }

    pub fn with_session(mut self, session_id: u64) -> Request {
        for m in &mut self.members {
            m.message.header.session_id = session_id;
        }
        self
    }

    /// Overrides the transform mode chosen for the session.
    pub fn sealed(mut self, mode: SealMode) -> Request {
        self.seal = Some(mode);
        self
    }

    /// Keeps raw reply bytes and hands the request bytes to the preauth transcript.
    pub fn preauth(mut self) -> Request {
        self.keep_raw = true;
        self.preauth = true;
        self
    }

    /// Marks the last member as operating on the previous member's result.
    pub fn related(mut self) -> Request {
        if let Some(m) = self.members.last_mut() {
            m.message.header.flags.set_related_operations(true);
        }
        self
    }

    /// Marks every member as a resend after a reconnect.
    pub fn set_replay(&mut self) {
        let supported = self
            .channel
            .negotiated()
            .is_some_and(|n| n.dialect.supports_replay());
        if !supported {
            return;
        }
        for m in &mut self.members {
            m.message.header.flags.set_replay_operation(true);
        }
    }

    fn return_credits(&mut self) {
        for m in self.members.drain(..) {
            self.conn.credits().on_response(m.charge, 0);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.return_credits();
    }
}

/// A sent request waiting for its reply.
pub struct InFlight {
    pub message_id: u64,
    pub command: Command,
    channel_id: u32,
    session_id: u64,
    conn: Arc<Connection>,
    rx: oneshot::Receiver<Result<Reply>>,
    async_id: Arc<AtomicU64>,
    generation: u64,
}

impl InFlight {
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// The async id the server assigned with an interim response, if any.
    pub fn async_id(&self) -> Option<u64> {
        match self.async_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// The session generation the request was sent in.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn wait(mut self, timeout: Option<Duration>) -> Result<Reply> {
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    log::warn!(
                        "Request {} ({:?}) timed out after {limit:?}",
                        self.message_id,
                        self.command
                    );
                    self.conn.forget(self.message_id);
                    return Err(Error::OperationTimeout(limit));
                }
            },
            None => (&mut self.rx).await,
        };
        let reply = received.map_err(|_| Error::ConnectionClosed)??;
        check_status(reply)
    }
}

/// Turns a failure status into [`Error::ServerStatus`], keeping the body.
fn check_status(reply: Reply) -> Result<Reply> {
    let status = reply.message.header.status;
    let is_error_body = matches!(reply.message.content, ResponseContent::Error(_));
    let is_error_status =
        status >> 30 == 3 && status != Status::U32_MORE_PROCESSING_REQUIRED;
    if is_error_body || is_error_status {
        log::debug!(
            "{:?} failed: {}",
            reply.message.header.command,
            Status::try_display_as_status(status)
        );
        return Err(Error::ServerStatus {
            status,
            command: reply.message.header.command,
            aux: Some(Box::new(reply.message.content)),
        });
    }
    Ok(reply)
}

/// Bytes a request moves, for credit charging.
fn payload_size(content: &RequestContent) -> u32 {
    match content {
        RequestContent::Read(r) => r.length,
        RequestContent::Write(w) => w.data.len() as u32,
        RequestContent::Ioctl(i) => (i.buffer.len() as u32).max(i.max_output_response),
        RequestContent::QueryDirectory(q) => q.output_buffer_length,
        RequestContent::QueryInfo(q) => q.output_buffer_length.max(q.input.len() as u32),
        RequestContent::ChangeNotify(c) => c.output_buffer_length,
        RequestContent::SetInfo(s) => s.data.len() as u32,
        _ => 0,
    }
}

pub struct Multiplexer {
    channels: RwLock<Vec<Arc<Channel>>>,
    next_channel: AtomicUsize,
    session_id: AtomicU64,
    generation: AtomicU64,
    channel_sequence: AtomicU16,
    transform: Arc<dyn TransformProvider>,
    timeout: Option<Duration>,
}

impl Multiplexer {
    pub fn new(transform: Arc<dyn TransformProvider>, timeout: Option<Duration>) -> Multiplexer {
        Multiplexer {
            channels: RwLock::new(Vec::new()),
            next_channel: AtomicUsize::new(0),
            session_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            channel_sequence: AtomicU16::new(0),
            transform,
            timeout,
        }
    }

    pub fn add_channel(&self, channel: Arc<Channel>) {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(channel);
    }

    pub fn remove_channel(&self, id: u32) -> Option<Arc<Channel>> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        let index = channels.iter().position(|c| c.id == id)?;
        Some(channels.remove(index))
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    pub fn set_session_id(&self, session_id: u64) {
        self.session_id.store(session_id, Ordering::SeqCst);
    }

    /// Bumped on every transition to ESTABLISHED. Message ids from different
    /// generations are not comparable.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn mark_established(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advanced on every reconnect so the server can tell replays apart.
    pub fn bump_channel_sequence(&self) {
        self.channel_sequence.fetch_add(1, Ordering::SeqCst);
    }

    pub fn transform(&self) -> &Arc<dyn TransformProvider> {
        &self.transform
    }

    fn select(&self, selector: ChannelSelector) -> Result<Arc<Channel>> {
        let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
        match selector {
            ChannelSelector::Pinned(id) => channels
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| Error::InvalidArgument(format!("no channel {id}"))),
            ChannelSelector::Any => {
                let up: Vec<&Arc<Channel>> = channels.iter().filter(|c| c.is_up()).collect();
                // When nothing is up, hand out the main channel so the caller sees
                // the transport failure and the reconnect path takes over.
                let pool = if up.is_empty() {
                    channels.iter().take(1).collect()
                } else {
                    up
                };
                let index = self.next_channel.fetch_add(1, Ordering::Relaxed);
                pool.get(index % pool.len().max(1))
                    .map(|c| (*c).clone())
                    .ok_or(Error::ConnectionClosed)
            }
        }
    }

    /// Allocates a request on a channel chosen by `selector`.
    pub async fn allocate(
        &self,
        content: RequestContent,
        selector: ChannelSelector,
        blocking: bool,
    ) -> Result<Request> {
        let channel = self.select(selector)?;
        self.allocate_on(&channel, content, blocking).await
    }

    /// Allocates a request on `channel`, which need not be part of this multiplexer
    /// yet (a channel being bound or renegotiated).
    pub async fn allocate_on(
        &self,
        channel: &Arc<Channel>,
        content: RequestContent,
        blocking: bool,
    ) -> Result<Request> {
        let conn = channel.connection();
        let negotiated = channel.negotiated();
        let payload = payload_size(&content);
        if let Some(n) = &negotiated {
            let limit = n.max_transact_size.max(n.max_io(true)).max(n.max_io(false));
            if payload > limit {
                return Err(Error::InvalidArgument(format!(
                    "{:?} payload of {payload} bytes exceeds the negotiated {limit}",
                    content.associated_cmd()
                )));
            }
        }
        let charge = conn.credits().charge(payload);
        let grant = conn.credits().acquire(charge, blocking).await?;

        let mut message = PlainRequest::new(content);
        message.header.message_id = grant.message_id;
        message.header.credit_charge = grant.header_charge;
        message.header.credit_request = grant.credit_request;
        message.header.session_id = self.session_id();
        if negotiated.is_some_and(|n| n.dialect.is_smb3()) {
            message.header.status = self.channel_sequence.load(Ordering::SeqCst) as u32;
        }
        log::trace!(
            "[channel {}] Allocated {:?} as message {} (charge {})",
            channel.id,
            message.header.command,
            grant.message_id,
            grant.charge
        );
        Ok(Request {
            channel: channel.clone(),
            conn,
            members: vec![Member {
                message,
                charge: grant.charge,
            }],
            seal: None,
            keep_raw: false,
            preauth: false,
        })
    }

    /// Chains `second` after `first` for one round trip. Both must have been
    /// allocated on the same connection.
    pub fn append_to_compound(&self, mut first: Request, mut second: Request) -> Result<Request> {
        if !Arc::ptr_eq(&first.conn, &second.conn) {
            return Err(Error::InvalidArgument(
                "compound members must share a connection".to_string(),
            ));
        }
        first.members.append(&mut second.members);
        first.keep_raw |= second.keep_raw;
        first.seal = first.seal.or(second.seal);
        Ok(first)
    }

    /// Seals and writes a request, returning one reply slot per member.
    pub async fn send(&self, mut request: Request) -> Result<Vec<InFlight>> {
        let members = std::mem::take(&mut request.members);
        let conn = request.conn.clone();

        let mut encoded = Vec::with_capacity(members.len());
        for m in &members {
            match m.message.encode() {
                Ok(bytes) => encoded.push(bytes),
                Err(e) => {
                    members
                        .iter()
                        .for_each(|m| conn.credits().on_response(m.charge, 0));
                    return Err(e.into());
                }
            }
        }

        let generation = self.generation();
        let mut flights = Vec::with_capacity(members.len());
        for (i, m) in members.iter().enumerate() {
            let header = &m.message.header;
            match conn.register(header.message_id, m.charge, request.keep_raw) {
                Ok(registration) => flights.push(InFlight {
                    message_id: registration.message_id,
                    command: header.command,
                    channel_id: request.channel.id,
                    session_id: header.session_id,
                    conn: conn.clone(),
                    rx: registration.rx,
                    async_id: registration.async_id,
                    generation,
                }),
                Err(e) => {
                    flights.iter().for_each(|f| conn.forget(f.message_id));
                    members[i..]
                        .iter()
                        .for_each(|m| conn.credits().on_response(m.charge, 0));
                    return Err(e);
                }
            }
        }

        if request.preauth {
            encoded
                .iter()
                .for_each(|bytes| self.transform.preauth_update(bytes));
        }
        let session_id = members[0].message.header.session_id;
        let mode = request
            .seal
            .unwrap_or_else(|| self.transform.mode(session_id));
        let chain = if encoded.len() == 1 {
            encoded.pop().unwrap_or_default()
        } else {
            encode_compound(encoded)?
        };
        let sent = match self.transform.seal(session_id, mode, chain) {
            Ok(sealed) => conn.send_raw(&sealed).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            flights.iter().for_each(|f| conn.forget(f.message_id));
            return Err(e);
        }
        Ok(flights)
    }

    fn timeout_for(&self, command: Command) -> Option<Duration> {
        match command {
            // Completes whenever the directory changes.
            Command::ChangeNotify => None,
            _ => self.timeout,
        }
    }

    /// Waits for the reply to one sent request.
    pub async fn complete(&self, flight: InFlight) -> Result<Reply> {
        let timeout = self.timeout_for(flight.command);
        flight.wait(timeout).await
    }

    /// Sends a single request and waits for its reply.
    pub async fn send_recv(&self, request: Request) -> Result<Reply> {
        if request.members.len() != 1 {
            return Err(Error::InvalidArgument(
                "send_recv takes a single request; use send for compounds".to_string(),
            ));
        }
        let mut flights = self.send(request).await?;
        let flight = flights.pop().ok_or(Error::ConnectionClosed)?;
        self.complete(flight).await
    }

    /// Sends and returns once written; `callback` runs with the reply on a worker
    /// task. Returns the message ids of the members.
    pub async fn send_with_callback<F>(&self, request: Request, callback: F) -> Result<Vec<u64>>
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let mut flights = self.send(request).await?;
        let ids = flights.iter().map(|f| f.message_id).collect();
        let Some(last) = flights.pop() else {
            return Ok(ids);
        };
        let timeout = self.timeout_for(last.command);
        tokio::spawn(async move {
            callback(last.wait(timeout).await);
        });
        Ok(ids)
    }

    /// Sends without waiting for a reply. The reply, when it comes, only settles
    /// credits.
    pub async fn send_no_reply(&self, request: Request) -> Result<()> {
        let flights = self.send(request).await?;
        log::trace!(
            "Sent {:?} without waiting",
            flights.iter().map(|f| f.message_id).collect::<Vec<_>>()
        );
        Ok(())
    }

    /// Asks the server to cancel a pending request. CANCEL reuses the request's
    /// message id (and async id, once known), takes no credits and gets no reply.
    pub async fn cancel(&self, flight: &InFlight) -> Result<()> {
        let mut message = PlainRequest::new(CancelRequest {}.into());
        message.header.message_id = flight.message_id;
        message.header.session_id = flight.session_id;
        if let Some(async_id) = flight.async_id() {
            message.header.to_async(async_id);
        }
        let bytes = message.encode()?;
        let mode = self.transform.mode(flight.session_id);
        let sealed = self.transform.seal(flight.session_id, mode, bytes)?;
        log::debug!("Cancelling message {}", flight.message_id);
        flight.conn.send_raw(&sealed).await
    }
}

#[cfg(test)]
mod tests {
    use smb_msg::{
        EchoRequest, EchoResponse, Header, PlainResponse, ReadRequest,
    };
    use smb_transport::{MemoryTransport, SmbTransportRead, SmbTransportWrite};
    use tokio::sync::mpsc;

    use super::*;
    use crate::transform::NoTransform;

    fn setup() -> (Multiplexer, Arc<Channel>, MemoryTransport) {
        let (client, server) = MemoryTransport::pair("mux");
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Connection::start(0, Box::new(client), 64, Arc::new(NoTransform), tx).unwrap();
        let mux = Multiplexer::new(Arc::new(NoTransform), Some(Duration::from_secs(5)));
        let channel = Channel::new(0, conn, QuantumConfig::default());
        mux.add_channel(channel.clone());
        (mux, channel, server)
    }

    fn response_to(request: &[u8], credits: u16) -> Vec<u8> {
        let header = Header::parse(request).unwrap();
        let mut response = PlainResponse {
            header: Header::new(header.command),
            content: EchoResponse {}.into(),
        };
        response.header.message_id = header.message_id;
        response.header.credit_request = credits;
        response.header.flags.set_server_to_redir(true);
        response.encode().unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn test_message_ids_increase() {
        let (mux, _channel, mut server) = setup();
        let mut ids = vec![];
        for _ in 0..3 {
            let request = mux
                .allocate(EchoRequest {}.into(), ChannelSelector::Any, true)
                .await
                .unwrap();
            ids.extend(request.message_ids());
            let flights = mux.send(request).await.unwrap();
            let received = server.receive().await.unwrap();
            server.send(&response_to(&received, 4)).await.unwrap();
            for f in flights {
                mux.complete(f).await.unwrap();
            }
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test_log::test(tokio::test)]
    async fn test_non_blocking_out_of_credits() {
        let (mux, _channel, _server) = setup();
        let first = mux
            .allocate(EchoRequest {}.into(), ChannelSelector::Any, false)
            .await
            .unwrap();
        let second = mux
            .allocate(EchoRequest {}.into(), ChannelSelector::Any, false)
            .await;
        assert!(matches!(second, Err(Error::OutOfCredits { .. })));
        drop(first);
        assert!(
            mux.allocate(EchoRequest {}.into(), ChannelSelector::Any, false)
                .await
                .is_ok()
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_compound_shares_one_send() {
        let (mux, channel, mut server) = setup();
        // Grow the window first.
        let request = mux
            .allocate(EchoRequest {}.into(), ChannelSelector::Any, true)
            .await
            .unwrap();
        let flights = mux.send(request).await.unwrap();
        let received = server.receive().await.unwrap();
        server.send(&response_to(&received, 8)).await.unwrap();
        for f in flights {
            mux.complete(f).await.unwrap();
        }

        let first = mux
            .allocate_on(&channel, EchoRequest {}.into(), true)
            .await
            .unwrap();
        let second = mux
            .allocate_on(&channel, EchoRequest {}.into(), true)
            .await
            .unwrap()
            .related();
        let chain = mux.append_to_compound(first, second).unwrap();
        assert_eq!(chain.message_ids(), vec![1, 2]);
        let flights = mux.send(chain).await.unwrap();
        assert_eq!(flights.len(), 2);
        let received = server.receive().await.unwrap();
        let members = smb_msg::split_compound(&received).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].len() % 8, 0);
        for m in members.into_iter().rev() {
            server.send(&response_to(m, 1)).await.unwrap();
        }
        for f in flights {
            mux.complete(f).await.unwrap();
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_error_status_keeps_body() {
        let (mux, _channel, mut server) = setup();
        let request = mux
            .allocate(EchoRequest {}.into(), ChannelSelector::Any, true)
            .await
            .unwrap();
        let flights = mux.send(request).await.unwrap();
        let received = server.receive().await.unwrap();
        let header = Header::parse(&received).unwrap();
        let mut response = PlainResponse {
            header: Header::new(header.command),
            content: ResponseContent::Error(Default::default()),
        };
        response.header.message_id = header.message_id;
        response.header.status = Status::U32_ACCESS_DENIED;
        response.header.credit_request = 1;
        response.header.flags.set_server_to_redir(true);
        server.send(&response.encode().unwrap()).await.unwrap();
        let err = mux
            .complete(flights.into_iter().next().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(Status::U32_ACCESS_DENIED));
    }

    #[test_log::test(tokio::test)]
    async fn test_payload_over_limit_rejected() {
        let (mux, channel, _server) = setup();
        let info = NegotiatedInfo {
            dialect: crate::DialectImpl::Smb302,
            wire_dialect: smb_msg::Dialect::Smb0302,
            security_mode: Default::default(),
            server_guid: Default::default(),
            capabilities: Default::default(),
            max_transact_size: 65536,
            max_read_size: 65536,
            max_write_size: 65536,
            cipher: None,
            signing_algorithm: None,
            preauth_hash: None,
            security_buffer: vec![],
        };
        channel.set_negotiated(info);
        let read = ReadRequest {
            flags: Default::default(),
            length: 1024 * 1024,
            offset: 0,
            file_id: Default::default(),
            minimum_count: 0,
        };
        assert!(matches!(
            mux.allocate(read.into(), ChannelSelector::Any, true).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_timeout_returns_credits() {
        let (mux, channel, _server) = setup();
        let request = mux
            .allocate(EchoRequest {}.into(), ChannelSelector::Any, true)
            .await
            .unwrap();
        let flights = mux.send(request).await.unwrap();
        assert_eq!(channel.connection().credits().available(), 0);
        let err = mux
            .complete(flights.into_iter().next().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationTimeout(_)));
        assert_eq!(channel.connection().credits().available(), 1);
    }
}
