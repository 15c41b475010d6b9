#![allow(dead_code)]

//! An in-process SMB2 server good enough to drive the engine end to end.
//!
//! State lives in [`StubServer`] and survives connections, so a reconnect finds
//! its durable opens again. Every connection the engine makes through
//! [`StubConnector`] gets its own serving task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_core::future::BoxFuture;
use smb_engine::transport::{
    MemoryTransport, SmbTransport, SmbTransportRead, SmbTransportWrite, TransportError,
};
use smb_engine::*;

pub struct TestConstants;

impl TestConstants {
    pub const SERVER: &'static str = "stub-server";
    pub const SHARE: &'static str = "share";
    pub const MAX_IO: u32 = 1024 * 1024;
    pub const SESSION_KEY: [u8; 16] = [7; 16];
}

type Writer = Arc<tokio::sync::Mutex<Option<Box<dyn SmbTransportWrite>>>>;

/// One request the server received, with the connection it came on.
#[derive(Debug, Clone)]
pub struct Logged {
    pub conn: usize,
    pub request: PlainRequest,
}

#[derive(Debug, Clone)]
pub struct StubOpen {
    pub name: String,
    pub file_id: FileId,
    pub create_guid: Option<Guid>,
    pub lease: Option<LeaseContext>,
    pub durable: bool,
    pub conn: usize,
}

pub struct ServerState {
    pub files: HashMap<String, Vec<u8>>,
    pub opens: HashMap<u64, StubOpen>,
    pub log: Vec<Logged>,
    /// Drop the connection instead of answering the next N requests of a command.
    pub drop_on: HashMap<Command, usize>,
    /// Carry out the next N requests of a command, then drop the connection
    /// before the reply goes out.
    pub lose_reply: HashMap<Command, usize>,
    /// Lease states are granted up to this.
    pub lease_cap: LeaseState,
    /// Break the next granted lease down to this state, sending the break
    /// ahead of the CREATE response.
    pub break_on_create: Option<LeaseState>,
    /// Unsolicited messages written before the next reply.
    notifications: Vec<PlainResponse>,
    pub server_guid: Guid,
    next_id: u64,
    next_session: u64,
    next_tree: u32,
    next_async: u64,
    connections: Vec<Writer>,
    /// Pending CHANGE_NOTIFYs by message id: (connection, async id, session).
    notifies: HashMap<u64, (usize, u64, u64)>,
}

impl ServerState {
    fn new() -> ServerState {
        ServerState {
            files: HashMap::new(),
            opens: HashMap::new(),
            log: Vec::new(),
            drop_on: HashMap::new(),
            lose_reply: HashMap::new(),
            lease_cap: LeaseState::rwh(),
            break_on_create: None,
            notifications: Vec::new(),
            server_guid: Guid::generate(),
            next_id: 1,
            next_session: 0x1000,
            next_tree: 1,
            next_async: 1,
            connections: Vec::new(),
            notifies: HashMap::new(),
        }
    }

    /// Requests of `command` in arrival order.
    pub fn requests(&self, command: Command) -> Vec<Logged> {
        self.log
            .iter()
            .filter(|l| l.request.header.command == command)
            .cloned()
            .collect()
    }

    fn find_open(&self, file_id: FileId) -> Option<&StubOpen> {
        self.opens
            .get(&file_id.persistent)
            .filter(|o| o.file_id == file_id)
    }

    fn new_file_id(&mut self, conn: usize) -> FileId {
        let persistent = self.next_id;
        self.next_id += 1;
        FileId {
            persistent,
            volatile: persistent + 0x1000 * (conn as u64 + 1),
        }
    }
}

#[derive(Clone)]
pub struct StubServer {
    pub state: Arc<Mutex<ServerState>>,
}

impl Default for StubServer {
    fn default() -> Self {
        StubServer::new()
    }
}

impl StubServer {
    pub fn new() -> StubServer {
        StubServer {
            state: Arc::new(Mutex::new(ServerState::new())),
        }
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    pub fn put_file(&self, name: &str, data: Vec<u8>) {
        self.lock().files.insert(name.to_string(), data);
    }

    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(name).cloned()
    }

    /// Makes the server drop the connection on the next `count` requests of
    /// `command`, without answering them.
    pub fn drop_next(&self, command: Command, count: usize) {
        self.lock().drop_on.insert(command, count);
    }

    /// Makes the server carry out the next `count` requests of `command` and
    /// then drop the connection instead of replying.
    pub fn lose_next_reply(&self, command: Command, count: usize) {
        self.lock().lose_reply.insert(command, count);
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Sends an unsolicited message on the newest connection.
    pub async fn push(&self, content: ResponseContent) {
        let writer = self.lock().connections.last().cloned().unwrap();
        let bytes = notification(content).encode().unwrap();
        if let Some(w) = writer.lock().await.as_mut() {
            w.send(&bytes).await.unwrap();
        }
    }

    pub async fn push_lease_break(&self, lease_key: Guid, from: LeaseState, to: LeaseState) {
        self.push(lease_break(lease_key, from, to).into()).await;
    }

    /// Polls until `check` holds; panics after five seconds.
    pub async fn wait_until(&self, what: &str, check: impl Fn(&ServerState) -> bool) {
        for _ in 0..500 {
            if check(&self.lock()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn accept(&self) -> MemoryTransport {
        let (client, server) = MemoryTransport::pair(TestConstants::SERVER);
        let (reader, writer) = Box::new(server).split().unwrap();
        let writer: Writer = Arc::new(tokio::sync::Mutex::new(Some(writer)));
        let conn = {
            let mut state = self.lock();
            state.connections.push(writer.clone());
            state.connections.len() - 1
        };
        tokio::spawn(serve(self.clone(), conn, reader, writer));
        client
    }
}

fn notification(content: ResponseContent) -> PlainResponse {
    let mut header = Header::new(Command::OplockBreak);
    header.message_id = u64::MAX;
    header.tree_id = Some(0);
    header.flags.set_server_to_redir(true);
    PlainResponse { header, content }
}

fn lease_break(lease_key: Guid, from: LeaseState, to: LeaseState) -> LeaseBreakNotify {
    LeaseBreakNotify {
        new_epoch: 2,
        flags: LeaseBreakFlags::new().with_ack_required(true),
        lease_key,
        current_lease_state: from,
        new_lease_state: to,
    }
}

enum Action {
    Reply(Vec<PlainResponse>),
    Disconnect,
}

async fn serve(
    server: StubServer,
    conn: usize,
    mut reader: Box<dyn SmbTransportRead>,
    writer: Writer,
) {
    while let Ok(message) = reader.receive().await {
        let action = handle_chain(&server, conn, &message);
        let notifications = std::mem::take(&mut server.lock().notifications);
        let mut writer = writer.lock().await;
        for notice in notifications {
            if let Some(w) = writer.as_mut() {
                if w.send(&notice.encode().unwrap()).await.is_err() {
                    break;
                }
            }
        }
        match action {
            Action::Reply(responses) if !responses.is_empty() => {
                let encoded: Vec<Vec<u8>> =
                    responses.iter().map(|r| r.encode().unwrap()).collect();
                let bytes = encode_compound(encoded).unwrap();
                if let Some(w) = writer.as_mut() {
                    if w.send(&bytes).await.is_err() {
                        break;
                    }
                }
            }
            Action::Reply(_) => {}
            Action::Disconnect => {
                writer.take();
                break;
            }
        }
    }
    // Volatile state goes with the connection.
    server
        .lock()
        .opens
        .retain(|_, open| open.conn != conn || open.durable);
}

fn handle_chain(server: &StubServer, conn: usize, message: &[u8]) -> Action {
    let mut state = server.lock();
    let mut responses = Vec::new();
    let mut last_file_id = FileId::EMPTY;
    for raw in split_compound(message).unwrap() {
        let request = PlainRequest::decode(raw).unwrap();
        state.log.push(Logged {
            conn,
            request: request.clone(),
        });
        let command = request.header.command;
        if let Some(n) = state.drop_on.get_mut(&command) {
            if *n > 0 {
                *n -= 1;
                return Action::Disconnect;
            }
        }
        if let Some(response) = handle(&mut state, conn, &request, &mut last_file_id) {
            responses.push(response);
        }
        if let Some(n) = state.lose_reply.get_mut(&command) {
            if *n > 0 {
                *n -= 1;
                return Action::Disconnect;
            }
        }
    }
    Action::Reply(responses)
}

fn reply(request: &PlainRequest, status: Status, content: ResponseContent) -> PlainResponse {
    let mut header = Header::new(request.header.command);
    header.message_id = request.header.message_id;
    header.session_id = request.header.session_id;
    header.tree_id = request.header.tree_id;
    header.status = status as u32;
    header.credit_request = request.header.credit_request.max(1);
    header.flags.set_server_to_redir(true);
    header
        .flags
        .set_related_operations(request.header.flags.related_operations());
    PlainResponse { header, content }
}

fn ok(request: &PlainRequest, content: impl Into<ResponseContent>) -> PlainResponse {
    reply(request, Status::Success, content.into())
}

fn fail(request: &PlainRequest, status: Status) -> PlainResponse {
    reply(request, status, ResponseContent::Error(Default::default()))
}

fn resolve(file_id: FileId, last: FileId) -> FileId {
    if file_id == FileId::FULL { last } else { file_id }
}

fn handle(
    state: &mut ServerState,
    conn: usize,
    request: &PlainRequest,
    last_file_id: &mut FileId,
) -> Option<PlainResponse> {
    let response = match &request.content {
        RequestContent::Negotiate(negotiate) => {
            let dialect = *negotiate.dialects.iter().max().unwrap();
            let contexts = (dialect == Dialect::Smb0311).then(|| {
                vec![NegotiateContext::PreauthIntegrity(
                    PreauthIntegrityCapabilities {
                        hash_algorithms: vec![HashAlgorithm::Sha512],
                        salt: vec![1; 32],
                    },
                )]
            });
            ok(
                request,
                NegotiateResponse {
                    security_mode: NegotiateSecurityMode::new().with_signing_enabled(true),
                    dialect_revision: NegotiateDialect::Dialect(dialect),
                    server_guid: state.server_guid,
                    capabilities: GlobalCapabilities::new()
                        .with_large_mtu(true)
                        .with_leasing(true)
                        .with_directory_leasing(true),
                    max_transact_size: TestConstants::MAX_IO,
                    max_read_size: TestConstants::MAX_IO,
                    max_write_size: TestConstants::MAX_IO,
                    system_time: FileTime::default(),
                    server_start_time: FileTime::default(),
                    buffer: b"MECHS".to_vec(),
                    negotiate_context_list: contexts,
                },
            )
        }
        RequestContent::SessionSetup(setup) => {
            let mut response = if setup.buffer == b"NEGOTIATE" {
                reply(
                    request,
                    Status::MoreProcessingRequired,
                    SessionSetupResponse {
                        session_flags: SessionFlags::new(),
                        buffer: b"CHALLENGE".to_vec(),
                    }
                    .into(),
                )
            } else {
                ok(
                    request,
                    SessionSetupResponse {
                        session_flags: SessionFlags::new(),
                        buffer: vec![],
                    },
                )
            };
            if request.header.session_id == 0 {
                response.header.session_id = state.next_session;
                state.next_session += 1;
            }
            response
        }
        RequestContent::Logoff(_) => ok(request, LogoffResponse {}),
        RequestContent::TreeConnect(_) => {
            let mut response = ok(
                request,
                TreeConnectResponse {
                    share_type: ShareType::Disk,
                    share_flags: ShareFlags::new(),
                    capabilities: TreeCapabilities::new(),
                    maximal_access: 0x001f_01ff,
                },
            );
            response.header.tree_id = Some(state.next_tree);
            state.next_tree += 1;
            response
        }
        RequestContent::TreeDisconnect(_) => ok(request, TreeDisconnectResponse {}),
        RequestContent::Create(create) => {
            let response = create_file(state, conn, request, create);
            if response.header.status == Status::U32_SUCCESS {
                *last_file_id = response.content.as_create().unwrap().file_id;
            }
            response
        }
        RequestContent::Close(close) => {
            let file_id = resolve(close.file_id, *last_file_id);
            if state.find_open(file_id).is_none() {
                fail(request, Status::FileClosed)
            } else {
                state.opens.remove(&file_id.persistent);
                ok(
                    request,
                    CloseResponse {
                        flags: CloseFlags::new(),
                        creation_time: FileTime::default(),
                        last_access_time: FileTime::default(),
                        last_write_time: FileTime::default(),
                        change_time: FileTime::default(),
                        allocation_size: 0,
                        end_of_file: 0,
                        file_attributes: FileAttributes::new(),
                    },
                )
            }
        }
        RequestContent::Read(read) => match state.find_open(read.file_id) {
            None => fail(request, Status::FileClosed),
            Some(open) => {
                let data = state.files.get(&open.name).cloned().unwrap_or_default();
                let start = read.offset as usize;
                if start >= data.len() {
                    fail(request, Status::EndOfFile)
                } else {
                    let end = (start + read.length as usize).min(data.len());
                    ok(
                        request,
                        ReadResponse {
                            buffer: data[start..end].to_vec(),
                        },
                    )
                }
            }
        },
        RequestContent::Write(write) => match state.find_open(write.file_id).cloned() {
            None => fail(request, Status::FileClosed),
            Some(open) => {
                let data = state.files.entry(open.name).or_default();
                let end = write.offset as usize + write.data.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[write.offset as usize..end].copy_from_slice(&write.data);
                ok(
                    request,
                    WriteResponse {
                        count: write.data.len() as u32,
                    },
                )
            }
        },
        RequestContent::QueryInfo(query) => {
            let file_id = resolve(query.file_id, *last_file_id);
            match state.find_open(file_id) {
                None => fail(request, Status::FileClosed),
                Some(open) => {
                    let len = state.files.get(&open.name).map_or(0, |d| d.len() as u64);
                    ok(
                        request,
                        QueryInfoResponse {
                            data: len.to_le_bytes().to_vec(),
                        },
                    )
                }
            }
        }
        RequestContent::SetInfo(_) => ok(request, SetInfoResponse {}),
        RequestContent::Flush(_) => ok(request, FlushResponse {}),
        RequestContent::Lock(_) => ok(request, LockResponse {}),
        RequestContent::Echo(_) => ok(request, EchoResponse {}),
        RequestContent::ChangeNotify(_) => {
            let async_id = state.next_async;
            state.next_async += 1;
            state.notifies.insert(
                request.header.message_id,
                (conn, async_id, request.header.session_id),
            );
            let mut interim = reply(request, Status::Pending, ResponseContent::Error(Default::default()));
            interim.header.to_async(async_id);
            interim
        }
        RequestContent::Cancel(_) => {
            let (_, async_id, _) = state.notifies.remove(&request.header.message_id)?;
            let mut cancelled = reply(request, Status::Cancelled, ResponseContent::Error(Default::default()));
            cancelled.header.command = Command::ChangeNotify;
            cancelled.header.credit_request = 0;
            cancelled.header.to_async(async_id);
            cancelled
        }
        RequestContent::LeaseBreakAck(ack) => ok(
            request,
            ResponseContent::LeaseBreak(LeaseBreakAckResponse {
                lease_key: ack.lease_key,
                lease_state: ack.lease_state,
            }),
        ),
        RequestContent::OplockBreakAck(ack) => {
            ok(request, ResponseContent::OplockBreak(ack.clone()))
        }
        _ => fail(request, Status::NotSupported),
    };
    Some(response)
}

fn create_file(
    state: &mut ServerState,
    conn: usize,
    request: &PlainRequest,
    create: &CreateRequest,
) -> PlainResponse {
    let mut lease_request = None;
    let mut durable_v2 = None;
    let mut reconnect = None;
    for context in &create.contexts {
        match context {
            CreateContextRequest::RequestLease(lease) => lease_request = Some(*lease),
            CreateContextRequest::DurableHandleRequestV2 { create_guid, .. } => {
                durable_v2 = Some(*create_guid)
            }
            CreateContextRequest::DurableHandleReconnectV2 {
                file_id,
                create_guid,
                ..
            } => reconnect = Some((*file_id, *create_guid)),
            _ => {}
        }
    }

    // Durable reconnect: the open must still exist under the same create guid.
    if let Some((file_id, create_guid)) = reconnect {
        let Some(open) = state
            .opens
            .get(&file_id.persistent)
            .filter(|o| o.create_guid == Some(create_guid))
            .cloned()
        else {
            return fail(request, Status::ObjectNameNotFound);
        };
        let new_id = FileId {
            persistent: file_id.persistent,
            volatile: file_id.persistent + 0x1000 * (conn as u64 + 1),
        };
        let mut contexts = vec![];
        if let Some(lease) = open.lease {
            contexts.push(CreateContextResponse::Lease(lease));
        }
        state.opens.insert(
            file_id.persistent,
            StubOpen {
                file_id: new_id,
                conn,
                ..open
            },
        );
        return ok(request, create_response(new_id, 0, contexts, true));
    }

    // A replayed create finds the open the lost attempt made.
    if request.header.flags.replay_operation() {
        if let Some(open) = durable_v2.and_then(|guid| {
            state
                .opens
                .values()
                .find(|o| o.create_guid == Some(guid))
                .cloned()
        }) {
            let mut contexts = vec![CreateContextResponse::DurableHandleV2 {
                timeout: 60_000,
                flags: DurableHandleV2Flags::new(),
            }];
            if let Some(lease) = open.lease {
                contexts.push(CreateContextResponse::Lease(lease));
            }
            let len = state.files.get(&open.name).map_or(0, |d| d.len() as u64);
            return ok(request, create_response(open.file_id, len, contexts, true));
        }
    }

    let name = create.name.to_string();
    let exists = state.files.contains_key(&name);
    let created = match create.create_disposition {
        CreateDisposition::Open if !exists => return fail(request, Status::ObjectNameNotFound),
        CreateDisposition::Create if exists => return fail(request, Status::ObjectNameCollision),
        CreateDisposition::Open | CreateDisposition::OpenIf => !exists,
        _ => true,
    };
    if created {
        state.files.insert(name.clone(), vec![]);
    }

    let file_id = state.new_file_id(conn);
    let mut contexts = vec![];
    if durable_v2.is_some() {
        contexts.push(CreateContextResponse::DurableHandleV2 {
            timeout: 60_000,
            flags: DurableHandleV2Flags::new(),
        });
    }
    let lease = lease_request.map(|lease| {
        let bits = u32::from_le_bytes(lease.lease_state.into_bytes())
            & u32::from_le_bytes(state.lease_cap.into_bytes());
        LeaseContext {
            lease_state: LeaseState::from_bytes(bits.to_le_bytes()),
            lease_flags: LeaseFlags::new(),
            v2: lease.v2.map(|v2| LeaseV2 { epoch: 1, ..v2 }),
            ..lease
        }
    });
    if let Some(lease) = lease {
        contexts.push(CreateContextResponse::Lease(lease));
        if let Some(to) = state.break_on_create.take() {
            let notify = lease_break(lease.lease_key, lease.lease_state, to);
            state.notifications.push(notification(notify.into()));
        }
    }
    state.opens.insert(
        file_id.persistent,
        StubOpen {
            name: name.clone(),
            file_id,
            create_guid: durable_v2,
            lease,
            durable: durable_v2.is_some(),
            conn,
        },
    );
    let len = state.files.get(&name).map_or(0, |d| d.len() as u64);
    ok(request, create_response(file_id, len, contexts, !created))
}

fn create_response(
    file_id: FileId,
    end_of_file: u64,
    create_contexts: Vec<CreateContextResponse>,
    opened: bool,
) -> CreateResponse {
    let leased = create_contexts
        .iter()
        .any(|c| matches!(c, CreateContextResponse::Lease(_)));
    CreateResponse {
        oplock_level: if leased {
            OplockLevel::Lease
        } else {
            OplockLevel::None
        },
        flags: CreateResponseFlags::new(),
        create_action: if opened {
            CreateAction::Opened
        } else {
            CreateAction::Created
        },
        creation_time: FileTime::default(),
        last_access_time: FileTime::default(),
        last_write_time: FileTime::default(),
        change_time: FileTime::default(),
        allocation_size: end_of_file,
        end_of_file,
        file_attributes: FileAttributes::new().with_normal(true),
        file_id,
        create_contexts,
    }
}

pub struct StubConnector {
    server: StubServer,
}

impl StubConnector {
    pub fn new(server: &StubServer) -> StubConnector {
        StubConnector {
            server: server.clone(),
        }
    }
}

impl Connector for StubConnector {
    fn connect<'a>(
        &'a self,
        server: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Box<dyn SmbTransport>, TransportError>> {
        Box::pin(async move {
            if server != TestConstants::SERVER {
                return Err(TransportError::InvalidAddress(server.to_string()));
            }
            Ok(Box::new(self.server.accept()) as Box<dyn SmbTransport>)
        })
    }
}

/// Two rounds: NEGOTIATE, then AUTHENTICATE once the challenge arrives.
#[derive(Default)]
pub struct StubAuthenticator {
    complete: bool,
}

impl Authenticator for StubAuthenticator {
    fn next_token(&mut self, input: &[u8]) -> smb_engine::Result<Vec<u8>> {
        if input == b"CHALLENGE" {
            self.complete = true;
            Ok(b"AUTHENTICATE".to_vec())
        } else if self.complete {
            Ok(vec![])
        } else {
            Ok(b"NEGOTIATE".to_vec())
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn session_key(&self) -> Option<Vec<u8>> {
        self.complete.then(|| TestConstants::SESSION_KEY.to_vec())
    }
}

pub struct StubAuthenticators;

impl AuthenticatorFactory for StubAuthenticators {
    fn create(&self, _server: &str) -> smb_engine::Result<Box<dyn Authenticator>> {
        Ok(Box::new(StubAuthenticator::default()))
    }
}

/// Opens an engine against `server` and connects the test share.
pub async fn make_stub_connection(
    server: &StubServer,
    config: ConnectionConfig,
    callbacks: Arc<dyn FsCallbacks>,
) -> std::result::Result<(SmbEngine, Share), Box<dyn std::error::Error>> {
    let engine = SmbEngine::open(
        config,
        Arc::new(StubConnector::new(server)),
        Arc::new(StubAuthenticators),
        Arc::new(LeaseRegistry::new()),
        callbacks,
    )?;
    engine.connect(TestConstants::SERVER).await?;
    let share = engine.tree_connect(TestConstants::SHARE).await?;
    Ok((engine, share))
}
