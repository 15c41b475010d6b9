//! Open files and directories, and the operations on them.
//!
//! Every operation goes through the session's retry loop, reading the file id and
//! tree id afresh on each attempt: a durable reconnect may have replaced both.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use smb_dtyp::Guid;
use smb_msg::{
    ChangeNotifyRequest, CloseFlags, CloseRequest, CreateContextRequest, CreateDisposition,
    CreateOptions, CreateRequest, CreateResponse, FileAccessMask, FileAttributes, FileId,
    FileNotifyInformation, FlushRequest, ImpersonationLevel, InfoType, IoctlRequest,
    IoctlRequestFlags, IoctlResponse, LeaseState, LockElement, LockRequest, LockSequence,
    NotifyFilter, NotifyFlags, OplockLevel, QueryDirectoryFlags, QueryDirectoryRequest,
    QueryInfoRequest, ReadRequest, RequestContent, ResponseContent, SetInfoRequest,
    ShareAccessFlags, SrvCopychunkCopy, SrvCopychunkItem, SrvCopychunkResponse,
    SrvRequestResumeKeyRequest, Status, WriteRequest,
};

use crate::bulk;
use crate::connection::Reply;
use crate::durable::{CreateOutcome, DurableHandle, DurableOptions, DurableRecord, HandleState};
use crate::lease::{LeaseEntry, NodeId};
use crate::locks::{ByteRangeLocks, HeldLock};
use crate::multiplexer::{ChannelSelector, InFlight};
use crate::session::SessionInner;
use crate::tree::ShareInner;
use crate::{Error, Result};

/// How long the server should keep a handle across a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    #[default]
    None,
    Durable,
    /// Requires continuous availability on the share.
    Persistent,
}

/// Parameters of a CREATE.
#[derive(Debug, Clone)]
pub struct CreateArgs {
    pub disposition: CreateDisposition,
    pub desired_access: FileAccessMask,
    pub share_access: ShareAccessFlags,
    pub attributes: FileAttributes,
    pub options: CreateOptions,
    pub directory: bool,
    /// The caller's node the lease is attached to.
    pub node: NodeId,
    /// Lease state to ask for; dropped when the session cannot lease.
    pub lease: Option<LeaseState>,
    pub durability: Durability,
    pub parent_lease_key: Option<Guid>,
    pub query_maximal_access: bool,
    pub extra_contexts: Vec<CreateContextRequest>,
}

fn share_all() -> ShareAccessFlags {
    ShareAccessFlags::new()
        .with_read(true)
        .with_write(true)
        .with_delete(true)
}

impl CreateArgs {
    /// Opens an existing file for reading with a full lease and a durable handle.
    pub fn open_file(node: NodeId) -> CreateArgs {
        CreateArgs {
            disposition: CreateDisposition::Open,
            desired_access: FileAccessMask::new()
                .with_file_read_data(true)
                .with_file_read_attributes(true)
                .with_synchronize(true),
            share_access: share_all(),
            attributes: FileAttributes::new(),
            options: CreateOptions::new().with_non_directory_file(true),
            directory: false,
            node,
            lease: Some(LeaseState::rwh()),
            durability: Durability::Durable,
            parent_lease_key: None,
            query_maximal_access: false,
            extra_contexts: vec![],
        }
    }

    /// Opens or creates a file for reading and writing.
    pub fn create_file(node: NodeId) -> CreateArgs {
        CreateArgs {
            disposition: CreateDisposition::OpenIf,
            desired_access: FileAccessMask::new()
                .with_file_read_data(true)
                .with_file_write_data(true)
                .with_file_append_data(true)
                .with_file_read_attributes(true)
                .with_file_write_attributes(true)
                .with_synchronize(true),
            attributes: FileAttributes::new().with_normal(true),
            ..CreateArgs::open_file(node)
        }
    }

    /// Opens a directory for enumeration with a read/handle directory lease.
    pub fn open_directory(node: NodeId) -> CreateArgs {
        CreateArgs {
            disposition: CreateDisposition::Open,
            desired_access: FileAccessMask::new()
                .with_file_read_data(true)
                .with_file_read_attributes(true)
                .with_synchronize(true),
            share_access: share_all(),
            attributes: FileAttributes::new(),
            options: CreateOptions::new().with_directory_file(true),
            directory: true,
            node,
            lease: Some(LeaseState::new().with_read_caching(true).with_handle_caching(true)),
            durability: Durability::None,
            parent_lease_key: None,
            query_maximal_access: false,
            extra_contexts: vec![],
        }
    }

    pub fn with_disposition(mut self, disposition: CreateDisposition) -> CreateArgs {
        self.disposition = disposition;
        self
    }

    pub fn with_lease(mut self, lease: Option<LeaseState>) -> CreateArgs {
        self.lease = lease;
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> CreateArgs {
        self.durability = durability;
        self
    }

    pub fn with_parent_lease_key(mut self, key: Guid) -> CreateArgs {
        self.parent_lease_key = Some(key);
        self
    }

    pub fn with_maximal_access(mut self) -> CreateArgs {
        self.query_maximal_access = true;
        self
    }
}

pub(crate) struct OpenInner {
    share: Arc<ShareInner>,
    durable: Arc<DurableHandle>,
    path: String,
    /// The CREATE as first sent, without contexts; reused for durable reconnects.
    template: CreateRequest,
    response: CreateResponse,
    file_id: Mutex<FileId>,
    revoked: AtomicBool,
    closed: AtomicBool,
    lock_sequence: AtomicU32,
    locks: Mutex<ByteRangeLocks>,
}

impl OpenInner {
    pub fn share(&self) -> &Arc<ShareInner> {
        &self.share
    }

    fn session(&self) -> &Arc<SessionInner> {
        &self.share.session
    }

    pub fn durable(&self) -> &Arc<DurableHandle> {
        &self.durable
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn reconnect_template(&self) -> CreateRequest {
        self.template.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn mark_revoked(&self) {
        self.revoked.store(true, Ordering::SeqCst);
        let dropped = self.locks().clear();
        if dropped > 0 {
            log::warn!("{} lost {dropped} byte-range locks", self.path);
        }
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, ByteRangeLocks> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_file_id(&self, file_id: FileId) {
        *self.file_id.lock().unwrap_or_else(|e| e.into_inner()) = file_id;
    }

    /// The current file id, failing once the open is closed or revoked.
    pub fn file_id(&self) -> Result<FileId> {
        if self.is_revoked() {
            return Err(Error::HandleRevoked);
        }
        if self.is_closed() {
            return Err(Error::InvalidState(format!("{} is closed", self.path)));
        }
        Ok(*self.file_id.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Sends one request built from the current file id, with recovery.
    pub async fn exchange<F>(self: &Arc<Self>, build: F) -> Result<Reply>
    where
        F: Fn(FileId) -> Result<RequestContent>,
    {
        let session = self.session();
        let build = &build;
        session
            .run(|replay| async move {
                let file_id = self.file_id()?;
                let tree_id = self.share.tree_id()?;
                let mut request = session
                    .mux
                    .allocate(build(file_id)?, ChannelSelector::Any, true)
                    .await?
                    .with_tree(tree_id);
                if replay {
                    request.set_replay();
                }
                session.mux.send_recv(request).await
            })
            .await
    }

    pub async fn read_at(self: &Arc<Self>, offset: u64, length: u32) -> Result<Vec<u8>> {
        let reply = self
            .exchange(|file_id| {
                Ok(ReadRequest {
                    flags: Default::default(),
                    length,
                    offset,
                    file_id,
                    minimum_count: 0,
                }
                .into())
            })
            .await;
        match reply {
            Ok(reply) => Ok(reply.message.content.to_read()?.buffer),
            Err(e) if e.status() == Some(Status::U32_END_OF_FILE) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    pub async fn write_at(self: &Arc<Self>, offset: u64, data: &[u8]) -> Result<u32> {
        let reply = self
            .exchange(|file_id| {
                Ok(WriteRequest {
                    offset,
                    file_id,
                    flags: Default::default(),
                    data: data.to_vec(),
                }
                .into())
            })
            .await?;
        let written = reply.message.content.to_write()?.count;
        if written as usize != data.len() {
            log::debug!("Short write at {offset}: {written} of {}", data.len());
        }
        Ok(written)
    }

    /// Sends the CLOSE, ignoring any deferral, and detaches the lease.
    pub async fn finish_close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let lease_key = self.durable.lease_key();
        let session = self.session();
        session.take_deferred(&lease_key);
        session.engine.registry.remove(&lease_key);
        self.locks().clear();
        if self.is_revoked() {
            log::debug!("{} was revoked; closing locally", self.path);
            return Ok(());
        }

        let result = session
            .run(|replay| async move {
                let file_id = *self.file_id.lock().unwrap_or_else(|e| e.into_inner());
                let tree_id = self.share.tree_id()?;
                let close = CloseRequest {
                    flags: CloseFlags::new(),
                    file_id,
                };
                let mut request = session
                    .mux
                    .allocate(close.into(), ChannelSelector::Any, true)
                    .await?
                    .with_tree(tree_id);
                if replay {
                    request.set_replay();
                }
                session.mux.send_recv(request).await
            })
            .await;
        match result {
            Ok(_) => {
                log::debug!("Closed {}", self.path);
                Ok(())
            }
            // A replayed close of a handle the server already dropped.
            Err(e) if e.status() == Some(Status::U32_FILE_CLOSED) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close(self: &Arc<Self>, defer: bool) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let session = self.session();
        if defer && session.engine.config.defer_close && !self.is_revoked() {
            let mut record = self.durable.lock().await;
            if record.holds_handle_lease() {
                record.flags.set_deferred_close(true);
                drop(record);
                log::debug!("Deferring close of {}", self.path);
                session.defer_close(self.durable.lease_key(), self.clone());
                return Ok(());
            }
        }
        self.finish_close().await
    }
}

fn durable_options(session: &SessionInner, share: &ShareInner, args: &CreateArgs) -> Result<DurableOptions> {
    let config = &session.engine.config;
    let negotiated = session.negotiated()?;
    let can_lease = config.leasing
        && negotiated.leasing()
        && (!args.directory || negotiated.directory_leasing());
    let durable = config.durable_handles && args.durability != Durability::None;
    let persistent = args.durability == Durability::Persistent
        && config.persistent_handles
        && negotiated.persistent_handles()
        && share.capabilities().continuous_availability();
    Ok(DurableOptions {
        lease: args.lease.filter(|_| can_lease),
        lease_v2: negotiated.dialect.supports_lease_v2(),
        durable,
        durable_v2: negotiated.dialect.supports_durable_v2(),
        persistent,
        directory: args.directory,
        parent_lease_key: args.parent_lease_key,
        timeout: 0,
    })
}

/// An open file or directory.
#[derive(Clone)]
pub struct OpenHandle {
    pub(crate) inner: Arc<OpenInner>,
}

impl OpenHandle {
    pub(crate) async fn create(
        share: &Arc<ShareInner>,
        path: &str,
        args: CreateArgs,
    ) -> Result<OpenHandle> {
        let session = &share.session;
        let options = durable_options(session, share, &args)?;
        let durable = Arc::new(DurableHandle::new(args.node, DurableRecord::new(&options)));
        let lease_key = durable.lease_key();
        let oplock = if options.lease.is_some() {
            OplockLevel::Lease
        } else if options.durable {
            OplockLevel::Batch
        } else {
            OplockLevel::None
        };
        let mut options_bits = args.options;
        if args.directory {
            options_bits.set_directory_file(true);
            options_bits.set_non_directory_file(false);
        }
        let template = CreateRequest {
            requested_oplock_level: oplock,
            impersonation_level: ImpersonationLevel::Impersonation,
            desired_access: args.desired_access,
            file_attributes: args.attributes,
            share_access: args.share_access,
            create_disposition: args.disposition,
            create_options: options_bits,
            name: path.into(),
            contexts: vec![],
        };

        // A break can arrive ahead of the CREATE response. Reserving the key
        // first lets the break handler find this record and wait on its lock.
        let registry = &session.engine.registry;
        let reserved = options.lease.is_some();
        if reserved {
            registry.insert(
                lease_key,
                LeaseEntry {
                    node: args.node,
                    file_id: FileId::EMPTY,
                    handle: Arc::downgrade(&durable),
                },
            )?;
        }

        let template_ref = &template;
        let durable_ref = &durable;
        let args_ref = &args;
        let created = session
            .run(|replay| async move {
                let tree_id = share.tree_id()?;
                // Held from before the send until the response is applied.
                let mut record = durable_ref.lock().await;
                let mut contexts = record.create_contexts(lease_key);
                if args_ref.query_maximal_access {
                    contexts.push(CreateContextRequest::QueryMaximalAccess(None));
                }
                contexts.extend(args_ref.extra_contexts.iter().cloned());
                CreateContextRequest::sort_for_assembly(&mut contexts);
                let request = CreateRequest {
                    contexts,
                    ..template_ref.clone()
                };
                let mut request = session
                    .mux
                    .allocate(request.into(), ChannelSelector::Any, true)
                    .await?
                    .with_tree(tree_id);
                if replay {
                    request.set_replay();
                }
                let reply = session.mux.send_recv(request).await?;
                let response = reply.message.content.to_create()?;
                let outcome = record.on_create_response(lease_key, &response)?;
                if record.granted.is_none() {
                    if reserved {
                        registry.remove(&lease_key);
                    }
                } else if !registry.update_file_id(&lease_key, response.file_id) {
                    registry.insert(
                        lease_key,
                        LeaseEntry {
                            node: args_ref.node,
                            file_id: response.file_id,
                            handle: Arc::downgrade(durable_ref),
                        },
                    )?;
                }
                Ok((response, outcome))
            })
            .await;
        let (response, outcome) = match created {
            Ok(created) => created,
            Err(e) => {
                registry.remove(&lease_key);
                return Err(e);
            }
        };

        if outcome == CreateOutcome::Inconsistent {
            log::warn!("{path} is open without durability after an inconsistent grant");
        }
        log::debug!(
            "Opened {path} as {} ({:?})",
            response.file_id,
            response.create_action
        );
        let inner = Arc::new(OpenInner {
            share: share.clone(),
            durable,
            path: path.to_string(),
            template,
            file_id: Mutex::new(response.file_id),
            response,
            revoked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock_sequence: AtomicU32::new(0),
            locks: Mutex::new(ByteRangeLocks::new()),
        });
        session.track_open(&inner);
        Ok(OpenHandle { inner })
    }

    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn file_id(&self) -> Result<FileId> {
        self.inner.file_id()
    }

    pub fn lease_key(&self) -> Guid {
        self.inner.durable.lease_key()
    }

    pub fn node(&self) -> NodeId {
        self.inner.durable.node()
    }

    /// The CREATE response the handle was opened with.
    pub fn create_response(&self) -> &CreateResponse {
        &self.inner.response
    }

    pub fn is_revoked(&self) -> bool {
        self.inner.is_revoked()
    }

    pub async fn lease_state(&self) -> LeaseState {
        self.inner.durable.lock().await.granted
    }

    pub async fn handle_state(&self) -> HandleState {
        self.inner.durable.lock().await.state
    }

    /// Reads up to `length` bytes; fewer at end of file.
    pub async fn read_at(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        self.inner.read_at(offset, length).await
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u32> {
        self.inner.write_at(offset, data).await
    }

    /// Reads `length` bytes in quantum-sized chunks, several at a time.
    pub async fn read_bulk(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        bulk::read(&self.inner, offset, length).await
    }

    pub async fn write_bulk(&self, offset: u64, data: &[u8]) -> Result<u64> {
        bulk::write(&self.inner, offset, data).await
    }

    pub async fn query_info(
        &self,
        info_type: InfoType,
        info_class: u8,
        output_buffer_length: u32,
    ) -> Result<Vec<u8>> {
        let reply = self
            .inner
            .exchange(|file_id| {
                Ok(QueryInfoRequest {
                    info_type,
                    info_class,
                    output_buffer_length,
                    additional_info: Default::default(),
                    flags: Default::default(),
                    file_id,
                    input: vec![],
                }
                .into())
            })
            .await?;
        Ok(reply.message.content.to_query_info()?.data)
    }

    /// Sets file information of `info_class`. Attribute caches of the node are
    /// invalidated on success.
    pub async fn set_info(&self, info_class: u8, data: Vec<u8>) -> Result<()> {
        let invalidates = SetInfoRequest::file_info(FileId::EMPTY, info_class, vec![])
            .invalidates_attributes();
        self.inner
            .exchange(|file_id| Ok(SetInfoRequest::file_info(file_id, info_class, data.clone()).into()))
            .await?;
        if invalidates {
            self.inner
                .session()
                .engine
                .callbacks
                .invalidate_attributes(self.node());
        }
        Ok(())
    }

    pub async fn set_end_of_file(&self, end_of_file: u64) -> Result<()> {
        self.inner
            .exchange(|file_id| Ok(SetInfoRequest::end_of_file(file_id, end_of_file).into()))
            .await?;
        self.inner
            .session()
            .engine
            .callbacks
            .invalidate_attributes(self.node());
        Ok(())
    }

    pub async fn ioctl(&self, ctl_code: u32, fsctl: bool, input: Vec<u8>, max_output: u32) -> Result<IoctlResponse> {
        let reply = self
            .inner
            .exchange(|file_id| {
                Ok(IoctlRequest {
                    ctl_code,
                    file_id,
                    max_input_response: 0,
                    max_output_response: max_output,
                    flags: IoctlRequestFlags::new().with_is_fsctl(fsctl),
                    buffer: input.clone(),
                }
                .into())
            })
            .await?;
        Ok(reply.message.content.to_ioctl()?)
    }

    /// Server-side copy from `source` into this handle.
    ///
    /// When the server rejects the chunk list as too large, the failure carries
    /// its limits; see [`copychunk_limits`].
    pub async fn copy_chunk(
        &self,
        source: &OpenHandle,
        chunks: Vec<SrvCopychunkItem>,
    ) -> Result<SrvCopychunkResponse> {
        let key = source
            .inner
            .exchange(|file_id| Ok(IoctlRequest::fsctl(file_id, &SrvRequestResumeKeyRequest, 32)?.into()))
            .await?
            .message
            .content
            .to_ioctl()?
            .parse_fsctl::<SrvRequestResumeKeyRequest>()?;
        let copy = SrvCopychunkCopy {
            source_key: key.resume_key,
            chunks,
            write: true,
        };
        let reply = self
            .inner
            .exchange(|file_id| Ok(IoctlRequest::fsctl(file_id, &copy, 12)?.into()))
            .await?;
        let response = reply.message.content.to_ioctl()?;
        Ok(SrvCopychunkResponse::from_output(&response.out_buffer)?)
    }

    /// Acquires or releases byte ranges.
    pub async fn lock(&self, locks: Vec<LockElement>) -> Result<()> {
        // One sequence slot per call, repeated unchanged on replays.
        let n = self.inner.lock_sequence.fetch_add(1, Ordering::SeqCst);
        let durable = self.inner.durable.lock().await.flags.granted();
        let lock_sequence = if durable {
            LockSequence::new()
                .with_number(((n / 64) % 16) as u8)
                .with_index(n % 64 + 1)
        } else {
            LockSequence::new()
        };
        self.inner
            .exchange(|file_id| {
                Ok(LockRequest {
                    lock_sequence,
                    file_id,
                    locks: locks.clone(),
                }
                .into())
            })
            .await?;
        self.inner.locks().apply(&locks);
        Ok(())
    }

    /// Byte ranges currently locked through this handle.
    pub fn held_locks(&self) -> Vec<HeldLock> {
        self.inner.locks().iter().map(|(_, l)| *l).collect()
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner
            .exchange(|file_id| Ok(FlushRequest { file_id }.into()))
            .await?;
        Ok(())
    }

    /// Arms a change notification on this directory.
    pub async fn change_notify(
        &self,
        filter: NotifyFilter,
        watch_tree: bool,
        output_buffer_length: u32,
    ) -> Result<NotifyWatch> {
        let inner = &self.inner;
        let session = inner.session();
        let flight = session
            .run(|replay| async move {
                let file_id = inner.file_id()?;
                let tree_id = inner.share.tree_id()?;
                let request = ChangeNotifyRequest {
                    flags: NotifyFlags::new().with_watch_tree(watch_tree),
                    output_buffer_length,
                    file_id,
                    completion_filter: filter,
                };
                let mut request = session
                    .mux
                    .allocate(request.into(), ChannelSelector::Any, true)
                    .await?
                    .with_tree(tree_id);
                if replay {
                    request.set_replay();
                }
                let mut flights = session.mux.send(request).await?;
                flights.pop().ok_or(Error::ConnectionClosed)
            })
            .await?;
        Ok(NotifyWatch {
            session: session.clone(),
            node: self.node(),
            flight,
        })
    }

    /// Arms a change notification and runs `callback` with its outcome.
    pub async fn change_notify_with<F>(
        &self,
        filter: NotifyFilter,
        watch_tree: bool,
        output_buffer_length: u32,
        callback: F,
    ) -> Result<u64>
    where
        F: FnOnce(Result<Vec<FileNotifyInformation>>) + Send + 'static,
    {
        let session = self.inner.session();
        let file_id = self.inner.file_id()?;
        let tree_id = self.inner.share.tree_id()?;
        let request = ChangeNotifyRequest {
            flags: NotifyFlags::new().with_watch_tree(watch_tree),
            output_buffer_length,
            file_id,
            completion_filter: filter,
        };
        let request = session
            .mux
            .allocate(request.into(), ChannelSelector::Any, true)
            .await?
            .with_tree(tree_id);
        let ids = session
            .mux
            .send_with_callback(request, move |reply| callback(notify_changes(reply)))
            .await?;
        ids.first().copied().ok_or(Error::ConnectionClosed)
    }

    /// One QUERY_DIRECTORY round; an empty result means the enumeration is done.
    pub async fn query_directory(
        &self,
        pattern: &str,
        info_class: u8,
        restart: bool,
        output_buffer_length: u32,
    ) -> Result<Vec<Vec<u8>>> {
        let reply = self
            .inner
            .exchange(|file_id| {
                Ok(QueryDirectoryRequest {
                    file_information_class: info_class,
                    flags: QueryDirectoryFlags::new().with_restart_scans(restart),
                    file_index: 0,
                    file_id,
                    output_buffer_length,
                    file_name: pattern.into(),
                }
                .into())
            })
            .await;
        match reply {
            Ok(reply) => {
                let response = reply.message.content.to_query_directory()?;
                Ok(response.entries()?.into_iter().map(<[u8]>::to_vec).collect())
            }
            Err(e) if e.status() == Some(Status::U32_NO_MORE_FILES) => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    /// Closes the handle, or defers the CLOSE while a handle lease is held.
    pub async fn close(self) -> Result<()> {
        self.inner.close(true).await
    }

    /// Closes the handle now, whatever lease it holds.
    pub async fn close_now(self) -> Result<()> {
        self.inner.close(false).await
    }
}

impl std::fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenHandle")
            .field("path", &self.path())
            .field("file_id", &self.file_id().ok())
            .finish()
    }
}

/// The chunk totals a rejected copychunk request came back with.
pub fn copychunk_limits(error: &Error) -> Option<SrvCopychunkResponse> {
    match error {
        Error::ServerStatus {
            status: Status::U32_INVALID_PARAMETER,
            aux: Some(content),
            ..
        } => match content.as_ref() {
            ResponseContent::Ioctl(ioctl) => SrvCopychunkResponse::from_output(&ioctl.out_buffer).ok(),
            _ => None,
        },
        _ => None,
    }
}

fn notify_changes(reply: Result<Reply>) -> Result<Vec<FileNotifyInformation>> {
    match reply {
        Ok(reply) => {
            if reply.message.header.status == Status::U32_NOTIFY_ENUM_DIR {
                return Ok(vec![]);
            }
            Ok(reply.message.content.to_change_notify()?.buffer.into_vec())
        }
        Err(e) => Err(e),
    }
}

/// A pending CHANGE_NOTIFY.
pub struct NotifyWatch {
    session: Arc<SessionInner>,
    node: NodeId,
    flight: InFlight,
}

impl NotifyWatch {
    pub fn message_id(&self) -> u64 {
        self.flight.message_id
    }

    /// Waits for the directory to change. An empty list means too much changed
    /// to report and the node's enumeration was invalidated.
    pub async fn wait(self) -> Result<Vec<FileNotifyInformation>> {
        let reply = self.session.mux.complete(self.flight).await;
        let changes = notify_changes(reply)?;
        if changes.is_empty() {
            self.session.engine.callbacks.invalidate_enumeration(self.node);
        }
        Ok(changes)
    }

    /// Asks the server to cancel; [`wait`](Self::wait) then fails with
    /// STATUS_CANCELLED.
    pub async fn cancel(&self) -> Result<()> {
        self.session.mux.cancel(&self.flight).await
    }
}
