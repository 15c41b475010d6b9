//! Tree connects: shares and operations addressed by path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use smb_msg::{
    CloseFlags, CloseRequest, CreateDisposition, CreateOptions, CreateRequest, FileAccessMask,
    FileAttributes, FileId, ImpersonationLevel, InfoType, OplockLevel, QueryInfoRequest,
    ShareAccessFlags, ShareType, TreeCapabilities, TreeConnectRequest, TreeConnectResponse,
    TreeDisconnectRequest,
};

use crate::handle::{CreateArgs, OpenHandle};
use crate::multiplexer::ChannelSelector;
use crate::session::{MAIN_CHANNEL, SessionInner};
use crate::{Error, Result};

/// Tree id of a share that is not connected.
pub const TID_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Connects `\\server\name` on the main channel.
pub(crate) async fn connect_tree(
    session: &Arc<SessionInner>,
    name: &str,
) -> Result<(u32, TreeConnectResponse)> {
    let path = format!(r"\\{}\{}", session.server, name);
    let request = session
        .mux
        .allocate(
            TreeConnectRequest::new(&path).into(),
            ChannelSelector::Pinned(MAIN_CHANNEL),
            true,
        )
        .await?;
    let reply = session.mux.send_recv(request).await?;
    let tree_id = reply
        .message
        .header
        .tree_id
        .ok_or_else(|| Error::InvalidMessage("tree connect response without a tree id".into()))?;
    let response = reply.message.content.to_tree_connect()?;
    log::debug!("Connected {path} as tree {tree_id:#x} ({:?})", response.share_type);
    Ok((tree_id, response))
}

pub(crate) async fn disconnect_tree(session: &Arc<SessionInner>, tree_id: u32) -> Result<()> {
    let request = session
        .mux
        .allocate(TreeDisconnectRequest {}.into(), ChannelSelector::Any, true)
        .await?
        .with_tree(tree_id);
    session.mux.send_recv(request).await?;
    Ok(())
}

pub(crate) struct ShareInner {
    pub session: Arc<SessionInner>,
    name: String,
    tree_id: AtomicU32,
    connected: AtomicBool,
    /// Set by an explicit disconnect; a reconnect leaves the share alone then.
    detached: AtomicBool,
    info: Mutex<TreeConnectResponse>,
}

impl ShareInner {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tree id, valid only while connected.
    pub fn tree_id(&self) -> Result<u32> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(format!("share {} is disconnected", self.name)));
        }
        if !self.connected.load(Ordering::SeqCst) {
            // Reconnect is under way; the caller retries once it completes.
            return Err(Error::ConnectionClosed);
        }
        Ok(self.tree_id.load(Ordering::SeqCst))
    }

    pub fn capabilities(&self) -> TreeCapabilities {
        self.info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .capabilities
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.tree_id.store(TID_UNKNOWN, Ordering::SeqCst);
    }

    /// Tree connect again after a session reconnect.
    pub async fn reconnect(&self) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (tree_id, response) = connect_tree(&self.session, &self.name).await?;
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = response;
        self.tree_id.store(tree_id, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        if self.detached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let tree_id = self.tree_id.swap(TID_UNKNOWN, Ordering::SeqCst);
        if !was_connected {
            return Ok(());
        }
        disconnect_tree(&self.session, tree_id).await
    }
}

/// A connected share.
#[derive(Clone)]
pub struct Share {
    pub(crate) inner: Arc<ShareInner>,
}

impl Share {
    pub(crate) async fn connect(session: &Arc<SessionInner>, name: &str) -> Result<Share> {
        let (tree_id, response) = connect_tree(session, name).await?;
        let inner = Arc::new(ShareInner {
            session: session.clone(),
            name: name.to_string(),
            tree_id: AtomicU32::new(tree_id),
            connected: AtomicBool::new(true),
            detached: AtomicBool::new(false),
            info: Mutex::new(response),
        });
        session.track_share(&inner);
        Ok(Share { inner })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// `None` while a reconnect is in progress or after a disconnect.
    pub fn tree_id(&self) -> Option<u32> {
        self.inner.tree_id().ok()
    }

    pub fn share_type(&self) -> ShareType {
        self.inner
            .info
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .share_type
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub async fn create(&self, path: &str, args: CreateArgs) -> Result<OpenHandle> {
        OpenHandle::create(&self.inner, path, args).await
    }

    /// Queries file information of `path` with one CREATE, QUERY_INFO and CLOSE
    /// round trip.
    pub async fn query_path_info(
        &self,
        path: &str,
        info_class: u8,
        output_buffer_length: u32,
    ) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let session = &inner.session;
        session
            .run(|replay| async move {
                let tree_id = inner.tree_id()?;
                let mux = &session.mux;
                let create = mux
                    .allocate(path_create(path).into(), ChannelSelector::Any, true)
                    .await?;
                let pinned = ChannelSelector::Pinned(create.channel_id());
                let query = QueryInfoRequest {
                    info_type: InfoType::File,
                    info_class,
                    output_buffer_length,
                    additional_info: Default::default(),
                    flags: Default::default(),
                    file_id: FileId::FULL,
                    input: vec![],
                };
                let query = mux.allocate(query.into(), pinned, true).await?.related();
                let close = CloseRequest {
                    flags: CloseFlags::new(),
                    file_id: FileId::FULL,
                };
                let close = mux.allocate(close.into(), pinned, true).await?.related();
                let chain = mux.append_to_compound(create, query)?;
                let mut chain = mux.append_to_compound(chain, close)?.with_tree(tree_id);
                if replay {
                    chain.set_replay();
                }

                let flights = mux.send(chain).await?;
                let mut results = Vec::with_capacity(flights.len());
                for flight in flights {
                    results.push(mux.complete(flight).await);
                }
                let mut results = results.into_iter();
                let (Some(create), Some(query), Some(close)) =
                    (results.next(), results.next(), results.next())
                else {
                    return Err(Error::InvalidMessage("compound reply is incomplete".into()));
                };
                create?;
                let data = query?.message.content.to_query_info()?.data;
                if let Err(e) = close {
                    log::debug!("Compound close of {path} failed: {e}");
                }
                Ok(data)
            })
            .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.disconnect().await
    }
}

fn path_create(path: &str) -> CreateRequest {
    CreateRequest {
        requested_oplock_level: OplockLevel::None,
        impersonation_level: ImpersonationLevel::Impersonation,
        desired_access: FileAccessMask::new().with_file_read_attributes(true),
        file_attributes: FileAttributes::new(),
        share_access: ShareAccessFlags::new()
            .with_read(true)
            .with_write(true)
            .with_delete(true),
        create_disposition: CreateDisposition::Open,
        create_options: CreateOptions::new(),
        name: path.into(),
        contexts: vec![],
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("name", &self.name())
            .field("tree_id", &self.tree_id())
            .finish()
    }
}
