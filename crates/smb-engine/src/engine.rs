//! The engine facade the filesystem layer talks to.

use std::sync::Arc;

use futures_core::future::BoxFuture;
use smb_dtyp::Guid;
use smb_transport::{SmbTransport, TransportError};
use tokio::sync::Mutex;

use crate::config::ConnectionConfig;
use crate::lease::{LeaseRegistry, NodeId};
use crate::session::{AuthenticatorFactory, Session};
use crate::transform::{NoTransform, TransformProvider};
use crate::tree::Share;
use crate::{Error, Result};

/// Opens transports to a server. Called for the main channel, for every alternate
/// channel and again on every reconnect.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        server: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Box<dyn SmbTransport>, TransportError>>;
}

/// Hooks into the caller's filesystem view, invoked when server-side state changes
/// what the caller may have cached.
pub trait FsCallbacks: Send + Sync {
    fn invalidate_attributes(&self, _node: NodeId) {}

    fn invalidate_enumeration(&self, _node: NodeId) {}

    /// Writes back dirty cached data of `node` before a lease break is acknowledged.
    fn flush_dirty(&self, _node: NodeId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// The open of `node` could not be recovered after a reconnect.
    fn revoked(&self, _node: NodeId) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallbacks;

impl FsCallbacks for NoCallbacks {}

pub(crate) struct EngineShared {
    pub config: ConnectionConfig,
    pub connector: Arc<dyn Connector>,
    pub authenticators: Arc<dyn AuthenticatorFactory>,
    pub registry: Arc<LeaseRegistry>,
    pub callbacks: Arc<dyn FsCallbacks>,
    pub transform: Arc<dyn TransformProvider>,
    pub client_guid: Guid,
}

/// One mounted server: a session, its channels and shares.
pub struct SmbEngine {
    shared: Arc<EngineShared>,
    session: Mutex<Option<Session>>,
}

impl SmbEngine {
    /// Validates `config` and opens `registry` for this engine's lifetime.
    pub fn open(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        authenticators: Arc<dyn AuthenticatorFactory>,
        registry: Arc<LeaseRegistry>,
        callbacks: Arc<dyn FsCallbacks>,
    ) -> Result<SmbEngine> {
        config.validate()?;
        registry.open();
        Ok(SmbEngine {
            shared: Arc::new(EngineShared {
                config,
                connector,
                authenticators,
                registry,
                callbacks,
                transform: Arc::new(NoTransform),
                client_guid: Guid::generate(),
            }),
            session: Mutex::new(None),
        })
    }

    /// Installs the signing and encryption layer. Must be called before `connect`.
    pub fn with_transform(mut self, transform: Arc<dyn TransformProvider>) -> Result<SmbEngine> {
        let shared = Arc::get_mut(&mut self.shared).ok_or_else(|| {
            Error::InvalidState("the transform must be set before connecting".into())
        })?;
        shared.transform = transform;
        Ok(self)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<LeaseRegistry> {
        &self.shared.registry
    }

    /// Negotiates and authenticates with `server` on a new main channel.
    pub async fn connect(&self, server: &str) -> Result<Session> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(Error::InvalidState(format!(
                "already connected; close before connecting to {server}"
            )));
        }
        if !self.shared.registry.is_open() {
            return Err(Error::InvalidState("the engine is closed".into()));
        }
        let session = Session::establish(self.shared.clone(), server).await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    pub async fn session(&self) -> Result<Session> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::InvalidState("not connected".into()))
    }

    pub async fn tree_connect(&self, share: &str) -> Result<Share> {
        self.session().await?.tree_connect(share).await
    }

    /// Binds one more channel to the session. Returns its channel id.
    pub async fn add_channel(&self) -> Result<u32> {
        self.session().await?.add_channel().await
    }

    pub async fn echo(&self) -> Result<()> {
        self.session().await?.echo().await
    }

    /// Closes deferred handles, logs off, stops every channel and closes the
    /// lease registry.
    pub async fn close(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        let result = match session {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        self.shared.registry.close();
        log::info!("Engine closed");
        result
    }
}
