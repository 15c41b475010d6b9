//! Oplock and lease break handling.
//!
//! Breaks arrive as unsolicited notifications on any channel. Each one is handled
//! on its own task: flush dirty data, close a deferred handle, then acknowledge.
//! The registry lock is never held across any of those steps.

use std::sync::{Arc, Weak};

use smb_dtyp::Guid;
use smb_msg::{
    LeaseBreakAck, LeaseBreakNotify, LeaseState, OplockBreakAck, OplockBreakNotify,
    RequestContent, ResponseContent,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Notification;
use crate::multiplexer::ChannelSelector;
use crate::session::SessionInner;
use crate::{Error, Result};

pub(crate) fn spawn_listener(
    session: Weak<SessionInner>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            let channel_id = notification.channel_id;
            match notification.message.content {
                ResponseContent::LeaseBreakNotify(notify) => {
                    tokio::spawn(async move {
                        if let Err(e) = on_lease_break(&session, notify).await {
                            log::warn!("[channel {channel_id}] Lease break failed: {e}");
                        }
                    });
                }
                ResponseContent::OplockBreakNotify(notify) => {
                    tokio::spawn(async move {
                        if let Err(e) = on_oplock_break(&session, notify).await {
                            log::warn!("[channel {channel_id}] Oplock break failed: {e}");
                        }
                    });
                }
                other => log::debug!(
                    "[channel {channel_id}] Ignoring notification {}",
                    other.content_name()
                ),
            }
        }
        log::debug!("Break listener stopped");
    })
}

async fn on_lease_break(session: &Arc<SessionInner>, notify: LeaseBreakNotify) -> Result<()> {
    let lease_key = notify.lease_key;
    let registry = &session.engine.registry;
    log::debug!(
        "Lease break for {lease_key}: {} -> {} (epoch {})",
        notify.current_lease_state,
        notify.new_lease_state,
        notify.new_epoch
    );

    let Some(entry) = registry.lookup(&lease_key) else {
        return on_unknown_lease(session, &notify).await;
    };
    let Some(handle) = entry.handle.upgrade() else {
        registry.remove(&lease_key);
        return on_unknown_lease(session, &notify).await;
    };

    let action = {
        let mut record = handle.lock().await;
        record.on_lease_break(lease_key, &notify)?
    };

    let callbacks = &session.engine.callbacks;
    if action.flush {
        if let Err(e) = callbacks.flush_dirty(entry.node).await {
            log::warn!("Flushing {:?} before the break of {lease_key} failed: {e}", entry.node);
        }
    }

    let mut closed = false;
    if action.close_deferred {
        if let Some(open) = session.take_deferred(&lease_key) {
            log::debug!("Closing deferred {} on lease break", open.path());
            open.finish_close().await?;
            closed = true;
        }
    }

    if action.ack {
        match acknowledge(session, lease_key, action.new_state).await {
            Ok(()) => {}
            // The close already gave the lease back.
            Err(e) if closed && e.kind() == crate::ErrorKind::Semantic => {
                log::debug!("Ack of {lease_key} after close: {e}");
            }
            Err(e) => return Err(e),
        }
    }

    if action.remove_entry {
        registry.remove(&lease_key);
    }
    if action.invalidate_enumeration {
        callbacks.invalidate_enumeration(entry.node);
    } else {
        callbacks.invalidate_attributes(entry.node);
    }
    Ok(())
}

async fn on_unknown_lease(session: &Arc<SessionInner>, notify: &LeaseBreakNotify) -> Result<()> {
    if !notify.flags.ack_required() {
        log::debug!("Break for unknown lease {}; nothing to do", notify.lease_key);
        return Ok(());
    }
    log::debug!("Acknowledging break for unknown lease {}", notify.lease_key);
    acknowledge(session, notify.lease_key, notify.new_lease_state).await
}

async fn acknowledge(session: &Arc<SessionInner>, lease_key: Guid, lease_state: LeaseState) -> Result<()> {
    let reply = session
        .run(|_| async move {
            let ack = LeaseBreakAck {
                lease_key,
                lease_state,
            };
            let request = session
                .mux
                .allocate(RequestContent::from(ack), ChannelSelector::Any, true)
                .await?;
            session.mux.send_recv(request).await
        })
        .await?;
    let response = reply.message.content.to_lease_break()?;
    if response.lease_key != lease_key {
        return Err(Error::LeaseKeyMismatch {
            expected: lease_key,
            actual: response.lease_key,
        });
    }
    log::debug!("Lease {lease_key} acknowledged at {}", response.lease_state);
    Ok(())
}

async fn on_oplock_break(session: &Arc<SessionInner>, notify: OplockBreakNotify) -> Result<()> {
    log::debug!(
        "Oplock break for {} to {:?}",
        notify.file_id,
        notify.oplock_level
    );
    let ack = OplockBreakAck {
        oplock_level: notify.oplock_level,
        file_id: notify.file_id,
    };
    session
        .run(|_| {
            let ack = ack.clone();
            async move {
                let request = session
                    .mux
                    .allocate(RequestContent::from(ack), ChannelSelector::Any, true)
                    .await?;
                session.mux.send_recv(request).await
            }
        })
        .await?
        .message
        .content
        .to_oplock_break()?;
    Ok(())
}
