use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_core::future::BoxFuture;
use smb_engine::*;
use tokio::sync::Notify;

mod common;
use common::{StubServer, make_stub_connection};

/// Records what the engine asks of the filesystem. Flushes wait on `gate`.
#[derive(Default)]
struct GatedCallbacks {
    gated: bool,
    gate: Notify,
    flushed: Mutex<Vec<NodeId>>,
    attributes: Mutex<Vec<NodeId>>,
    enumerations: Mutex<Vec<NodeId>>,
}

impl GatedCallbacks {
    fn gated() -> GatedCallbacks {
        GatedCallbacks {
            gated: true,
            ..Default::default()
        }
    }
}

impl FsCallbacks for GatedCallbacks {
    fn invalidate_attributes(&self, node: NodeId) {
        self.attributes.lock().unwrap().push(node);
    }

    fn invalidate_enumeration(&self, node: NodeId) {
        self.enumerations.lock().unwrap().push(node);
    }

    fn flush_dirty(&self, node: NodeId) -> BoxFuture<'_, smb_engine::Result<()>> {
        Box::pin(async move {
            self.flushed.lock().unwrap().push(node);
            if self.gated {
                self.gate.notified().await;
            }
            Ok(())
        })
    }
}

fn acks(state: &common::ServerState) -> Vec<LeaseBreakAck> {
    state
        .requests(Command::OplockBreak)
        .into_iter()
        .filter_map(|l| l.request.content.as_lease_break_ack().ok().cloned())
        .collect()
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A deferred close is carried out when the handle lease goes, and the CLOSE
/// reaches the server before the acknowledgment.
#[test_log::test(tokio::test)]
async fn test_break_closes_deferred_handle() -> Result<(), Box<dyn std::error::Error>> {
    let server = StubServer::new();
    server.put_file("deferred.bin", vec![1; 32]);
    let (engine, share) =
        make_stub_connection(&server, ConnectionConfig::default(), Arc::new(NoCallbacks)).await?;

    let file = share
        .create("deferred.bin", CreateArgs::open_file(NodeId(1)))
        .await?;
    let lease_key = file.lease_key();
    file.close().await?;
    assert!(server.lock().requests(Command::Close).is_empty());
    assert_eq!(engine.registry().len(), 1);

    server
        .push_lease_break(lease_key, LeaseState::rwh(), LeaseState::NONE)
        .await;
    server
        .wait_until("lease break ack", |s| !acks(s).is_empty())
        .await;

    {
        let state = server.lock();
        let position = |command: Command| {
            state
                .log
                .iter()
                .position(|l| l.request.header.command == command)
                .unwrap()
        };
        assert!(position(Command::Close) < position(Command::OplockBreak));
        let ack = &acks(&state)[0];
        assert_eq!(ack.lease_key, lease_key);
        assert!(ack.lease_state.is_none());
        assert!(state.opens.is_empty());
    }

    let registry = engine.registry().clone();
    wait_for("registry to drain", || registry.is_empty()).await;
    engine.close().await?;
    Ok(())
}

/// While one break waits on a slow flush, other opens go ahead.
#[test_log::test(tokio::test)]
async fn test_slow_flush_does_not_block_opens() -> Result<(), Box<dyn std::error::Error>> {
    let server = StubServer::new();
    server.put_file("slow.bin", vec![2; 32]);
    server.put_file("other.bin", vec![3; 32]);
    let callbacks = Arc::new(GatedCallbacks::gated());
    let (engine, share) =
        make_stub_connection(&server, ConnectionConfig::default(), callbacks.clone()).await?;

    let slow = share
        .create("slow.bin", CreateArgs::open_file(NodeId(1)))
        .await?;
    server
        .push_lease_break(slow.lease_key(), LeaseState::rwh(), LeaseState::new().with_read_caching(true))
        .await;
    wait_for("flush to start", || !callbacks.flushed.lock().unwrap().is_empty()).await;

    let other = share
        .create("other.bin", CreateArgs::open_file(NodeId(2)))
        .await?;
    assert_eq!(engine.registry().len(), 2);
    assert!(acks(&server.lock()).is_empty());

    callbacks.gate.notify_one();
    server
        .wait_until("lease break ack", |s| !acks(s).is_empty())
        .await;
    let ack = acks(&server.lock()).remove(0);
    assert_eq!(ack.lease_key, slow.lease_key());
    assert_eq!(ack.lease_state, LeaseState::new().with_read_caching(true));

    wait_for("attribute invalidation", || {
        !callbacks.attributes.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(*callbacks.flushed.lock().unwrap(), vec![NodeId(1)]);
    assert_eq!(slow.lease_state().await, LeaseState::new().with_read_caching(true));
    assert_eq!(slow.handle_state().await, HandleState::Granted);
    // Still leased at R, so the entry stays.
    assert!(engine.registry().lookup(&slow.lease_key()).is_some());

    slow.close_now().await?;
    other.close_now().await?;
    engine.close().await?;
    Ok(())
}

/// A directory lease break invalidates the enumeration and flushes nothing.
#[test_log::test(tokio::test)]
async fn test_directory_break_invalidates_enumeration() -> Result<(), Box<dyn std::error::Error>> {
    let server = StubServer::new();
    server.put_file("dir", vec![]);
    let callbacks = Arc::new(GatedCallbacks::default());
    let (engine, share) =
        make_stub_connection(&server, ConnectionConfig::default(), callbacks.clone()).await?;

    let dir = share
        .create("dir", CreateArgs::open_directory(NodeId(7)))
        .await?;
    let lease_key = dir.lease_key();
    assert!(!dir.lease_state().await.is_none());

    server
        .push_lease_break(lease_key, dir.lease_state().await, LeaseState::NONE)
        .await;
    wait_for("enumeration invalidation", || {
        !callbacks.enumerations.lock().unwrap().is_empty()
    })
    .await;

    assert_eq!(*callbacks.enumerations.lock().unwrap(), vec![NodeId(7)]);
    assert!(callbacks.flushed.lock().unwrap().is_empty());
    assert_eq!(dir.handle_state().await, HandleState::Broken);
    assert!(engine.registry().lookup(&lease_key).is_none());
    assert_eq!(acks(&server.lock()).len(), 1);

    dir.close_now().await?;
    engine.close().await?;
    Ok(())
}

/// A break written ahead of the CREATE response is applied to the new open,
/// not treated as a break for an unknown lease.
#[test_log::test(tokio::test)]
async fn test_break_racing_create_response() -> Result<(), Box<dyn std::error::Error>> {
    let server = StubServer::new();
    server.put_file("racy.bin", vec![4; 32]);
    let callbacks = Arc::new(GatedCallbacks::default());
    let (engine, share) =
        make_stub_connection(&server, ConnectionConfig::default(), callbacks.clone()).await?;

    let read_only = LeaseState::new().with_read_caching(true);
    server.lock().break_on_create = Some(read_only);
    let file = share
        .create("racy.bin", CreateArgs::open_file(NodeId(3)))
        .await?;
    server
        .wait_until("lease break ack", |s| !acks(s).is_empty())
        .await;

    let ack = acks(&server.lock()).remove(0);
    assert_eq!(ack.lease_key, file.lease_key());
    assert_eq!(ack.lease_state, read_only);
    wait_for("attribute invalidation", || {
        !callbacks.attributes.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(*callbacks.flushed.lock().unwrap(), vec![NodeId(3)]);
    assert_eq!(file.lease_state().await, read_only);
    assert_eq!(file.handle_state().await, HandleState::Granted);
    let entry = engine.registry().lookup(&file.lease_key()).unwrap();
    assert_eq!(entry.file_id, file.file_id()?);
    assert_eq!(entry.node, NodeId(3));

    file.close_now().await?;
    engine.close().await?;
    Ok(())
}

/// A failed CREATE leaves no reservation behind.
#[test_log::test(tokio::test)]
async fn test_failed_create_releases_lease_key() -> Result<(), Box<dyn std::error::Error>> {
    let server = StubServer::new();
    let (engine, share) =
        make_stub_connection(&server, ConnectionConfig::default(), Arc::new(NoCallbacks)).await?;

    let missing = share
        .create("missing.bin", CreateArgs::open_file(NodeId(4)))
        .await;
    assert!(missing.is_err());
    assert!(engine.registry().is_empty());

    engine.close().await?;
    Ok(())
}

/// Breaks for leases nobody holds are still acknowledged when asked to be.
#[test_log::test(tokio::test)]
async fn test_unknown_lease_break_is_acknowledged() -> Result<(), Box<dyn std::error::Error>> {
    let server = StubServer::new();
    let (engine, _share) =
        make_stub_connection(&server, ConnectionConfig::default(), Arc::new(NoCallbacks)).await?;

    let stranger = Guid::generate();
    server
        .push_lease_break(stranger, LeaseState::rwh(), LeaseState::NONE)
        .await;
    server
        .wait_until("lease break ack", |s| !acks(s).is_empty())
        .await;
    assert_eq!(acks(&server.lock())[0].lease_key, stranger);

    engine.close().await?;
    Ok(())
}
