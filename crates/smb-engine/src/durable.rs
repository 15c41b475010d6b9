//! Durable handle and lease state per open.
//!
//! ```text
//! NONE -> REQUESTED -> GRANTED -> BROKEN | RECONNECT_PENDING -> GRANTED | FAILED
//! ```
//!
//! A [`DurableRecord`] is only touched through its [`DurableHandle`]'s async mutex,
//! which one of the create, lease-break or reconnect paths holds at a time, possibly
//! across network I/O.

use modular_bitfield::prelude::*;
use smb_dtyp::Guid;
use smb_msg::{
    CreateContextRequest, CreateContextResponse, CreateResponse, DurableHandleV2Flags, FileId,
    LeaseBreakNotify, LeaseContext, LeaseFlags, LeaseState, LeaseV2,
};
use tokio::sync::{Mutex, MutexGuard};

use crate::lease::NodeId;
use crate::{Error, Result};

/// How far `server_epoch` is ahead of `local_epoch`, modulo 2^16.
///
/// Positive means the server's state is newer; zero or negative means stale.
pub fn get_epoch_delta(server_epoch: u16, local_epoch: u16) -> i16 {
    server_epoch.wrapping_sub(local_epoch) as i16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    None,
    Requested,
    Granted,
    Broken,
    ReconnectPending,
    Failed,
}

#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DurableFlags {
    pub request: bool,
    pub granted: bool,
    pub persistent: bool,
    pub v2: bool,
    pub broken: bool,
    pub deferred_close: bool,
    #[skip]
    __: B2,
}

/// What to ask for when opening.
#[derive(Debug, Clone, Default)]
pub struct DurableOptions {
    /// Lease state to request; `None` asks for no lease.
    pub lease: Option<LeaseState>,
    pub lease_v2: bool,
    pub durable: bool,
    pub durable_v2: bool,
    pub persistent: bool,
    pub directory: bool,
    pub parent_lease_key: Option<Guid>,
    /// Durable v2 timeout in milliseconds; zero lets the server choose.
    pub timeout: u32,
}

#[derive(Debug, Clone)]
pub struct DurableRecord {
    pub state: HandleState,
    pub lease_requested: bool,
    pub lease_v2: bool,
    pub requested: LeaseState,
    pub granted: LeaseState,
    pub epoch: u16,
    pub flags: DurableFlags,
    pub create_guid: Guid,
    pub parent_lease_key: Option<Guid>,
    pub file_id: FileId,
    pub timeout: u32,
    pub directory: bool,
}

/// What a create (or reconnect) response did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A lease or durability was granted.
    Granted,
    /// Nothing was asked for or nothing was granted.
    Plain,
    /// The server answered with a different version or more than was asked; the
    /// record is failed and the open continues as a plain handle.
    Inconsistent,
}

/// Steps the lease-break path must take, in order: flush, close, then acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakAction {
    pub new_state: LeaseState,
    pub flush: bool,
    pub close_deferred: bool,
    pub ack: bool,
    pub remove_entry: bool,
    pub invalidate_enumeration: bool,
}

fn intersect(a: LeaseState, b: LeaseState) -> LeaseState {
    let bits = u32::from_le_bytes(a.into_bytes()) & u32::from_le_bytes(b.into_bytes());
    LeaseState::from_bytes(bits.to_le_bytes())
}

impl DurableRecord {
    pub fn new(options: &DurableOptions) -> DurableRecord {
        let lease_requested = options.lease.is_some_and(|l| !l.is_none());
        // Directory leases only exist in the V2 format.
        let lease_v2 = lease_requested && (options.lease_v2 || options.directory);
        let flags = DurableFlags::new()
            .with_request(options.durable)
            .with_v2(options.durable && options.durable_v2)
            .with_persistent(options.durable && options.durable_v2 && options.persistent);
        DurableRecord {
            state: if lease_requested || options.durable {
                HandleState::Requested
            } else {
                HandleState::None
            },
            lease_requested,
            lease_v2,
            requested: options.lease.unwrap_or(LeaseState::NONE),
            granted: LeaseState::NONE,
            epoch: 0,
            flags,
            create_guid: if flags.v2() { Guid::generate() } else { Guid::ZERO },
            parent_lease_key: options.parent_lease_key.filter(|_| lease_v2),
            file_id: FileId::EMPTY,
            timeout: options.timeout,
            directory: options.directory,
        }
    }

    fn lease_context(&self, state: LeaseState) -> LeaseContext {
        LeaseContext {
            lease_key: Guid::ZERO,
            lease_state: state,
            lease_flags: LeaseFlags::new().with_parent_lease_key_set(self.parent_lease_key.is_some()),
            lease_duration: 0,
            v2: self.lease_v2.then(|| LeaseV2 {
                parent_lease_key: self.parent_lease_key.unwrap_or(Guid::ZERO),
                epoch: self.epoch,
            }),
        }
    }

    /// Contexts for the initial CREATE, in assembly order.
    pub fn create_contexts(&self, lease_key: Guid) -> Vec<CreateContextRequest> {
        let mut contexts = Vec::new();
        if self.flags.request() {
            contexts.push(if self.flags.v2() {
                CreateContextRequest::DurableHandleRequestV2 {
                    timeout: self.timeout,
                    flags: DurableHandleV2Flags::new().with_persistent(self.flags.persistent()),
                    create_guid: self.create_guid,
                }
            } else {
                CreateContextRequest::DurableHandleRequest
            });
        }
        if self.lease_requested {
            contexts.push(CreateContextRequest::RequestLease(LeaseContext {
                lease_key,
                ..self.lease_context(self.requested)
            }));
        }
        contexts
    }

    /// Contexts for a reconnect CREATE: the same durable version and lease format
    /// the handle was granted with.
    pub fn reconnect_contexts(&self, lease_key: Guid) -> Vec<CreateContextRequest> {
        let mut contexts = vec![if self.flags.v2() {
            CreateContextRequest::DurableHandleReconnectV2 {
                file_id: self.file_id,
                create_guid: self.create_guid,
                flags: DurableHandleV2Flags::new().with_persistent(self.flags.persistent()),
            }
        } else {
            CreateContextRequest::DurableHandleReconnect {
                file_id: self.file_id,
            }
        }];
        if self.lease_requested && !self.granted.is_none() {
            contexts.push(CreateContextRequest::RequestLease(LeaseContext {
                lease_key,
                ..self.lease_context(self.granted)
            }));
        }
        contexts
    }

    pub fn on_create_response(
        &mut self,
        lease_key: Guid,
        response: &CreateResponse,
    ) -> Result<CreateOutcome> {
        self.file_id = response.file_id;
        let first_grant = self.state == HandleState::Requested;

        if self.flags.request() {
            let durable = response.create_contexts.iter().find_map(|c| match c {
                CreateContextResponse::DurableHandleV2 { timeout, flags } => {
                    Some((true, *timeout, flags.persistent()))
                }
                CreateContextResponse::DurableHandle => Some((false, 0, false)),
                _ => None,
            });
            match durable {
                Some((v2, _, _)) if v2 != self.flags.v2() => {
                    return Ok(self.mark_inconsistent(format!(
                        "durable handle {} requested, server granted {}",
                        if self.flags.v2() { "v2" } else { "v1" },
                        if v2 { "v2" } else { "v1" },
                    )));
                }
                Some((_, timeout, persistent)) => {
                    self.flags.set_granted(true);
                    if self.flags.v2() {
                        self.timeout = timeout;
                        self.flags.set_persistent(persistent);
                    }
                }
                None => self.flags.set_granted(false),
            }
        }

        if self.lease_requested {
            match response.lease() {
                Some(lease) => {
                    if let Some(outcome) = self.apply_lease(lease_key, lease, first_grant)? {
                        return Ok(outcome);
                    }
                }
                None => self.granted = LeaseState::NONE,
            }
        }

        self.state = if self.flags.granted() || !self.granted.is_none() {
            HandleState::Granted
        } else {
            HandleState::None
        };
        Ok(match self.state {
            HandleState::Granted => CreateOutcome::Granted,
            _ => CreateOutcome::Plain,
        })
    }

    /// Applies a lease context from a create or reconnect response. Returns an
    /// outcome when the response is inconsistent.
    fn apply_lease(
        &mut self,
        lease_key: Guid,
        lease: &LeaseContext,
        first_grant: bool,
    ) -> Result<Option<CreateOutcome>> {
        if lease.lease_key != lease_key {
            return Err(Error::LeaseKeyMismatch {
                expected: lease_key,
                actual: lease.lease_key,
            });
        }
        if lease.v2.is_some() != self.lease_v2 {
            return Ok(Some(self.mark_inconsistent(format!(
                "lease {} requested, server granted {}",
                if self.lease_v2 { "v2" } else { "v1" },
                if lease.v2.is_some() { "v2" } else { "v1" },
            ))));
        }
        if !lease.lease_state.is_subset_of(&self.requested) {
            return Ok(Some(self.mark_inconsistent(format!(
                "server granted lease {} beyond the requested {}",
                lease.lease_state, self.requested
            ))));
        }
        match &lease.v2 {
            Some(v2) if !first_grant && get_epoch_delta(v2.epoch, self.epoch) <= 0 => {
                log::debug!(
                    "Ignoring stale lease state {} (epoch {} <= {})",
                    lease.lease_state,
                    v2.epoch,
                    self.epoch
                );
            }
            Some(v2) => {
                self.epoch = v2.epoch;
                self.granted = lease.lease_state;
            }
            None => self.granted = lease.lease_state,
        }
        Ok(None)
    }

    fn mark_inconsistent(&mut self, reason: String) -> CreateOutcome {
        log::warn!("Durable/lease inconsistency, continuing without durability: {reason}");
        self.state = HandleState::Failed;
        self.flags.set_granted(false);
        self.granted = LeaseState::NONE;
        CreateOutcome::Inconsistent
    }

    pub fn on_lease_break(
        &mut self,
        lease_key: Guid,
        notify: &LeaseBreakNotify,
    ) -> Result<BreakAction> {
        if notify.lease_key != lease_key {
            return Err(Error::LeaseKeyMismatch {
                expected: lease_key,
                actual: notify.lease_key,
            });
        }
        if self.lease_v2 && get_epoch_delta(notify.new_epoch, self.epoch) > 0 {
            self.epoch = notify.new_epoch;
        }
        let old = self.granted;
        let new = intersect(notify.new_lease_state, old);
        let lost_read = old.read_caching() && !new.read_caching();
        let lost_write = old.write_caching() && !new.write_caching();
        let lost_handle = old.handle_caching() && !new.handle_caching();
        let close_deferred = lost_handle && self.flags.deferred_close();

        self.granted = new;
        self.flags.set_broken(new.is_none());
        if close_deferred {
            self.flags.set_deferred_close(false);
        }
        self.state = if new.is_none() {
            HandleState::Broken
        } else {
            HandleState::Granted
        };
        log::debug!("Lease {lease_key} broken from {old} to {new}");
        Ok(BreakAction {
            new_state: new,
            flush: !self.directory && (lost_read || lost_write),
            close_deferred,
            ack: notify.flags.ack_required(),
            remove_entry: new.is_none(),
            invalidate_enumeration: self.directory,
        })
    }

    /// Moves a durable handle to RECONNECT_PENDING. Returns false, and fails the
    /// record, when there is nothing the server promised to keep.
    pub fn begin_reconnect(&mut self) -> bool {
        if self.flags.granted() && matches!(self.state, HandleState::Granted | HandleState::Broken) {
            self.state = HandleState::ReconnectPending;
            true
        } else {
            self.state = HandleState::Failed;
            false
        }
    }

    pub fn on_reconnect_response(
        &mut self,
        lease_key: Guid,
        response: &CreateResponse,
    ) -> Result<CreateOutcome> {
        if self.state != HandleState::ReconnectPending {
            return Err(Error::InvalidState(format!(
                "reconnect response in state {:?}",
                self.state
            )));
        }
        self.file_id = response.file_id;
        if self.lease_requested {
            if let Some(lease) = response.lease() {
                if let Some(outcome) = self.apply_lease(lease_key, lease, false)? {
                    return Ok(outcome);
                }
            }
        }
        self.state = HandleState::Granted;
        Ok(CreateOutcome::Granted)
    }

    pub fn reconnect_failed(&mut self) {
        self.state = HandleState::Failed;
        self.flags.set_granted(false);
        self.granted = LeaseState::NONE;
    }

    pub fn holds_handle_lease(&self) -> bool {
        self.granted.handle_caching()
    }
}

/// The record of one open plus its lease key and filesystem node.
#[derive(Debug)]
pub struct DurableHandle {
    lease_key: Guid,
    node: NodeId,
    record: Mutex<DurableRecord>,
}

impl DurableHandle {
    pub fn new(node: NodeId, record: DurableRecord) -> DurableHandle {
        DurableHandle {
            lease_key: Guid::generate(),
            node,
            record: Mutex::new(record),
        }
    }

    pub fn lease_key(&self) -> Guid {
        self.lease_key
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub async fn lock(&self) -> MutexGuard<'_, DurableRecord> {
        self.record.lock().await
    }
}
