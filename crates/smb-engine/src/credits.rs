//! Credit window and message id allocation for one connection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::{Semaphore, TryAcquireError};

use crate::{Error, Result};

/// Payload bytes covered by one credit once large MTU is negotiated.
pub const CREDIT_UNIT: u32 = 65536;

/// Credits needed to move `payload` bytes with large MTU.
pub fn charge_for(payload: u32) -> u16 {
    if payload == 0 {
        return 1;
    }
    (1 + (payload - 1) / CREDIT_UNIT) as u16
}

/// What an acquisition hands back to be written into the request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub message_id: u64,
    /// Credits taken from the window.
    pub charge: u16,
    /// CreditCharge header value; zero until large MTU is in effect.
    pub header_charge: u16,
    pub credit_request: u16,
}

/// The credits a connection may spend, and the message id sequence they pay for.
///
/// Permits are taken with `forget()` and only come back with the server's grants,
/// so the semaphore always holds the credits currently spendable.
#[derive(Debug)]
pub struct CreditWindow {
    available: Semaphore,
    /// Credits granted and not yet returned, including the ones in flight.
    pool: AtomicU32,
    next_message_id: AtomicU64,
    large_mtu: AtomicBool,
    backlog: u16,
}

impl CreditWindow {
    /// A fresh connection holds one credit and starts at message id 0.
    pub fn new(backlog: u16) -> CreditWindow {
        CreditWindow {
            available: Semaphore::new(1),
            pool: AtomicU32::new(1),
            next_message_id: AtomicU64::new(0),
            large_mtu: AtomicBool::new(false),
            backlog,
        }
    }

    pub fn set_large_mtu(&self, large_mtu: bool) {
        self.large_mtu.store(large_mtu, Ordering::SeqCst);
    }

    pub fn large_mtu(&self) -> bool {
        self.large_mtu.load(Ordering::SeqCst)
    }

    /// Credits a request moving `payload` bytes costs on this connection.
    pub fn charge(&self, payload: u32) -> u16 {
        if self.large_mtu() {
            charge_for(payload)
        } else {
            1
        }
    }

    /// Takes `charge` credits and the matching range of message ids.
    ///
    /// With `blocking` unset, a shortfall returns [`Error::OutOfCredits`] instead of
    /// waiting for grants.
    pub async fn acquire(&self, charge: u16, blocking: bool) -> Result<Grant> {
        let charge = charge.max(1);
        if blocking {
            self.available
                .acquire_many(charge as u32)
                .await
                .map_err(|_| Error::ConnectionClosed)?
                .forget();
        } else {
            match self.available.try_acquire_many(charge as u32) {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => {
                    return Err(Error::OutOfCredits {
                        needed: charge,
                        available: self.available.available_permits(),
                    });
                }
                Err(TryAcquireError::Closed) => return Err(Error::ConnectionClosed),
            }
        }

        let message_id = self
            .next_message_id
            .fetch_add(charge as u64, Ordering::SeqCst);
        let pool = self.pool.load(Ordering::SeqCst);
        let mut credit_request = charge;
        if pool < self.backlog as u32 {
            credit_request = credit_request.saturating_add((self.backlog as u32 - pool) as u16);
        }
        Ok(Grant {
            message_id,
            charge,
            header_charge: if self.large_mtu() { charge } else { 0 },
            credit_request,
        })
    }

    /// Accounts for a response that spent `charged` credits and granted `granted`.
    ///
    /// A server that grants nothing is treated as returning what was charged, so
    /// the window never drains to zero.
    pub fn on_response(&self, charged: u16, granted: u16) {
        let charged = charged as u32;
        let granted = granted as u32;
        if granted >= charged {
            self.pool.fetch_add(granted - charged, Ordering::SeqCst);
        } else if granted > 0 {
            let _ = self
                .pool
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                    Some(p.saturating_sub(charged - granted).max(1))
                });
        }
        let returned = if granted == 0 { charged } else { granted };
        if granted == 0 && charged > 0 {
            log::trace!("server granted zero credits, returning {charged} charged");
        }
        self.available.add_permits(returned as usize);
    }

    /// Credits granted by the server and not yet consumed by completed requests.
    pub fn credits_max(&self) -> u32 {
        self.pool.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.available.available_permits()
    }

    /// The id the next request will receive.
    pub fn peek_message_id(&self) -> u64 {
        self.next_message_id.load(Ordering::SeqCst)
    }

    /// Wakes every waiter with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        self.available.close();
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_for() {
        assert_eq!(charge_for(0), 1);
        assert_eq!(charge_for(1), 1);
        assert_eq!(charge_for(65536), 1);
        assert_eq!(charge_for(65537), 2);
        assert_eq!(charge_for(8 * 1024 * 1024), 128);
    }

    #[test]
    fn test_charge_without_large_mtu() {
        let window = CreditWindow::new(128);
        assert_eq!(window.charge(1024 * 1024), 1);
        window.set_large_mtu(true);
        assert_eq!(window.charge(1024 * 1024), 16);
    }

    #[tokio::test]
    async fn test_message_ids_advance_by_charge() {
        let window = CreditWindow::new(4);
        window.set_large_mtu(true);
        let first = window.acquire(1, true).await.unwrap();
        assert_eq!(first.message_id, 0);
        assert_eq!(first.credit_request, 1 + 3);
        window.on_response(1, 10);
        assert_eq!(window.credits_max(), 10);
        let second = window.acquire(3, true).await.unwrap();
        assert_eq!(second.message_id, 1);
        assert_eq!(second.header_charge, 3);
        let third = window.acquire(1, true).await.unwrap();
        assert_eq!(third.message_id, 4);
    }

    #[tokio::test]
    async fn test_non_blocking_shortfall() {
        let window = CreditWindow::new(128);
        window.acquire(1, false).await.unwrap();
        assert!(matches!(
            window.acquire(1, false).await,
            Err(Error::OutOfCredits {
                needed: 1,
                available: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_zero_grant_returns_charge() {
        let window = CreditWindow::new(128);
        window.acquire(1, true).await.unwrap();
        assert_eq!(window.available(), 0);
        window.on_response(1, 0);
        assert_eq!(window.available(), 1);
        assert_eq!(window.credits_max(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let window = std::sync::Arc::new(CreditWindow::new(128));
        window.acquire(1, true).await.unwrap();
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire(1, true).await })
        };
        tokio::task::yield_now().await;
        window.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }
}
