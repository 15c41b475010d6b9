//! Engine configuration.

use std::time::Duration;

use modular_bitfield::prelude::*;
use smb_msg::Dialect;

use crate::dialects::DialectImpl;
use crate::{Error, Result};

/// Set of dialects the client is willing to offer.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectMask {
    /// Never offered; a mask holding only this bit is rejected.
    pub smb1: bool,
    pub smb202: bool,
    pub smb21: bool,
    pub smb30: bool,
    pub smb302: bool,
    pub smb311: bool,
    #[skip]
    __: B2,
}

impl DialectMask {
    /// Every SMB2/3 dialect.
    pub fn all() -> DialectMask {
        DialectMask::new()
            .with_smb202(true)
            .with_smb21(true)
            .with_smb30(true)
            .with_smb302(true)
            .with_smb311(true)
    }

    pub fn only(dialect: DialectImpl) -> DialectMask {
        DialectMask::new().with(dialect)
    }

    pub fn with(self, dialect: DialectImpl) -> DialectMask {
        match dialect {
            DialectImpl::Smb1 => self.with_smb1(true),
            DialectImpl::Smb202 => self.with_smb202(true),
            DialectImpl::Smb21 => self.with_smb21(true),
            DialectImpl::Smb30 => self.with_smb30(true),
            DialectImpl::Smb302 => self.with_smb302(true),
            DialectImpl::Smb311 => self.with_smb311(true),
        }
    }

    pub fn contains(&self, dialect: DialectImpl) -> bool {
        match dialect {
            DialectImpl::Smb1 => self.smb1(),
            DialectImpl::Smb202 => self.smb202(),
            DialectImpl::Smb21 => self.smb21(),
            DialectImpl::Smb30 => self.smb30(),
            DialectImpl::Smb302 => self.smb302(),
            DialectImpl::Smb311 => self.smb311(),
        }
    }

    /// Wire dialects to offer, oldest first.
    pub fn offered(&self) -> Vec<Dialect> {
        DialectImpl::SUPPORTED
            .iter()
            .filter(|d| self.contains(**d))
            .filter_map(|d| d.revision().ok())
            .collect()
    }
}

impl Default for DialectMask {
    fn default() -> Self {
        DialectMask::all()
    }
}

/// Bounds and candidates for the adaptive transfer size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantumConfig {
    pub min_size: u32,
    pub max_size: u32,
    /// Sizes measured on every recheck, smallest first.
    pub candidate_sizes: [u32; 3],
    /// Upper bound on bytes outstanding at once for one bulk transfer.
    pub max_in_flight_bytes: u64,
    pub max_count: u32,
    pub recheck_interval: Duration,
    /// Transfers at least this long count as "large" and feed the throughput samples.
    pub large_transfer_threshold: u64,
}

impl Default for QuantumConfig {
    fn default() -> Self {
        QuantumConfig {
            min_size: 64 * 1024,
            max_size: 8 * 1024 * 1024,
            candidate_sizes: [64 * 1024, 1024 * 1024, 8 * 1024 * 1024],
            max_in_flight_bytes: 16 * 1024 * 1024,
            max_count: 16,
            recheck_interval: Duration::from_secs(60),
            large_transfer_threshold: 4 * 1024 * 1024,
        }
    }
}

/// No server grants this many credits; a reserve at or above it would starve
/// every request.
pub const MAX_PLAUSIBLE_CREDITS: u16 = 8192;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub dialects: DialectMask,
    pub quantum: QuantumConfig,
    /// Credits held back from bulk transfers for control traffic.
    pub credit_reserve: u16,
    /// Credits requested beyond each charge until the pool reaches this size.
    pub credits_backlog: u16,
    pub preauth_integrity: bool,
    pub encryption: bool,
    /// Run FSCTL_VALIDATE_NEGOTIATE_INFO after tree connect on 3.0 and 3.0.2.
    pub validate_negotiate: bool,
    pub multichannel: bool,
    pub leasing: bool,
    pub durable_handles: bool,
    pub persistent_handles: bool,
    /// Hold closes of handles with a handle lease until the lease is broken.
    pub defer_close: bool,
    /// How long a request may wait for its response before the channel is
    /// considered dead. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Sent as the 3.1.1 netname context; defaults to the server name.
    pub client_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            dialects: DialectMask::default(),
            quantum: QuantumConfig::default(),
            credit_reserve: 8,
            credits_backlog: 128,
            preauth_integrity: true,
            encryption: false,
            validate_negotiate: true,
            multichannel: false,
            leasing: true,
            durable_handles: true,
            persistent_handles: false,
            defer_close: true,
            timeout: Some(Duration::from_secs(30)),
            client_name: None,
        }
    }
}

impl ConnectionConfig {
    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dialects.offered().is_empty() {
            return Err(Error::InvalidConfiguration(
                "no supported dialect is enabled".into(),
            ));
        }
        if self.dialects.smb311() && !self.preauth_integrity {
            return Err(Error::InvalidConfiguration(
                "SMB 3.1.1 requires preauth integrity".into(),
            ));
        }
        let smb3 = self.dialects.smb30() || self.dialects.smb302() || self.dialects.smb311();
        if self.encryption && !smb3 {
            return Err(Error::InvalidConfiguration(
                "encryption requires an SMB 3.x dialect".into(),
            ));
        }
        if self.persistent_handles && !self.durable_handles {
            return Err(Error::InvalidConfiguration(
                "persistent handles require durable handles".into(),
            ));
        }
        if self.credit_reserve >= MAX_PLAUSIBLE_CREDITS {
            return Err(Error::InvalidConfiguration(format!(
                "credit reserve {} exceeds any plausible grant",
                self.credit_reserve
            )));
        }
        if self.credits_backlog == 0 {
            return Err(Error::InvalidConfiguration(
                "credit backlog must be positive".into(),
            ));
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(Error::InvalidConfiguration("zero request timeout".into()));
        }
        self.quantum.validate()
    }
}

impl QuantumConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size > self.max_size {
            return Err(Error::InvalidConfiguration(format!(
                "quantum bounds {}..={} are invalid",
                self.min_size, self.max_size
            )));
        }
        if let Some(bad) = self
            .candidate_sizes
            .iter()
            .find(|s| **s < self.min_size || **s > self.max_size)
        {
            return Err(Error::InvalidConfiguration(format!(
                "candidate quantum size {bad} is outside {}..={}",
                self.min_size, self.max_size
            )));
        }
        if self.max_count == 0 || self.max_in_flight_bytes == 0 {
            return Err(Error::InvalidConfiguration(
                "quantum count and in-flight bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ConnectionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_offered_order() {
        assert_eq!(DialectMask::all().offered(), Dialect::ALL.to_vec());
        assert_eq!(
            DialectMask::only(DialectImpl::Smb302).offered(),
            vec![Dialect::Smb0302]
        );
    }

    #[test]
    fn test_invalid_combinations() {
        let cases = [
            ConnectionConfig {
                dialects: DialectMask::only(DialectImpl::Smb1),
                ..Default::default()
            },
            ConnectionConfig {
                preauth_integrity: false,
                ..Default::default()
            },
            ConnectionConfig {
                dialects: DialectMask::only(DialectImpl::Smb21),
                encryption: true,
                ..Default::default()
            },
            ConnectionConfig {
                durable_handles: false,
                persistent_handles: true,
                ..Default::default()
            },
            ConnectionConfig {
                credit_reserve: MAX_PLAUSIBLE_CREDITS,
                ..Default::default()
            },
            ConnectionConfig {
                quantum: QuantumConfig {
                    candidate_sizes: [0, 1024 * 1024, 8 * 1024 * 1024],
                    ..Default::default()
                },
                ..Default::default()
            },
            ConnectionConfig {
                quantum: QuantumConfig {
                    min_size: 1024 * 1024,
                    max_size: 64 * 1024,
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfiguration(_))),
                "{config:?}"
            );
        }
    }

    #[test]
    fn test_preauth_only_required_for_311() {
        let config = ConnectionConfig {
            dialects: DialectMask::only(DialectImpl::Smb302),
            preauth_integrity: false,
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
