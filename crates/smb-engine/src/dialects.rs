//! Per-dialect behavior.
//!
//! Everything that differs between dialects is answered here, so callers ask
//! `dialect.supports_…()` instead of comparing revision numbers.

use smb_msg::{Dialect, GlobalCapabilities};

use crate::{Error, Result};

/// A protocol dialect as the engine reasons about it.
///
/// `Smb1` exists so a server that only answers in SMB1 can be named in errors;
/// it is never negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DialectImpl {
    Smb1,
    Smb202,
    Smb21,
    Smb30,
    Smb302,
    Smb311,
}

impl DialectImpl {
    pub const SUPPORTED: [DialectImpl; 5] = [
        DialectImpl::Smb202,
        DialectImpl::Smb21,
        DialectImpl::Smb30,
        DialectImpl::Smb302,
        DialectImpl::Smb311,
    ];

    pub fn from_revision(revision: u16) -> Result<DialectImpl> {
        let dialect = Dialect::try_from(revision).map_err(|_| {
            Error::NegotiationError(format!("server selected unknown dialect {revision:#06x}"))
        })?;
        Ok(dialect.into())
    }

    /// The wire revision, or an error for SMB1.
    pub fn revision(&self) -> Result<Dialect> {
        Ok(match self {
            DialectImpl::Smb1 => {
                return Err(Error::NegotiationError("SMB1 is not supported".into()));
            }
            DialectImpl::Smb202 => Dialect::Smb0202,
            DialectImpl::Smb21 => Dialect::Smb021,
            DialectImpl::Smb30 => Dialect::Smb030,
            DialectImpl::Smb302 => Dialect::Smb0302,
            DialectImpl::Smb311 => Dialect::Smb0311,
        })
    }

    pub fn is_supported(&self) -> bool {
        *self != DialectImpl::Smb1
    }

    pub fn is_smb3(&self) -> bool {
        *self >= DialectImpl::Smb30
    }

    pub fn supports_large_mtu(&self) -> bool {
        *self >= DialectImpl::Smb21
    }

    pub fn supports_leasing(&self) -> bool {
        *self >= DialectImpl::Smb21
    }

    /// V2 lease contexts carry an epoch and a parent key.
    pub fn supports_lease_v2(&self) -> bool {
        self.is_smb3()
    }

    pub fn supports_directory_leasing(&self) -> bool {
        self.is_smb3()
    }

    pub fn supports_durable_v2(&self) -> bool {
        self.is_smb3()
    }

    pub fn supports_persistent_handles(&self) -> bool {
        self.is_smb3()
    }

    pub fn supports_multichannel(&self) -> bool {
        self.is_smb3()
    }

    pub fn supports_encryption(&self) -> bool {
        self.is_smb3()
    }

    pub fn supports_replay(&self) -> bool {
        self.is_smb3()
    }

    /// FSCTL_VALIDATE_NEGOTIATE_INFO; superseded by preauth integrity in 3.1.1.
    pub fn supports_validate_negotiate(&self) -> bool {
        matches!(self, DialectImpl::Smb30 | DialectImpl::Smb302)
    }

    pub fn requires_negotiate_contexts(&self) -> bool {
        *self == DialectImpl::Smb311
    }

    pub fn uses_preauth_integrity(&self) -> bool {
        *self == DialectImpl::Smb311
    }

    /// Capabilities worth advertising when this is the newest dialect offered.
    pub fn client_capabilities(&self, encryption: bool, multichannel: bool) -> GlobalCapabilities {
        if !self.is_smb3() {
            return GlobalCapabilities::new();
        }
        GlobalCapabilities::new()
            .with_dfs(true)
            .with_leasing(true)
            .with_large_mtu(true)
            .with_multi_channel(multichannel)
            .with_persistent_handles(true)
            .with_directory_leasing(true)
            .with_encryption(encryption && *self != DialectImpl::Smb311)
    }
}

impl From<Dialect> for DialectImpl {
    fn from(value: Dialect) -> Self {
        match value {
            Dialect::Smb0202 => DialectImpl::Smb202,
            Dialect::Smb021 => DialectImpl::Smb21,
            Dialect::Smb030 => DialectImpl::Smb30,
            Dialect::Smb0302 => DialectImpl::Smb302,
            Dialect::Smb0311 => DialectImpl::Smb311,
        }
    }
}

impl std::fmt::Display for DialectImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.revision() {
            Ok(d) => write!(f, "{d}"),
            Err(_) => write!(f, "SMB 1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_matrix() {
        assert!(!DialectImpl::Smb202.supports_leasing());
        assert!(DialectImpl::Smb21.supports_leasing());
        assert!(!DialectImpl::Smb21.supports_lease_v2());
        assert!(DialectImpl::Smb30.supports_validate_negotiate());
        assert!(DialectImpl::Smb302.supports_validate_negotiate());
        assert!(!DialectImpl::Smb311.supports_validate_negotiate());
        assert!(DialectImpl::Smb311.requires_negotiate_contexts());
        assert!(!DialectImpl::Smb1.is_supported());
        assert!(DialectImpl::Smb1.revision().is_err());
    }

    #[test]
    fn test_from_revision() {
        assert_eq!(
            DialectImpl::from_revision(0x0302).unwrap(),
            DialectImpl::Smb302
        );
        assert!(matches!(
            DialectImpl::from_revision(0x02ff),
            Err(Error::NegotiationError(_))
        ));
    }

    #[test]
    fn test_capabilities_only_for_smb3() {
        assert_eq!(
            DialectImpl::Smb21.client_capabilities(true, true),
            GlobalCapabilities::new()
        );
        let caps = DialectImpl::Smb311.client_capabilities(true, false);
        assert!(caps.leasing() && caps.large_mtu() && !caps.multi_channel());
        // 3.1.1 negotiates ciphers through contexts instead.
        assert!(!caps.encryption());
    }
}
