//! NEGOTIATE: building the offer, interpreting the answer, and checking a
//! reconnect's answer against the original negotiation.

use rand::RngCore;
use smb_dtyp::Guid;
use smb_msg::{
    CompressionAlgorithm, CompressionCapabilities, Dialect, EncryptionCapabilities,
    EncryptionCipher, GlobalCapabilities, HashAlgorithm, NegotiateContext, NegotiateRequest,
    NegotiateResponse, NegotiateSecurityMode, PreauthIntegrityCapabilities, SigningAlgorithm,
    SigningCapabilities, ValidateNegotiateInfoRequest, ValidateNegotiateInfoResponse,
};

use crate::config::ConnectionConfig;
use crate::dialects::DialectImpl;
use crate::{Error, Result};

/// Preauth integrity salt length, regenerated on every negotiate.
pub const PREAUTH_SALT_LEN: usize = 32;

const ENCRYPTING_CIPHERS: [EncryptionCipher; 4] = [
    EncryptionCipher::Aes128Ccm,
    EncryptionCipher::Aes128Gcm,
    EncryptionCipher::Aes256Ccm,
    EncryptionCipher::Aes256Gcm,
];

const SIGNING_ALGORITHMS: [SigningAlgorithm; 3] = [
    SigningAlgorithm::AesGmac,
    SigningAlgorithm::AesCmac,
    SigningAlgorithm::HmacSha256,
];

/// What a NEGOTIATE exchange settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedInfo {
    pub dialect: DialectImpl,
    pub wire_dialect: Dialect,
    pub security_mode: NegotiateSecurityMode,
    pub server_guid: Guid,
    pub capabilities: GlobalCapabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub cipher: Option<EncryptionCipher>,
    pub signing_algorithm: Option<SigningAlgorithm>,
    pub preauth_hash: Option<HashAlgorithm>,
    /// The server's initial security token.
    pub security_buffer: Vec<u8>,
}

impl NegotiatedInfo {
    pub fn signing_required(&self) -> bool {
        self.security_mode.signing_required()
    }

    pub fn large_mtu(&self) -> bool {
        self.dialect.supports_large_mtu() && self.capabilities.large_mtu()
    }

    pub fn leasing(&self) -> bool {
        self.dialect.supports_leasing() && self.capabilities.leasing()
    }

    pub fn directory_leasing(&self) -> bool {
        self.dialect.supports_directory_leasing() && self.capabilities.directory_leasing()
    }

    pub fn persistent_handles(&self) -> bool {
        self.dialect.supports_persistent_handles() && self.capabilities.persistent_handles()
    }

    pub fn multichannel(&self) -> bool {
        self.dialect.supports_multichannel() && self.capabilities.multi_channel()
    }

    pub fn encryption(&self) -> bool {
        match self.dialect {
            DialectImpl::Smb311 => self.cipher.is_some(),
            d => d.supports_encryption() && self.capabilities.encryption(),
        }
    }

    /// Largest single read or write payload.
    pub fn max_io(&self, write: bool) -> u32 {
        let max = if write {
            self.max_write_size
        } else {
            self.max_read_size
        };
        if self.large_mtu() { max } else { max.min(65536) }
    }
}

fn security_mode() -> NegotiateSecurityMode {
    NegotiateSecurityMode::new().with_signing_enabled(true)
}

fn offered_capabilities(config: &ConnectionConfig, dialects: &[Dialect]) -> GlobalCapabilities {
    let newest = dialects.iter().max().copied().map(DialectImpl::from);
    let mut capabilities = newest
        .map(|d| d.client_capabilities(config.encryption, config.multichannel))
        .unwrap_or_default();
    if dialects.iter().any(|d| *d >= Dialect::Smb021) {
        capabilities.set_large_mtu(true);
        capabilities.set_leasing(config.leasing);
    }
    capabilities
}

/// Builds the NEGOTIATE request offering `dialects`, oldest first.
///
/// `server` is the name as the caller spelled it; it goes out verbatim in the
/// netname context when 3.1.1 is offered.
pub fn build_request(
    config: &ConnectionConfig,
    client_guid: Guid,
    server: &str,
    dialects: &[Dialect],
) -> NegotiateRequest {
    let mut dialects = dialects.to_vec();
    dialects.sort();
    let capabilities = offered_capabilities(config, &dialects);
    let negotiate_context_list = dialects
        .contains(&Dialect::Smb0311)
        .then(|| negotiate_contexts(config, server));
    NegotiateRequest {
        security_mode: security_mode(),
        capabilities,
        client_guid,
        dialects,
        negotiate_context_list,
    }
}

fn negotiate_contexts(config: &ConnectionConfig, server: &str) -> Vec<NegotiateContext> {
    let mut salt = vec![0u8; PREAUTH_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut contexts = vec![NegotiateContext::PreauthIntegrity(
        PreauthIntegrityCapabilities {
            hash_algorithms: vec![HashAlgorithm::Sha512],
            salt,
        },
    )];
    contexts.push(NegotiateContext::Encryption(EncryptionCapabilities {
        ciphers: if config.encryption {
            ENCRYPTING_CIPHERS.to_vec()
        } else {
            vec![EncryptionCipher::None]
        },
    }));
    // Advertised so the server can tell we speak the format; nothing is compressed.
    contexts.push(NegotiateContext::Compression(CompressionCapabilities {
        chained: false,
        compression_algorithms: vec![CompressionAlgorithm::None],
    }));
    contexts.push(NegotiateContext::Netname(server.to_string()));
    contexts.push(NegotiateContext::Signing(SigningCapabilities {
        signing_algorithms: SIGNING_ALGORITHMS.to_vec(),
    }));
    contexts
}

/// Interprets a NEGOTIATE response to an offer of `offered`.
pub fn process_response(
    config: &ConnectionConfig,
    offered: &[Dialect],
    response: &NegotiateResponse,
) -> Result<NegotiatedInfo> {
    let wire_dialect = response.dialect()?;
    if !offered.contains(&wire_dialect) {
        return Err(Error::NegotiationError(format!(
            "server selected {wire_dialect}, which was not offered"
        )));
    }
    let dialect = DialectImpl::from(wire_dialect);
    log::debug!("Negotiated {dialect}");

    let mut info = NegotiatedInfo {
        dialect,
        wire_dialect,
        security_mode: response.security_mode,
        server_guid: response.server_guid,
        capabilities: response.capabilities,
        max_transact_size: response.max_transact_size,
        max_read_size: response.max_read_size,
        max_write_size: response.max_write_size,
        cipher: None,
        signing_algorithm: None,
        preauth_hash: None,
        security_buffer: response.buffer.clone(),
    };

    if dialect.requires_negotiate_contexts() {
        apply_contexts(config, &mut info, response.contexts())?;
    } else if response.negotiate_context_list.is_some() {
        return Err(Error::NegotiationError(format!(
            "negotiate contexts are not valid for {dialect}"
        )));
    }

    if config.encryption && !info.encryption() {
        return Err(Error::NegotiationError(
            "encryption is required but the server did not agree to it".to_string(),
        ));
    }
    Ok(info)
}

fn apply_contexts(
    config: &ConnectionConfig,
    info: &mut NegotiatedInfo,
    contexts: &[NegotiateContext],
) -> Result<()> {
    let mut preauth_seen = false;
    for context in contexts {
        match context {
            NegotiateContext::PreauthIntegrity(p) => {
                let [algorithm] = p.hash_algorithms.as_slice() else {
                    return Err(Error::NegotiationError(format!(
                        "expected exactly one preauth hash algorithm, got {}",
                        p.hash_algorithms.len()
                    )));
                };
                info.preauth_hash = Some(*algorithm);
                preauth_seen = true;
            }
            NegotiateContext::Encryption(e) => {
                info.cipher = match e.ciphers.as_slice() {
                    [EncryptionCipher::None] | [] => None,
                    [cipher] if config.encryption && ENCRYPTING_CIPHERS.contains(cipher) => {
                        Some(*cipher)
                    }
                    [cipher] => {
                        return Err(Error::NegotiationError(format!(
                            "server selected unrequested cipher {cipher:?}"
                        )));
                    }
                    many => {
                        return Err(Error::NegotiationError(format!(
                            "server selected {} ciphers",
                            many.len()
                        )));
                    }
                };
            }
            NegotiateContext::Signing(s) => {
                info.signing_algorithm = match s.signing_algorithms.as_slice() {
                    [algorithm] if SIGNING_ALGORITHMS.contains(algorithm) => Some(*algorithm),
                    other => {
                        return Err(Error::NegotiationError(format!(
                            "invalid signing algorithm selection {other:?}"
                        )));
                    }
                };
            }
            NegotiateContext::Compression(_) => {
                log::trace!("Ignoring compression capabilities from server");
            }
            NegotiateContext::Netname(_) | NegotiateContext::Other { .. } => {
                log::trace!(
                    "Ignoring negotiate context type {:#x}",
                    context.context_type()
                );
            }
        }
    }
    if !preauth_seen && config.preauth_integrity {
        return Err(Error::NegotiationError(
            "3.1.1 response is missing the preauth integrity context".to_string(),
        ));
    }
    Ok(())
}

/// Checks that a reconnect's negotiation is identical to the original.
pub fn validate_reconnect(previous: &NegotiatedInfo, current: &NegotiatedInfo) -> Result<()> {
    if previous.wire_dialect != current.wire_dialect {
        return Err(Error::NegotiateMismatch("dialect"));
    }
    if previous.security_mode != current.security_mode {
        return Err(Error::NegotiateMismatch("security mode"));
    }
    if previous.server_guid != current.server_guid {
        return Err(Error::NegotiateMismatch("server guid"));
    }
    if previous.capabilities != current.capabilities {
        return Err(Error::NegotiateMismatch("capabilities"));
    }
    if previous.max_transact_size != current.max_transact_size {
        return Err(Error::NegotiateMismatch("max transact size"));
    }
    if previous.max_read_size != current.max_read_size {
        return Err(Error::NegotiateMismatch("max read size"));
    }
    if previous.max_write_size != current.max_write_size {
        return Err(Error::NegotiateMismatch("max write size"));
    }
    if previous.cipher != current.cipher {
        return Err(Error::NegotiateMismatch("cipher"));
    }
    Ok(())
}

/// FSCTL_VALIDATE_NEGOTIATE_INFO input echoing the offer that was sent.
pub fn validate_negotiate_request(
    config: &ConnectionConfig,
    client_guid: Guid,
    offered: &[Dialect],
) -> ValidateNegotiateInfoRequest {
    let mut dialects = offered.to_vec();
    dialects.sort();
    ValidateNegotiateInfoRequest {
        capabilities: offered_capabilities(config, &dialects),
        guid: client_guid,
        security_mode: security_mode(),
        dialects,
    }
}

/// Checks the server's view of the negotiation against ours.
pub fn check_validate_negotiate(
    info: &NegotiatedInfo,
    response: &ValidateNegotiateInfoResponse,
) -> Result<()> {
    if response.dialect != info.wire_dialect {
        return Err(Error::NegotiateMismatch("validated dialect"));
    }
    if response.guid != info.server_guid {
        return Err(Error::NegotiateMismatch("validated server guid"));
    }
    if response.security_mode != info.security_mode {
        return Err(Error::NegotiateMismatch("validated security mode"));
    }
    if response.capabilities != info.capabilities {
        return Err(Error::NegotiateMismatch("validated capabilities"));
    }
    Ok(())
}
