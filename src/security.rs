//! The asynchronous security engine port.
//!
//! All cryptographic primitives (CCM network encrypt/decrypt, CMAC beacon authentication, AES-ECB,
//! `s1`) live outside this crate, possibly on a separate execution context. From the stack's
//! perspective every primitive is a *request* submitted through [`SecurityEngine`] together with a
//! completion token; the engine answers by handing a [`SecurityComplete`] message back to the
//! event loop, which routes it into `MeshStack::security_complete`.
//!
//! The engine may process at most one request of each kind at a time; the stack enforces this with
//! its single-in-flight flags and queues, so implementations do not need internal queueing.
//! Completions must *always* be delivered, also on failure, or the pipeline queues stall.
//!
//! [`SecurityEngine`]: trait.SecurityEngine.html
//! [`SecurityComplete`]: enum.SecurityComplete.html

use crate::address::Address;
use crate::beacon::{BeaconHandle, BEACON_LEN};
use crate::net::pdu::PduHandle;
use crate::proxy::ProxyToken;
use crate::Error;
use heapless::Vec;

/// Byte buffer sized for the largest PDU that passes through the engine (a proxy configuration
/// network PDU).
pub type CryptoBuf = Vec<u8, 66>;

/// Identifies the pipeline a network encrypt/decrypt request belongs to.
///
/// The proxy configuration pipeline is deliberately separate from the main network pipeline so
/// that proxy configuration does not starve during heavy traffic; tokens keep the completions
/// apart.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CryptoRef {
    /// Main network pipeline; the handle addresses the PDU arena.
    Net(PduHandle),
    /// Proxy configuration pipeline.
    Proxy(ProxyToken),
}

/// Nonce flavor for network-layer CCM operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NonceKind {
    Network,
    Proxy,
}

/// Request to encrypt and obfuscate a network PDU.
pub struct EncryptRequest {
    pub token: CryptoRef,
    pub nonce: NonceKind,
    /// Plaintext PDU: packed header (IVI/NID zeroed) followed by the lower transport PDU,
    /// *without* room for the NetMIC.
    pub pdu: CryptoBuf,
    /// NetMIC length in octets: 4 for access PDUs, 8 for control PDUs.
    pub mic_len: u8,
    pub net_key_index: u16,
    pub iv_index: u32,
    /// Unassigned selects master credentials, a unicast address selects the friendship
    /// credentials shared with that node.
    pub friend_lpn_addr: Address,
}

/// Request to deobfuscate and decrypt a received network PDU.
///
/// The engine performs trial decryption against all stored keys whose NID matches and both
/// acceptable IV indices.
pub struct DecryptRequest {
    pub token: CryptoRef,
    pub nonce: NonceKind,
    /// Obfuscated/encrypted PDU including the NetMIC.
    pub pdu: CryptoBuf,
}

/// Successful network decrypt result.
pub struct DecryptOk {
    /// Plaintext PDU; same length as the request's buffer, the trailing NetMIC octets are
    /// consumed by authentication and left unspecified.
    pub pdu: CryptoBuf,
    /// NetKey index of the key that authenticated the PDU.
    pub net_key_index: u16,
    /// IV index that authenticated the PDU.
    pub iv_index: u32,
    /// Friend or LPN address if friendship credentials matched, unassigned otherwise.
    pub friend_lpn_addr: Address,
}

/// Request to compute the authentication value of a secure network beacon.
pub struct BeaconGenRequest {
    pub token: BeaconHandle,
    /// Beacon frame with flags and IV index filled in; network id and auth are written by the
    /// engine.
    pub beacon: [u8; BEACON_LEN],
    pub net_key_index: u16,
    /// Authenticate with the new key (subnet in key refresh phase 2).
    pub use_new_key: bool,
}

/// Request to authenticate a received secure network beacon against all stored beacon keys.
pub struct BeaconAuthRequest {
    pub beacon: [u8; BEACON_LEN],
}

/// Successful beacon authentication result.
#[derive(Debug, Copy, Clone)]
pub struct BeaconAuthOk {
    pub net_key_index: u16,
    pub new_key_used: bool,
}

/// Completion message for a previously submitted request.
///
/// Produced by the [`SecurityEngine`] host glue and fed into `MeshStack::security_complete` on the
/// event loop.
///
/// [`SecurityEngine`]: trait.SecurityEngine.html
pub enum SecurityComplete {
    /// Network encrypt/obfuscate finished.
    Encrypt {
        token: CryptoRef,
        /// Encrypted and obfuscated PDU including the NetMIC, or `None` on failure.
        result: Option<CryptoBuf>,
    },

    /// Network deobfuscate/decrypt finished.
    Decrypt {
        token: CryptoRef,
        /// `None` if no stored key authenticated the PDU.
        result: Option<DecryptOk>,
    },

    /// Beacon authentication value computed.
    BeaconGen {
        token: BeaconHandle,
        /// Completed beacon frame, or `None` on failure.
        result: Option<[u8; BEACON_LEN]>,
    },

    /// Received beacon authentication finished.
    BeaconAuth {
        /// The beacon frame from the request.
        beacon: [u8; BEACON_LEN],
        /// `None` if no stored beacon key matched.
        result: Option<BeaconAuthOk>,
    },

    /// AES-ECB block encryption finished (node identity hash).
    AesEcb { ciphertext: [u8; 16] },

    /// `s1` salt generation finished (unprovisioned beacon URI hash).
    S1 { result: Option<[u8; 16]> },
}

/// The asynchronous security engine consumed by the stack.
///
/// The synchronous query methods give the stack access to key-derived values that are cheap
/// lookups in the engine's key store.
pub trait SecurityEngine {
    /// Submits a network PDU encrypt/obfuscate request.
    ///
    /// Completion arrives as [`SecurityComplete::Encrypt`].
    ///
    /// [`SecurityComplete::Encrypt`]: enum.SecurityComplete.html#variant.Encrypt
    fn encrypt_network(&mut self, req: EncryptRequest) -> Result<(), Error>;

    /// Submits a network PDU deobfuscate/decrypt request.
    fn decrypt_network(&mut self, req: DecryptRequest) -> Result<(), Error>;

    /// Submits a beacon authentication value computation.
    fn compute_beacon_auth(&mut self, req: BeaconGenRequest) -> Result<(), Error>;

    /// Submits a received-beacon authentication.
    fn authenticate_beacon(&mut self, req: BeaconAuthRequest) -> Result<(), Error>;

    /// Submits a single AES-ECB block encryption.
    fn aes_ecb(&mut self, key: [u8; 16], plaintext: [u8; 16]) -> Result<(), Error>;

    /// Submits an `s1` computation over `data` (URI hash for unprovisioned beacons).
    fn s1(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Returns whether any stored network key derives the given 7-bit NID.
    ///
    /// Cheap prefilter protecting the RX cache from junk entries.
    fn nid_exists(&self, nid: u8) -> bool;

    /// Returns the network id derived from the given NetKey.
    fn network_id(&self, net_key_index: u16) -> Option<[u8; 8]>;

    /// Returns the identity key derived from the given NetKey.
    fn identity_key(&self, net_key_index: u16) -> Option<[u8; 16]>;
}
