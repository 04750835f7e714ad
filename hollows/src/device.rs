//! Device provisioning, attestation and account-key derivation.
//!
//! At boot the device loads its identity from the fuse block (version,
//! model, serial) and its key material from the "attest" store namespace:
//! the `cipherdata` blob (the RSA-3072 private key sealed for the on-chip
//! signing peripheral), the factory attestation proof and the public
//! modulus.  Any gap leaves the device in a sticky failure status that
//! short-circuits every signing operation.
//!
//! An attestation binds the device identity, a nonce and a caller-supplied
//! challenge under a PKCS#1 v1.5 signature.  Nonces are namespaced by
//! their top bit: cleared for anything externally visible, set only for
//! the internal derivation path, so an external caller can never obtain a
//! signature from the internal namespace.
//!
//! Account keys are derived deterministically from the sealed material:
//! the cipherdata digest is attested with the internal nonce, the
//! signature is reduced to 16 bytes of entropy, and a BIP-39/BIP-32
//! pipeline walks `m/44'/60'/account'/0/0` to a secp256k1 private key.
//! Account 0 is primed once at boot and cached.

use std::sync::Mutex;

use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::{attest, DeviceStatus};

pub const RSA_MODULUS_LENGTH: usize = 384;
pub const ATTEST_PROOF_LENGTH: usize = 64;
pub const CHALLENGE_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 16;
pub const PRIVKEY_LENGTH: usize = 32;

/// Words of device fuse block 3.
const FUSE_VERSION: usize = 0;
const FUSE_MODEL: usize = 1;
const FUSE_SERIAL: usize = 2;

/// Read-only fuse registers (block 3).
pub trait Fuses: Send + Sync {
    fn read_word(&self, word: usize) -> u32;
}

/// The "attest" namespace of the secure store.
pub trait SecureStore: Send + Sync {
    fn read_blob(&self, key: &str) -> Option<Vec<u8>>;
}

#[derive(Debug)]
pub struct SignerError;

/// The hardware signing peripheral.  It consumes the sealed `cipherdata`
/// blob plus a full-width signing block, both little-endian, and produces
/// a little-endian signature; the wire format of everything around it is
/// big-endian, so callers reverse on the way in and out.
pub trait SealedSigner: Send + Sync {
    fn sign(
        &self,
        cipherdata: &[u8],
        input_le: &[u8; RSA_MODULUS_LENGTH],
    ) -> Result<[u8; RSA_MODULUS_LENGTH], SignerError>;
}

/// Source of nonce randomness.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// Host entropy; on the target the TRNG peripheral implements the trait.
pub struct SystemEntropy;

impl EntropySource for SystemEntropy {
    fn fill(&self, buf: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

/// The two disjoint nonce namespaces.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NonceKind {
    /// Random nonce, top bit cleared; anything handed out of the device.
    External,
    /// The fixed all-zero nonce with the top bit set; only the key
    /// derivation path may use it.
    Internal,
}

/// A signed statement binding this device, a nonce and a challenge.
#[derive(Clone, Debug)]
pub struct Attestation {
    pub version: u8,
    pub nonce: [u8; NONCE_LENGTH],
    pub challenge: [u8; CHALLENGE_LENGTH],
    pub model: u32,
    pub serial: u32,
    pub pubkey_n: [u8; RSA_MODULUS_LENGTH],
    pub attest_proof: [u8; ATTEST_PROOF_LENGTH],
    pub signature: [u8; RSA_MODULUS_LENGTH],
}

/// The DER prefix of a SHA-256 DigestInfo.
const PKCS_PREFIX: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

pub struct Device {
    status: DeviceStatus,
    model: u32,
    serial: u32,
    pubkey_n: [u8; RSA_MODULUS_LENGTH],
    attest_proof: [u8; ATTEST_PROOF_LENGTH],
    cipherdata: Vec<u8>,
    signer: Box<dyn SealedSigner>,
    entropy: Box<dyn EntropySource>,
    privkey0: Mutex<Option<[u8; PRIVKEY_LENGTH]>>,
}

impl Device {
    /// Load provisioning state.  The returned status is final: a device
    /// that failed to load stays failed.
    pub fn new(
        fuses: Box<dyn Fuses>,
        store: Box<dyn SecureStore>,
        signer: Box<dyn SealedSigner>,
        entropy: Box<dyn EntropySource>,
    ) -> Device {
        let mut model = 0;
        let mut serial = 0;
        let mut pubkey_n = [0u8; RSA_MODULUS_LENGTH];
        let mut attest_proof = [0u8; ATTEST_PROOF_LENGTH];
        let mut cipherdata = Vec::new();

        let status = (|| {
            let version = fuses.read_word(FUSE_VERSION);
            let fuse_model = fuses.read_word(FUSE_MODEL);
            let fuse_serial = fuses.read_word(FUSE_SERIAL);
            if version != 1 || fuse_model == 0 || fuse_serial == 0 {
                return DeviceStatus::MissingFuses;
            }

            let Some(sealed) = store.read_blob("cipherdata") else {
                return DeviceStatus::MissingStore;
            };
            if sealed.is_empty() {
                return DeviceStatus::MissingStore;
            }

            let Some(proof) = store.read_blob("attest") else {
                return DeviceStatus::MissingStore;
            };
            if proof.len() != ATTEST_PROOF_LENGTH {
                return DeviceStatus::MissingStore;
            }

            let Some(modulus) = store.read_blob("pubkey-n") else {
                return DeviceStatus::MissingStore;
            };
            if modulus.len() != RSA_MODULUS_LENGTH {
                return DeviceStatus::MissingStore;
            }

            cipherdata = sealed;
            attest_proof.copy_from_slice(&proof);
            pubkey_n.copy_from_slice(&modulus);
            model = fuse_model;
            serial = fuse_serial;
            DeviceStatus::Ok
        })();

        Device {
            status,
            model,
            serial,
            pubkey_n,
            attest_proof,
            cipherdata,
            signer,
            entropy,
            privkey0: Mutex::new(None),
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn model_number(&self) -> u32 {
        self.model
    }

    pub fn serial_number(&self) -> u32 {
        self.serial
    }

    pub fn model_name(&self) -> String {
        if self.status != DeviceStatus::Ok {
            return "[unprovisioned]".into();
        }
        if self.model >> 8 == 1 {
            format!("Firefly Pixie (DevKit rev.{})", self.model & 0xff)
        } else {
            format!("[Unknown model: {:#x}]", self.model)
        }
    }

    fn make_nonce(&self, kind: NonceKind) -> [u8; NONCE_LENGTH] {
        let mut nonce = [0u8; NONCE_LENGTH];
        match kind {
            NonceKind::External => {
                self.entropy.fill(&mut nonce);
                nonce[0] &= 0x7f;
            }
            NonceKind::Internal => {
                // Stable, and unreachable from the external namespace.
                nonce[0] = 0x80;
            }
        }
        nonce
    }

    /// Sign `version || nonce || challenge` under the sealed key.
    fn attest_raw(
        &self,
        challenge: &[u8; CHALLENGE_LENGTH],
        nonce: &[u8; NONCE_LENGTH],
    ) -> Result<Attestation, DeviceStatus> {
        if self.status != DeviceStatus::Ok {
            return Err(self.status);
        }

        let mut preimage = [0u8; 1 + NONCE_LENGTH + CHALLENGE_LENGTH];
        preimage[0] = 1;
        preimage[1..1 + NONCE_LENGTH].copy_from_slice(nonce);
        preimage[1 + NONCE_LENGTH..].copy_from_slice(challenge);

        // PKCS#1 v1.5: 0x00 0x01 FF.. 0x00 DigestInfo, big-endian across
        // the modulus width.
        let mut block = [0u8; RSA_MODULUS_LENGTH];
        const PADDING: usize = RSA_MODULUS_LENGTH - 2 - 1 - PKCS_PREFIX.len() - 32;
        block[0] = 0x00;
        block[1] = 0x01;
        block[2..2 + PADDING].fill(0xff);
        block[2 + PADDING] = 0x00;
        block[3 + PADDING..3 + PADDING + PKCS_PREFIX.len()].copy_from_slice(&PKCS_PREFIX);
        let digest = Sha256::digest(preimage);
        block[RSA_MODULUS_LENGTH - 32..].copy_from_slice(&digest);

        // The signer wants little-endian limbs.
        block.reverse();
        let mut signature = self
            .signer
            .sign(&self.cipherdata, &block)
            .map_err(|_| DeviceStatus::Failed)?;
        // And back to wire order.
        signature.reverse();

        Ok(Attestation {
            version: 1,
            nonce: *nonce,
            challenge: *challenge,
            model: self.model,
            serial: self.serial,
            pubkey_n: self.pubkey_n,
            attest_proof: self.attest_proof,
            signature,
        })
    }

    /// Attest a structured payload (see [`attest::hash_attest`]) with a
    /// fresh external nonce.
    pub fn attest(&self, payload: &[u8]) -> Option<Attestation> {
        let digest = attest::hash_attest(payload)?;
        self.attest_digest(&digest)
    }

    /// Attest a caller-computed 32-byte challenge with a fresh external
    /// nonce.
    pub fn attest_digest(&self, challenge: &[u8; CHALLENGE_LENGTH]) -> Option<Attestation> {
        let nonce = self.make_nonce(NonceKind::External);
        self.attest_raw(challenge, &nonce).ok()
    }

    /// The deterministic test key for `account` (`< 2^31`).  Account 0 is
    /// cached; the prime task fills the cache at boot.
    pub fn test_privkey(&self, account: u32) -> Option<[u8; PRIVKEY_LENGTH]> {
        if account == 0 {
            let mut cached = self.privkey0.lock().unwrap();
            if cached.is_none() {
                *cached = self.derive_privkey(0);
            }
            return *cached;
        }
        self.derive_privkey(account)
    }

    fn derive_privkey(&self, account: u32) -> Option<[u8; PRIVKEY_LENGTH]> {
        if self.status != DeviceStatus::Ok || self.cipherdata.is_empty() || account > 0x7fff_ffff
        {
            return None;
        }

        // Bind the key to this device's sealed material.
        let digest: [u8; 32] = Keccak256::digest(&self.cipherdata).into();
        let nonce = self.make_nonce(NonceKind::Internal);
        let attestation = self.attest_raw(&digest, &nonce).ok()?;

        let entropy: [u8; 32] = Keccak256::digest(attestation.signature).into();
        let mnemonic = bip39::Mnemonic::from_entropy(&entropy[..16]).ok()?;
        let seed = mnemonic.to_seed("");

        let path: bip32::DerivationPath = format!("m/44'/60'/{account}'/0/0").parse().ok()?;
        let key = bip32::XPrv::derive_from_path(seed, &path).ok()?;
        Some(key.private_key().to_bytes().into())
    }
}

/// Attestation and derivation surface on the runtime.
impl crate::Runtime {
    pub fn device_status(&self) -> DeviceStatus {
        self.device.status()
    }

    pub fn device_model_number(&self) -> u32 {
        self.device.model_number()
    }

    pub fn device_serial_number(&self) -> u32 {
        self.device.serial_number()
    }

    pub fn device_model_name(&self) -> String {
        self.device.model_name()
    }

    /// Attest a structured payload with an external nonce.
    pub fn device_attest(&self, payload: &[u8]) -> Option<Attestation> {
        self.device.attest(payload)
    }

    /// The canonical digest of an attestation payload.
    pub fn hash_attest(&self, payload: &[u8]) -> Option<[u8; CHALLENGE_LENGTH]> {
        attest::hash_attest(payload)
    }

    /// The deterministic test key for `account`.
    pub fn device_test_privkey(&self, account: u32) -> Option<[u8; PRIVKEY_LENGTH]> {
        self.device.test_privkey(account)
    }
}
