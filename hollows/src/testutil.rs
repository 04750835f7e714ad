//! In-memory hardware stand-ins shared by the unit tests.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::device::{
    Device, EntropySource, Fuses, SealedSigner, SecureStore, SignerError, RSA_MODULUS_LENGTH,
};
use crate::radio::{Characteristic, Transport, TransportError};
use crate::scene::MemoryScene;
use crate::Runtime;

pub(crate) struct NullTransport;

impl Transport for NullTransport {
    fn indicate(&self, _chr: Characteristic, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnect(&self) {}
}

pub(crate) struct NoFuses;

impl Fuses for NoFuses {
    fn read_word(&self, _word: usize) -> u32 {
        0
    }
}

/// Fuse block of a provisioned device: version 1, model 0x0102, serial 42.
pub(crate) struct GoodFuses;

impl Fuses for GoodFuses {
    fn read_word(&self, word: usize) -> u32 {
        [1, 0x0102, 42].get(word).copied().unwrap_or(0)
    }
}

pub(crate) struct EmptyStore;

impl SecureStore for EmptyStore {
    fn read_blob(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }
}

/// An "attest" namespace with fixed provisioning blobs.
pub(crate) struct GoodStore;

impl SecureStore for GoodStore {
    fn read_blob(&self, key: &str) -> Option<Vec<u8>> {
        match key {
            "cipherdata" => Some(vec![0u8; 1220]),
            "attest" => Some(vec![0xaa; 64]),
            "pubkey-n" => Some(vec![0xbb; RSA_MODULUS_LENGTH]),
            _ => None,
        }
    }
}

pub(crate) struct FixedEntropy(pub u8);

impl EntropySource for FixedEntropy {
    fn fill(&self, buf: &mut [u8]) {
        buf.fill(self.0);
    }
}

/// A deterministic stand-in for the sealed signing peripheral: the
/// "signature" is a hash chain over the cipherdata and the little-endian
/// signing block.  Not RSA, but stable per (cipherdata, input) pair, which
/// is what the derivation pipeline cares about.
pub(crate) struct StubSigner;

impl SealedSigner for StubSigner {
    fn sign(
        &self,
        cipherdata: &[u8],
        input_le: &[u8; RSA_MODULUS_LENGTH],
    ) -> Result<[u8; RSA_MODULUS_LENGTH], SignerError> {
        let mut seed = Sha256::new();
        seed.update(cipherdata);
        seed.update(input_le);
        let seed = seed.finalize();

        let mut signature = [0u8; RSA_MODULUS_LENGTH];
        for (block, chunk) in signature.chunks_mut(32).enumerate() {
            let mut h = Sha256::new();
            h.update(seed);
            h.update([block as u8]);
            chunk.copy_from_slice(&h.finalize()[..chunk.len()]);
        }
        Ok(signature)
    }
}

/// A signer that records the block it was asked to sign.
pub(crate) struct CapturingSigner {
    pub captured: std::sync::Mutex<Vec<[u8; RSA_MODULUS_LENGTH]>>,
}

impl SealedSigner for &'static CapturingSigner {
    fn sign(
        &self,
        cipherdata: &[u8],
        input_le: &[u8; RSA_MODULUS_LENGTH],
    ) -> Result<[u8; RSA_MODULUS_LENGTH], SignerError> {
        self.captured.lock().unwrap().push(*input_le);
        StubSigner.sign(cipherdata, input_le)
    }
}

pub(crate) fn unprovisioned_device() -> Device {
    Device::new(
        Box::new(NoFuses),
        Box::new(EmptyStore),
        Box::new(StubSigner),
        Box::new(FixedEntropy(0x5a)),
    )
}

pub(crate) fn provisioned_device() -> Device {
    Device::new(
        Box::new(GoodFuses),
        Box::new(GoodStore),
        Box::new(StubSigner),
        Box::new(FixedEntropy(0x5a)),
    )
}

/// A runtime over the instant scene with stub hardware; no worker threads.
pub(crate) fn runtime() -> Arc<Runtime> {
    Runtime::new(
        MemoryScene::instant(),
        Arc::new(NullTransport),
        unprovisioned_device(),
    )
}

/// Same, but the device is provisioned; used by the radio tests.
pub(crate) fn provisioned_runtime() -> Arc<Runtime> {
    Runtime::new(
        MemoryScene::instant(),
        Arc::new(NullTransport),
        provisioned_device(),
    )
}
