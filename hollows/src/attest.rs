//! Canonical hashing of attestation payloads.
//!
//! The payload is a CBOR map `{version, domain: {chainId, contract},
//! action, params: [{type, name, value}, ...], salt}`.  It is folded into a
//! single 32-byte digest by running a pair of 32-byte halves through
//! Keccak-256: the accumulator A absorbs each component through
//! `A = keccak(A || B)`.
//!
//! Two behaviors here are kept wire-for-wire compatible with deployed
//! verifiers rather than what one would write from scratch:
//!
//! - the action-signature preimage separates `type name` pairs with `(`
//!   instead of `,`;
//! - a declared param type counts as dynamic only when it is exactly five
//!   bytes and equals `"bytes"` or the first five bytes of `"string"` —
//!   so the six-byte string `"string"` itself is treated as static.

use minicbor::data::Type;
use minicbor::Decoder;
use sha3::{Digest, Keccak256};

use fsp::cbor;

const SPACE: u8 = b' ';
const OPEN_PAREN: u8 = b'(';
const CLOSE_PAREN: u8 = b')';

const SALT_LENGTH: usize = 32;

fn keccak(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// A = keccak(A || B).
fn fold(a: &mut [u8; 32], b: &[u8; 32]) {
    let mut h = Keccak256::new();
    h.update(&a[..]);
    h.update(b);
    *a = h.finalize().into();
}

/// A = keccak(A || 0x00), the 33-byte domain separator step.
fn fold_zero(a: &mut [u8; 32]) {
    let mut h = Keccak256::new();
    h.update(&a[..]);
    h.update([0u8]);
    *a = h.finalize().into();
}

/// Left-zero-pad a value of at most 32 bytes.
fn padded(d: &mut Decoder<'_>) -> Option<[u8; 32]> {
    let value = cbor::data_value(d)?;
    if value.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[32 - value.len()..].copy_from_slice(value);
    Some(out)
}

/// Steps 1-5: version, domain accumulation, action signature, separator.
fn compute_prefix(a: &mut [u8; 32], root: &Decoder<'_>) -> Option<()> {
    let mut version = cbor::follow_key(root, "version")?;
    if cbor::uint_value(&mut version)? != 1 {
        return None;
    }
    *a = [0u8; 32];
    a[31] = 1;

    let domain = cbor::follow_key(root, "domain")?;
    let mut chain_id = cbor::follow_key(&domain, "chainId")?;
    let b = padded(&mut chain_id)?;
    fold(a, &b);
    let mut contract = cbor::follow_key(&domain, "contract")?;
    let b = padded(&mut contract)?;
    fold(a, &b);

    // action ++ "(" ++ params.map(`type name`) ++ ")"
    let mut h = Keccak256::new();
    let mut action = cbor::follow_key(root, "action")?;
    h.update(cbor::data_value(&mut action)?);
    h.update([OPEN_PAREN]);

    let params = cbor::follow_key(root, "params")?;
    let mut first = true;
    for child in cbor::array_children(&params)? {
        if !first {
            // Separator kept as "(" for compatibility; see the module doc.
            h.update([OPEN_PAREN]);
        }
        first = false;

        let mut declared = cbor::follow_key(&child, "type")?;
        h.update(cbor::data_value(&mut declared)?);
        h.update([SPACE]);
        let mut name = cbor::follow_key(&child, "name")?;
        h.update(cbor::data_value(&mut name)?);
    }
    h.update([CLOSE_PAREN]);
    let signature: [u8; 32] = h.finalize().into();
    fold(a, &signature);

    fold_zero(a);
    Some(())
}

/// Whether a declared type hashes its value instead of padding it.
fn is_dynamic(declared: &[u8]) -> bool {
    declared.len() == 5 && (declared == b"bytes" || declared == &b"string"[..5])
}

/// The attestation digest of a CBOR payload; `None` when the payload is
/// malformed.  A pure function of the payload bytes.
pub fn hash_attest(payload: &[u8]) -> Option<[u8; 32]> {
    let root = Decoder::new(payload);

    let mut a = [0u8; 32];
    compute_prefix(&mut a, &root)?;

    // Salt: exactly 32 opaque bytes.
    let mut salt = cbor::follow_key(&root, "salt")?;
    if salt.datatype().ok()? != Type::Bytes {
        return None;
    }
    let salt = salt.bytes().ok()?;
    if salt.len() != SALT_LENGTH {
        return None;
    }
    fold(&mut a, salt.try_into().ok()?);

    // Param values, in declaration order.
    let params = cbor::follow_key(&root, "params")?;
    for child in cbor::array_children(&params)? {
        let mut declared = cbor::follow_key(&child, "type")?;
        let dynamic = is_dynamic(cbor::data_value(&mut declared)?);

        let mut value = cbor::follow_key(&child, "value")?;
        let b = if dynamic {
            keccak(cbor::data_value(&mut value)?)
        } else {
            padded(&mut value)?
        };
        fold(&mut a, &b);
    }

    fold_zero(&mut a);
    Some(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::Encoder;

    struct Param<'a> {
        declared: &'a str,
        name: &'a str,
        value: &'a [u8],
    }

    fn payload(chain_id: &[u8], action: &str, params: &[Param<'_>], salt: &[u8; 32]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(5).unwrap()
            .str("version").unwrap().u32(1).unwrap()
            .str("domain").unwrap()
            .map(2).unwrap()
            .str("chainId").unwrap().bytes(chain_id).unwrap()
            .str("contract").unwrap().bytes(&[0x22; 20]).unwrap()
            .str("action").unwrap().str(action).unwrap()
            .str("params").unwrap();
        e.array(params.len() as u64).unwrap();
        for p in params {
            e.map(3).unwrap()
                .str("type").unwrap().str(p.declared).unwrap()
                .str("name").unwrap().str(p.name).unwrap()
                .str("value").unwrap().bytes(p.value).unwrap();
        }
        e.str("salt").unwrap().bytes(salt).unwrap();
        buf
    }

    #[test]
    fn digest_is_a_pure_function_of_the_payload() {
        let params = [
            Param { declared: "uint256", name: "amount", value: &[0x07] },
            Param { declared: "bytes", name: "payload", value: &[0x55; 40] },
        ];
        let p1 = payload(&[1], "transfer", &params, &[0x33; 32]);
        let p2 = payload(&[1], "transfer", &params, &[0x33; 32]);

        let d1 = hash_attest(&p1).unwrap();
        let d2 = hash_attest(&p2).unwrap();
        assert_eq!(d1, d2);

        // Any input perturbation moves the digest.
        let other_salt = payload(&[1], "transfer", &params, &[0x34; 32]);
        assert_ne!(hash_attest(&other_salt).unwrap(), d1);
        let other_chain = payload(&[2], "transfer", &params, &[0x33; 32]);
        assert_ne!(hash_attest(&other_chain).unwrap(), d1);
        let other_action = payload(&[1], "transfers", &params, &[0x33; 32]);
        assert_ne!(hash_attest(&other_action).unwrap(), d1);
    }

    /// Replays the whole accumulation by hand, pinning the separator byte
    /// and the step order.
    #[test]
    fn digest_matches_the_manual_accumulation() {
        let salt = [0x44u8; 32];
        let params = [
            Param { declared: "uint256", name: "a", value: &[0x01] },
            Param { declared: "bytes", name: "b", value: &[0x02, 0x03] },
        ];
        let encoded = payload(&[0x05], "act", &params, &salt);
        let digest = hash_attest(&encoded).unwrap();

        let pad = |v: &[u8]| {
            let mut out = [0u8; 32];
            out[32 - v.len()..].copy_from_slice(v);
            out
        };
        let cat = |a: &[u8; 32], b: &[u8; 32]| {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(a);
            buf[32..].copy_from_slice(b);
            keccak(&buf)
        };

        let mut a = pad(&[1]); // version
        a = cat(&a, &pad(&[0x05])); // chainId
        a = cat(&a, &pad(&[0x22; 20])); // contract
        // The inter-parameter separator is an open paren, not a comma.
        let signature = keccak(b"act(uint256 a(bytes b)");
        a = cat(&a, &signature);
        a = keccak(&[&a[..], &[0u8]].concat());
        a = cat(&a, &salt);
        a = cat(&a, &pad(&[0x01]));
        a = cat(&a, &keccak(&[0x02, 0x03])); // dynamic value
        a = keccak(&[&a[..], &[0u8]].concat());

        assert_eq!(digest, a);
    }

    #[test]
    fn five_byte_type_comparison() {
        let salt = [0x01u8; 32];
        let long_value = [0x66u8; 40];

        // "strin" (five bytes) is dynamic, so a long value hashes fine.
        let p = payload(
            &[1],
            "act",
            &[Param { declared: "strin", name: "x", value: &long_value }],
            &salt,
        );
        assert!(hash_attest(&p).is_some());

        // "string" itself is six bytes, fails the length gate and is
        // static, so the oversized value is rejected.
        let p = payload(
            &[1],
            "act",
            &[Param { declared: "string", name: "x", value: &long_value }],
            &salt,
        );
        assert!(hash_attest(&p).is_none());

        // "bytes" is dynamic.
        let p = payload(
            &[1],
            "act",
            &[Param { declared: "bytes", name: "x", value: &long_value }],
            &salt,
        );
        assert!(hash_attest(&p).is_some());
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let salt = [0u8; 32];

        // Wrong version.
        let mut buf = Vec::new();
        Encoder::new(&mut buf)
            .map(1).unwrap()
            .str("version").unwrap().u32(2).unwrap();
        assert!(hash_attest(&buf).is_none());

        // Static value over 32 bytes.
        let p = payload(
            &[1],
            "act",
            &[Param { declared: "uint256", name: "x", value: &[0x11; 33] }],
            &salt,
        );
        assert!(hash_attest(&p).is_none());

        // Short salt.
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.map(5).unwrap()
            .str("version").unwrap().u32(1).unwrap()
            .str("domain").unwrap()
            .map(2).unwrap()
            .str("chainId").unwrap().bytes(&[1]).unwrap()
            .str("contract").unwrap().bytes(&[2]).unwrap()
            .str("action").unwrap().str("a").unwrap()
            .str("params").unwrap().array(0).unwrap()
            .str("salt").unwrap().bytes(&[0u8; 31]).unwrap();
        assert!(hash_attest(&buf).is_none());
    }
}
