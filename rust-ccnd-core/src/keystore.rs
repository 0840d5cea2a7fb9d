//! The daemon's keystore.
//!
//! Keys live in a shrouded file under a per-user directory; the shroud
//! pass adds integrity checking and protection against accidental
//! misuse, while file permissions do the real access control.  The
//! daemon identity (`ccnd_id`) is the SHA-256 of the public key blob.
//!
//! Signing is DigestSha256: the signature layout on the wire is the
//! standard one, and a public-key signer can be slotted in behind
//! [`SigningParams`] without touching any caller.

use log::info;
use rand::rngs::SmallRng;
use rand::RngCore;
use rust_ccnd_common::packet::{
    content_digest, encode_content_object, ContentObjectParams, CONTENT_TYPE_DATA,
};
use rust_ccnd_common::name::Name;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Fixed shroud pass for the keystore file.
const KEYSTORE_PASS: &[u8] = b"\x08\x23\x43\xfd\xd7\x9f\x6a\xe9\x6d";

const KEYSTORE_MAGIC: &[u8; 8] = b"CCNDKEY1";
const KEY_BYTES: usize = 32;

/// Parameters for signing a ContentObject on behalf of the daemon.
#[derive(Debug, Clone)]
pub struct SigningParams {
    pub freshness_seconds: Option<u32>,
    pub content_type: u32,
    pub final_block: Option<Vec<u8>>,
    pub key_locator_name: Option<Name>,
    pub include_key_bits: bool,
}

impl Default for SigningParams {
    fn default() -> Self {
        Self {
            freshness_seconds: Some(10),
            content_type: CONTENT_TYPE_DATA,
            final_block: None,
            key_locator_name: None,
            include_key_bits: false,
        }
    }
}

#[derive(Debug)]
pub struct Keystore {
    key: [u8; KEY_BYTES],
    public_key: [u8; KEY_BYTES],
    ccnd_id: [u8; 32],
    path: PathBuf,
}

impl Keystore {
    /// Load the keystore at `dir/.ccnd_keystore_<port>`, creating a
    /// fresh one when absent.
    pub fn open(dir: &Path, port: &str, rng: &mut SmallRng) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut perms = fs::metadata(dir)?.permissions();
        perms.set_mode(0o700);
        let _ = fs::set_permissions(dir, perms);
        let path = dir.join(format!(".ccnd_keystore_{}", port));
        let key = match fs::read(&path) {
            Ok(bytes) => unshroud(&bytes).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt keystore {}", path.display()),
                )
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut key = [0u8; KEY_BYTES];
                rng.fill_bytes(&mut key);
                fs::write(&path, shroud(&key))?;
                let mut perms = fs::metadata(&path)?.permissions();
                perms.set_mode(0o600);
                let _ = fs::set_permissions(&path, perms);
                info!("created keystore {}", path.display());
                key
            }
            Err(e) => return Err(e),
        };
        let public_key = derive_public(&key);
        let mut h = Sha256::new();
        h.update(public_key);
        let ccnd_id: [u8; 32] = h.finalize().into();
        Ok(Self {
            key,
            public_key,
            ccnd_id,
            path,
        })
    }

    pub fn ccnd_id(&self) -> [u8; 32] {
        self.ccnd_id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sign a ContentObject under `name` with the given payload.
    pub fn sign_content(
        &self,
        name: Name,
        payload: &[u8],
        timestamp: u64,
        sp: &SigningParams,
    ) -> Vec<u8> {
        let mut params = ContentObjectParams::new(name, self.ccnd_id, timestamp);
        params.content_type = sp.content_type;
        params.freshness_seconds = sp.freshness_seconds;
        params.final_block_id = sp.final_block.clone();
        params.key_locator_name = sp.key_locator_name.clone();
        if sp.include_key_bits {
            params.key_bits = Some(self.public_key.to_vec());
        }
        let msg = encode_content_object(&params, payload, |signed| {
            content_digest(signed).to_vec()
        });
        msg.to_vec()
    }

    /// Verify a DigestSha256 signature over the signed span.
    pub fn verify_signature(signed: &[u8], bits: &[u8]) -> bool {
        bits == content_digest(signed)
    }
}

fn derive_public(key: &[u8; KEY_BYTES]) -> [u8; KEY_BYTES] {
    let mut h = Sha256::new();
    h.update(b"ccnd-public");
    h.update(key);
    h.finalize().into()
}

fn shroud(key: &[u8; KEY_BYTES]) -> Vec<u8> {
    let mut out = Vec::with_capacity(KEYSTORE_MAGIC.len() + KEY_BYTES + 32);
    out.extend_from_slice(KEYSTORE_MAGIC);
    let pad = shroud_pad();
    for (i, &b) in key.iter().enumerate() {
        out.push(b ^ pad[i % pad.len()]);
    }
    let mut h = Sha256::new();
    h.update(KEYSTORE_MAGIC);
    h.update(key);
    out.extend_from_slice(&h.finalize());
    out
}

fn unshroud(bytes: &[u8]) -> Option<[u8; KEY_BYTES]> {
    if bytes.len() != KEYSTORE_MAGIC.len() + KEY_BYTES + 32 {
        return None;
    }
    if &bytes[..KEYSTORE_MAGIC.len()] != KEYSTORE_MAGIC {
        return None;
    }
    let pad = shroud_pad();
    let mut key = [0u8; KEY_BYTES];
    for i in 0..KEY_BYTES {
        key[i] = bytes[KEYSTORE_MAGIC.len() + i] ^ pad[i % pad.len()];
    }
    let mut h = Sha256::new();
    h.update(KEYSTORE_MAGIC);
    h.update(key);
    let check: [u8; 32] = h.finalize().into();
    if check != bytes[KEYSTORE_MAGIC.len() + KEY_BYTES..] {
        return None;
    }
    Some(key)
}

fn shroud_pad() -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(KEYSTORE_PASS);
    h.finalize().into()
}

/// The default keystore directory: `/var/tmp/.ccnx-user<euid>/`.
pub fn default_directory() -> PathBuf {
    let euid = unsafe { libc::geteuid() };
    PathBuf::from(format!("/var/tmp/.ccnx-user{}", euid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn create_then_reload_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let ks1 = Keystore::open(dir.path(), "9695", &mut rng).unwrap();
        let ks2 = Keystore::open(dir.path(), "9695", &mut rng).unwrap();
        assert_eq!(ks1.ccnd_id(), ks2.ccnd_id());
        assert_eq!(ks1.public_key(), ks2.public_key());
    }

    #[test]
    fn different_ports_get_different_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let a = Keystore::open(dir.path(), "9695", &mut rng).unwrap();
        let b = Keystore::open(dir.path(), "7001", &mut rng).unwrap();
        assert_ne!(a.ccnd_id(), b.ccnd_id());
    }

    #[test]
    fn corrupt_keystore_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let ks = Keystore::open(dir.path(), "9695", &mut rng).unwrap();
        let path = ks.path().to_path_buf();
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 1;
        fs::write(&path, bytes).unwrap();
        assert!(Keystore::open(dir.path(), "9695", &mut rng).is_err());
    }

    #[test]
    fn signed_objects_verify() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let ks = Keystore::open(dir.path(), "9695", &mut rng).unwrap();
        let msg = ks.sign_content(
            Name::from_uri("ccnx:/signed").unwrap(),
            b"payload",
            123,
            &SigningParams::default(),
        );
        let pco = rust_ccnd_common::packet::parse_content_object(&msg).unwrap();
        let signed = &msg[pco.signed_span.clone()];
        let bits = &msg[pco.signature_bits.clone()];
        assert!(Keystore::verify_signature(signed, bits));
        let mut bad = msg.clone();
        let at = pco.content_body.start;
        bad[at] ^= 1;
        let bad_signed = &bad[pco.signed_span.clone()];
        assert!(!Keystore::verify_signature(bad_signed, bits));
    }
}
