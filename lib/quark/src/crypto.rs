use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

/// Sealing a payload adds the nonce and the MAC on top of the plain text.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + MAC_SIZE;

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Cipher schedule derived once from a 128/192/256-bit seed and then shared by reference with
/// every datagram codec that seals or opens traffic.
pub struct EncryptKey {
    key: [u8; KEY_SIZE],
}

impl EncryptKey {
    /// Derives the schedule from a 16, 24 or 32 byte seed. Returns `None` for any other seed size.
    pub fn new(seed: &[u8]) -> Option<EncryptKey> {
        match seed.len() {
            16 | 24 | 32 => (),
            _ => return None,
        }

        let mut key = [0u8; KEY_SIZE];

        unsafe {
            let result = libsodium_sys::crypto_generichash(
                key.as_mut_ptr(),
                KEY_SIZE,
                seed.as_ptr(),
                seed.len() as u64,
                ::std::ptr::null(),
                0,
            );

            if result != 0 {
                return None;
            }
        }

        Some(EncryptKey { key })
    }
}

/// Seals the payload into a fresh buffer laid out as `[nonce][cipher + mac]`.
pub fn seal(plain: &[u8], key: &EncryptKey) -> Vec<u8> {
    let mut sealed = vec![0u8; plain.len() + SEAL_OVERHEAD];

    let (nonce, cipher) = sealed.split_at_mut(NONCE_SIZE);
    random_bytes(nonce);

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            ::std::ptr::null(),
            0,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.key.as_ptr(),
        );

        if result < 0 {
            panic!("Encryption failed on a correctly sized buffer")
        }
    }

    sealed
}

/// Opens a sealed buffer produced by `seal`. Returns `None` if the buffer is too short or the
/// authentication tag does not verify.
pub fn open(sealed: &[u8], key: &EncryptKey) -> Option<Vec<u8>> {
    if sealed.len() < SEAL_OVERHEAD {
        return None;
    }

    let (nonce, cipher) = sealed.split_at(NONCE_SIZE);
    let mut plain = vec![0u8; cipher.len() - MAC_SIZE];

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            ::std::ptr::null(),
            0,
            nonce.as_ptr(),
            key.key.as_ptr(),
        );

        if result < 0 {
            return None;
        }
    }

    Some(plain)
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Uniformly random 32 bit value.
#[inline]
pub fn random_u32() -> u32 {
    unsafe { libsodium_sys::randombytes_random() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EncryptKey::new(&[7u8; 16]).unwrap();

        let sealed = seal(b"hello world", &key);
        assert_eq!(sealed.len(), 11 + SEAL_OVERHEAD);

        let plain = open(&sealed, &key).unwrap();
        assert_eq!(&plain[..], b"hello world");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = EncryptKey::new(&[7u8; 32]).unwrap();

        let mut sealed = seal(b"hello world", &key);
        sealed[NONCE_SIZE] ^= 1;

        assert!(open(&sealed, &key).is_none());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let key = EncryptKey::new(&[7u8; 24]).unwrap();
        let other = EncryptKey::new(&[8u8; 24]).unwrap();

        let sealed = seal(b"hello world", &key);

        assert!(open(&sealed, &other).is_none());
    }

    #[test]
    fn test_key_rejects_bad_seed_size() {
        assert!(EncryptKey::new(&[0u8; 15]).is_none());
        assert!(EncryptKey::new(&[0u8; 33]).is_none());
        assert!(EncryptKey::new(&[0u8; 0]).is_none());
    }

    #[test]
    fn test_open_rejects_short_buffer() {
        let key = EncryptKey::new(&[7u8; 16]).unwrap();

        assert!(open(&[0u8; SEAL_OVERHEAD - 1], &key).is_none());
    }
}
