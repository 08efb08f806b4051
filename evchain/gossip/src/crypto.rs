use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};

use crate::error::GossipError;

const NONCE_LEN: usize = 12;

/// Seals whole transport packets with a cluster-shared key. A random nonce
/// is prepended to each packet.
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        PacketCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, GossipError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| GossipError::Encryption)?;

        let mut packet = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packet.extend_from_slice(&nonce_bytes);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>, GossipError> {
        if packet.len() < NONCE_LEN {
            return Err(GossipError::Encryption);
        }
        let (nonce_bytes, ciphertext) = packet.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| GossipError::Encryption)
    }

    /// Bytes added per sealed packet: nonce plus the AEAD tag.
    pub const OVERHEAD: usize = NONCE_LEN + 16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let cipher = PacketCipher::new(&[42u8; 32]);
        let sealed = cipher.seal(b"frame bytes").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"frame bytes");
        assert_eq!(sealed.len(), b"frame bytes".len() + PacketCipher::OVERHEAD);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = PacketCipher::new(&[1u8; 32]).seal(b"data").unwrap();
        assert!(PacketCipher::new(&[2u8; 32]).open(&sealed).is_err());
    }

    #[test]
    fn tampered_packet_fails_to_open() {
        let cipher = PacketCipher::new(&[1u8; 32]);
        let mut sealed = cipher.seal(b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(cipher.open(&sealed).is_err());
    }
}
