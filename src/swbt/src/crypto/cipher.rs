use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};

/// AES-128 in counter mode with a 128-bit big-endian counter block.
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// XORs the keystream for `(key, iv)` into `data`. Encryption and decryption are
/// the same operation.
pub(crate) fn apply_keystream(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(&(*key).into(), &(*iv).into());
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A, F.5.1 CTR-AES128.Encrypt, blocks 1 and 2.
    #[test]
    fn matches_nist_ctr_vector() {
        let key: [u8; 16] = hex::decode("2b7e151628aed2a6abf7158809cf4f3c")
            .unwrap()
            .try_into()
            .unwrap();
        let iv: [u8; 16] = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff")
            .unwrap()
            .try_into()
            .unwrap();
        let mut data =
            hex::decode("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51")
                .unwrap();
        apply_keystream(&key, &iv, &mut data);
        assert_eq!(
            hex::encode(&data),
            "874d6191b620e3261bef6864990db6ce9806f66b7970fdff8617187bb9fffdff"
        );
        apply_keystream(&key, &iv, &mut data);
        assert_eq!(
            hex::encode(&data),
            "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51"
        );
    }
}
