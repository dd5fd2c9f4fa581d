/// Base64 helpers for binary fields embedded in serde-backed configuration.
pub mod base64 {
    use serde::Serializer;

    #[inline]
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&::base64::encode(bytes))
    }

    #[inline]
    pub fn encode(bytes: &[u8]) -> String {
        ::base64::encode(bytes)
    }

    #[inline]
    pub fn decode(encoded: &str) -> Result<Vec<u8>, ::base64::DecodeError> {
        ::base64::decode(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::base64;

    #[test]
    fn test_roundtrip() {
        let encoded = base64::encode(&[1, 2, 3, 255]);
        assert_eq!(base64::decode(&encoded).unwrap(), vec![1, 2, 3, 255]);
    }
}
