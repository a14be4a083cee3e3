#[cfg(test)]
mod tests {
    use crate::encoding::{
        EncodingError, get_len_prefixed, get_u32_le, get_u64_le, put_len_prefixed,
    };

    #[test]
    fn test_u32_le_roundtrip() {
        let buf = 0xdead_beefu32.to_le_bytes();
        assert_eq!(get_u32_le(&buf).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_u64_le_roundtrip() {
        let buf = 0x0123_4567_89ab_cdefu64.to_le_bytes();
        assert_eq!(get_u64_le(&buf).unwrap(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn test_fixed_short_buffer() {
        assert!(matches!(
            get_u32_le(&[1, 2, 3]).unwrap_err(),
            EncodingError::UnexpectedEof {
                needed: 4,
                available: 3
            }
        ));
        assert!(matches!(
            get_u64_le(&[0; 7]).unwrap_err(),
            EncodingError::UnexpectedEof { .. }
        ));
    }

    #[test]
    fn test_len_prefixed_roundtrip() {
        let mut buf = Vec::new();
        put_len_prefixed(&mut buf, b"hello").unwrap();
        put_len_prefixed(&mut buf, b"").unwrap();

        let (first, consumed) = get_len_prefixed(&buf, 1024).unwrap();
        assert_eq!(first, b"hello");
        let (second, consumed2) = get_len_prefixed(&buf[consumed..], 1024).unwrap();
        assert_eq!(second, b"");
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn test_len_prefixed_limit_enforced() {
        let mut buf = Vec::new();
        put_len_prefixed(&mut buf, &[0u8; 100]).unwrap();

        let err = get_len_prefixed(&buf, 99).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn test_len_prefixed_truncated_payload() {
        let mut buf = Vec::new();
        put_len_prefixed(&mut buf, b"abcdef").unwrap();
        buf.truncate(buf.len() - 2);

        let err = get_len_prefixed(&buf, 1024).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
    }
}
