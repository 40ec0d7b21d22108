//! Length-prefixed encoding for `BYTES` tensors.
//!
//! Each element is a little-endian `u32` length followed by that many raw
//! bytes, no terminator. Elements are concatenated with no overall header, so
//! a decoder must consume the buffer exactly.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const LEN_PREFIX: usize = std::mem::size_of::<u32>();

pub fn encode_strings<I, S>(items: I) -> Result<Bytes>
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    for (idx, item) in items.into_iter().enumerate() {
        let item = item.as_ref();
        let len = u32::try_from(item.len()).map_err(|_| {
            Error::invalid_argument(format!(
                "string element {idx} is {} bytes, longer than a u32 length prefix allows",
                item.len()
            ))
        })?;
        buf.reserve(LEN_PREFIX + item.len());
        buf.put_u32_le(len);
        buf.put_slice(item);
    }
    Ok(buf.freeze())
}

/// Walks the records without copying, calling `f` with each element.
fn for_each_element<'a>(data: &'a [u8], mut f: impl FnMut(&'a [u8]) -> Result<()>) -> Result<()> {
    let mut cursor = data;
    while cursor.has_remaining() {
        let offset = data.len() - cursor.remaining();
        if cursor.remaining() < LEN_PREFIX {
            return Err(Error::Decode(format!(
                "truncated length prefix at byte {offset}: {} of {LEN_PREFIX} bytes present",
                cursor.remaining()
            )));
        }
        let len = cursor.get_u32_le() as usize;
        if cursor.remaining() < len {
            return Err(Error::Decode(format!(
                "element at byte {offset} declares {len} bytes, only {} remain",
                cursor.remaining()
            )));
        }
        f(&cursor[..len])?;
        cursor.advance(len);
    }
    Ok(())
}

pub fn decode_strings(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for_each_element(data, |el| {
        out.push(el.to_vec());
        Ok(())
    })?;
    Ok(out)
}

/// Like [`decode_strings`] but requires every element to be valid UTF-8.
pub fn decode_utf8_strings(data: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for_each_element(data, |el| {
        let s = std::str::from_utf8(el)
            .map_err(|e| Error::Decode(format!("element {} is not UTF-8: {e}", out.len())))?;
        out.push(s.to_owned());
        Ok(())
    })?;
    Ok(out)
}

pub fn count_strings(data: &[u8]) -> Result<usize> {
    let mut count = 0;
    for_each_element(data, |_| {
        count += 1;
        Ok(())
    })?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_elements() {
        let encoded = encode_strings(["ab", "c"]).unwrap();
        assert_eq!(&encoded[..], b"\x02\x00\x00\x00ab\x01\x00\x00\x00c");
        assert_eq!(decode_utf8_strings(&encoded).unwrap(), vec!["ab", "c"]);
    }

    #[test]
    fn empty_sequence_is_empty_buffer() {
        let encoded = encode_strings(Vec::<String>::new()).unwrap();
        assert!(encoded.is_empty());
        assert!(decode_strings(&encoded).unwrap().is_empty());
    }

    #[test]
    fn empty_elements_survive() {
        let encoded = encode_strings(["", "x", ""]).unwrap();
        assert_eq!(encoded.len(), 13);
        assert_eq!(count_strings(&encoded).unwrap(), 3);
    }

    #[test]
    fn truncated_prefix_is_a_decode_error() {
        let err = decode_strings(&[4, 0]).unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{err}");
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let mut encoded = encode_strings(["hello"]).unwrap().to_vec();
        encoded.pop();
        assert!(matches!(decode_strings(&encoded), Err(Error::Decode(_))));
    }

    #[test]
    fn uses_full_four_byte_prefix() {
        let long = "x".repeat(300);
        let encoded = encode_strings([long.as_str()]).unwrap();
        assert_eq!(&encoded[..4], &300u32.to_le_bytes());
        assert_eq!(decode_utf8_strings(&encoded).unwrap(), vec![long]);
    }

    #[test]
    fn invalid_utf8_is_rejected_only_by_utf8_decoder() {
        let encoded = encode_strings([&[0xffu8, 0xfe][..]]).unwrap();
        assert_eq!(decode_strings(&encoded).unwrap(), vec![vec![0xff, 0xfe]]);
        assert!(matches!(decode_utf8_strings(&encoded), Err(Error::Decode(_))));
    }
}
