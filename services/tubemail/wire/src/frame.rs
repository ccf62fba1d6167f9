//! Block framing for the wire protocol.
//!
//! A byte stream is cut into blocks, each prefixed by its length. The framer
//! is agnostic of what the block carries; message semantics live in
//! [`crate::message`].

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum block size accepted by default (16 MiB)
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Most the decoder reserves ahead of bytes actually received
const MAX_RESERVE: usize = 64 * 1024;

/// Encode one block from an ordered list of fragments.
///
/// The fragments are concatenated logically: the length prefix covers all of
/// them and the result is a single contiguous buffer ready for one write.
pub fn encode_block<B: AsRef<[u8]>>(fragments: &[B]) -> Result<Bytes, WireError> {
    let len: usize = fragments.iter().map(|f| f.as_ref().len()).sum();
    if len > u32::MAX as usize {
        return Err(WireError::Size(len));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len);
    buf.put_u32(len as u32);
    for fragment in fragments {
        buf.put_slice(fragment.as_ref());
    }

    Ok(buf.freeze())
}

/// Block decoder for reassembling incoming blocks
#[derive(Debug)]
pub struct BlockDecoder {
    max_block_size: usize,
}

impl BlockDecoder {
    /// Create a new block decoder
    pub fn new() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }

    /// Create a decoder with a custom block size limit
    pub fn with_max_block_size(max_block_size: usize) -> Self {
        Self { max_block_size }
    }

    /// Decode one block from a buffer.
    ///
    /// Returns `Ok(None)` until a complete `length + payload` unit is
    /// buffered. Consumed bytes are removed from `buf`; any trailing bytes of
    /// the next block stay in place for the following call.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at block length
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_block_size {
            return Err(WireError::Size(len));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + len {
            buf.reserve((LENGTH_PREFIX_SIZE + len - buf.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

impl Default for BlockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(block: &[u8]) -> Bytes {
        encode_block(&[block]).unwrap()
    }

    /// Feed `stream` in chunks of `chunk` bytes and collect every emitted block.
    fn reassemble(stream: &[u8], chunk: usize) -> Vec<Bytes> {
        let mut decoder = BlockDecoder::new();
        let mut buf = BytesMut::new();
        let mut blocks = Vec::new();
        for piece in stream.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(block) = decoder.decode(&mut buf).unwrap() {
                blocks.push(block);
            }
        }
        assert!(buf.is_empty());
        blocks
    }

    #[test]
    fn test_length_header_does_not_preallocate_block() {
        let mut decoder = BlockDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(DEFAULT_MAX_BLOCK_SIZE as u32).to_be_bytes());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.capacity() <= 2 * (LENGTH_PREFIX_SIZE + MAX_RESERVE));

        // The block still completes once its bytes arrive
        let mut decoder = BlockDecoder::new();
        let payload = vec![7u8; 3 * MAX_RESERVE];
        let encoded = framed(&payload);
        let mut buf = BytesMut::new();
        let mut block = None;
        for piece in encoded.chunks(1000) {
            buf.extend_from_slice(piece);
            if let Some(b) = decoder.decode(&mut buf).unwrap() {
                block = Some(b);
            }
        }
        assert_eq!(block.unwrap(), Bytes::from(payload));
    }

    #[test]
    fn test_encode_single_block() {
        let block = [b'a'; 64];
        let encoded = framed(&block);
        assert_eq!(&encoded[..4], &64u32.to_be_bytes());
        assert_eq!(&encoded[4..], &block[..]);
    }

    #[test]
    fn test_encode_fragments() {
        let block = [b'a'; 64];
        let encoded = encode_block(&[&block[..], &block[..]]).unwrap();
        assert_eq!(&encoded[..4], &128u32.to_be_bytes());
        assert_eq!(encoded.len(), 4 + 128);
    }

    #[test]
    fn test_decode_whole_block() {
        let blocks = reassemble(&framed(b"hello world"), usize::MAX);
        assert_eq!(blocks, vec![Bytes::from_static(b"hello world")]);
    }

    #[test]
    fn test_decode_split_inside_length_field() {
        let stream = framed(&[0x2a; 64]);
        let mut decoder = BlockDecoder::new();
        let mut buf = BytesMut::from(&stream[..2]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&stream[2..8]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&stream[8..]);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().as_ref(), &[0x2a; 64][..]);
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let block = vec![7u8; 300];
        assert_eq!(reassemble(&framed(&block), 1), vec![Bytes::from(block)]);
    }

    #[test]
    fn test_decode_two_blocks_in_one_chunk() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&framed(b"first"));
        stream.extend_from_slice(&framed(b""));
        stream.extend_from_slice(&framed(b"third"));

        let blocks = reassemble(&stream, usize::MAX);
        assert_eq!(
            blocks,
            vec![
                Bytes::from_static(b"first"),
                Bytes::new(),
                Bytes::from_static(b"third")
            ]
        );
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let payloads: Vec<Vec<u8>> = (0..12u8).map(|i| vec![i; i as usize * 17]).collect();
        let mut stream = BytesMut::new();
        for payload in &payloads {
            let (head, tail) = payload.split_at(3.min(payload.len()));
            stream.extend_from_slice(&encode_block(&[head, tail]).unwrap());
        }

        let expected: Vec<Bytes> = payloads.into_iter().map(Bytes::from).collect();
        for chunk in [1, 2, 3, 4, 5, 7, 64, 1000, usize::MAX] {
            assert_eq!(reassemble(&stream, chunk), expected, "chunk size {}", chunk);
        }
    }

    #[test]
    fn test_reject_oversized_block() {
        let mut decoder = BlockDecoder::with_max_block_size(8);
        let mut buf = BytesMut::from(&framed(&[0u8; 9])[..]);
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(9))));
    }
}
