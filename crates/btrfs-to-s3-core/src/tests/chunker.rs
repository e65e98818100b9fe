use std::io::{Cursor, Read};

use sha2::{Digest, Sha256};

use crate::chunker::Chunker;

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn drain(body: &mut impl Read) -> Vec<u8> {
    let mut out = Vec::new();
    body.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn empty_stream_yields_no_chunks() {
    let mut chunker = Chunker::new(Cursor::new(Vec::new()), 4).unwrap();
    assert!(chunker.next_chunk().unwrap().is_none());
}

#[test]
fn zero_chunk_size_rejected() {
    assert!(Chunker::new(Cursor::new(vec![1u8]), 0).is_err());
}

#[test]
fn single_short_chunk() {
    let data = b"hello".to_vec();
    let mut chunker = Chunker::new(Cursor::new(data.clone()), 100).unwrap();

    let mut body = chunker.next_chunk().unwrap().unwrap();
    assert_eq!(body.index(), 0);
    assert_eq!(drain(&mut body), data);
    let (size, digest) = body.finish().unwrap();
    assert_eq!(size, 5);
    assert_eq!(digest, sha256_hex(&data));

    assert!(chunker.next_chunk().unwrap().is_none());
}

#[test]
fn exact_multiple_produces_no_empty_trailing_chunk() {
    let data: Vec<u8> = (0..10u8).collect();
    let mut chunker = Chunker::new(Cursor::new(data.clone()), 5).unwrap();

    let mut body = chunker.next_chunk().unwrap().unwrap();
    assert_eq!(drain(&mut body), &data[..5]);
    assert_eq!(body.finish().unwrap(), (5, sha256_hex(&data[..5])));

    let mut body = chunker.next_chunk().unwrap().unwrap();
    assert_eq!(body.index(), 1);
    assert_eq!(drain(&mut body), &data[5..]);
    assert_eq!(body.finish().unwrap(), (5, sha256_hex(&data[5..])));

    assert!(chunker.next_chunk().unwrap().is_none());
}

#[test]
fn final_chunk_may_be_smaller() {
    let data: Vec<u8> = (0..7u8).collect();
    let mut chunker = Chunker::new(Cursor::new(data.clone()), 5).unwrap();

    let mut body = chunker.next_chunk().unwrap().unwrap();
    assert_eq!(drain(&mut body).len(), 5);
    body.finish().unwrap();

    let mut body = chunker.next_chunk().unwrap().unwrap();
    let tail = drain(&mut body);
    assert_eq!(tail, &data[5..]);
    let (size, digest) = body.finish().unwrap();
    assert_eq!(size, 2);
    assert_eq!(digest, sha256_hex(&data[5..]));

    assert!(chunker.next_chunk().unwrap().is_none());
}

#[test]
fn concatenated_chunks_reproduce_the_stream() {
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let mut chunker = Chunker::new(Cursor::new(data.clone()), 4096).unwrap();

    let mut reassembled = Vec::new();
    let mut count = 0u64;
    while let Some(mut body) = chunker.next_chunk().unwrap() {
        assert_eq!(body.index(), count);
        let bytes = drain(&mut body);
        let (size, digest) = body.finish().unwrap();
        assert_eq!(size as usize, bytes.len());
        assert_eq!(digest, sha256_hex(&bytes));
        reassembled.extend_from_slice(&bytes);
        count += 1;
    }
    assert_eq!(reassembled, data);
    assert_eq!(count, 100_000_u64.div_ceil(4096));
}

#[test]
fn finish_requires_full_consumption() {
    let data: Vec<u8> = (0..10u8).collect();
    let mut chunker = Chunker::new(Cursor::new(data), 5).unwrap();

    let mut body = chunker.next_chunk().unwrap().unwrap();
    let mut one = [0u8; 1];
    body.read_exact(&mut one).unwrap();
    assert!(body.finish().is_err());
}

#[test]
fn chunk_reads_are_bounded() {
    let data = vec![0xABu8; 64];
    let mut chunker = Chunker::new(Cursor::new(data), 64).unwrap();
    let mut body = chunker.next_chunk().unwrap().unwrap();

    // First read returns only the probed byte.
    let mut buf = [0u8; 32];
    assert_eq!(body.read(&mut buf).unwrap(), 1);
    // Later reads never exceed the caller's buffer.
    let n = body.read(&mut buf).unwrap();
    assert!(n > 0 && n <= 32);
}
