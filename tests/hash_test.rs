use std::io::Write;

use sha2::{Digest, Sha256};

use lomob::hash::{
    concat_base64, decode_base64, hash_bytes, hash_file, hash_parts, to_base64, to_hex,
};

#[test]
fn hex_and_base64_encodings() {
    let digest = hash_bytes(b"abc");
    assert_eq!(
        to_hex(&digest),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(to_base64(&digest), "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
    assert_eq!(decode_base64(&to_base64(&digest)).unwrap(), digest.to_vec());
}

#[test]
fn decode_base64_rejects_garbage() {
    assert!(decode_base64("not base64 !!!").is_err());
}

#[test]
fn file_hash_matches_buffer_hash() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"the quick brown fox").unwrap();
    f.flush().unwrap();

    assert_eq!(hash_file(f.path()).unwrap(), hash_bytes(b"the quick brown fox"));
}

#[test]
fn windowed_hashes_match_manual_chunking() {
    // 9.5 windows of 1000 bytes: the last one is short
    let data: Vec<u8> = (0..9500u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&data).unwrap();
    f.flush().unwrap();

    let parts = hash_parts(f.path(), 1000).unwrap();
    assert_eq!(parts.len(), 10);

    let expect: Vec<[u8; 32]> =
        data.chunks(1000).map(|c| Sha256::digest(c).into()).collect();
    assert_eq!(parts, expect);

    // whole-file digest equals the single-window case
    assert_eq!(hash_parts(f.path(), 1 << 20).unwrap(), vec![hash_file(f.path()).unwrap()]);
}

#[test]
fn empty_file_has_no_parts() {
    let f = tempfile::NamedTempFile::new().unwrap();
    assert!(hash_parts(f.path(), 1000).unwrap().is_empty());
}

#[test]
fn concat_digest_matches_known_vector() {
    // checksum-of-checksums over two known part digests
    let parts: Vec<[u8; 32]> = [
        "lzeb6gPr4raiM1LG0ZNF2OOtdoUCRu+6ewNA0Qir4sI=",
        "lZh9FyuGrF/0Vbw8CBtSFVMX04SgRnLbrPX9BYpQRNg=",
    ]
    .iter()
    .map(|p| decode_base64(p).unwrap().try_into().unwrap())
    .collect();

    assert_eq!(concat_base64(&parts), "NnO4DPqD+RLUyOycER1BKbzMv6+APV72KGFvLBNay8c=");
}

#[test]
fn concat_digest_is_hash_of_raw_concatenation() {
    let a = hash_bytes(b"first");
    let b = hash_bytes(b"second");

    let mut h = Sha256::new();
    h.update(a);
    h.update(b);
    let expect: [u8; 32] = h.finalize().into();

    assert_eq!(concat_base64(&[a, b]), to_base64(&expect));
}
