use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use proptest::prelude::*;
use sha2::{Digest, Sha256};

use lomob::crypto::{
    decrypt_file, derive_key, encrypt_file, random_salt, salt_from_hex_hash, DecryptingWriter,
    EncryptingReader, MasterDecryptingWriter, SALT_LEN,
};

fn encrypt_all(plaintext: &[u8], passphrase: &str, salt: &[u8; 16], with_header: bool) -> Vec<u8> {
    let key = derive_key(passphrase, salt).unwrap();
    let mut enc =
        EncryptingReader::new(Cursor::new(plaintext.to_vec()), &key, salt, with_header).unwrap();
    let mut out = Vec::new();
    enc.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn single_byte_roundtrip_with_header() {
    let salt = random_salt();
    let out = encrypt_all(b"a", "pw", &salt, true);

    assert_eq!(out.len(), SALT_LEN + 1);
    assert_eq!(&out[..SALT_LEN], &salt);

    let mut plain = Vec::new();
    let mut dec = MasterDecryptingWriter::new(&mut plain, "pw");
    dec.write_all(&out).unwrap();
    dec.flush().unwrap();
    assert_eq!(plain, b"a");
}

#[test]
fn first_read_stops_at_header_boundary() {
    let salt = random_salt();
    let key = derive_key("pw", &salt).unwrap();
    let mut enc =
        EncryptingReader::new(Cursor::new(vec![7u8; 100]), &key, &salt, true).unwrap();
    assert_eq!(enc.size(), 116);

    // a large buffer still yields only the salt on the first call
    let mut buf = [0u8; 128];
    let n = enc.read(&mut buf).unwrap();
    assert_eq!(n, SALT_LEN);
    assert_eq!(&buf[..SALT_LEN], &salt);

    let n = enc.read(&mut buf).unwrap();
    assert_eq!(n, 100);
}

#[test]
fn digests_track_plain_and_cipher_streams() {
    let plaintext = b"some plaintext very very long -----".to_vec();
    let salt = random_salt();
    let key = derive_key("pw", &salt).unwrap();

    let mut enc =
        EncryptingReader::new(Cursor::new(plaintext.clone()), &key, &salt, true).unwrap();
    let mut out = Vec::new();
    enc.read_to_end(&mut out).unwrap();

    let expect_plain: [u8; 32] = Sha256::digest(&plaintext).into();
    let expect_cipher: [u8; 32] = Sha256::digest(&out).into();
    assert_eq!(enc.hash_plain(), expect_plain);
    assert_eq!(enc.hash_cipher(), expect_cipher);

    // without header the cipher digest covers ciphertext only
    let mut enc =
        EncryptingReader::new(Cursor::new(plaintext.clone()), &key, &salt, false).unwrap();
    let mut bare = Vec::new();
    enc.read_to_end(&mut bare).unwrap();
    assert_eq!(&out[SALT_LEN..], &bare[..]);
    let expect_cipher: [u8; 32] = Sha256::digest(&bare).into();
    assert_eq!(enc.hash_cipher(), expect_cipher);
}

#[test]
fn ciphertext_is_not_plaintext() {
    let salt = random_salt();
    let out = encrypt_all(b"some plaintext very very long -----", "pw", &salt, false);
    assert_ne!(out, b"some plaintext very very long -----");
}

#[test]
fn decrypting_writer_inverts_stream() {
    let plaintext = (0u8..200).collect::<Vec<_>>();
    let salt = random_salt();
    let key = derive_key("pw", &salt).unwrap();
    let cipher = encrypt_all(&plaintext, "pw", &salt, false);

    let mut plain = Vec::new();
    let mut dec = DecryptingWriter::new(&mut plain, &key, &salt);
    dec.write_all(&cipher).unwrap();
    dec.flush().unwrap();
    assert_eq!(plain, plaintext);
}

#[test]
fn master_writer_requires_full_salt_header() {
    let mut out = Vec::new();
    let mut dec = MasterDecryptingWriter::new(&mut out, "pw");
    let err = dec.write(&[1u8; SALT_LEN - 1]).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
}

#[test]
fn same_salt_yields_identical_ciphertext() {
    // hash-derived salt, as the encrypted ISO path uses it
    let content = vec![42u8; 4096];
    let hex_hash = hex::encode(Sha256::digest(&content));
    let salt = salt_from_hex_hash(&hex_hash).unwrap();

    let first = encrypt_all(&content, "pw", &salt, true);
    let second = encrypt_all(&content, "pw", &salt, true);
    assert_eq!(first, second);
}

#[test]
fn salt_from_short_hash_is_rejected() {
    assert!(salt_from_hex_hash("abcd").is_err());
}

#[test]
fn seek_reseeds_the_keystream() {
    let plaintext: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let salt = random_salt();
    let key = derive_key("pw", &salt).unwrap();
    let full = encrypt_all(&plaintext, "pw", &salt, true);

    let mut enc =
        EncryptingReader::new(Cursor::new(plaintext.clone()), &key, &salt, true).unwrap();

    // forward into the middle of the ciphertext region
    let mid = 400u64;
    assert_eq!(enc.seek(SeekFrom::Start(mid)).unwrap(), mid);
    let mut rest = Vec::new();
    enc.read_to_end(&mut rest).unwrap();
    assert_eq!(&rest[..], &full[mid as usize..]);

    // back into the salt region
    assert_eq!(enc.seek(SeekFrom::Start(4)).unwrap(), 4);
    let mut buf = [0u8; 4];
    enc.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, &salt[4..8]);

    // clamped past both ends
    assert_eq!(enc.seek(SeekFrom::End(10)).unwrap(), enc.size());
    assert_eq!(enc.seek(SeekFrom::Current(-10_000)).unwrap(), 0);
}

#[test]
fn file_helpers_roundtrip() {
    let plaintext = b"backup me".to_vec();
    let mut cipher = Vec::new();
    encrypt_file(Cursor::new(plaintext.clone()), &mut cipher, "pw").unwrap();
    assert_eq!(cipher.len(), plaintext.len() + SALT_LEN);

    let mut restored = Vec::new();
    decrypt_file(Cursor::new(cipher), &mut restored, "pw").unwrap();
    assert_eq!(restored, plaintext);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn roundtrip_any_payload(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let salt = random_salt();
        let out = encrypt_all(&payload, "prop-pass", &salt, true);
        prop_assert_eq!(out.len(), payload.len() + SALT_LEN);

        let mut plain = Vec::new();
        decrypt_file(Cursor::new(out), &mut plain, "prop-pass").unwrap();
        prop_assert_eq!(plain, payload);
    }
}
