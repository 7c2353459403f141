//! Chaos tests: archives damaged after they were written
//!
//! Extraction must refuse damaged content, while test mode must keep going
//! and report every problem it finds.

use crate::common::Harness;
use ::phatbak::compression::CompFlag;
use ::phatbak::record::{render_descriptors, ChunkDescriptor};
use ::phatbak::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

/// Archive "a" holding one file of three chunks at Chunks/0..2 and FInfo/0
fn damaged_fixture() -> Harness {
    let h = Harness::new();
    fs::write(h.live.join("abc"), b"AAAABBBBCC").unwrap();
    h.create("a", BaseSelection::Rebase, 1);
    h
}

fn verify(h: &Harness) -> VerificationReport {
    ArchiveVerifier::new(h.reader("a"), Arc::new(TaskScheduler::new(2).unwrap()))
        .verify()
        .unwrap()
}

#[test]
fn test_corrupted_chunk_fails_extract() {
    for threads in [1, 4] {
        let h = damaged_fixture();
        fs::write(h.reader("a").chunks().path(1), b"BxBB").unwrap();

        let err = h.extractor("a", threads).run().unwrap_err();
        assert!(err.is_integrity(), "threads {}: {}", threads, err);
    }
}

#[test]
fn test_corrupted_chunk_is_a_warning_in_test_mode() {
    let h = damaged_fixture();
    fs::write(h.reader("a").chunks().path(1), b"BxBB").unwrap();

    let report = verify(&h);
    assert_eq!(report.hash_mismatches, 1);
    assert_eq!(report.chunks_checked, 3);
    assert!(report.missing_blocks.is_empty());
    assert!(!report.is_valid());
}

#[test]
fn test_garbage_list_line_is_a_format_error() {
    let h = damaged_fixture();
    let mut list = OpenOptions::new()
        .append(true)
        .open(h.repo.layout("a").list())
        .unwrap();
    writeln!(list, "this line has no separator").unwrap();
    drop(list);

    let err = h.extractor("a", 2).run().unwrap_err();
    assert!(matches!(err, PhatError::Format { line: Some(_), .. }), "{}", err);
    assert!(err.is_fatal());

    let err = ArchiveVerifier::new(h.reader("a"), Arc::new(TaskScheduler::new(2).unwrap()))
        .verify()
        .unwrap_err();
    assert!(matches!(err, PhatError::Format { .. }));
}

#[test]
fn test_garbage_descriptor_block() {
    let h = damaged_fixture();
    fs::write(h.reader("a").finfo().path(0), b"X-0 not a descriptor\n").unwrap();

    let err = h.extractor("a", 2).run().unwrap_err();
    assert!(matches!(err, PhatError::Format { .. }), "{}", err);

    let report = verify(&h);
    assert_eq!(report.chunks_checked, 0);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.unused_blocks.len(), 3);
}

#[test]
fn test_missing_chunk_block() {
    let h = damaged_fixture();
    fs::remove_file(h.reader("a").chunks().path(2)).unwrap();

    let err = h.extractor("a", 1).run().unwrap_err();
    assert!(matches!(err, PhatError::FileIo { .. }), "{}", err);

    let report = verify(&h);
    assert_eq!(report.missing_blocks.len(), 1);
    assert_eq!(report.missing_blocks[0].index, 2);
}

#[test]
fn test_short_inner_chunk_is_rejected() {
    let h = damaged_fixture();
    let reader = h.reader("a");
    fs::write(reader.chunks().path(0), b"AA").unwrap();
    let chunks = vec![
        ChunkDescriptor {
            flag: CompFlag::Uncompressed,
            block: 0,
            hash: HashType::Md5.digest(b"AA"),
        },
        ChunkDescriptor {
            flag: CompFlag::Uncompressed,
            block: 1,
            hash: HashType::Md5.digest(b"BBBB"),
        },
        ChunkDescriptor {
            flag: CompFlag::Uncompressed,
            block: 2,
            hash: HashType::Md5.digest(b"CC"),
        },
    ];
    fs::write(reader.finfo().path(0), render_descriptors(&chunks)).unwrap();

    let err = h.extractor("a", 1).run().unwrap_err();
    assert!(matches!(err, PhatError::Format { .. }), "{}", err);
    assert!(verify(&h).is_valid());
}

#[test]
fn test_random_block_damage_never_extracts_bad_content() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..8 {
        let h = Harness::new();
        let content: Vec<u8> = (0..64).map(|_| rng.random()).collect();
        fs::write(h.live.join("f"), &content).unwrap();
        h.create("a", BaseSelection::Rebase, 2);

        let blocks = Harness::block_files(&h.repo.layout("a").chunks_dir());
        let victim = &blocks[rng.random_range(0..blocks.len())];
        let mut bytes = fs::read(victim).unwrap();
        let at = rng.random_range(0..bytes.len());
        bytes[at] ^= 0x55;
        fs::write(victim, &bytes).unwrap();

        assert!(h.extractor("a", 3).run().is_err());
        assert_eq!(verify(&h).hash_mismatches, 1);
    }
}
