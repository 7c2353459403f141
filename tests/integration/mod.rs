//! Integration tests for create and extract scenarios

use crate::common::{Harness, CHUNK};
use ::phatbak::compression::CompFlag;
use ::phatbak::record::{render_descriptors, ChunkDescriptor, DescriptorRef};
use ::phatbak::extract::{ChunkHook, ChunkStage};
use ::phatbak::*;
use filetime::FileTime;
use parking_lot::Mutex;
use rand::Rng;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn record<'a>(records: &'a [ListRecord], path: &Path) -> &'a ListRecord {
    records
        .iter()
        .find(|r| r.name == path.to_str().unwrap())
        .unwrap_or_else(|| panic!("no record for {:?}", path))
}

#[test]
fn test_three_chunk_file_layout() {
    let h = Harness::new();
    let file = h.live.join("abc");
    fs::write(&file, b"AAAABBBBCC").unwrap();
    h.create("a", BaseSelection::Rebase, 1);

    let reader = h.reader("a");
    let records = reader.records().unwrap();
    let rec = record(&records, &file);
    assert_eq!(rec.size, 10);
    assert_eq!(rec.content, Some(DescriptorRef::block(CompFlag::Uncompressed, 0)));

    let expected: Vec<ChunkDescriptor> = [&b"AAAA"[..], b"BBBB", b"CC"]
        .iter()
        .enumerate()
        .map(|(i, data)| ChunkDescriptor {
            flag: CompFlag::Uncompressed,
            block: i as u64,
            hash: HashType::Md5.digest(data),
        })
        .collect();
    let stored = fs::read_to_string(reader.finfo().path(0)).unwrap();
    assert_eq!(stored, render_descriptors(&expected));

    assert_eq!(fs::read(reader.chunks().path(0)).unwrap(), b"AAAA");
    assert_eq!(fs::read(reader.chunks().path(1)).unwrap(), b"BBBB");
    assert_eq!(fs::read(reader.chunks().path(2)).unwrap(), b"CC");
}

#[test]
fn test_list_lines_are_parseable_text() {
    let h = Harness::new();
    fs::write(h.live.join("f"), b"data").unwrap();
    std::os::unix::fs::symlink("f", h.live.join("l")).unwrap();
    h.create("a", BaseSelection::Rebase, 2);

    let list = fs::read_to_string(h.repo.layout("a").list()).unwrap();
    let link_line = list
        .lines()
        .find(|l| l.starts_with(h.live.join("l").to_str().unwrap()))
        .unwrap();
    assert!(link_line.ends_with("slink>f"));
    assert_eq!(list.lines().count(), h.reader("a").records().unwrap().len());
}

#[test]
fn test_unchanged_tree_writes_nothing_new() {
    let h = Harness::new();
    fs::create_dir(h.live.join("d")).unwrap();
    fs::write(h.live.join("d/one"), b"0123456789").unwrap();
    fs::write(h.live.join("two"), vec![7u8; 33]).unwrap();
    let first = h.create("a", BaseSelection::Rebase, 3);
    let second = h.create("b", BaseSelection::Named("a".into()), 3);

    assert_eq!(second.chunks_written, 0);
    assert_eq!(second.descriptors_written, 0);
    assert_eq!(second.chunks_linked, first.chunks_written);
    assert_eq!(second.unchanged_files, 2);

    let chunks = Harness::block_files(&h.repo.layout("b").chunks_dir());
    assert_eq!(chunks.len() as u64, first.chunks_written);
    for block in chunks.iter().chain(&Harness::block_files(&h.repo.layout("b").finfo_dir())) {
        assert_eq!(fs::metadata(block).unwrap().nlink(), 2, "{:?}", block);
    }
}

#[test]
fn test_partial_change_rewrites_one_chunk() {
    let h = Harness::new();
    let file = h.live.join("big");
    let mut content: Vec<u8> = (0..40u8).collect();
    fs::write(&file, &content).unwrap();
    h.create("a", BaseSelection::Rebase, 4);

    content[21] = 0xff;
    fs::write(&file, &content).unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_800_000_000, 0)).unwrap();
    let second = h.create("b", BaseSelection::Named("a".into()), 4);
    assert_eq!(second.chunks_written, 1);
    assert_eq!(second.chunks_linked, 9);
    assert_eq!(second.descriptors_written, 1);
    assert_eq!(second.descriptors_linked, 0);

    assert_eq!(fs::read(h.extract("b", 4).join("big")).unwrap(), content);
    let original: Vec<u8> = (0..40u8).collect();
    assert_eq!(fs::read(h.extract("a", 4).join("big")).unwrap(), original);
}

#[test]
fn test_growing_file_gets_new_descriptor() {
    let h = Harness::new();
    let file = h.live.join("grow");
    fs::write(&file, b"AAAABBBB").unwrap();
    h.create("a", BaseSelection::Rebase, 2);

    fs::write(&file, b"AAAABBBBCCCC").unwrap();
    let second = h.create("b", BaseSelection::Named("a".into()), 2);
    assert_eq!(second.chunks_linked, 2);
    assert_eq!(second.chunks_written, 1);
    assert_eq!(second.descriptors_written, 1);
    assert_eq!(fs::read(h.extract("b", 2).join("grow")).unwrap(), b"AAAABBBBCCCC");
}

#[test]
fn test_chain_of_three_archives() {
    let h = Harness::new();
    let file = h.live.join("f");
    fs::write(&file, b"version one!").unwrap();
    h.create("2024_01_01_0000_00", BaseSelection::Rebase, 2);
    fs::write(&file, b"version two!").unwrap();
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    h.create("2024_01_02_0000_00", BaseSelection::Latest, 2);
    fs::write(h.live.join("g"), b"new").unwrap();
    let third = h.create("2024_01_03_0000_00", BaseSelection::Latest, 2);

    assert_eq!(third.base.as_deref(), Some("2024_01_02_0000_00"));
    assert_eq!(third.unchanged_files, 1);
    let out = h.extract("2024_01_03_0000_00", 2);
    assert_eq!(fs::read(out.join("f")).unwrap(), b"version two!");
    assert_eq!(fs::read(out.join("g")).unwrap(), b"new");
}

#[test]
fn test_round_trip_preserves_tree() {
    let h = Harness::new();
    let live = &h.live;
    fs::create_dir_all(live.join("a/b/c")).unwrap();
    fs::write(live.join("a/b/c/deep"), b"deep content here").unwrap();
    fs::write(live.join("a/exec"), b"#!/bin/sh\n").unwrap();
    fs::set_permissions(live.join("a/exec"), fs::Permissions::from_mode(0o750)).unwrap();
    fs::write(live.join("empty"), b"").unwrap();
    fs::write(live.join("hl1"), b"shared by two names").unwrap();
    fs::hard_link(live.join("hl1"), live.join("a/hl2")).unwrap();
    std::os::unix::fs::symlink("a/b/c/deep", live.join("rel-link")).unwrap();
    std::os::unix::fs::symlink("/nonexistent/target", live.join("dangling")).unwrap();
    phatbak::attrs::make_fifo(&live.join("pipe"), 0o600).unwrap();
    fs::set_permissions(live.join("a/b"), fs::Permissions::from_mode(0o700)).unwrap();
    for (i, path) in ["a/b/c/deep", "a/b/c", "a/b", "a", "hl1"].iter().enumerate() {
        let when = FileTime::from_unix_time(1_600_000_000 + i as i64 * 1000, 123_000);
        filetime::set_symlink_file_times(live.join(path), when, when).unwrap();
    }
    filetime::set_file_mtime(live, FileTime::from_unix_time(1_650_000_000, 0)).unwrap();

    h.create("a", BaseSelection::Rebase, 4);
    let out = h.extract("a", 4);

    assert_eq!(fs::read(out.join("a/b/c/deep")).unwrap(), b"deep content here");
    assert_eq!(
        fs::metadata(out.join("a/exec")).unwrap().permissions().mode() & 0o7777,
        0o750
    );
    assert_eq!(
        fs::metadata(out.join("hl1")).unwrap().ino(),
        fs::metadata(out.join("a/hl2")).unwrap().ino()
    );
    assert_eq!(fs::read_link(out.join("dangling")).unwrap(), Path::new("/nonexistent/target"));

    let config = h.config(1);
    let reader = h.repo.open_archive(Some("a"), &config).unwrap();
    let report = Comparator::new(reader)
        .with_root(h.tmp.path().join("out-a"))
        .with_filters(vec![h.live.clone()])
        .compare()
        .unwrap();
    assert!(report.is_identical(), "{:?}", report.differences);
}

#[test]
fn test_writes_stay_in_chunk_order_under_random_delays() {
    let h = Harness::new();
    let mut rng = rand::rng();
    let content: Vec<u8> = (0..64 * CHUNK).map(|_| rng.random()).collect();
    fs::write(h.live.join("big"), &content).unwrap();
    h.create("a", BaseSelection::Rebase, 8);

    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    let hook: ChunkHook = Arc::new(move |k: usize, stage: ChunkStage| match stage {
        ChunkStage::Decode => {
            let ms = rand::rng().random_range(0..4);
            std::thread::sleep(Duration::from_millis(ms));
        }
        ChunkStage::Write => log.lock().push(k),
    });
    h.extractor("a", 8).with_chunk_hook(hook).run().unwrap();

    assert_eq!(fs::read(h.restored("a").join("big")).unwrap(), content);
    assert_eq!(*order.lock(), (0..64).collect::<Vec<usize>>());
}

#[test]
fn test_thread_count_does_not_change_archive_content() {
    let h = Harness::new();
    let mut rng = rand::rng();
    for i in 0..12 {
        let len = rng.random_range(0..100);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        fs::write(h.live.join(format!("f{i}")), data).unwrap();
    }
    h.create("one", BaseSelection::Rebase, 1);
    h.create("many", BaseSelection::Rebase, 8);

    let one = h.extract("one", 1);
    let many = h.extract("many", 8);
    for i in 0..12 {
        let name = format!("f{i}");
        assert_eq!(fs::read(one.join(&name)).unwrap(), fs::read(many.join(&name)).unwrap());
    }
}

#[test]
fn test_compressible_chunks_are_stored_compressed() {
    let h = Harness::new();
    let config = Config::builder()
        .chunk_size(4096)
        .threads(2)
        .compression(CompressionType::Zstd)
        .file_args([h.live.to_str().unwrap()])
        .build()
        .unwrap();
    fs::write(h.live.join("zeros"), vec![0u8; 10_000]).unwrap();
    let summary = h.create_with(&config, "a", BaseSelection::Rebase);
    assert_eq!(summary.chunks_written, 3);
    assert!(summary.compression.blocks_compressed >= 2);

    let reader = h.reader("a");
    for block in Harness::block_files(&h.repo.layout("a").chunks_dir()) {
        assert!(fs::metadata(block).unwrap().len() < 4096);
    }
    let out = h.extract("a", 2);
    assert_eq!(fs::read(out.join("zeros")).unwrap(), vec![0u8; 10_000]);
    assert_eq!(reader.config().chunk_size, 4096);
}
