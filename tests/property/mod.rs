//! Property-based testing for PhatBak
//!
//! Uses proptest to check the block allocator against a set model, the
//! `List` line codec, and create/extract round trips of random trees.

use crate::common::Harness;
use ::phatbak::block_list::BlockAllocator;
use ::phatbak::compression::CompFlag;
use ::phatbak::record::DescriptorRef;
use ::phatbak::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

/// Operations applied to an allocator and its model
#[derive(Debug, Clone)]
pub enum AllocOp {
    Alloc,
    Free(u64),
    Mark(u64),
}

fn alloc_op_strategy() -> impl Strategy<Value = AllocOp> {
    prop_oneof![
        3 => Just(AllocOp::Alloc),
        2 => (0u64..48).prop_map(AllocOp::Free),
        2 => (0u64..48).prop_map(AllocOp::Mark),
    ]
}

fn check_ranges(alloc: &BlockAllocator, model: &BTreeSet<u64>) {
    let ranges = alloc.ranges();
    for pair in ranges.windows(2) {
        // sorted, disjoint and never adjacent
        assert!(pair[0].max + 1 < pair[1].min, "{:?}", ranges);
    }
    let expanded: BTreeSet<u64> = ranges.iter().flat_map(|r| r.min..=r.max).collect();
    assert_eq!(&expanded, model);
    assert_eq!(alloc.count_allocated(), model.len() as u64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_allocator_matches_set_model(ops in prop::collection::vec(alloc_op_strategy(), 1..200)) {
        let alloc = BlockAllocator::new("Chunks", 100);
        let mut model = BTreeSet::new();

        for op in ops {
            match op {
                AllocOp::Alloc => {
                    let idx = alloc.alloc().unwrap();
                    let lowest_free = (0..).find(|i| !model.contains(i)).unwrap();
                    prop_assert_eq!(idx, lowest_free);
                    model.insert(idx);
                }
                AllocOp::Free(idx) => {
                    let result = alloc.free(idx);
                    prop_assert_eq!(result.is_ok(), model.remove(&idx));
                }
                AllocOp::Mark(idx) => {
                    let result = alloc.mark_allocated(idx);
                    prop_assert_eq!(result.is_ok(), model.insert(idx));
                }
            }
            check_ranges(&alloc, &model);
        }
        for idx in 0..50 {
            prop_assert_eq!(alloc.is_allocated(idx), model.contains(&idx));
        }
    }

    #[test]
    fn prop_shard_path_is_unique(a in 0u64..1_000_000, b in 0u64..1_000_000, modulus in 2u64..200) {
        let alloc = BlockAllocator::new("FInfo", modulus);
        let top = PathBuf::from("/top");
        prop_assume!(a != b);
        prop_assert_ne!(alloc.path_under(&top, a), alloc.path_under(&top, b));
        prop_assert!(alloc.sub_dirs(a).len() as u64 <= 1 + a.checked_ilog(modulus).unwrap_or(0) as u64);
    }
}

fn name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-zA-Z0-9 ._;#'\"%>-]{1,12}", 1..5)
        .prop_map(|parts| format!("/{}", parts.join("/")))
        .prop_filter("separator inside name", |n| !n.contains(record::LIST_SEP))
}

fn record_strategy() -> impl Strategy<Value = ListRecord> {
    (
        name_strategy(),
        prop_oneof![Just(0o100000u32), Just(0o040000), Just(0o120000), Just(0o010000)],
        0u32..0o7777,
        any::<u32>(),
        any::<u32>(),
        any::<u64>(),
        any::<i64>(),
        proptest::option::of("[a-z:0-9,-]{1,20}"),
        proptest::option::of((any::<bool>(), any::<i64>())),
    )
        .prop_map(|(name, kind, perms, uid, gid, size, mtime_ns, acl, content)| {
            let mode = kind | perms;
            let link_target = (kind == 0o120000).then(|| format!("{}-target", name));
            ListRecord {
                name,
                mode,
                uid,
                gid,
                size,
                mtime_ns,
                acl,
                content: content.map(|(compressed, id)| DescriptorRef {
                    flag: if compressed { CompFlag::Compressed } else { CompFlag::Uncompressed },
                    id,
                }),
                link_target,
            }
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_list_line_codec(rec in record_strategy()) {
        let line = rec.to_line();
        prop_assert!(!line.contains('\n'));
        let parsed = ListRecord::parse(&line, "List", 1).unwrap();
        prop_assert_eq!(parsed, rec);
    }
}

/// Random tree: relative path to content
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(
        "[a-c]{1,2}(/[a-c]{1,2}){0,2}\\.f",
        prop::collection::vec(any::<u8>(), 0..40),
        1..12,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_random_tree_round_trip(tree in tree_strategy(), threads in 1usize..6) {
        let h = Harness::new();
        for (rel, content) in &tree {
            let path = h.live.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
        h.create("a", BaseSelection::Rebase, threads);
        let second = h.create("b", BaseSelection::Named("a".into()), threads);
        prop_assert_eq!(second.chunks_written, 0);

        let out = h.extract("b", threads);
        for (rel, content) in &tree {
            prop_assert_eq!(&fs::read(out.join(rel)).unwrap(), content);
        }
    }
}
