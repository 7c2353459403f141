//! Main test module for PhatBak
//!
//! This module includes all test suites:
//! - Integration tests for create/extract scenarios
//! - Chaos tests for damaged archives
//! - Property-based tests for invariants

pub mod chaos;
pub mod common;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use crate::common::Harness;
    use ::phatbak::*;
    use std::fs;

    #[test]
    fn test_empty_directory() {
        let h = Harness::new();
        let summary = h.create("a", BaseSelection::Rebase, 2);
        assert_eq!(summary.files, 0);
        assert_eq!(summary.chunks_written, 0);

        let out = h.extract("a", 2);
        assert!(out.is_dir());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_special_filenames() {
        let h = Harness::new();
        let names = ["spaces in name", "ünïcödé", "semi;colon", "quote'\"", "gt>sign", "#hash"];
        for name in names {
            fs::write(h.live.join(name), name.as_bytes()).unwrap();
        }
        h.create("a", BaseSelection::Rebase, 2);

        let out = h.extract("a", 2);
        for name in names {
            assert_eq!(fs::read(out.join(name)).unwrap(), name.as_bytes(), "{}", name);
        }
    }

    #[test]
    fn test_file_of_exactly_one_chunk() {
        let h = Harness::new();
        fs::write(h.live.join("four"), b"1234").unwrap();
        let summary = h.create("a", BaseSelection::Rebase, 1);
        assert_eq!(summary.chunks_written, 1);
        assert_eq!(fs::read(h.extract("a", 1).join("four")).unwrap(), b"1234");
    }

    #[test]
    fn test_unfinished_archive_is_not_a_base() {
        let h = Harness::new();
        fs::write(h.live.join("f"), b"abcdefgh").unwrap();
        h.create("2024_01_01_0000_00", BaseSelection::Rebase, 1);
        h.create("2024_01_02_0000_00", BaseSelection::Rebase, 1);
        fs::remove_file(h.repo.layout("2024_01_02_0000_00").finished_marker()).unwrap();

        assert_eq!(
            h.repo.latest_finished().unwrap().as_deref(),
            Some("2024_01_01_0000_00")
        );
        let summary = h.create("2024_01_03_0000_00", BaseSelection::Latest, 1);
        assert_eq!(summary.base.as_deref(), Some("2024_01_01_0000_00"));
        assert_eq!(summary.chunks_written, 0);
    }
}
