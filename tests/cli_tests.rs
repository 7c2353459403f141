use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn phatbak(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_phatbak"))
        .args(args)
        .current_dir(cwd)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run phatbak")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_cli_create_list_extract() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    let repo = repo.to_str().unwrap();
    let live = tmp.path().join("live");
    fs::create_dir(&live).unwrap();
    fs::write(live.join("hello.txt"), "hello world").unwrap();

    let output = phatbak(&["init", repo], tmp.path());
    assert!(output.status.success(), "init failed: {:?}", output);

    let target = format!("{repo}::2024_02_03_0405_06");
    let output = phatbak(&["create", "--chunk-size", "4", &target, "live"], tmp.path());
    assert!(output.status.success(), "create failed: {:?}", output);
    assert!(stdout(&output).contains("Created archive 2024_02_03_0405_06"));

    let output = phatbak(&["list", repo], tmp.path());
    assert_eq!(stdout(&output).trim(), format!("{repo}::2024_02_03_0405_06"));

    let output = phatbak(&["latest", repo], tmp.path());
    assert_eq!(stdout(&output).trim(), "2024_02_03_0405_06");

    let output = phatbak(&["list", &target], tmp.path());
    assert!(stdout(&output)
        .lines()
        .any(|l| l == live.join("hello.txt").to_str().unwrap()));

    let output = phatbak(&["extract", "--target", "restored", repo], tmp.path());
    assert!(output.status.success(), "extract failed: {:?}", output);
    let restored = tmp
        .path()
        .join("restored")
        .join(live.join("hello.txt").strip_prefix("/").unwrap());
    assert_eq!(fs::read_to_string(restored).unwrap(), "hello world");

    let output = phatbak(&["extract", "--target", "restored", repo], tmp.path());
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error"));
}

#[test]
fn test_cli_json_summary_and_test_mode() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    let repo = repo.to_str().unwrap();
    let live = tmp.path().join("live");
    fs::create_dir(&live).unwrap();
    fs::write(live.join("data"), vec![3u8; 100]).unwrap();

    assert!(phatbak(&["init", repo], tmp.path()).status.success());
    let output = phatbak(&["--json", "create", "--rebase", repo, "live"], tmp.path());
    assert!(output.status.success(), "create failed: {:?}", output);
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["files"], 1);
    assert!(summary["base"].is_null());

    let output = phatbak(&["test", repo], tmp.path());
    assert!(output.status.success(), "test failed: {:?}", output);
    assert!(stdout(&output).contains("is valid"));

    let output = phatbak(&["compare", repo, "live"], tmp.path());
    assert!(output.status.success(), "compare failed: {:?}", output);
}

#[test]
fn test_cli_missing_repository() {
    let tmp = TempDir::new().unwrap();
    let output = phatbak(&["latest", "no-such-repo"], tmp.path());
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error"));
}
