//! CLI smoke tests against the built binary.

use std::io::Write;
use std::process::Command;

fn write_source(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".can")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn candor() -> Command {
    Command::new(env!("CARGO_BIN_EXE_candor"))
}

#[test]
fn check_reports_semantic_errors_as_json() {
    let file = write_source("break");
    let output = candor()
        .args(["check", "--json"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json = String::from_utf8_lossy(&output.stdout);
    assert!(json.contains("\"status\": \"failure\""), "json: {}", json);
    assert!(json.contains("GEN_003"), "json: {}", json);
    assert!(json.contains("Expected loop"), "json: {}", json);
}

#[test]
fn check_passes_valid_programs() {
    let file = write_source("f(x) { return x } f(7)");
    let output = candor().arg("check").arg(file.path()).output().unwrap();
    assert!(output.status.success());
}

#[test]
fn ast_prints_bracketed_form() {
    let file = write_source("f(x) { return x }");
    let output = candor().arg("ast").arg(file.path()).output().unwrap();
    assert!(output.status.success());
    let printed = String::from_utf8_lossy(&output.stdout);
    assert!(
        printed.contains("[kFunction [kName f] @[[kName x]] [kReturn [kName x]]]"),
        "printed: {}",
        printed
    );
}

#[cfg(target_arch = "x86_64")]
#[test]
fn run_prints_the_result() {
    let file = write_source("return 40 + 2");
    let output = candor().arg("run").arg(file.path()).output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "42");
}

#[cfg(target_arch = "x86_64")]
#[test]
fn run_with_custom_page_size() {
    let file = write_source("i = 0 while (i < 100) { t = [i] i = i + 1 } return i");
    let output = candor()
        .args(["run", "--page-size", "16384"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "100");
}
