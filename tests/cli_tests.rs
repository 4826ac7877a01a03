//! End-to-end tests for the classflow binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn classflow() -> Command {
    Command::cargo_bin("classflow").unwrap()
}

/// Minimal classfile: public class `pkg/Demo` with one public static
/// method `run()I` whose body is `iconst_1; ireturn`.
fn demo_class_bytes() -> Vec<u8> {
    let mut out = Vec::new();
    let u16 = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_be_bytes());
    let u32 = |out: &mut Vec<u8>, v: u32| out.extend_from_slice(&v.to_be_bytes());
    let utf8 = |out: &mut Vec<u8>, s: &str| {
        out.push(1);
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
    };

    u32(&mut out, 0xCAFE_BABE);
    u16(&mut out, 0); // minor
    u16(&mut out, 52); // major
    u16(&mut out, 8); // constant pool count
    utf8(&mut out, "pkg/Demo"); // 1
    out.push(7);
    u16(&mut out, 1); // 2: Class -> #1
    utf8(&mut out, "java/lang/Object"); // 3
    out.push(7);
    u16(&mut out, 3); // 4: Class -> #3
    utf8(&mut out, "run"); // 5
    utf8(&mut out, "()I"); // 6
    utf8(&mut out, "Code"); // 7
    u16(&mut out, 0x0021); // access
    u16(&mut out, 2); // this
    u16(&mut out, 4); // super
    u16(&mut out, 0); // interfaces
    u16(&mut out, 0); // fields
    u16(&mut out, 1); // methods
    u16(&mut out, 0x0009); // public static
    u16(&mut out, 5); // name
    u16(&mut out, 6); // descriptor
    u16(&mut out, 1); // attribute count
    u16(&mut out, 7); // "Code"
    u32(&mut out, 14); // attribute length
    u16(&mut out, 1); // max_stack
    u16(&mut out, 0); // max_locals
    u32(&mut out, 2); // code length
    out.extend_from_slice(&[0x04, 0xac]); // iconst_1; ireturn
    u16(&mut out, 0); // exception handlers
    u16(&mut out, 0); // code attributes
    u16(&mut out, 0); // class attributes
    out
}

#[test]
fn test_missing_entry_classes_is_a_usage_error() {
    classflow()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_flag_is_a_usage_error() {
    classflow()
        .arg("--frobnicate")
        .arg("pkg.Demo")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--frobnicate"));
}

#[test]
fn test_unresolvable_class_is_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.xml");
    classflow()
        .arg("-o")
        .arg(&out)
        .arg("no.such.Class")
        .assert()
        .success();
    let text = fs::read_to_string(&out).unwrap();
    assert!(text.contains("<classflow/>"));
}

#[test]
fn test_double_dash_ends_flag_parsing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.xml");
    classflow()
        .arg("-o")
        .arg(&out)
        .arg("--")
        .arg("--odd.Name")
        .assert()
        .success();
    assert!(out.exists());
}

#[test]
fn test_unwritable_output_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("missing-subdir").join("out.xml");
    classflow()
        .arg("-o")
        .arg(&out)
        .arg("no.such.Class")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to write"));
}

#[test]
fn test_analyses_class_from_directory_classpath() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = dir.path().join("pkg");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("Demo.class"), demo_class_bytes()).unwrap();
    let out = dir.path().join("out.xml");

    classflow()
        .arg("-p")
        .arg(dir.path())
        .arg("-o")
        .arg(&out)
        .arg("pkg.Demo")
        .assert()
        .success();

    let text = fs::read_to_string(&out).unwrap();
    assert!(text.contains("<method id=\"java:pkg.Demo.run[()I]\">"));
    // iconst_1 and ireturn, with the literal attached
    assert!(text.contains("opcode=\"4\""));
    assert!(text.contains("opcode=\"172\""));
    assert!(text.contains("value=\"raw:1\""));
    assert!(text.contains("value-of"));
}

#[test]
fn test_colon_separated_classpath_entries() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let pkg = second.path().join("pkg");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("Demo.class"), demo_class_bytes()).unwrap();
    let out = second.path().join("out.xml");

    let entries = format!("{}:{}", first.path().display(), second.path().display());
    classflow()
        .arg("--classpath")
        .arg(&entries)
        .arg("-o")
        .arg(&out)
        .arg("pkg/Demo")
        .assert()
        .success();
    let text = fs::read_to_string(&out).unwrap();
    assert!(text.contains("java:pkg.Demo.run[()I]"));
}
