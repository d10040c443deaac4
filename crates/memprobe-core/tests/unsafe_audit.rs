//! Every `unsafe` site in the library is opted in explicitly and documented.

use std::fs;
use std::path::{Path, PathBuf};

fn sources(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            sources(&path, out);
        } else if path.extension().is_some_and(|e| e == "rs") {
            out.push(path);
        }
    }
}

fn library_sources() -> Vec<(PathBuf, String)> {
    let mut paths = Vec::new();
    sources(&Path::new(env!("CARGO_MANIFEST_DIR")).join("src"), &mut paths);
    paths.sort();
    paths
        .into_iter()
        .map(|p| {
            let text = fs::read_to_string(&p).unwrap();
            (p, text)
        })
        .collect()
}

#[test]
fn test_crate_denies_unsafe_by_default() {
    let lib = fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join("src/lib.rs")).unwrap();
    assert!(lib.contains("#![deny(unsafe_code)]"));
}

#[test]
fn test_unsafe_blocks_carry_safety_comments() {
    for (path, text) in library_sources() {
        let lines: Vec<&str> = text.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            let code = line.trim_start();
            if code.starts_with("//") || !(code.contains("unsafe {") || code.starts_with("unsafe impl")) {
                continue;
            }
            let documented = lines[i.saturating_sub(5)..=i]
                .iter()
                .any(|l| l.contains("SAFETY"));
            assert!(documented, "{}:{} has no SAFETY comment", path.display(), i + 1);
        }
    }
}

#[test]
fn test_unsafe_is_opted_in_per_item() {
    for (path, text) in library_sources() {
        let allows = text.matches("#[allow(unsafe_code)]").count();
        let has_unsafe = text
            .lines()
            .any(|l| !l.trim_start().starts_with("//") && l.contains("unsafe "));
        if has_unsafe {
            assert!(allows > 0, "{} uses unsafe without opting in", path.display());
        }
    }
}
