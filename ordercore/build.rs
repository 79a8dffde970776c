// Fails the ordercore build when a source file silences a lint with an
// `allow` attribute. Findings are fixed at the call site instead.
//
// Set ORDERCORE_LINT_SCAN=off to build without scanning.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SCANNED_DIRS: [&str; 2] = ["src", "tests"];
const SKIPPED_DIRS: [&str; 2] = ["target", ".git"];
const MARKERS: [&str; 2] = ["#[allow", "#![allow"];

struct Suppression {
    file: PathBuf,
    line: usize,
    text: String,
}

fn main() {
    println!("cargo:rerun-if-env-changed=ORDERCORE_LINT_SCAN");
    if env::var("ORDERCORE_LINT_SCAN").is_ok_and(|value| value == "off") {
        return;
    }

    let crate_root =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR"));

    let mut found = Vec::new();
    for dir in SCANNED_DIRS {
        println!("cargo:rerun-if-changed={dir}");
        let root = crate_root.join(dir);
        if root.exists() {
            collect(&root, &mut found);
        }
    }

    if found.is_empty() {
        return;
    }

    eprintln!("ordercore sources suppress lints:");
    for suppression in &found {
        eprintln!(
            "  {}:{}: {}",
            suppression.file.display(),
            suppression.line,
            suppression.text
        );
    }
    panic!("{} lint suppression(s) in ordercore", found.len());
}

fn collect(path: &Path, found: &mut Vec<Suppression>) {
    if path.is_dir() {
        if SKIPPED_DIRS.iter().any(|dir| path.ends_with(dir)) {
            return;
        }
        let entries = fs::read_dir(path).expect("source directory should be readable");
        for entry in entries {
            let entry = entry.expect("directory entry should be readable");
            collect(&entry.path(), found);
        }
        return;
    }

    if path.extension().map_or(true, |ext| ext != "rs") {
        return;
    }
    let Ok(source) = fs::read_to_string(path) else {
        return;
    };
    for (index, line) in source.lines().enumerate() {
        if MARKERS.iter().any(|marker| line.contains(marker)) {
            found.push(Suppression {
                file: path.to_path_buf(),
                line: index + 1,
                text: line.trim().to_owned(),
            });
        }
    }
}
