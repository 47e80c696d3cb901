use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Non-empty lines allowed in any checked file.
const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "md", "yaml", "toml"];

/// `examples/` is a read-only reference tree, not part of this crate.
const SKIPPED_DIRS: &[&str] = &["target", ".git", "examples"];

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");
    println!("cargo:rerun-if-changed=.git/packed-refs");

    let sha = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=INSTALL_SESSIOND_GIT_SHA={}", sha);

    let timestamp = git(&["show", "-s", "--format=%ct", "HEAD"])
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    println!("cargo:rustc-env=INSTALL_SESSIOND_BUILD_TIMESTAMP={}", timestamp);

    let root = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()));
    let mut files = Vec::new();
    walk(&root, &mut files);

    let mut problems = Vec::new();
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
        let Ok(content) = fs::read_to_string(file) else {
            continue;
        };
        let rel = file.strip_prefix(&root).unwrap_or(file).display().to_string();
        check_length(&rel, &content, &mut problems);
        if file.extension().and_then(|e| e.to_str()) == Some("rs") && !rel.ends_with("build.rs") {
            check_source(&rel, &content, &mut problems);
        }
    }

    if !problems.is_empty() {
        panic!(
            "\n\nSource guard failed ({} problem(s)):\n{}\n",
            problems.len(),
            problems.join("\n")
        );
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if !SKIPPED_DIRS.contains(&name.as_str()) {
                walk(&path, out);
            }
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| CHECKED_EXTENSIONS.contains(&ext))
            && name != "Cargo.lock"
        {
            out.push(path);
        }
    }
}

fn check_length(rel: &str, content: &str, problems: &mut Vec<String>) {
    let lines = content.lines().filter(|l| !l.trim().is_empty()).count();
    if lines > MAX_LINES {
        problems.push(format!(
            "  {}: {} non-empty lines (limit {}); split the module",
            rel, lines, MAX_LINES
        ));
    }
}

/// Source rules:
/// - no `#[allow(dead_code)]`: delete unused code instead;
/// - tests that touch process env must be `#[serial]`;
/// - tests run on `#[tokio::test]`, never a hand-built runtime;
/// - tests never bail out early with a bare `return;`.
fn check_source(rel: &str, content: &str, problems: &mut Vec<String>) {
    let lines: Vec<&str> = content.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        if line.replace(' ', "").contains("#[allow(dead_code)]") {
            problems.push(format!("  {}:{}: #[allow(dead_code)]", rel, i + 1));
        }
    }

    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed != "#[test]" && !trimmed.starts_with("#[tokio::test") {
            i += 1;
            continue;
        }

        // Attributes may sit on either side of the test attribute.
        let mut attrs_start = i;
        while attrs_start > 0 && lines[attrs_start - 1].trim().starts_with("#[") {
            attrs_start -= 1;
        }
        let Some(fn_line) = (i..lines.len()).find(|&j| lines[j].contains("fn ")) else {
            break;
        };
        let serial = lines[attrs_start..fn_line]
            .iter()
            .any(|l| matches!(l.trim(), "#[serial]" | "#[serial_test::serial]"));
        let end = body_end(&lines, fn_line);
        let name = test_name(lines[fn_line]);

        for (offset, body_line) in lines[fn_line..=end].iter().enumerate() {
            let at = format!("  {}:{} ({})", rel, fn_line + offset + 1, name);
            let code = body_line.trim();
            if (code.contains("set_var(") || code.contains("remove_var(")) && !serial {
                problems.push(format!("{}: env mutation without #[serial]", at));
            }
            if code.contains("Runtime::new(") || code.contains("runtime::Builder") {
                problems.push(format!("{}: builds its own runtime; use #[tokio::test]", at));
            }
            if code == "return;" {
                problems.push(format!("{}: early return skips assertions", at));
            }
        }
        i = end + 1;
    }
}

/// Index of the line closing the item that opens on `start`.
fn body_end(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i32;
    let mut opened = false;
    for (j, line) in lines.iter().enumerate().skip(start) {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return j;
        }
    }
    lines.len().saturating_sub(1)
}

fn test_name(line: &str) -> String {
    line.split("fn ")
        .nth(1)
        .and_then(|rest| rest.split('(').next())
        .unwrap_or("?")
        .trim()
        .to_string()
}
