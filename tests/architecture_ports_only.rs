use std::fs;
use std::path::{Path, PathBuf};

/// Service modules reach storage, chain and bridge only through `ports`
const SERVICE_DIRS: &[&str] = &["src/services", "src/supervisor", "src/coordination"];

const FORBIDDEN: &[&str] = &["crate::adapters", "sqlx::", "reqwest::"];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

#[test]
fn services_depend_on_ports_not_adapters() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    for dir in SERVICE_DIRS {
        collect_rust_files(&repo_root.join(dir), &mut files);
    }
    assert!(!files.is_empty(), "no service sources found");

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("//") {
                continue;
            }
            if FORBIDDEN.iter().any(|needle| trimmed.contains(needle)) {
                offenders.push(format!("{rel}:{}: {}", idx + 1, trimmed));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "service code reaches past the ports:\n{}",
        offenders.join("\n")
    );
}
