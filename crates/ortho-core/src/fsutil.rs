use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| anyhow!("failed to create directory {}: {}", path.display(), e))
}

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written document.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

pub fn load_json_file(path: &Path) -> Result<Value> {
    let bytes =
        fs::read(path).map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| anyhow!("invalid JSON in {}: {}", path.display(), e))
}

/// Recursively copy `src` into `dst`, following symlinks to real files and
/// directories. Broken links are recreated as links.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(anyhow!("not a directory: {}", src.display()));
    }
    ensure_dir(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            match fs::canonicalize(path) {
                Ok(real) if real.is_dir() => copy_dir(&real, &target)?,
                Ok(real) if real.is_file() => {
                    fs::copy(real, &target)?;
                }
                Ok(_) => {}
                Err(_) => {
                    let link_target = fs::read_link(path)?;
                    if target.exists() {
                        let _ = fs::remove_file(&target);
                    }
                    #[cfg(unix)]
                    symlink(&link_target, &target)?;
                }
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "ortho_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn atomic_json_write_leaves_no_temp_files() {
        let dir = scratch("atomic");
        let path = dir.join("state.json");
        atomic_write_json_pretty(&path, &json!({"status": "completed"})).expect("write");
        let back = load_json_file(&path).expect("read");
        assert_eq!(back["status"], "completed");
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn copy_dir_copies_nested_tree() {
        let dir = scratch("copy");
        let src = dir.join("inputs");
        ensure_dir(&src.join("nested")).expect("nested");
        fs::write(src.join("a.txt"), "a").expect("a");
        fs::write(src.join("nested").join("b.txt"), "b").expect("b");
        let dst = dir.join("out").join("inputs");
        copy_dir(&src, &dst).expect("copy");
        assert_eq!(fs::read_to_string(dst.join("a.txt")).expect("read a"), "a");
        assert_eq!(
            fs::read_to_string(dst.join("nested").join("b.txt")).expect("read b"),
            "b"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn copy_dir_rejects_files() {
        let dir = scratch("copy_file");
        let file = dir.join("x.txt");
        fs::write(&file, "x").expect("x");
        assert!(copy_dir(&file, &dir.join("y")).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}
