use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use sysinfo::Disks;

/// Writes `contents` to a sibling temp file, syncs it, then renames over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = sibling_with_suffix(path, "tmp");
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    rename_replace(&temp_path, path)
}

/// Copies `src` to `dest` through a temp sibling so `dest` is either absent or complete.
pub fn copy_atomic(src: &Path, dest: &Path) -> io::Result<u64> {
    let temp_path = sibling_with_suffix(dest, "tmp");
    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let copied = match copy_synced(src, &temp_path) {
        Ok(copied) => copied,
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }
    };
    if let Err(err) = rename_replace(&temp_path, dest) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    Ok(copied)
}

fn copy_synced(src: &Path, dest: &Path) -> io::Result<u64> {
    let mut input = File::open(src)?;
    let mut output = File::create(dest)?;
    let copied = io::copy(&mut input, &mut output)?;
    output.sync_all()?;
    Ok(copied)
}

/// Rename that overwrites `dest`. Falls back to remove-then-rename where the
/// platform refuses to replace an existing file.
pub fn rename_replace(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if dest.exists() => {
            tracing::debug!(dest = %dest.display(), error = %err, "rename failed, removing destination first");
            fs::remove_file(dest)?;
            fs::rename(src, dest)
        }
        Err(err) => Err(err),
    }
}

pub async fn rename_replace_async(src: &Path, dest: &Path) -> io::Result<()> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || rename_replace(&src, &dest))
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?
}

pub fn mmap_read(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before any write to the same path.
    unsafe { MmapOptions::new().map(&file) }
}

/// `foo/bar.jar` + `original` -> `foo/bar.jar.original`
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|value| value.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

pub fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

pub fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let score = mount.as_os_str().to_string_lossy().len();
            match best {
                Some((best_score, _)) if best_score >= score => {}
                _ => best = Some((score, disk.available_space())),
            }
        }
    }
    best.map(|(_, space)| space)
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let value = bytes as f64;
    if value >= GB {
        format!("{:.2} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}
