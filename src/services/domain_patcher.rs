//! Length-preserving rewrite of an embedded domain name.
//!
//! The client executable carries the domain in a few physical encodings; the
//! server archive carries it as plain UTF-8 inside class and config entries.
//! Replacements are never longer than what they replace: the remainder is
//! zero-filled so file size and every absolute offset stay put.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::config::DomainPatchConfig;
use crate::errors::{LauncherError, Result};
use crate::services::progress::{ProgressReporter, ProgressStage};
use crate::utils::file::{mmap_read, rename_replace, sibling_with_suffix, write_atomic};
use crate::utils::paths::InstallLayout;
use crate::utils::platform::mark_executable;

pub const ORIGINAL_SUFFIX: &str = "original";
const SCANNED_EXTENSIONS: &[&str] = &[".class", ".properties", ".json", ".xml", ".yml", ".yaml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchEncoding {
    /// 4-byte little-endian length, then the characters separated by single NULs
    /// (none after the last one).
    LengthPrefixed,
    Utf8,
    /// UTF-16LE, either NUL-terminated or in the length-prefixed layout. The two
    /// share a prefix and differ only in the byte after the last character.
    Utf16Hybrid,
}

impl PatchEncoding {
    /// Rewrites every occurrence of `old` in place and returns how many were patched.
    pub fn apply(&self, data: &mut [u8], old: &str, new: &str) -> usize {
        match self {
            PatchEncoding::LengthPrefixed => {
                replace_all(data, &length_prefixed(old), &length_prefixed(new))
            }
            PatchEncoding::Utf8 => replace_all(data, old.as_bytes(), new.as_bytes()),
            PatchEncoding::Utf16Hybrid => replace_utf16_hybrid(data, old, new),
        }
    }

    pub fn patch(&self, haystack: &[u8], old: &str, new: &str) -> (Vec<u8>, usize) {
        let mut out = haystack.to_vec();
        let count = self.apply(&mut out, old, new);
        (out, count)
    }
}

pub fn length_prefixed(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len() * 2);
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            out.push(0);
        }
        out.push(*byte);
    }
    out
}

pub fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Start offsets of every match, advancing one byte past each hit's start.
pub fn find_all(data: &[u8], pattern: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    if pattern.is_empty() || pattern.len() > data.len() {
        return positions;
    }
    let first = pattern[0];
    let last_start = data.len() - pattern.len();
    let mut pos = 0;
    while pos <= last_start {
        let Some(offset) = data[pos..=last_start].iter().position(|byte| *byte == first) else {
            break;
        };
        let start = pos + offset;
        if &data[start..start + pattern.len()] == pattern {
            positions.push(start);
        }
        pos = start + 1;
    }
    positions
}

fn replace_all(data: &mut [u8], old: &[u8], new: &[u8]) -> usize {
    if new.len() > old.len() {
        tracing::warn!(new_len = new.len(), old_len = old.len(), "replacement longer than original, skipping");
        return 0;
    }
    let mut count = 0;
    for pos in find_all(data, old) {
        let end = pos + old.len();
        // An earlier overlapping hit may already have rewritten this one.
        if &data[pos..end] != old {
            continue;
        }
        data[pos..pos + new.len()].copy_from_slice(new);
        data[pos + new.len()..end].fill(0);
        count += 1;
    }
    count
}

fn replace_utf16_hybrid(data: &mut [u8], old: &str, new: &str) -> usize {
    let (old_len, new_len) = (old.len(), new.len());
    if new_len > old_len {
        tracing::warn!(new_len, old_len, "new domain too long for UTF-16 pass, skipping");
        return 0;
    }
    if old_len == 0 || new_len == 0 {
        return 0;
    }

    let old_prefix = utf16le(&old[..old_len - 1]);
    let new_prefix = utf16le(&new[..new_len - 1]);
    let old_last = old.as_bytes()[old_len - 1];
    let new_last = new.as_bytes()[new_len - 1];

    let mut count = 0;
    for pos in find_all(data, &old_prefix) {
        let last = pos + old_prefix.len();
        if last >= data.len() || data[pos..last] != old_prefix[..] || data[last] != old_last {
            continue;
        }
        let nul_terminated = data.get(last + 1) == Some(&0);

        data[pos..pos + new_prefix.len()].copy_from_slice(&new_prefix);
        let new_last_pos = pos + new_prefix.len();
        data[new_last_pos] = new_last;
        // Old text spans 2n-1 bytes in either layout; clear what the new text no longer covers.
        let tail_end = (pos + 2 * old_len - 1).min(data.len());
        if new_last_pos + 1 < tail_end {
            data[new_last_pos + 1..tail_end].fill(0);
        }

        tracing::debug!(
            offset = pos,
            layout = if nul_terminated { "utf16" } else { "length-prefixed" },
            "patched UTF-16 occurrence"
        );
        count += 1;
    }
    count
}

/// What happened to one patch target.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum TargetOutcome {
    Patched { replacements: usize },
    /// Already patched, or the domain never appeared.
    Unchanged,
    Missing,
    Failed { message: String },
}

impl TargetOutcome {
    pub fn from_result(path: &Path, result: Result<usize>) -> Self {
        match result {
            Ok(0) => TargetOutcome::Unchanged,
            Ok(replacements) => TargetOutcome::Patched { replacements },
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "domain patch failed");
                TargetOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TargetOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainPatchReport {
    pub client: TargetOutcome,
    pub server: TargetOutcome,
}

impl DomainPatchReport {
    pub fn has_failures(&self) -> bool {
        self.client.is_failure() || self.server.is_failure()
    }
}

#[derive(Debug, Clone)]
struct Pass {
    label: String,
    encoding: PatchEncoding,
    old: String,
    new: String,
}

#[derive(Debug, Clone)]
pub struct DomainPatcher {
    original: String,
    target: String,
    scheme: String,
    subdomains: Vec<String>,
    crash_endpoint: Option<(String, String)>,
}

impl DomainPatcher {
    pub fn new(original: &str, target: &str) -> Result<Self> {
        let config = DomainPatchConfig {
            original_domain: original.to_string(),
            target_domain: target.to_string(),
            ..DomainPatchConfig::default()
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &DomainPatchConfig) -> Result<Self> {
        validate_domain("original", &config.original_domain)?;
        validate_domain("target", &config.target_domain)?;
        if config.target_domain.len() > config.original_domain.len() {
            tracing::warn!(
                original_domain = %config.original_domain,
                target_domain = %config.target_domain,
                "target domain is longer than the original; most passes will be skipped"
            );
        }
        let crash_endpoint = config.crash_report_endpoint.as_ref().map(|endpoint| {
            let replacement = config
                .crash_report_replacement
                .replace("{scheme}", &config.scheme)
                .replace("{domain}", &config.target_domain);
            (endpoint.clone(), replacement)
        });
        Ok(Self {
            original: config.original_domain.clone(),
            target: config.target_domain.clone(),
            scheme: config.scheme.clone(),
            subdomains: config.subdomains.clone(),
            crash_endpoint,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn client_passes(&self) -> Vec<Pass> {
        let mut passes = Vec::new();
        if let Some((endpoint, replacement)) = &self.crash_endpoint {
            passes.push(Pass {
                label: "crash report endpoint".to_string(),
                encoding: PatchEncoding::LengthPrefixed,
                old: endpoint.clone(),
                new: replacement.clone(),
            });
        }
        let new_url = format!("{}{}", self.scheme, self.target);
        for subdomain in &self.subdomains {
            let old_url = format!("{}{}{}", self.scheme, subdomain, self.original);
            passes.push(Pass {
                label: format!("url {old_url}"),
                encoding: PatchEncoding::LengthPrefixed,
                old: old_url,
                new: new_url.clone(),
            });
        }
        passes.push(Pass {
            label: "bare domain".to_string(),
            encoding: PatchEncoding::LengthPrefixed,
            old: self.original.clone(),
            new: self.target.clone(),
        });
        passes.push(Pass {
            label: "utf-16".to_string(),
            encoding: PatchEncoding::Utf16Hybrid,
            old: self.original.clone(),
            new: self.target.clone(),
        });
        passes
    }

    /// Runs every client pass over `data` in order and returns the total replacements.
    pub fn patch_bytes(&self, data: &mut [u8]) -> usize {
        let mut total = 0;
        for pass in self.client_passes() {
            let count = pass.encoding.apply(data, &pass.old, &pass.new);
            if count > 0 {
                tracing::info!(pass = %pass.label, count, "patched occurrences");
                total += count;
            }
        }
        total
    }

    pub fn patch_client(&self, path: &Path, progress: &ProgressReporter) -> Result<usize> {
        tracing::info!(path = %path.display(), domain = %self.target, "patching client");
        if !path.is_file() {
            return Err(LauncherError::DomainPatch(format!(
                "client binary not found: {}",
                path.display()
            )));
        }

        progress.report(ProgressStage::DomainPatch, 10.0, "Reading client binary...");
        let mut data = {
            let map = mmap_read(path)?;
            map.to_vec()
        };

        progress.report(ProgressStage::DomainPatch, 30.0, "Applying patches...");
        let count = self.patch_bytes(&mut data);
        if count == 0 {
            tracing::info!(path = %path.display(), "no client patches applied, already patched or no matches");
            return Ok(0);
        }

        progress.report(ProgressStage::DomainPatch, 70.0, "Writing patched binary...");
        preserve_original(path)?;
        write_atomic(path, &data)?;
        mark_executable(path)?;

        progress.report(
            ProgressStage::DomainPatch,
            100.0,
            format!("Client patched ({count} occurrences)"),
        );
        tracing::info!(path = %path.display(), occurrences = count, "client patched");
        Ok(count)
    }

    /// Rewrites scanned entries of the archive. Untouched entries are copied raw.
    pub fn patch_server_archive(&self, path: &Path, progress: &ProgressReporter) -> Result<usize> {
        tracing::info!(path = %path.display(), domain = %self.target, "patching server archive");
        if !path.is_file() {
            return Err(LauncherError::DomainPatch(format!(
                "server archive not found: {}",
                path.display()
            )));
        }

        progress.report(ProgressStage::DomainPatch, 10.0, "Opening server archive...");
        let temp_path = sibling_with_suffix(path, "tmp");
        let total = match self.rewrite_archive(path, &temp_path, progress) {
            Ok(total) => total,
            Err(err) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(err);
            }
        };

        if total == 0 {
            let _ = std::fs::remove_file(&temp_path);
            tracing::info!(path = %path.display(), "no server patches applied, already patched or no matches");
            return Ok(0);
        }

        progress.report(ProgressStage::DomainPatch, 80.0, "Finalizing patched archive...");
        if let Err(err) = preserve_original(path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }
        rename_replace(&temp_path, path)?;

        progress.report(
            ProgressStage::DomainPatch,
            100.0,
            format!("Server patched ({total} occurrences)"),
        );
        tracing::info!(path = %path.display(), occurrences = total, "server archive patched");
        Ok(total)
    }

    fn rewrite_archive(&self, path: &Path, temp_path: &Path, progress: &ProgressReporter) -> Result<usize> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut writer = ZipWriter::new(File::create(temp_path)?);
        let needle = self.original.as_bytes();
        let entries = archive.len();
        let mut total = 0;

        for index in 0..entries {
            if index % 100 == 0 {
                let percent = 30.0 + 40.0 * index as f64 / entries.max(1) as f64;
                progress.report(ProgressStage::DomainPatch, percent, "Patching archive entries...");
            }

            let name = archive.by_index_raw(index)?.name().to_string();
            if is_scanned_entry(&name) {
                let (mut data, options) = {
                    let mut entry = archive.by_index(index)?;
                    let mut data = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut data)?;
                    let mut options = FileOptions::default()
                        .compression_method(entry.compression())
                        .last_modified_time(entry.last_modified())
                        .large_file(entry.size() >= u32::MAX as u64);
                    if let Some(mode) = entry.unix_mode() {
                        options = options.unix_permissions(mode);
                    }
                    (data, options)
                };
                if !find_all(&data, needle).is_empty() {
                    let count = PatchEncoding::Utf8.apply(&mut data, &self.original, &self.target);
                    if count > 0 {
                        tracing::debug!(entry = %name, count, "patched archive entry");
                        writer.start_file(name, options)?;
                        writer.write_all(&data)?;
                        total += count;
                        continue;
                    }
                }
            }
            writer.raw_copy_file(archive.by_index_raw(index)?)?;
        }

        writer.finish()?.sync_all()?;
        Ok(total)
    }

    /// Patches the client and server of one install. A failure on one target
    /// does not stop the other.
    pub fn patch_install(&self, layout: &InstallLayout, progress: &ProgressReporter) -> DomainPatchReport {
        let client = if layout.client.is_file() {
            let result = self.patch_client(&layout.client, &progress.scaled(0.0, 50.0));
            TargetOutcome::from_result(&layout.client, result)
        } else {
            tracing::warn!(path = %layout.client.display(), "client binary not found, skipping client patch");
            TargetOutcome::Missing
        };

        let server = if layout.server_archive.is_file() {
            let result = self.patch_server_archive(&layout.server_archive, &progress.scaled(50.0, 100.0));
            TargetOutcome::from_result(&layout.server_archive, result)
        } else {
            tracing::warn!(path = %layout.server_archive.display(), "server archive not found, skipping server patch");
            TargetOutcome::Missing
        };

        progress.report(ProgressStage::DomainPatch, 100.0, "Game patching complete");
        DomainPatchReport { client, server }
    }
}

fn validate_domain(which: &str, domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(LauncherError::DomainPatch(format!("{which} domain is empty")));
    }
    if !domain.is_ascii() || domain.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        return Err(LauncherError::DomainPatch(format!("invalid {which} domain: {domain:?}")));
    }
    Ok(())
}

fn is_scanned_entry(name: &str) -> bool {
    SCANNED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Moves `path` aside as `<path>.original` unless a backup already exists.
fn preserve_original(path: &Path) -> Result<()> {
    let backup = sibling_with_suffix(path, ORIGINAL_SUFFIX);
    if backup.exists() {
        return Ok(());
    }
    std::fs::rename(path, &backup).map_err(|err| {
        LauncherError::DomainPatch(format!("failed to back up original {}: {err}", path.display()))
    })
}

/// Puts `<path>.original` back in place of the patched file.
pub fn restore_original(path: &Path) -> Result<PathBuf> {
    let backup = sibling_with_suffix(path, ORIGINAL_SUFFIX);
    if !backup.is_file() {
        return Err(LauncherError::NotFound(format!(
            "no original backup for {}",
            path.display()
        )));
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    std::fs::rename(&backup, path)?;
    tracing::info!(path = %path.display(), "restored original");
    Ok(backup)
}

pub fn restore_client(path: &Path) -> Result<PathBuf> {
    restore_original(path)
}

pub fn restore_server_archive(path: &Path) -> Result<PathBuf> {
    restore_original(path)
}

/// Restores every target of the install that has a backup. Errors when none had one.
pub fn restore_install(layout: &InstallLayout) -> Result<usize> {
    let mut restored = 0;
    for path in [&layout.client, &layout.server_archive] {
        if sibling_with_suffix(path, ORIGINAL_SUFFIX).is_file() {
            restore_original(path)?;
            restored += 1;
        }
    }
    if restored == 0 {
        return Err(LauncherError::NotFound("no backups found to restore".to_string()));
    }
    tracing::info!(count = restored, "restored original files");
    Ok(restored)
}
