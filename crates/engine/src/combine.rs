//! Incremental-chain combination.
//!
//! An incremental backup stores only the files that changed since its
//! parent; its manifest still lists the complete file set. Combining a
//! chain materializes the newest member: the newest manifest dictates
//! which files exist, and each file's bytes come from the newest chain
//! member that stored it. When parallel chains touched the same file, the
//! member with the later start position wins by construction of the walk.

use crate::info::BackupInfo;
use crate::manifest::{digest_hex, Manifest};
use pgharbor_core::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Resolve the chain for a label by following parent links.
///
/// Returns backup directories oldest first, ending with `label`'s own.
pub fn resolve_chain(backup_root: &Path, label: &str) -> Result<Vec<PathBuf>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = label.to_string();

    loop {
        if !seen.insert(current.clone()) {
            return Err(Error::corruption(format!(
                "backup chain cycles at '{}'",
                current
            )));
        }
        let dir = backup_root.join(&current);
        let info = BackupInfo::load(&dir)?;
        chain.push(dir);
        match info.parent {
            Some(parent) => current = parent,
            None => break,
        }
    }

    chain.reverse();
    Ok(chain)
}

/// Combine a chain (oldest first) into `output`.
///
/// Every file named by the newest manifest must be found somewhere in the
/// chain and must match its manifest checksum; anything else is
/// `corruption`.
pub fn combine_chain(chain: &[PathBuf], output: &Path) -> Result<()> {
    let newest = chain
        .last()
        .ok_or_else(|| Error::format("empty backup chain"))?;
    let manifest = Manifest::load(newest)?;

    std::fs::create_dir_all(output).map_err(|e| Error::io(output, e))?;

    for entry in &manifest.files {
        let mut found = false;
        // Newest member first: later changes shadow older content.
        for member in chain.iter().rev() {
            let candidate = member.join("data").join(&entry.path);
            if !candidate.exists() {
                continue;
            }
            let data = std::fs::read(&candidate).map_err(|e| Error::io(&candidate, e))?;
            let checksum = digest_hex(&entry.checksum_algo, &data)?;
            if checksum != entry.checksum {
                return Err(Error::corruption(format!(
                    "chain member {} holds a stale copy of '{}'",
                    member.display(),
                    entry.path
                )));
            }
            let dest = output.join(&entry.path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            std::fs::write(&dest, &data).map_err(|e| Error::io(&dest, e))?;
            found = true;
            break;
        }
        if !found {
            return Err(Error::corruption(format!(
                "file '{}' is listed in the manifest but missing from the whole chain",
                entry.path
            )));
        }
    }
    Ok(())
}
