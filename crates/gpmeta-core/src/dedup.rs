use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::media::{ExtClass, MediaFile};

/// Identity of a media file for reconciliation: base name with any `(n)`
/// duplicate marker removed, plus the extension class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub base: String,
    pub class: ExtClass,
}

/// Same-identity files found in two or more folders.
#[derive(Debug)]
pub struct DuplicateGroup {
    pub key: IdentityKey,
    pub files: Vec<MediaFile>,
    /// True when every copy is byte-identical (size, then SHA-256).
    pub identical: bool,
}

/// Resolution seam. The default policies run headless; an interactive caller
/// supplies its own implementation and answers from the user.
pub trait DuplicatePolicy {
    /// Index of the copy to keep, or `None` when the policy makes no
    /// decision for this group.
    fn choose(&self, group: &DuplicateGroup) -> Option<usize>;

    fn name(&self) -> &str;
}

/// Never decides; groups fall through to the keep-all rule.
pub struct KeepAll;

impl DuplicatePolicy for KeepAll {
    fn choose(&self, _group: &DuplicateGroup) -> Option<usize> {
        None
    }

    fn name(&self) -> &str {
        "keep-all"
    }
}

/// Keeps the copy with the latest modification time.
pub struct KeepNewest;

impl DuplicatePolicy for KeepNewest {
    fn choose(&self, group: &DuplicateGroup) -> Option<usize> {
        group
            .files
            .iter()
            .enumerate()
            .filter_map(|(i, f)| Some((i, file_mtime(f)?)))
            .max_by_key(|(_, t)| *t)
            .map(|(i, _)| i)
    }

    fn name(&self) -> &str {
        "keep-newest"
    }
}

/// Keeps the largest copy.
pub struct KeepLargest;

impl DuplicatePolicy for KeepLargest {
    fn choose(&self, group: &DuplicateGroup) -> Option<usize> {
        group
            .files
            .iter()
            .enumerate()
            .filter_map(|(i, f)| Some((i, fs::metadata(&f.path).ok()?.len())))
            .max_by_key(|(_, len)| *len)
            .map(|(i, _)| i)
    }

    fn name(&self) -> &str {
        "keep-largest"
    }
}

fn file_mtime(f: &MediaFile) -> Option<SystemTime> {
    fs::metadata(&f.path).ok()?.modified().ok()
}

/// Index the whole file list and return the cross-folder duplicate groups.
pub fn find_duplicates(files: &[MediaFile]) -> Vec<DuplicateGroup> {
    let mut by_key: HashMap<IdentityKey, Vec<MediaFile>> = HashMap::new();
    for f in files {
        let key = IdentityKey {
            base: f.identity_base(),
            class: f.class,
        };
        by_key.entry(key).or_default().push(f.clone());
    }

    let mut groups: Vec<DuplicateGroup> = by_key
        .into_iter()
        .filter(|(_, members)| {
            let parents: HashSet<_> = members.iter().filter_map(|m| m.path.parent()).collect();
            members.len() >= 2 && parents.len() >= 2
        })
        .map(|(key, files)| {
            let identical = all_identical(&files);
            DuplicateGroup {
                key,
                files,
                identical,
            }
        })
        .collect();
    groups.sort_by(|a, b| a.key.base.cmp(&b.key.base));
    groups
}

/// Sizes first, content hash only when sizes agree.
fn all_identical(files: &[MediaFile]) -> bool {
    let sizes: Vec<u64> = files
        .iter()
        .filter_map(|f| fs::metadata(&f.path).ok().map(|m| m.len()))
        .collect();
    if sizes.len() != files.len() || sizes.windows(2).any(|w| w[0] != w[1]) {
        return false;
    }
    let hashes: Vec<String> = files.iter().filter_map(|f| hash_file(f)).collect();
    hashes.len() == files.len() && hashes.windows(2).all(|w| w[0] == w[1])
}

fn hash_file(f: &MediaFile) -> Option<String> {
    let bytes = fs::read(&f.path).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

pub struct ReconcileResult {
    pub kept: Vec<MediaFile>,
    pub groups_found: u64,
    pub copies_discarded: u64,
}

/// Narrow the working index so at most one file per identity key survives.
/// A policy decision is always honored; undecided groups keep all copies
/// (logged as a decision), except that byte-identical undecided groups keep
/// just the first copy since the rest are indistinguishable. Source files
/// are never deleted here.
pub fn reconcile(files: Vec<MediaFile>, policy: &dyn DuplicatePolicy) -> ReconcileResult {
    let groups = find_duplicates(&files);
    let groups_found = groups.len() as u64;
    let mut dropped: HashSet<PathBuf> = HashSet::new();

    for group in &groups {
        let choice = match policy.choose(group) {
            Some(i) if i < group.files.len() => Some(i),
            Some(i) => {
                log::warn!(
                    "policy {} chose out-of-range copy {} for {}; keeping all",
                    policy.name(),
                    i,
                    group.key.base
                );
                None
            }
            None => None,
        };

        match choice {
            Some(keep) => {
                for (i, f) in group.files.iter().enumerate() {
                    if i != keep {
                        dropped.insert(f.path.clone());
                    }
                }
                log::info!(
                    "duplicate {}: policy {} kept {}",
                    group.key.base,
                    policy.name(),
                    group.files[keep].path.display()
                );
            }
            None if group.identical => {
                for f in &group.files[1..] {
                    dropped.insert(f.path.clone());
                }
                log::info!(
                    "duplicate {}: {} byte-identical copies, kept {}",
                    group.key.base,
                    group.files.len(),
                    group.files[0].path.display()
                );
            }
            None => {
                log::info!(
                    "duplicate {}: no decision from policy {}, keeping all {} copies",
                    group.key.base,
                    policy.name(),
                    group.files.len()
                );
            }
        }
    }

    let copies_discarded = dropped.len() as u64;
    let kept = files
        .into_iter()
        .filter(|f| !dropped.contains(&f.path))
        .collect();

    ReconcileResult {
        kept,
        groups_found,
        copies_discarded,
    }
}
