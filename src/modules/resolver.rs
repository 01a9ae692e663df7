//! Specifier resolution cascade, spec §4.7 step 3-4. Grounded on the
//! teacher's `module_loader.rs` URL-based specifier handling, generalized
//! from Convex's single `convex:` scheme to relative/absolute/bare
//! specifiers resolved against the virtual filesystem.

use crate::vfs::VirtualFilesystem;

pub const BUILTIN_MODULES: &[&str] = &["path", "url", "util", "buffer", "stream"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Specifier {
    Relative(String),
    Absolute(String),
    Bare(String),
}

pub fn classify(specifier: &str) -> Specifier {
    if specifier.starts_with("./") || specifier.starts_with("../") {
        Specifier::Relative(specifier.to_string())
    } else if specifier.starts_with('/') {
        Specifier::Absolute(specifier.to_string())
    } else {
        Specifier::Bare(specifier.to_string())
    }
}

fn join(from_dir: &str, relative: &str) -> String {
    let mut components: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    for segment in relative.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            seg => components.push(seg),
        }
    }
    format!("/{}", components.join("/"))
}

fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

/// Tries `candidate`, `candidate.js`, `candidate.ts`, `candidate.json`, and
/// then the same four forms under `candidate/index.*`, returning the first
/// path that exists as a file in the VFS.
fn resolve_candidates(vfs: &VirtualFilesystem, candidate: &str) -> Option<String> {
    let direct = [
        candidate.to_string(),
        format!("{candidate}.js"),
        format!("{candidate}.ts"),
        format!("{candidate}.json"),
    ];
    for path in direct {
        if vfs.stat(&path).map(|s| !s.is_directory).unwrap_or(false) {
            return Some(path);
        }
    }
    let index = [
        format!("{candidate}/index.js"),
        format!("{candidate}/index.ts"),
        format!("{candidate}/index.json"),
    ];
    for path in index {
        if vfs.stat(&path).map(|s| !s.is_directory).unwrap_or(false) {
            return Some(path);
        }
    }
    None
}

/// Resolves `specifier` as seen from `from_path` against the VFS. Bare
/// specifiers are tried under `/node_modules/<specifier>` only; there is
/// no external bare-module fallthrough (spec §4.7: "external bare loads
/// fail ModuleDenied").
pub fn resolve(vfs: &VirtualFilesystem, specifier: &str, from_path: &str) -> Option<String> {
    match classify(specifier) {
        Specifier::Relative(rel) => {
            let joined = join(dirname(from_path), &rel);
            resolve_candidates(vfs, &joined)
        }
        Specifier::Absolute(abs) => resolve_candidates(vfs, &abs),
        Specifier::Bare(bare) => resolve_candidates(vfs, &format!("/node_modules/{bare}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_relative_absolute_bare() {
        assert_eq!(classify("./a"), Specifier::Relative("./a".into()));
        assert_eq!(classify("../a"), Specifier::Relative("../a".into()));
        assert_eq!(classify("/a"), Specifier::Absolute("/a".into()));
        assert_eq!(classify("lodash"), Specifier::Bare("lodash".into()));
    }

    #[test]
    fn join_resolves_relative_against_dirname() {
        assert_eq!(join("/sandbox/lib", "./a"), "/sandbox/lib/a");
        assert_eq!(join("/sandbox/lib", "../a"), "/sandbox/a");
    }
}
