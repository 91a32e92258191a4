//! Lexical guest path handling.
//!
//! Guest paths are normalized against the directory they are resolved from
//! without touching the host filesystem, so a `..` escape is rejected before
//! any host I/O happens.

use weh_common::Errno;

/// Outcome of normalizing a guest path below a sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    /// Components below the sandbox root.
    Inside(Vec<String>),
    /// The path climbs above the sandbox root.
    Escapes,
}

/// Check that a guest path is usable at all.
pub fn validate(path: &str) -> Result<(), Errno> {
    if path.is_empty() {
        return Err(Errno::NoEnt);
    }
    if path.contains('\0') {
        return Err(Errno::Inval);
    }
    Ok(())
}

/// Normalize `path` relative to `base`, both expressed as components below
/// the sandbox root.
///
/// `.` and empty components are dropped, `..` pops one level. Popping past
/// the root yields [`Normalized::Escapes`] unless `clamp_at_root` is set, in
/// which case the root is its own parent (POSIX `/..`).
pub fn normalize(base: &[String], path: &str, clamp_at_root: bool) -> Normalized {
    let mut components: Vec<String> = base.to_vec();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() && !clamp_at_root {
                    return Normalized::Escapes;
                }
            }
            name => components.push(name.to_string()),
        }
    }

    Normalized::Inside(components)
}

/// Split a guest mount name into components (`/data/in` -> `["data", "in"]`).
pub fn mount_components(mount: &str) -> Vec<String> {
    mount
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(str::to_string)
        .collect()
}

/// If the absolute guest `path` lies under `mount`, return the remainder.
pub fn strip_mount<'a>(mount: &str, path: &'a str) -> Option<&'a str> {
    let mount_parts = mount_components(mount);
    let mut rest = path.trim_start_matches('/');

    for expected in &mount_parts {
        let (head, tail) = rest.split_once('/').unwrap_or((rest, ""));
        if head != expected {
            return None;
        }
        rest = tail.trim_start_matches('/');
    }

    Some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_validate() {
        assert_eq!(validate(""), Err(Errno::NoEnt));
        assert_eq!(validate("a\0b"), Err(Errno::Inval));
        assert_eq!(validate("notes.txt"), Ok(()));
    }

    #[test]
    fn test_normalize_simple() {
        assert_eq!(
            normalize(&[], "notes.txt", false),
            Normalized::Inside(parts(&["notes.txt"]))
        );
        assert_eq!(
            normalize(&[], "./a//b/./c", false),
            Normalized::Inside(parts(&["a", "b", "c"]))
        );
    }

    #[test]
    fn test_normalize_dotdot_inside() {
        assert_eq!(
            normalize(&parts(&["sub"]), "../x", false),
            Normalized::Inside(parts(&["x"]))
        );
        assert_eq!(
            normalize(&[], "a/../b", false),
            Normalized::Inside(parts(&["b"]))
        );
    }

    #[test]
    fn test_normalize_escape() {
        assert_eq!(normalize(&[], "../etc/passwd", false), Normalized::Escapes);
        assert_eq!(normalize(&[], "a/../../b", false), Normalized::Escapes);
        assert_eq!(
            normalize(&parts(&["sub"]), "../../outside", false),
            Normalized::Escapes
        );
    }

    #[test]
    fn test_normalize_clamped() {
        assert_eq!(
            normalize(&[], "../../etc", true),
            Normalized::Inside(parts(&["etc"]))
        );
    }

    #[test]
    fn test_strip_mount() {
        assert_eq!(strip_mount("/data", "/data/notes.txt"), Some("notes.txt"));
        assert_eq!(strip_mount("/data", "/data"), Some(""));
        assert_eq!(strip_mount("/data", "/database/x"), None);
        assert_eq!(strip_mount("/data/in", "/data/in/a/b"), Some("a/b"));
        assert_eq!(strip_mount("/", "/etc/hosts"), Some("etc/hosts"));
    }
}
