//! Universal paths: normalized, forward-slash, no leading slash. The root is `""`.

/// Normalize a host path into a upath.
///
/// Collapses repeated separators and `.` components and resolves `..`
/// against the already-seen prefix. `..` at the root stays at the root.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }
    parts.join("/")
}

/// Parent upath; the parent of a top-level entry (and of the root) is the root.
pub fn udirname(upath: &str) -> &str {
    match upath.rfind('/') {
        Some(i) => &upath[..i],
        None => "",
    }
}

/// Last path segment.
pub fn ubasename(upath: &str) -> &str {
    match upath.rfind('/') {
        Some(i) => &upath[i + 1..],
        None => upath,
    }
}
