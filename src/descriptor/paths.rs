//! Lexical path helpers for descriptor resolution.
//!
//! Descriptor files reference volumes, env files and build contexts relative
//! to the descriptor's own location. All helpers operate on `/`-separated
//! strings and are purely lexical; nothing here touches the filesystem.

/// Collapses `.`/`..` segments and duplicate slashes, like Go's `path.Clean`.
pub fn clean(p: &str) -> String {
    let rooted = p.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if let Some(last) = out.last() {
                    if *last != ".." {
                        out.pop();
                        continue;
                    }
                }
                if !rooted {
                    out.push("..");
                }
            }
            s => out.push(s),
        }
    }
    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Returns the directory part of a slash path, like Go's `path.Dir`.
pub fn dir(p: &str) -> String {
    match p.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => clean(&p[..idx]),
        None => ".".to_string(),
    }
}

/// True when `v` denotes a filesystem path rather than a volume name.
pub fn is_path(v: &str) -> bool {
    v == "."
        || v.starts_with('/')
        || v.starts_with("./")
        || v.starts_with("../")
}

/// Resolves `p` against the directory of `base_file` unless it is absolute.
pub fn abs_path(p: &str, base_file: &str) -> String {
    if p.starts_with('/') {
        clean(p)
    } else {
        let base_dir = dir(base_file);
        clean(&format!("{base_dir}/{p}"))
    }
}

/// Makes `p` relative to the directory of `base_file` where possible,
/// keeping the result path-shaped (`./x` rather than `x`).
pub fn rel_path(p: &str, base_file: &str) -> String {
    let mut p = clean(p);
    if p.is_empty() || p.starts_with('/') {
        let base_dir = clean(&dir(base_file));
        if p == base_dir {
            p = ".".to_string();
        } else if let Some(stripped) = p.strip_prefix(&format!("{base_dir}/")) {
            p = stripped.to_string();
        }
    }
    if is_path(&p) { p } else { format!("./{p}") }
}

/// Derives a volume/image identifier: lowercased, with every run of
/// characters outside `[a-z0-9]` collapsed to `-` and edges trimmed.
pub fn to_id(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    let mut pending_dash = false;
    for c in v.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses_segments() {
        assert_eq!(clean("/a/b/../c"), "/a/c");
        assert_eq!(clean("a//b/./c"), "a/b/c");
        assert_eq!(clean("../x"), "../x");
        assert_eq!(clean("/.."), "/");
        assert_eq!(clean(""), ".");
    }

    #[test]
    fn abs_path_resolves_against_descriptor_dir() {
        assert_eq!(abs_path("./data", "/pods/app/pod.json"), "/pods/app/data");
        assert_eq!(abs_path("/var/lib", "/pods/app/pod.json"), "/var/lib");
        assert_eq!(abs_path("../shared", "/pods/app/pod.json"), "/pods/shared");
    }

    #[test]
    fn rel_path_strips_descriptor_dir() {
        assert_eq!(rel_path("/pods/app/data", "/pods/app/pod.json"), "./data");
        assert_eq!(rel_path("/pods/app", "/pods/app/pod.json"), ".");
        assert_eq!(rel_path("/elsewhere", "/pods/app/pod.json"), "/elsewhere");
    }

    #[test]
    fn path_detection() {
        assert!(is_path("."));
        assert!(is_path("/abs"));
        assert!(is_path("./rel"));
        assert!(is_path("../up"));
        assert!(!is_path("volume-name"));
    }

    #[test]
    fn to_id_normalizes() {
        assert_eq!(to_id("./Data/Logs"), "data-logs");
        assert_eq!(to_id("/var/lib/pgsql"), "var-lib-pgsql");
        assert_eq!(to_id("--x--"), "x");
    }
}
