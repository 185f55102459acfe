use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the store root (used by tests and CI).
pub const STORE_ROOT_ENV: &str = "SHEPHERD_HOME";

/// Return the per-user store root: `~/.local/share/shepherd/`
/// Falls back to `~/.shepherd/`, then to a relative `.shepherd-store/`.
pub fn store_root() -> PathBuf {
    if let Some(dir) = std::env::var_os(STORE_ROOT_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(data_dir) = dirs::data_dir() {
        data_dir.join("shepherd")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".shepherd")
    } else {
        PathBuf::from(".shepherd-store")
    }
}

/// Default config file: `store_root/config.json`
pub fn config_path() -> PathBuf {
    store_root().join("config.json")
}

/// Default parent directory for cloned pull-request workspaces.
pub fn workspaces_dir() -> PathBuf {
    store_root().join("workspaces")
}

/// Per-session directory holding the event journal and agent transcripts.
pub fn session_dir(session_id: &str) -> PathBuf {
    store_root()
        .join("sessions")
        .join(sanitize_component(session_id))
}

/// Make a string safe to use as a single path component.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else becomes `-`.
/// Runs of `-` are collapsed and leading/trailing `-`/`.` are trimmed so the
/// result can never be `.` or `..`.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Atomic write: write to temp file in same dir, then rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_root_is_not_empty() {
        let root = store_root();
        assert!(!root.as_os_str().is_empty());
    }

    #[test]
    fn session_dir_is_under_store() {
        let dir = session_dir("abc123");
        assert!(dir.starts_with(store_root()));
        assert!(dir.ends_with("abc123"));
    }

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_component("acme-widgets-pr-42"), "acme-widgets-pr-42");
        assert_eq!(sanitize_component("v1.2_final"), "v1.2_final");
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_component("feature/fix ci"), "feature-fix-ci");
        assert_eq!(sanitize_component("a//b"), "a-b");
    }

    #[test]
    fn sanitize_never_yields_dot_dirs() {
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("/"), "_");
        assert_eq!(sanitize_component("../etc"), "etc");
    }

    #[test]
    fn write_atomic_creates_parents_and_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("status.json");
        write_atomic(&path, b"one").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one");
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }
}
