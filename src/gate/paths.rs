use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecPaths {
    dirs: Vec<PathBuf>,
    pinned: Vec<(String, PathBuf)>,
}

impl ExecPaths {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self::default().with_dirs(dirs)
    }

    pub fn discover(home_dir: &Path) -> Self {
        let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        dirs.extend(well_known_dirs(home_dir));
        Self::new(dirs)
    }

    pub fn with_dirs<I>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut dirs = self.dirs.clone();
        for dir in extra {
            if dir.as_os_str().is_empty() || dirs.contains(&dir) {
                continue;
            }
            dirs.push(dir);
        }
        Self {
            dirs,
            pinned: self.pinned.clone(),
        }
    }

    /// Resolves `name` to `path` ahead of the directory search. Ignored unless
    /// `path` is a file called `name`.
    pub fn with_pinned(&self, name: &str, path: PathBuf) -> Self {
        let mut pinned = self.pinned.clone();
        if path.file_name().and_then(|n| n.to_str()) == Some(name) {
            pinned.retain(|(n, _)| n != name);
            pinned.push((name.to_string(), path));
        }
        Self {
            dirs: self.dirs.clone(),
            pinned,
        }
    }

    pub fn pinned(&self, name: &str) -> Option<&Path> {
        self.pinned
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_path())
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return None;
        }
        if let Some(pinned) = self.pinned(name).filter(|p| is_executable(p)) {
            return Some(pinned.to_path_buf());
        }
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }

    pub fn to_path_env(&self) -> Option<OsString> {
        if self.dirs.is_empty() {
            return None;
        }
        std::env::join_paths(&self.dirs).ok()
    }
}

pub fn well_known_dirs(home_dir: &Path) -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/usr/bin"),
        PathBuf::from("/bin"),
        PathBuf::from("/opt/homebrew/bin"),
        PathBuf::from("/usr/local/go/bin"),
        home_dir.join("go/bin"),
        home_dir.join(".local/bin"),
    ]
}

/// `$GOBIN`, else the first `$GOPATH` entry's `bin`, else `~/go/bin`.
pub fn go_bin_dir(home_dir: &Path) -> PathBuf {
    if let Some(gobin) = std::env::var_os("GOBIN").filter(|v| !v.is_empty()) {
        return PathBuf::from(gobin);
    }
    if let Some(gopath) = std::env::var_os("GOPATH") {
        if let Some(first) = std::env::split_paths(&gopath).find(|p| !p.as_os_str().is_empty()) {
            return first.join("bin");
        }
    }
    home_dir.join("go/bin")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn touch_exe(dir: &Path, name: &str, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, b"#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).expect("chmod");
        path
    }

    #[test]
    fn locate_respects_order_and_exec_bit() {
        let a = tempfile::tempdir().expect("tempdir");
        let b = tempfile::tempdir().expect("tempdir");
        touch_exe(a.path(), "syft", 0o644);
        let expected = touch_exe(b.path(), "syft", 0o755);
        touch_exe(b.path(), "gosec", 0o755);
        let first = touch_exe(a.path(), "gosec", 0o755);

        let paths = ExecPaths::new(vec![a.path().to_path_buf(), b.path().to_path_buf()]);
        assert_eq!(paths.locate("syft"), Some(expected));
        assert_eq!(paths.locate("gosec"), Some(first));
        assert_eq!(paths.locate("semgrep"), None);
        assert_eq!(paths.locate("../syft"), None);
    }

    #[test]
    fn pinned_location_wins_over_search_order() {
        let stale = tempfile::tempdir().expect("tempdir");
        let fresh = tempfile::tempdir().expect("tempdir");
        let old = touch_exe(stale.path(), "gosec", 0o755);
        let new = touch_exe(fresh.path(), "gosec", 0o755);

        let paths = ExecPaths::new(vec![stale.path().to_path_buf(), fresh.path().to_path_buf()]);
        assert_eq!(paths.locate("gosec"), Some(old.clone()));

        let pinned = paths.with_pinned("gosec", new.clone());
        assert_eq!(pinned.locate("gosec"), Some(new.clone()));
        assert_eq!(paths.locate("gosec"), Some(old.clone()));
        assert_eq!(pinned.with_dirs(vec![PathBuf::from("/x")]).locate("gosec"), Some(new.clone()));

        std::fs::remove_file(&new).expect("remove");
        assert_eq!(pinned.locate("gosec"), Some(old));
    }

    #[test]
    fn pin_must_name_the_same_executable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sh = touch_exe(dir.path(), "sh", 0o755);
        let paths = ExecPaths::default().with_pinned("gosec", sh);
        assert_eq!(paths.pinned("gosec"), None);
        assert_eq!(paths.locate("gosec"), None);
    }

    #[test]
    fn with_dirs_is_additive_and_leaves_original_alone() {
        let base = ExecPaths::new(vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        let grown = base.with_dirs(vec![PathBuf::from("/b"), PathBuf::from("/c")]);
        assert_eq!(base.dirs(), &[PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(
            grown.dirs(),
            &[PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }

    #[test]
    fn path_env_joins_dirs() {
        let paths = ExecPaths::new(vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(paths.to_path_env(), Some(OsString::from("/a:/b")));
        assert_eq!(ExecPaths::default().to_path_env(), None);
    }
}
