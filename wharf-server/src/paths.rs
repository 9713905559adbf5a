use std::path::{Path, PathBuf};

/// If `wharf` is being run from a path under a `target/` directory, return
/// that `target/` directory path.
pub fn target_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// If `wharf` is being run from a path under a `target/` directory, return
/// the repo root directory (the parent of `target/`).
pub fn repo_root_from_exe(exe_path: &Path) -> Option<PathBuf> {
    target_dir_from_exe(exe_path)?
        .parent()
        .map(|p| p.to_path_buf())
}

/// Default unix socket path for debug builds when running from a source
/// checkout.
///
/// Example: `{repo}/local-dev/wharf/tmp/wharf.sock`
pub fn debug_default_socket_from_exe(exe_path: &Path) -> Option<PathBuf> {
    repo_root_from_exe(exe_path).map(|root| {
        root.join("local-dev")
            .join("wharf")
            .join("tmp")
            .join("wharf.sock")
    })
}

/// Default state directory for debug builds when running from a source
/// checkout.
///
/// Example: `{repo}/local-dev/wharf/data`
pub fn debug_default_state_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    repo_root_from_exe(exe_path).map(|root| root.join("local-dev").join("wharf").join("data"))
}

/// Production default socket path.
pub fn production_default_socket_path() -> PathBuf {
    PathBuf::from("/run/wharf/wharf.sock")
}

/// Production default state directory (routes, deployments, cert queue).
pub fn production_default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/wharf")
}

/// Production default certificate directory.
pub fn production_default_cert_dir() -> PathBuf {
    PathBuf::from("/var/lib/wharf/certs")
}

/// Resolve the socket path to bind: explicit override, else a dev-checkout
/// default when running from `target/`, else the production default.
pub fn resolve_socket_path(explicit: Option<PathBuf>, exe_path: &Path) -> PathBuf {
    explicit
        .or_else(|| debug_default_socket_from_exe(exe_path))
        .unwrap_or_else(production_default_socket_path)
}

/// Resolve the state directory the same way.
pub fn resolve_state_dir(explicit: Option<PathBuf>, exe_path: &Path) -> PathBuf {
    explicit
        .or_else(|| debug_default_state_dir_from_exe(exe_path))
        .unwrap_or_else(production_default_state_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_root_from_exe_finds_repo_root() {
        let exe = PathBuf::from("/Users/me/proj/target/debug/wharf");
        assert_eq!(
            repo_root_from_exe(&exe).as_deref(),
            Some(Path::new("/Users/me/proj"))
        );
    }

    #[test]
    fn debug_default_socket_is_under_local_dev_tmp() {
        let exe = PathBuf::from("/Users/me/proj/target/debug/wharf");
        assert_eq!(
            debug_default_socket_from_exe(&exe).as_deref(),
            Some(Path::new("/Users/me/proj/local-dev/wharf/tmp/wharf.sock"))
        );
    }

    #[test]
    fn resolve_socket_path_prefers_explicit_override() {
        let exe = PathBuf::from("/Users/me/proj/target/debug/wharf");
        let explicit = PathBuf::from("/tmp/custom.sock");
        assert_eq!(
            resolve_socket_path(Some(explicit.clone()), &exe),
            explicit
        );
    }

    #[test]
    fn resolve_socket_path_falls_back_to_production_default_outside_checkout() {
        let exe = PathBuf::from("/usr/bin/wharf");
        assert_eq!(resolve_socket_path(None, &exe), production_default_socket_path());
    }
}
