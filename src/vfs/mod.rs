//! Virtual-filesystem path resolution: normalize a client-supplied path,
//! confine it to a user's chroot, authorize it against the policy store,
//! then join it under the real root directory.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::db::{Action, RTxn, User, Verb};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid path")]
    Invalid,
    #[error("access denied")]
    Denied,
    #[error("reserved path")]
    Reserved,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Resolves `vpath` for a user and a required action against the policy
/// store held by `rtxn`, joining the result under `root`.
pub fn resolve(vpath: &str, user: &User, action: Action, rtxn: &RTxn<'_>, root: &Path) -> Result<PathBuf> {
    resolve_inner(vpath, Some((user, action)), rtxn, root)
}

/// Resolves `vpath` without any authorization check, for single-user mode
/// where there is no policy store to consult.
pub fn resolve_single_user(vpath: &str, root: &Path) -> Result<PathBuf> {
    let clean = normalize(vpath)?;
    join_under_root(&clean, root)
}

fn resolve_inner(
    vpath: &str,
    auth: Option<(&User, Action)>,
    rtxn: &RTxn<'_>,
    root: &Path,
) -> Result<PathBuf> {
    let mut clean = normalize(vpath)?;

    if let Some((user, _)) = auth {
        clean = normalize(&join_virtual(&user.chroot, &clean))?;
    }

    if let Some((user, action)) = auth {
        if !authorize(user, &clean, action, rtxn) {
            return Err(Error::Denied);
        }
    }

    join_under_root(&clean, root)
}

/// Rejects `.`/`..` segments and collapses to a clean absolute path, the
/// way a client-controlled path must be scrubbed before any chroot join.
fn normalize(vpath: &str) -> Result<String> {
    let trimmed = vpath.trim_matches('/');

    for segment in trimmed.split('/') {
        let s = segment.trim();
        if s == "." || s == ".." {
            return Err(Error::Invalid);
        }
    }

    Ok(format!("/{trimmed}"))
}

fn join_virtual(chroot: &str, clean_path: &str) -> String {
    let chroot = chroot.trim_matches('/');
    let rest = clean_path.trim_matches('/');
    if chroot.is_empty() {
        format!("/{rest}")
    } else if rest.is_empty() {
        format!("/{chroot}")
    } else {
        format!("/{chroot}/{rest}")
    }
}

fn join_under_root(clean_path: &str, root: &Path) -> Result<PathBuf> {
    let real = root.join(clean_path.trim_start_matches('/'));
    let fly_root = root.join(".fly");

    if real.starts_with(&fly_root) {
        return Err(Error::Reserved);
    }

    Ok(real)
}

fn authorize(user: &User, clean_path: &str, action: Action, rtxn: &RTxn<'_>) -> bool {
    if user.admin {
        return true;
    }

    let policies = rtxn.get_policies(clean_path, &user.username, action);

    if policies.is_empty() {
        return false; // implicit deny
    }

    !policies.iter().any(|p| p.verb == Verb::Deny) // explicit deny
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Handle;

    fn admin_user() -> User {
        User { username: "root".into(), password: String::new(), chroot: "/".into(), admin: true }
    }

    fn plain_user(chroot: &str) -> User {
        User { username: "bob".into(), password: String::new(), chroot: chroot.into(), admin: false }
    }

    #[test]
    fn rejects_dot_segments() {
        assert_eq!(normalize("/a/../b").unwrap_err(), Error::Invalid);
        assert_eq!(normalize("/a/./b").unwrap_err(), Error::Invalid);
    }

    #[tokio::test]
    async fn admin_bypasses_implicit_and_explicit_deny() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = Handle::open(tmp.path()).await.unwrap();
        let rtxn = handle.rtxn().await;
        let user = admin_user();

        let result = resolve("/secret", Action::Read, &user, &rtxn, tmp.path());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn implicit_deny_with_no_policies() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = Handle::open(tmp.path()).await.unwrap();
        let rtxn = handle.rtxn().await;
        let user = plain_user("/");

        let err = resolve("/anything", Action::Read, &user, &rtxn, tmp.path()).unwrap_err();
        assert_eq!(err, Error::Denied);
    }

    #[tokio::test]
    async fn reserved_path_denied_even_for_admin() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = Handle::open(tmp.path()).await.unwrap();
        let rtxn = handle.rtxn().await;
        let user = admin_user();

        let err = resolve("/.fly/users.csv", Action::Read, &user, &rtxn, tmp.path()).unwrap_err();
        assert_eq!(err, Error::Reserved);
    }

    // helper to call resolve with argument order matching the public fn
    fn resolve(
        vpath: &str,
        action: Action,
        user: &User,
        rtxn: &RTxn<'_>,
        root: &Path,
    ) -> Result<PathBuf> {
        super::resolve(vpath, user, action, rtxn, root)
    }
}
