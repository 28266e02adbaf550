//! Utility functionality

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};

/// Default PATH handed to containers and appended to the user PATH.
pub const DEFAULT_PATH: &str = "/bin:/usr/bin:/sbin:/usr/sbin:/usr/local/bin:/usr/local/sbin";

/// Get a nix::unistd::User via UID. Potential errors will be ignored.
pub fn get_unix_user(uid: Uid) -> Option<User> {
    User::from_uid(uid).ok().flatten()
}

/// Get home path of a User via UID.
pub fn get_user_home(uid: u32) -> Option<PathBuf> {
    get_unix_user(Uid::from_raw(uid)).map(|user| user.dir)
}

/// Name of the user owning `uid`, or the numeric uid when the passwd
/// database has no entry.
pub fn get_username(uid: u32) -> String {
    get_unix_user(Uid::from_raw(uid))
        .map(|user| user.name)
        .unwrap_or_else(|| uid.to_string())
}

/// Reports whether the current process runs inside a user namespace other
/// than the initial one.
pub fn is_in_new_userns() -> bool {
    match fs::read_to_string("/proc/self/uid_map") {
        Ok(content) => !content.contains("4294967295"),
        Err(err) => {
            tracing::debug!(?err, "failed to read /proc/self/uid_map");
            false
        }
    }
}

/// Recursively adds owner rwx permissions so a tree extracted with odd
/// permissions can be removed by its owner.
pub fn fix_perms_for_removal(path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    if metadata.file_type().is_symlink() {
        return;
    }
    let mode = metadata.permissions().mode() | 0o700;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        tracing::debug!(?path, ?err, "failed to fix permissions");
    }
    if metadata.is_dir() {
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                fix_perms_for_removal(&entry.path());
            }
        }
    }
}
