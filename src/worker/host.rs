//! Host-side filesystem operations performed by the node agent.
//!
//! The node agent owns the per-volume directories under the `/pav` root and
//! the bind mounts into kubelet's publish targets. All of this runs in the
//! agent's mount namespace, which shares the host's via bidirectional
//! propagation.

use std::collections::HashSet;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::Error;

/// Size of a block device in bytes.
pub fn block_device_size(path: &Path) -> Result<i64, Error> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::internal(format!("cannot open {}: {e}", path.display())))?;

    let size = file
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::internal(format!("cannot size {}: {e}", path.display())))?;

    i64::try_from(size).map_err(|_| Error::internal(format!("{} is too large", path.display())))
}

/// Bind-mount `source` onto `target`, creating the target first: a
/// directory for directory sources, an empty file for device (or other
/// non-directory) sources.
pub async fn bind_mount(source: &Path, target: &Path) -> Result<(), Error> {
    if source.is_dir() {
        std::fs::create_dir_all(target)
            .map_err(|e| Error::internal(format!("cannot create {}: {e}", target.display())))?;
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::internal(format!("cannot create {}: {e}", parent.display())))?;
        }
        if !target.exists() {
            std::fs::File::create(target)
                .map_err(|e| Error::internal(format!("cannot create {}: {e}", target.display())))?;
        }
    }

    run_checked(Command::new("/bin/mount").arg("--bind").arg(source).arg(target)).await
}

/// Undo a publish-target bind mount and remove the target. Both steps are
/// no-ops if already undone, so unpublish stays idempotent.
pub async fn unmount_target(target: &Path) -> Result<(), Error> {
    if !target.exists() {
        return Ok(());
    }

    // ignore failure: the target may never have been mounted
    let _ = Command::new("/bin/umount")
        .arg("--no-canonicalize")
        .arg(target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let result = if target.is_dir() {
        std::fs::remove_dir(target)
    } else {
        std::fs::remove_file(target)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::internal(format!(
            "cannot remove {}: {e}",
            target.display()
        ))),
    }
}

/// Unmount everything under `directory` and remove it.
///
/// Layered mounts can hide other mounts, so top-level mount points are
/// re-discovered and unmounted until none remain. Unmounts are forced to
/// abort requests whose backing (e.g. FUSE) process is gone, and skip
/// canonicalization to avoid submitting further metadata requests.
pub async fn teardown_volume_dir(directory: &Path) -> Result<(), Error> {
    loop {
        let mount_points = find_top_level_mounts(directory)?;
        if mount_points.is_empty() {
            break;
        }

        for mount_point in mount_points {
            debug!(path = %mount_point.display(), "unmounting leftover mount point");
            run_checked(
                Command::new("/bin/umount")
                    .arg("--force")
                    .arg("--no-canonicalize")
                    .arg("--recursive")
                    .arg(&mount_point),
            )
            .await?;
        }
    }

    if directory.exists() {
        std::fs::remove_dir_all(directory)
            .map_err(|e| Error::internal(format!("cannot remove {}: {e}", directory.display())))?;
    }

    Ok(())
}

/// Mount points under `directory` (excluding it) that are not themselves
/// under any other mount point below `directory`.
pub fn find_top_level_mounts(directory: &Path) -> Result<HashSet<PathBuf>, Error> {
    debug_assert!(directory.is_absolute());

    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| Error::internal(format!("cannot read mountinfo: {e}")))?;

    Ok(top_level_mounts_from_mountinfo(&mountinfo, directory))
}

fn top_level_mounts_from_mountinfo(mountinfo: &str, directory: &Path) -> HashSet<PathBuf> {
    let under_dir: HashSet<PathBuf> = mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(decode_mountinfo_path(field)))
        .filter(|mount_point| mount_point.starts_with(directory) && mount_point != directory)
        .collect();

    under_dir
        .iter()
        .filter(|mount_point| {
            !under_dir
                .iter()
                .any(|other| *mount_point != other && mount_point.starts_with(other))
        })
        .cloned()
        .collect()
}

/// Decode the octal escapes (`\040` for space, etc.) mountinfo uses.
fn decode_mountinfo_path(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        out.push(c);
    }

    out
}

async fn run_checked(command: &mut Command) -> Result<(), Error> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| Error::internal(format!("cannot run command: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(Error::internal(format!(
            "command failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
36 35 98:0 /mnt1 /var/lib/kubernetes-pav/vol-a rw,noatime - ext3 /dev/root rw
37 36 98:1 / /var/lib/kubernetes-pav/vol-a/nested rw - ext3 /dev/sdb rw
38 35 98:2 / /var/lib/kubernetes-pav/vol-b rw - ext3 /dev/sdc rw
39 35 98:3 / /var/lib/other rw - ext3 /dev/sdd rw
40 35 98:4 / /var/lib/kubernetes-pav/with\\040space rw - ext3 /dev/sde rw";

    #[test]
    fn top_level_mounts_exclude_nested_and_unrelated_ones() {
        let mounts = top_level_mounts_from_mountinfo(
            MOUNTINFO,
            Path::new("/var/lib/kubernetes-pav"),
        );

        assert!(mounts.contains(Path::new("/var/lib/kubernetes-pav/vol-a")));
        assert!(mounts.contains(Path::new("/var/lib/kubernetes-pav/vol-b")));
        assert!(!mounts.contains(Path::new("/var/lib/kubernetes-pav/vol-a/nested")));
        assert!(!mounts.contains(Path::new("/var/lib/other")));
    }

    #[test]
    fn the_directory_itself_is_never_a_result() {
        let mounts = top_level_mounts_from_mountinfo(
            "36 35 98:0 / /var/lib/kubernetes-pav rw - ext3 /dev/root rw",
            Path::new("/var/lib/kubernetes-pav"),
        );
        assert!(mounts.is_empty());
    }

    #[test]
    fn octal_escapes_decode() {
        assert_eq!(decode_mountinfo_path("a\\040b"), "a b");
        assert_eq!(decode_mountinfo_path("tab\\011here"), "tab\there");
        assert_eq!(decode_mountinfo_path("plain"), "plain");

        let mounts =
            top_level_mounts_from_mountinfo(MOUNTINFO, Path::new("/var/lib/kubernetes-pav"));
        assert!(mounts.contains(Path::new("/var/lib/kubernetes-pav/with space")));
    }
}
