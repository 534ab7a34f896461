//! Filesystem quiesce for crash-consistent host snapshots.
//!
//! Freeze and thaw are globally serialized by the dispatcher; at most one
//! of either runs at a time. The kernel-side FIFREEZE can block while
//! dirty pages flush, so the ioctl pass runs on the blocking pool.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use helion_shared::ops::{self, FreezeRequest, FreezeResponse, op};
use tracing::info;

use super::{Handler, HandlerError, RequestContext};

pub struct FsFreezeHandler;

impl Handler for FsFreezeHandler {
    fn operation(&self) -> &'static str {
        op::FS_FREEZE
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        run(ctx, Direction::Freeze).boxed()
    }
}

pub struct FsThawHandler;

impl Handler for FsThawHandler {
    fn operation(&self) -> &'static str {
        op::FS_THAW
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        run(ctx, Direction::Thaw).boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Freeze,
    Thaw,
}

async fn run(ctx: RequestContext, direction: Direction) -> Result<Vec<u8>, HandlerError> {
    let req: FreezeRequest = ctx.decode()?;
    let targets = resolve_targets(&req).await?;
    if targets.is_empty() {
        return Err(HandlerError::Unsupported(
            "no quiescable filesystems".into(),
        ));
    }

    let affected = tokio::task::spawn_blocking(move || match direction {
        Direction::Freeze => platform::freeze_all(targets),
        Direction::Thaw => platform::thaw_all(targets),
    })
    .await
    .map_err(|err| HandlerError::Internal(format!("quiesce task: {err}")))??;

    info!(
        cid = ctx.correlation_id,
        ?direction,
        count = affected.len(),
        "filesystem quiesce"
    );
    Ok(ops::encode(&FreezeResponse {
        mountpoints: affected,
    })?)
}

/// Explicit list from the request, or every quiescable mount. Nested
/// mounts come first so freezing never writes through a frozen parent.
async fn resolve_targets(req: &FreezeRequest) -> Result<Vec<String>, HandlerError> {
    if !req.mountpoints.is_empty() {
        for mountpoint in &req.mountpoints {
            if !std::path::Path::new(mountpoint).is_absolute() {
                return Err(HandlerError::InvalidArgument(format!(
                    "mountpoint must be absolute: {mountpoint}"
                )));
            }
        }
        return Ok(req.mountpoints.clone());
    }

    let text = tokio::fs::read_to_string("/proc/self/mounts")
        .await
        .map_err(|err| HandlerError::Unsupported(format!("no mount table: {err}")))?;
    Ok(quiesce_targets(&parse_mounts(&text)))
}

/// Filesystems that implement FIFREEZE.
const QUIESCABLE: &[&str] = &[
    "ext2", "ext3", "ext4", "xfs", "btrfs", "f2fs", "jfs", "reiserfs",
];

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MountEntry {
    pub mountpoint: String,
    pub fstype: String,
    pub writable: bool,
}

pub(crate) fn parse_mounts(text: &str) -> Vec<MountEntry> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let mountpoint = unescape_mount_path(fields.next()?);
            let fstype = fields.next()?.to_string();
            let options = fields.next()?;
            let writable = options.split(',').all(|opt| opt != "ro");
            Some(MountEntry {
                mountpoint,
                fstype,
                writable,
            })
        })
        .collect()
}

/// The kernel escapes whitespace in mount paths as octal (`\040` etc).
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}

pub(crate) fn quiesce_targets(mounts: &[MountEntry]) -> Vec<String> {
    let mut targets: Vec<&MountEntry> = mounts
        .iter()
        .filter(|m| m.writable && QUIESCABLE.contains(&m.fstype.as_str()))
        .collect();
    // Deepest first (a nested mount path strictly contains its parent),
    // and one entry per mountpoint even with overmounts.
    targets.sort_by_key(|m| std::cmp::Reverse(m.mountpoint.len()));
    let mut seen = std::collections::HashSet::new();
    targets
        .into_iter()
        .filter(|m| seen.insert(m.mountpoint.clone()))
        .map(|m| m.mountpoint.clone())
        .collect()
}

#[cfg(target_os = "linux")]
mod platform {
    use std::os::fd::AsRawFd;

    use nix::errno::Errno;
    use tracing::warn;

    use super::HandlerError;

    nix::ioctl_readwrite!(fifreeze, b'X', 119, libc::c_int);
    nix::ioctl_readwrite!(fithaw, b'X', 120, libc::c_int);

    /// Freeze every target or none: a failure rolls back the mounts
    /// already frozen, in reverse order.
    pub(super) fn freeze_all(targets: Vec<String>) -> Result<Vec<String>, HandlerError> {
        let mut frozen: Vec<String> = Vec::new();
        for mountpoint in &targets {
            match freeze_one(mountpoint) {
                Ok(()) => frozen.push(mountpoint.clone()),
                Err(err) => {
                    for done in frozen.iter().rev() {
                        if let Err(thaw_err) = thaw_one(done) {
                            warn!(mountpoint = %done, %thaw_err, "rollback thaw failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(frozen)
    }

    pub(super) fn thaw_all(targets: Vec<String>) -> Result<Vec<String>, HandlerError> {
        let mut thawed = Vec::new();
        for mountpoint in &targets {
            match thaw_one(mountpoint) {
                Ok(true) => thawed.push(mountpoint.clone()),
                Ok(false) => {} // was not frozen
                Err(err) => return Err(err),
            }
        }
        Ok(thawed)
    }

    fn freeze_one(mountpoint: &str) -> Result<(), HandlerError> {
        let dir = std::fs::File::open(mountpoint)
            .map_err(|err| HandlerError::NotFound(format!("{mountpoint}: {err}")))?;
        let mut arg: libc::c_int = 0;
        match unsafe { fifreeze(dir.as_raw_fd(), &mut arg) } {
            Ok(_) => Ok(()),
            // Frozen by someone else already; the snapshot still works.
            Err(Errno::EBUSY) => Ok(()),
            Err(Errno::EOPNOTSUPP) | Err(Errno::ENOTTY) => Err(HandlerError::Unsupported(format!(
                "{mountpoint} does not support quiesce"
            ))),
            Err(err) => Err(HandlerError::Internal(format!(
                "freeze {mountpoint}: {err}"
            ))),
        }
    }

    /// Ok(false) means the mount was not frozen in the first place.
    fn thaw_one(mountpoint: &str) -> Result<bool, HandlerError> {
        let dir = std::fs::File::open(mountpoint)
            .map_err(|err| HandlerError::NotFound(format!("{mountpoint}: {err}")))?;
        let mut arg: libc::c_int = 0;
        match unsafe { fithaw(dir.as_raw_fd(), &mut arg) } {
            Ok(_) => Ok(true),
            Err(Errno::EINVAL) => Ok(false),
            Err(Errno::EOPNOTSUPP) | Err(Errno::ENOTTY) => Err(HandlerError::Unsupported(format!(
                "{mountpoint} does not support quiesce"
            ))),
            Err(err) => Err(HandlerError::Internal(format!("thaw {mountpoint}: {err}"))),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::HandlerError;

    pub(super) fn freeze_all(_targets: Vec<String>) -> Result<Vec<String>, HandlerError> {
        Err(HandlerError::Unsupported(
            "filesystem quiesce is only supported on Linux guests".into(),
        ))
    }

    pub(super) fn thaw_all(_targets: Vec<String>) -> Result<Vec<String>, HandlerError> {
        Err(HandlerError::Unsupported(
            "filesystem quiesce is only supported on Linux guests".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
/dev/vda2 / ext4 rw,relatime 0 0
/dev/vda1 /boot ext4 rw,relatime 0 0
tmpfs /run tmpfs rw,nosuid 0 0
/dev/vdb1 /var/lib/data xfs rw,noatime 0 0
/dev/vdc1 /mnt/read\\040only ext4 ro,relatime 0 0
proc /proc proc rw,nosuid 0 0
";

    #[test]
    fn parses_the_mount_table() {
        let mounts = parse_mounts(SAMPLE);
        assert_eq!(mounts.len(), 6);
        assert_eq!(mounts[0].mountpoint, "/");
        assert_eq!(mounts[0].fstype, "ext4");
        assert!(mounts[0].writable);
        assert_eq!(mounts[4].mountpoint, "/mnt/read only");
        assert!(!mounts[4].writable);
    }

    #[test]
    fn targets_are_writable_quiescable_and_deepest_first() {
        let targets = quiesce_targets(&parse_mounts(SAMPLE));
        assert_eq!(targets, vec!["/var/lib/data", "/boot", "/"]);
    }

    #[test]
    fn overmounts_collapse_to_one_target() {
        let mounts = vec![
            MountEntry {
                mountpoint: "/data".into(),
                fstype: "ext4".into(),
                writable: true,
            },
            MountEntry {
                mountpoint: "/data".into(),
                fstype: "xfs".into(),
                writable: true,
            },
        ];
        assert_eq!(quiesce_targets(&mounts), vec!["/data"]);
    }

    #[tokio::test]
    async fn relative_explicit_mountpoint_is_invalid() {
        use crate::handler::testutil::test_ctx;
        let payload = ops::encode(&FreezeRequest {
            mountpoints: vec!["not/absolute".into()],
        })
        .unwrap();
        let (ctx, _e) = test_ctx(op::FS_FREEZE, payload, None);
        assert!(matches!(
            FsFreezeHandler.handle(ctx).await,
            Err(HandlerError::InvalidArgument(_))
        ));
    }
}
