use crate::MountSpec;
use crate::error::MountError;
use nix::mount::{MsFlags, mount};
use std::path::Path;

/// Splits mount options into kernel flags and the filesystem data string.
pub fn parse_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "private" => flags |= MsFlags::MS_PRIVATE,
            "rprivate" => flags |= MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

/// Mounts a single rootfs descriptor onto `target`.
///
/// Supports:
/// - overlay: options are passed through as `lowerdir`/`upperdir`/`workdir`
/// - bind, rbind: bind mount from source to target, `ro` applied by remount
pub fn mount_spec(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    std::fs::create_dir_all(target)?;

    match spec.mount_type.as_str() {
        "overlay" => mount_overlay(spec, target),
        "bind" | "rbind" => mount_bind(spec, target),
        other => Err(MountError::UnsupportedType(other.to_string())),
    }
}

/// Mounts every descriptor in order onto `target`.
pub fn mount_all(specs: &[MountSpec], target: &Path) -> Result<(), MountError> {
    for spec in specs {
        mount_spec(spec, target)?;
    }
    Ok(())
}

fn mount_overlay(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    let (flags, data) = parse_options(&spec.options);
    if !data.contains("lowerdir=") {
        return Err(MountError::BadOptions {
            mount_type: spec.mount_type.clone(),
            reason: "missing lowerdir".to_string(),
        });
    }

    tracing::info!(target = %target.display(), options = %data, "Mounting overlay");

    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        flags,
        Some(data.as_str()),
    )
    .map_err(|errno| MountError::Mount {
        kind: "overlay",
        target: target.to_path_buf(),
        errno,
    })?;

    Ok(())
}

fn mount_bind(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    let source = Path::new(&spec.source);
    let (mut flags, _) = parse_options(&spec.options);
    flags |= MsFlags::MS_BIND;
    if spec.mount_type == "rbind" {
        flags |= MsFlags::MS_REC;
    }
    let read_only = flags.contains(MsFlags::MS_RDONLY);

    tracing::info!(
        source = %source.display(),
        target = %target.display(),
        flags = ?flags,
        "Bind mounting rootfs"
    );

    mount(
        Some(source),
        target,
        None::<&str>,
        flags & !MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|errno| MountError::Mount {
        kind: "bind",
        target: target.to_path_buf(),
        errno,
    })?;

    // MS_RDONLY is ignored on the initial bind.
    if read_only {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|errno| MountError::Mount {
            kind: "read-only remount",
            target: target.to_path_buf(),
            errno,
        })?;
    }

    Ok(())
}
