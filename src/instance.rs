//! Stable per-process instance identity backed by PID lock files.
//!
//! Each (client id, environment) pair hashes to a key; up to [`MAX_SLOTS`]
//! numbered slots exist per key, each consisting of a `.pid` and a `.uuid`
//! file under `<system-tmp>/apitally/`. A process claims the first free slot
//! through an exclusive create of the pid file and keeps the slot's UUID.
//! Hot reloads that reuse the same PID find their old slot and keep the same
//! identity. If the filesystem is unusable the identity degrades to an
//! ephemeral random UUID.

use std::{
    collections::HashSet,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Maximum number of concurrently claimable slots per (client, env) pair.
const MAX_SLOTS: u32 = 100;
/// UUID files untouched for longer than this are considered stale.
const UUID_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolve the instance UUID for this process.
pub(crate) fn get_instance_uuid(client_id: Uuid, env: &str) -> Uuid {
    acquire_instance_uuid(&std::env::temp_dir().join("apitally"), client_id, env)
}

/// Resolve the instance UUID using lock files under `dir`.
pub(crate) fn acquire_instance_uuid(dir: &Path, client_id: Uuid, env: &str) -> Uuid {
    let hash = hash_key(client_id, env);
    match try_acquire(dir, &hash) {
        Ok(uuid) => uuid,
        Err(err) => {
            debug!(error = %err, "could not use instance lock files, using ephemeral instance uuid");
            Uuid::new_v4()
        }
    }
}

/// First 8 hex characters of the SHA-256 digest over `<client_id>:<env>`.
fn hash_key(client_id: Uuid, env: &str) -> String {
    let digest = Sha256::digest(format!("{client_id}:{env}").as_bytes());
    hex::encode(digest)[..8].to_owned()
}

fn pid_path(dir: &Path, hash: &str, slot: u32) -> PathBuf {
    dir.join(format!("instance_{hash}_{slot}.pid"))
}

fn uuid_path(dir: &Path, hash: &str, slot: u32) -> PathBuf {
    dir.join(format!("instance_{hash}_{slot}.uuid"))
}

fn try_acquire(dir: &Path, hash: &str) -> io::Result<Uuid> {
    fs::create_dir_all(dir)?;
    sweep(dir, hash);

    let pid = std::process::id();
    for slot in 0..MAX_SLOTS {
        let pid_file = pid_path(dir, hash, slot);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&pid_file)
        {
            Ok(mut file) => {
                file.write_all(pid.to_string().as_bytes())?;
                return ensure_uuid_file(&uuid_path(dir, hash, slot));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // Slot taken. A hot reload keeps its PID, so a matching pid
                // file means this is still our slot.
                if read_pid(&pid_file) == Some(pid) {
                    return ensure_uuid_file(&uuid_path(dir, hash, slot));
                }
            }
            Err(_) => {}
        }
    }
    Err(io::Error::other("no free instance slot"))
}

/// Remove stale, invalid and duplicate lock files for the given hash key.
fn sweep(dir: &Path, hash: &str) {
    let mut seen = HashSet::new();
    for slot in 0..MAX_SLOTS {
        let uuid_file = uuid_path(dir, hash, slot);
        if let Ok(content) = fs::read_to_string(&uuid_file) {
            let uuid = Uuid::try_parse(content.trim()).ok();
            let stale = fs::metadata(&uuid_file)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .is_some_and(|age| age > UUID_MAX_AGE);
            match uuid {
                Some(uuid) if !stale && seen.insert(uuid) => {}
                _ => {
                    let _ = fs::remove_file(&uuid_file);
                }
            }
        }
        let pid_file = pid_path(dir, hash, slot);
        if pid_file.exists() && !read_pid(&pid_file).is_some_and(process_alive) {
            let _ = fs::remove_file(&pid_file);
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Reuse the UUID stored at `path` if it is valid, otherwise store a fresh one.
fn ensure_uuid_file(path: &Path) -> io::Result<Uuid> {
    if let Ok(content) = fs::read_to_string(path) {
        if let Ok(uuid) = Uuid::try_parse(content.trim()) {
            return Ok(uuid);
        }
    }
    let uuid = Uuid::new_v4();
    fs::write(path, uuid.to_string())?;
    Ok(uuid)
}

/// Probe whether a process with the given PID is alive.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // EPERM means the process exists but belongs to someone else.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Liveness cannot be probed here; report not-alive so stale slots are
/// reclaimed eventually.
#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_ID: &str = "076f0b05-4d67-4981-86b9-7d7a1dd4b210";

    fn client_id() -> Uuid {
        Uuid::try_parse(CLIENT_ID).unwrap()
    }

    #[test]
    fn uuid_is_stable_within_process() {
        let dir = tempfile::tempdir().unwrap();
        let first = acquire_instance_uuid(dir.path(), client_id(), "dev");
        let second = acquire_instance_uuid(dir.path(), client_id(), "dev");
        assert_eq!(first, second);
    }

    #[test]
    fn different_envs_get_different_uuids() {
        let dir = tempfile::tempdir().unwrap();
        let dev = acquire_instance_uuid(dir.path(), client_id(), "dev");
        let prod = acquire_instance_uuid(dir.path(), client_id(), "prod");
        assert_ne!(dev, prod);
    }

    #[test]
    fn invalid_uuid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let hash = hash_key(client_id(), "dev");
        fs::write(uuid_path(dir.path(), &hash, 0), "not-a-uuid").unwrap();

        let uuid = acquire_instance_uuid(dir.path(), client_id(), "dev");
        let stored = fs::read_to_string(uuid_path(dir.path(), &hash, 0)).unwrap();
        assert_eq!(Uuid::try_parse(stored.trim()).unwrap(), uuid);
    }

    #[test]
    fn duplicate_uuid_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let hash = hash_key(client_id(), "dev");
        let duplicate = Uuid::new_v4();
        fs::write(uuid_path(dir.path(), &hash, 0), duplicate.to_string()).unwrap();
        fs::write(uuid_path(dir.path(), &hash, 1), duplicate.to_string()).unwrap();

        let uuid = acquire_instance_uuid(dir.path(), client_id(), "dev");
        assert_eq!(uuid, duplicate);
        assert!(!uuid_path(dir.path(), &hash, 1).exists());
    }

    #[test]
    fn dead_pid_file_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let hash = hash_key(client_id(), "dev");
        let old_uuid = Uuid::new_v4();
        // A PID far above any default pid_max, so certainly not running.
        fs::write(pid_path(dir.path(), &hash, 0), "999999999").unwrap();
        fs::write(uuid_path(dir.path(), &hash, 0), old_uuid.to_string()).unwrap();

        let uuid = acquire_instance_uuid(dir.path(), client_id(), "dev");
        assert_eq!(uuid, old_uuid);
        let stored = fs::read_to_string(pid_path(dir.path(), &hash, 0)).unwrap();
        assert_eq!(stored.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn unusable_directory_falls_back_to_ephemeral() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file cannot be used as the lock directory.
        let uuid = acquire_instance_uuid(file.path(), client_id(), "dev");
        assert_ne!(uuid, Uuid::nil());
    }
}
