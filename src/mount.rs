//! Mount lifecycle
//!
//! A mount goes unmounted → mounted → unmounted exactly once. The tree is
//! built completely before the kernel sees the mountpoint; a malformed
//! archive fails [`mount`] without exposing anything.

use bytes::Bytes;
use fuser::{BackgroundSession, MountOption};
use parking_lot::Mutex;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::archive::{EntryParser, ReadAt};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fs::TarFs;
use crate::monitor::Monitor;
use crate::tree::NodeTree;

/// Parse the archive and build its tree
pub fn build_tree(source: Arc<dyn ReadAt>, config: &Config) -> Result<NodeTree> {
    let mut parser = EntryParser::new(source.clone())?;
    NodeTree::build(parser.entries()?, source, &config.archive)
}

/// Mount `source` read-only at `mountpoint`, reporting accesses to `monitor`
pub fn mount<P: AsRef<Path>>(
    mountpoint: P,
    source: Arc<dyn ReadAt>,
    monitor: Arc<dyn Monitor>,
    config: &Config,
) -> Result<MountHandle> {
    let mountpoint = mountpoint.as_ref().to_path_buf();
    config.validate()?;

    let tree = Arc::new(build_tree(source, config)?);
    info!("Built tree with {} nodes", tree.node_count());

    let mount_err = |source: io::Error| Error::Mount {
        mountpoint: mountpoint.clone(),
        source,
    };
    let underlying_dev = device_of(&mountpoint).map_err(mount_err)?;

    let mut options = vec![
        MountOption::RO,
        MountOption::FSName(config.mount.fsname.clone()),
    ];
    if config.mount.allow_other {
        options.push(MountOption::AllowOther);
    }
    if config.mount.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let fs = TarFs::new(tree, monitor, config);
    let session = fuser::spawn_mount2(fs, &mountpoint, &options).map_err(mount_err)?;
    info!("Mounted at {:?}", mountpoint);

    Ok(MountHandle {
        mountpoint,
        underlying_dev,
        session: Mutex::new(Some(session)),
        unmounted: AtomicBool::new(false),
    })
}

/// Like [`mount`], buffering a sequential stream into memory first
pub fn mount_reader<P: AsRef<Path>, R: Read>(
    mountpoint: P,
    mut reader: R,
    monitor: Arc<dyn Monitor>,
    config: &Config,
) -> Result<MountHandle> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    debug!("Buffered {} bytes of archive", data.len());
    mount(mountpoint, Arc::new(Bytes::from(data)), monitor, config)
}

/// Handle to a live mount
pub struct MountHandle {
    mountpoint: PathBuf,
    /// Device of the directory underneath the mount
    underlying_dev: libc::dev_t,
    session: Mutex<Option<BackgroundSession>>,
    unmounted: AtomicBool,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .field("unmounted", &self.is_unmounted())
            .finish()
    }
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::SeqCst)
    }

    /// Unmount and release the session.
    ///
    /// Calling this again after success is a no-op. On failure the handle
    /// stays mounted and the call can be retried.
    pub fn cleanup(&self) -> Result<()> {
        if self.is_unmounted() {
            return Ok(());
        }
        let mut session = self.session.lock();
        if self.is_unmounted() {
            return Ok(());
        }

        if let Some(session) = session.take() {
            debug!("Stopping FUSE session for {:?}", self.mountpoint);
            session.join();
        }
        if self.is_mounted() {
            self.force_unmount()?;
        }

        self.unmounted.store(true, Ordering::SeqCst);
        info!("Unmounted {:?}", self.mountpoint);
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        match device_of(&self.mountpoint) {
            Ok(dev) => dev != self.underlying_dev,
            // A dead FUSE connection fails stat with ENOTCONN.
            Err(_) => true,
        }
    }

    /// Detach a mount the session failed to take down
    fn force_unmount(&self) -> Result<()> {
        warn!("{:?} still mounted, detaching", self.mountpoint);

        #[cfg(target_os = "linux")]
        {
            use nix::mount::{umount2, MntFlags};
            match umount2(&self.mountpoint, MntFlags::MNT_DETACH) {
                Ok(()) if !self.is_mounted() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("umount2 failed: {}", e),
            }
        }

        // Unprivileged fallback.
        let output = Command::new("fusermount")
            .arg("-u")
            .arg("-z")
            .arg(&self.mountpoint)
            .output();
        match output {
            Ok(output) if output.status.success() && !self.is_mounted() => Ok(()),
            Ok(output) => Err(Error::Unmount {
                mountpoint: self.mountpoint.clone(),
                source: io::Error::new(
                    io::ErrorKind::Other,
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ),
            }),
            Err(source) => Err(Error::Unmount {
                mountpoint: self.mountpoint.clone(),
                source,
            }),
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Failed to unmount {:?}: {}", self.mountpoint, e);
        }
    }
}

fn device_of(path: &Path) -> io::Result<libc::dev_t> {
    let stat = nix::sys::stat::stat(path).map_err(io::Error::from)?;
    Ok(stat.st_dev)
}
