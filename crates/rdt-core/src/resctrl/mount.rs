//! Mounting/unmounting the resctrl pseudo-filesystem (spec.md §4.D,
//! §6). Mount data is the comma-joined subset of `{"cdp", "cdpl2",
//! "mba_MBps"}`: `cdp`/`cdpl2` turn CDP on for L3/L2 at mount time,
//! `mba_MBps` selects MBA-CTRL (direct MB/s) mode instead of percent
//! mode. Changing any of these after the fact requires unmount+remount
//! (spec.md §4.E.9 "full reset").

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub l3_cdp: bool,
    pub l2_cdp: bool,
    pub mba_mbps: bool,
}

impl MountOptions {
    pub fn mount_data(&self) -> String {
        let mut opts = Vec::new();
        if self.l3_cdp {
            opts.push("cdp");
        }
        if self.l2_cdp {
            opts.push("cdpl2");
        }
        if self.mba_mbps {
            opts.push("mba_MBps");
        }
        opts.join(",")
    }
}

/// Is resctrl already mounted and usable — i.e. does the root group's
/// `cpus` bitmap file exist (spec.md §4.D "if resctrl is selected but
/// the `cpus` bitmap file is not yet present")?
pub fn is_mounted(root: &Path) -> bool {
    root.join("cpus").exists()
}

pub fn mount(root: &Path, opts: MountOptions) -> Result<()> {
    fs::create_dir_all(root).map_err(Error::Io)?;
    let data = opts.mount_data();
    nix::mount::mount(
        Some("resctrl"),
        root,
        Some("resctrl"),
        nix::mount::MsFlags::empty(),
        if data.is_empty() { None } else { Some(data.as_str()) },
    )
    .map_err(|e| Error::interface(format!("mount resctrl failed: {e}")))
}

pub fn unmount(root: &Path) -> Result<()> {
    nix::mount::umount(root).map_err(|e| Error::interface(format!("umount resctrl failed: {e}")))
}
