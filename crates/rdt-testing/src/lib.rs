//! Integration-test support: builds a fake `/sys/fs/resctrl`-shaped
//! tree under a tempdir so the resctrl backend can be exercised
//! end-to-end without real hardware or kernel support.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A throwaway resctrl root populated with the `info/*` files
/// [`rdt_core::capability::discover_resctrl`] expects plus a root
/// `schemata`/`cpus`/`tasks`, matching a two-socket, two-L3-cluster,
/// four-core platform with CAT, CDP, and MBA-CTRL support.
pub struct FakeResctrl {
    _dir: TempDir,
    pub root: PathBuf,
}

impl FakeResctrl {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();

        let l3 = root.join("info/L3");
        fs::create_dir_all(&l3).unwrap();
        fs::write(l3.join("cbm_mask"), "ffff\n").unwrap();
        fs::write(l3.join("num_closids"), "16\n").unwrap();
        fs::write(l3.join("shareable_bits"), "0\n").unwrap();

        let mb = root.join("info/MB");
        fs::create_dir_all(&mb).unwrap();
        fs::write(mb.join("num_closids"), "8\n").unwrap();
        fs::write(mb.join("bandwidth_gran"), "10\n").unwrap();
        fs::write(mb.join("delay_linear"), "1\n").unwrap();

        let mon = root.join("info/L3_MON");
        fs::create_dir_all(&mon).unwrap();
        fs::write(mon.join("num_rmids"), "32\n").unwrap();
        fs::write(mon.join("max_threshold_occupancy"), "1048576\n").unwrap();
        fs::write(mon.join("mon_features"), "llc_occupancy\nmbm_total_bytes\nmbm_local_bytes\n").unwrap();

        fs::write(root.join("cpus"), "0000000f").unwrap();
        fs::write(root.join("schemata"), "L3:0=ffff\nMB:0=100\n").unwrap();
        fs::write(root.join("tasks"), "").unwrap();

        FakeResctrl { _dir: dir, root }
    }

    pub fn create_cos(&self, cos: u32) {
        let dir = self.root.join(format!("COS{cos}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cpus"), "0").unwrap();
        fs::write(dir.join("tasks"), "").unwrap();
        fs::write(dir.join("schemata"), "L3:0=ffff\nMB:0=100\n").unwrap();
    }

    pub fn write_mon_counter(&self, mon_dir: &Path, l3_id: u32, file: &str, value: u64) {
        let dir = mon_dir.join("mon_data").join(format!("mon_L3_{l3_id}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), value.to_string()).unwrap();
    }
}

impl Default for FakeResctrl {
    fn default() -> Self {
        Self::new()
    }
}
