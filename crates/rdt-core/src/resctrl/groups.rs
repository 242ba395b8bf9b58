//! resctrl group-directory operations (spec.md §6, Component G):
//! create/remove `COS<k>` directories, read/write their `cpus`/`tasks`
//! files, and manage `mon_groups/<name>` subdirectories and their
//! `mon_data/mon_L3_<id>/*` counter files.

use crate::error::{Error, Result};
use crate::resctrl::cpumask;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub fn cos_dir(root: &Path, cos: u32) -> PathBuf {
    if cos == 0 {
        root.to_path_buf()
    } else {
        root.join(format!("COS{cos}"))
    }
}

pub fn create_cos_dir(root: &Path, cos: u32) -> Result<()> {
    if cos == 0 {
        return Ok(());
    }
    match fs::create_dir(cos_dir(root, cos)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::busy(format!("mkdir COS{cos}: {e}"))),
    }
}

pub fn remove_cos_dir(root: &Path, cos: u32) -> Result<()> {
    if cos == 0 {
        return Ok(());
    }
    let dir = cos_dir(root, cos);
    if !dir.exists() {
        return Ok(());
    }
    fs::remove_dir_all(dir).map_err(Error::Io)
}

pub fn read_cpus(root: &Path, cos: u32) -> Result<BTreeSet<u32>> {
    let text = fs::read_to_string(cos_dir(root, cos).join("cpus")).map_err(Error::Io)?;
    Ok(cpumask::parse(&text))
}

pub fn write_cpus(root: &Path, cos: u32, cpus: &BTreeSet<u32>) -> Result<()> {
    fs::write(cos_dir(root, cos).join("cpus"), cpumask::format(cpus)).map_err(Error::Io)
}

pub fn read_tasks(root: &Path, cos: u32) -> Result<Vec<i32>> {
    let text = fs::read_to_string(cos_dir(root, cos).join("tasks")).map_err(Error::Io)?;
    Ok(text.lines().filter_map(|l| l.trim().parse().ok()).collect())
}

pub fn write_task(root: &Path, cos: u32, pid: i32) -> Result<()> {
    fs::write(cos_dir(root, cos).join("tasks"), pid.to_string()).map_err(Error::Io)
}

/// Move `core` into `target`'s `cpus` file, clearing it from every
/// other COS `0..num_cos` it might currently be set in.
pub fn move_core_to_cos(root: &Path, num_cos: u32, core: u32, target: u32) -> Result<()> {
    for cos in 0..num_cos {
        if cos == target {
            continue;
        }
        let mut set = read_cpus(root, cos)?;
        if set.remove(&core) {
            write_cpus(root, cos, &set)?;
        }
    }
    let mut set = read_cpus(root, target)?;
    set.insert(core);
    write_cpus(root, target, &set)
}

pub fn mon_group_dir(cos_dir: &Path, name: &str) -> PathBuf {
    cos_dir.join("mon_groups").join(name)
}

pub fn create_mon_group(cos_dir: &Path, name: &str) -> Result<PathBuf> {
    let dir = mon_group_dir(cos_dir, name);
    fs::create_dir_all(&dir).map_err(|e| Error::busy(format!("mkdir {}: {e}", dir.display())))?;
    Ok(dir)
}

pub fn remove_mon_group(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    fs::remove_dir_all(dir).map_err(Error::Io)
}

/// All `mon_groups/*` subdirectories directly under `cos_dir`, empty
/// list if none exist yet.
pub fn list_mon_groups(cos_dir: &Path) -> Result<Vec<PathBuf>> {
    let base = cos_dir.join("mon_groups");
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut v = Vec::new();
    for entry in fs::read_dir(&base).map_err(Error::Io)? {
        let entry = entry.map_err(Error::Io)?;
        if entry.path().is_dir() {
            v.push(entry.path());
        }
    }
    Ok(v)
}

pub fn read_mon_counter(mon_dir: &Path, l3_id: u32, file: &str) -> Result<u64> {
    let p = mon_dir.join("mon_data").join(format!("mon_L3_{l3_id}")).join(file);
    let text = fs::read_to_string(&p).map_err(Error::Io)?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| Error::bad_request(format!("unreadable counter file {}", p.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cos_dir_zero_is_root() {
        assert_eq!(cos_dir(Path::new("/sys/fs/resctrl"), 0), Path::new("/sys/fs/resctrl"));
        assert_eq!(cos_dir(Path::new("/sys/fs/resctrl"), 3), Path::new("/sys/fs/resctrl/COS3"));
    }

    #[test]
    fn move_core_between_cos_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("COS1")).unwrap();
        fs::create_dir_all(root.join("COS2")).unwrap();
        fs::write(root.join("cpus"), "00000003").unwrap();
        fs::write(root.join("COS1/cpus"), "0").unwrap();
        fs::write(root.join("COS2/cpus"), "0").unwrap();

        move_core_to_cos(root, 3, 0, 1).unwrap();
        assert_eq!(read_cpus(root, 0).unwrap(), [1].into_iter().collect());
        assert_eq!(read_cpus(root, 1).unwrap(), [0].into_iter().collect());
    }
}
