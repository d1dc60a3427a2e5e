mod maps;

pub use maps::{MemoryMapping, MemoryMaps};

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// The process being profiled: always this one
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pid: u32,
    name: String,
    exe_path: PathBuf,
}

impl ProcessInfo {
    pub fn current() -> Result<Self> {
        let exe_path = std::env::current_exe()?;
        let name = exe_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("no file name in {}", exe_path.display()))
            })?;

        Ok(ProcessInfo {
            pid: nix::unistd::getpid().as_raw() as u32,
            name,
            exe_path,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    /// Path that still reads the running image if the file on disk was
    /// replaced since startup
    pub fn proc_exe_path(&self) -> PathBuf {
        let proc_exe = PathBuf::from(format!("/proc/{}/exe", self.pid));
        if proc_exe.exists() {
            proc_exe
        } else {
            self.exe_path.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process() {
        let info = ProcessInfo::current().unwrap();
        assert_eq!(info.pid(), std::process::id());
        assert!(!info.name().is_empty());
        assert!(info.proc_exe_path().exists());
    }
}
