use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// A parsed memory mapping from /proc/[pid]/maps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Collection of memory mappings for a process
#[derive(Debug, Clone, Default)]
pub struct MemoryMaps {
    mappings: Vec<MemoryMapping>,
}

impl MemoryMaps {
    /// Mappings of the calling process
    pub fn current() -> Result<Self> {
        Self::read("/proc/self/maps")
    }

    pub fn for_pid(pid: u32) -> Result<Self> {
        Self::read(&format!("/proc/{}/maps", pid))
    }

    fn read(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::UnsupportedPlatform(format!("{path} is not available"))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        MemoryMaps {
            mappings: content.lines().filter_map(Self::parse_line).collect(),
        }
    }

    fn parse_line(line: &str) -> Option<MemoryMapping> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            return None;
        }

        let (start, end) = parts[0].split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let perms = parts[1].to_string();
        let offset = u64::from_str_radix(parts[2], 16).ok()?;

        // Pathname may contain spaces
        let pathname = (parts.len() >= 6).then(|| parts[5..].join(" "));

        Some(MemoryMapping {
            start,
            end,
            perms,
            offset,
            pathname,
        })
    }

    /// Load bias of `exe_path`: runtime address minus link-time address.
    ///
    /// Taken from the first mapping of the file (file offset 0), not the
    /// executable segment, whose offset is non-zero. 0 for non-PIE binaries
    /// or when the file is not mapped.
    pub fn aslr_offset(&self, exe_path: &Path) -> u64 {
        let exe_str = exe_path.to_string_lossy();
        let file_name = exe_path.file_name().map(|n| n.to_string_lossy());

        self.mappings
            .iter()
            .find(|mapping| match &mapping.pathname {
                Some(pathname) => {
                    pathname == exe_str.as_ref()
                        || file_name
                            .as_ref()
                            .is_some_and(|name| pathname.ends_with(&format!("/{name}")))
                }
                None => false,
            })
            .map(|mapping| mapping.start - mapping.offset)
            .unwrap_or(0)
    }

    pub fn executable_mappings(&self) -> impl Iterator<Item = &MemoryMapping> {
        self.mappings.iter().filter(|m| m.is_executable())
    }

    /// The mapping containing `addr`, if any
    pub fn find(&self, addr: u64) -> Option<&MemoryMapping> {
        self.mappings.iter().find(|m| m.contains(addr))
    }

    pub fn is_executable_addr(&self, addr: u64) -> bool {
        self.find(addr).is_some_and(MemoryMapping::is_executable)
    }
}
