use super::dwarf::DebugInfo;
use crate::error::Result;
use crate::process::{MemoryMaps, ProcessInfo};
use std::collections::HashMap;
use std::ops::Range;

/// A resolved source location
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub function: String,
}

impl Location {
    pub fn unknown() -> Self {
        Location {
            file: "[unknown]".to_string(),
            line: 0,
            column: 0,
            function: "[unknown]".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.function.is_empty() || self.function == "[unknown]"
    }

    /// Format as file:line
    pub fn as_file_line(&self) -> String {
        if self.line > 0 {
            format!("{}:{}", self.file, self.line)
        } else {
            self.file.clone()
        }
    }
}

/// Maps return addresses of the running executable to source locations
pub struct SymbolResolver {
    info: DebugInfo,
    aslr_offset: u64,
    /// Runtime address range of the executable; `None` accepts everything
    image: Option<Range<u64>>,
    cache: HashMap<u64, Location>,
}

impl SymbolResolver {
    /// Resolver for this process's own executable
    pub fn for_process(proc_info: &ProcessInfo) -> Result<Self> {
        let info = DebugInfo::parse(&proc_info.proc_exe_path())?;
        let maps = MemoryMaps::for_pid(proc_info.pid())?;
        let aslr_offset = maps.aslr_offset(proc_info.exe_path());

        let exe = proc_info.exe_path().to_string_lossy();
        let image = maps
            .executable_mappings()
            .filter(|m| m.pathname.as_deref() == Some(exe.as_ref()))
            .fold(None::<Range<u64>>, |acc, m| match acc {
                Some(r) => Some(r.start.min(m.start)..r.end.max(m.end)),
                None => Some(m.start..m.end),
            });

        tracing::debug!(
            ranges = info.ranges.len(),
            functions = info.functions.len(),
            aslr_offset = %format!("{:#x}", aslr_offset),
            "loaded symbols"
        );

        Ok(SymbolResolver {
            info,
            aslr_offset,
            image,
            cache: HashMap::new(),
        })
    }

    pub fn new(info: DebugInfo, aslr_offset: u64) -> Self {
        SymbolResolver {
            info,
            aslr_offset,
            image: None,
            cache: HashMap::new(),
        }
    }

    pub fn range_count(&self) -> usize {
        self.info.ranges.len()
    }

    pub fn function_count(&self) -> usize {
        self.info.functions.len()
    }

    pub fn aslr_offset(&self) -> u64 {
        self.aslr_offset
    }

    /// Resolve an instruction address
    pub fn resolve(&self, addr: u64) -> Location {
        if let Some(image) = &self.image
            && !image.contains(&addr)
        {
            return Location::unknown();
        }

        let debug_addr = addr.wrapping_sub(self.aslr_offset);
        let function = self
            .info
            .find_function(debug_addr)
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "[unknown]".to_string());

        match self.info.find_range(debug_addr) {
            Some(range) => Location {
                file: simplify_path(&range.file),
                line: range.line,
                column: range.column,
                function,
            },
            None if function != "[unknown]" => Location {
                file: "[no line info]".to_string(),
                line: 0,
                column: 0,
                function,
            },
            None => Location::unknown(),
        }
    }

    pub fn resolve_cached(&mut self, addr: u64) -> Location {
        if let Some(loc) = self.cache.get(&addr) {
            return loc.clone();
        }
        let location = self.resolve(addr);
        self.cache.insert(addr, location.clone());
        location
    }

    /// Resolve a return address. It points after the call instruction,
    /// which may already belong to the next line or function.
    pub fn resolve_return_address(&mut self, addr: u64) -> Location {
        self.resolve_cached(addr.saturating_sub(1))
    }

    /// The frame an allocation is charged to: the first one that is not
    /// profiler, allocator or standard library code. A utility function
    /// (clone, to_string, ...) is charged to its caller instead.
    pub fn attributed_frame(&mut self, stack: &[u64]) -> Option<Location> {
        let mut frames = stack
            .iter()
            .map(|&addr| self.resolve_return_address(addr))
            .filter(|loc| !loc.is_unknown() && !is_internal_location(loc));

        let first = frames.next()?;
        if is_utility_function(&first.function)
            && let Some(caller) = frames.next()
        {
            return Some(caller);
        }
        Some(first)
    }
}

/// Functions that never count as the allocation site
const SKIP_FUNCTION_PATTERNS: &[&str] = &[
    // Rust allocator entry points
    "__rust_alloc",
    "__rust_dealloc",
    "__rust_realloc",
    "__rustc",
    // Collections and allocation internals
    "alloc::alloc::",
    "alloc::raw_vec::",
    "alloc::vec::",
    "alloc::string::",
    "alloc::collections::",
    "alloc::fmt::",
    "alloc::ffi::",
    "<alloc::",
    "hashbrown::",
    "std::collections::hash",
    "core::ptr::",
    "core::slice::",
    "core::iter::",
    "core::ops::function::",
    "core::fmt::",
    "<core::",
    "std::io::",
    "std::fmt::",
    "std::sys::",
    "std::thread::",
    "std::sync::",
    "<std::",
    " as core::",
    " as alloc::",
    // libc allocator
    "malloc",
    "calloc",
    "realloc",
    "posix_memalign",
    "aligned_alloc",
    "_start",
    "__libc_start_main",
    // Unwinding and profiler internals
    "_Unwind_",
    "backtrace::",
    "cmemprof_trace::",
    "<cmemprof_trace::",
];

const UTILITY_PATTERNS: &[&str] = &[
    ">::clone",
    ">::fmt",
    "::to_string",
    "::to_owned",
    "::into",
];

fn is_internal_file(file: &str) -> bool {
    file.is_empty()
        || file.starts_with('<')
        || file.contains("/rustc/")
        || file.contains("/.cargo/registry/")
        || file.contains("/rust/library/")
        || file.contains("cmemprof-trace/src/")
}

/// Profiler, allocator or library code
pub fn is_internal_location(loc: &Location) -> bool {
    (loc.file != "[no line info]" && is_internal_file(&loc.file))
        || SKIP_FUNCTION_PATTERNS
            .iter()
            .any(|p| loc.function.contains(p))
}

fn is_utility_function(function: &str) -> bool {
    UTILITY_PATTERNS.iter().any(|p| function.contains(p))
}

/// Shorten a source path for display
pub fn simplify_path(path: &str) -> String {
    let prefixes_to_strip = ["/rustc/", "/.cargo/registry/src/", "/.cargo/git/checkouts/"];

    let mut result = path.to_string();
    for prefix in &prefixes_to_strip {
        if let Some(idx) = result.find(prefix) {
            // Drop the hash/index directory that follows the prefix
            let after_prefix = &result[idx + prefix.len()..];
            if let Some(slash_idx) = after_prefix.find('/') {
                result = format!("<{}", &after_prefix[slash_idx..]);
            }
        }
    }

    // "/home/user/project/src/main.rs" -> "src/main.rs"
    if !result.starts_with('<')
        && let Some(idx) = result.find("/src/")
    {
        result = result[idx + 1..].to_string();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::dwarf::{AddressRange, FunctionSymbol};

    const BIAS: u64 = 0x5500_0000_0000;

    fn resolver() -> SymbolResolver {
        let range = |start, end, file: &str, line| AddressRange {
            start,
            end,
            file: file.to_string(),
            line,
            column: 0,
        };
        let function = |start, size, name: &str| FunctionSymbol {
            start,
            size,
            name: name.to_string(),
        };

        let info = DebugInfo::from_parts(
            vec![
                range(0x1000, 0x1010, "/rustc/abc123/library/alloc/src/raw_vec.rs", 10),
                range(0x2000, 0x2008, "/home/dev/app/src/cache.rs", 41),
                range(0x2008, 0x2010, "/home/dev/app/src/cache.rs", 42),
                range(0x3000, 0x3010, "/home/dev/app/src/main.rs", 7),
                range(0x4000, 0x4010, "/home/dev/app/src/model.rs", 19),
            ],
            vec![
                function(0x1000, 0x100, "alloc::raw_vec::RawVec<T,A>::grow_one"),
                function(0x2000, 0x100, "app::cache::Cache::insert"),
                function(0x3000, 0x100, "app::main"),
                function(0x4000, 0x100, "app::model::Record::to_string"),
                function(0x5000, 0x100, "cmemprof_trace::profiler::Profiler<C>::record"),
            ],
        );
        SymbolResolver::new(info, BIAS)
    }

    #[test]
    fn test_resolve_applies_bias() {
        let resolver = resolver();
        let loc = resolver.resolve(BIAS + 0x2004);
        assert_eq!(loc.file, "src/cache.rs");
        assert_eq!(loc.line, 41);
        assert_eq!(loc.function, "app::cache::Cache::insert");
        assert_eq!(loc.as_file_line(), "src/cache.rs:41");

        assert!(resolver.resolve(0x2004).is_unknown());
    }

    #[test]
    fn test_return_address_looked_up_before_call() {
        let mut resolver = resolver();
        // Return address is the first byte of line 42's range
        assert_eq!(resolver.resolve_return_address(BIAS + 0x2008).line, 41);
        assert_eq!(resolver.resolve_cached(BIAS + 0x2008).line, 42);
    }

    #[test]
    fn test_function_without_lines() {
        let resolver = resolver();
        let loc = resolver.resolve(BIAS + 0x5004);
        assert_eq!(loc.file, "[no line info]");
        assert_eq!(loc.function, "cmemprof_trace::profiler::Profiler<C>::record");
    }

    #[test]
    fn test_attributed_frame_skips_internals() {
        let mut resolver = resolver();
        let stack = [
            BIAS + 0x5005, // profiler
            BIAS + 0x1005, // RawVec growth
            BIAS + 0x2005, // Cache::insert
            BIAS + 0x3005, // main
        ];
        let loc = resolver.attributed_frame(&stack).unwrap();
        assert_eq!(loc.function, "app::cache::Cache::insert");
    }

    #[test]
    fn test_attributed_frame_charges_utility_caller() {
        let mut resolver = resolver();
        let stack = [BIAS + 0x1005, BIAS + 0x4005, BIAS + 0x3005];
        let loc = resolver.attributed_frame(&stack).unwrap();
        assert_eq!(loc.function, "app::main");
    }

    #[test]
    fn test_attributed_frame_all_internal() {
        let mut resolver = resolver();
        assert!(resolver.attributed_frame(&[BIAS + 0x1005, 0x10]).is_none());
        assert!(resolver.attributed_frame(&[]).is_none());
    }

    #[test]
    fn test_simplify_path() {
        assert_eq!(simplify_path("/home/dev/app/src/main.rs"), "src/main.rs");
        assert_eq!(
            simplify_path("/rustc/90b35a623/library/alloc/src/vec/mod.rs"),
            "</library/alloc/src/vec/mod.rs"
        );
        assert_eq!(
            simplify_path("/home/dev/.cargo/registry/src/index.crates.io-6f17d22bba15001f/hashbrown-0.14.5/src/raw/mod.rs"),
            "</hashbrown-0.14.5/src/raw/mod.rs"
        );
        assert_eq!(simplify_path("build.rs"), "build.rs");
    }
}
