use crate::error::{Error, Result};
use gimli::{EndianSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol};
use std::fs::File;
use std::path::Path;

/// Line table and symbol table of one executable, sorted for lookup
#[derive(Debug, Default)]
pub struct DebugInfo {
    pub ranges: Vec<AddressRange>,
    pub functions: Vec<FunctionSymbol>,
}

/// An address range mapped to a source location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A text symbol, demangled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    pub start: u64,
    /// 0 when the symbol table does not record a size
    pub size: u64,
    pub name: String,
}

impl DebugInfo {
    /// Parse an ELF file. Missing DWARF only loses file/line information;
    /// a binary with neither DWARF nor a symbol table is an error.
    pub fn parse(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file) }?;

        let object = object::File::parse(&*mmap)
            .map_err(|e| Error::SymbolResolution(format!("Failed to parse ELF: {}", e)))?;

        let functions = Self::parse_functions(&object);
        let has_dwarf = object.section_by_name(".debug_info").is_some();

        if !has_dwarf && functions.is_empty() {
            return Err(Error::MissingDebugInfo {
                path: path.display().to_string(),
            });
        }

        let ranges = if has_dwarf {
            let endian = if object.is_little_endian() {
                RunTimeEndian::Little
            } else {
                RunTimeEndian::Big
            };
            Self::parse_line_info_from_object(&object, endian)?
        } else {
            tracing::warn!(path = %path.display(), "no DWARF line info, reporting functions only");
            Vec::new()
        };

        Ok(DebugInfo::from_parts(ranges, functions))
    }

    /// Assemble from already-parsed tables, sorting both
    pub fn from_parts(mut ranges: Vec<AddressRange>, mut functions: Vec<FunctionSymbol>) -> Self {
        ranges.sort_by_key(|r| r.start);
        functions.sort_by_key(|f| f.start);
        functions.dedup_by_key(|f| f.start);
        DebugInfo { ranges, functions }
    }

    /// The line-table range containing `addr`
    pub fn find_range(&self, addr: u64) -> Option<&AddressRange> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (addr < range.end).then_some(range)
    }

    /// The function whose body contains `addr`. Symbols without a size
    /// extend to the next symbol.
    pub fn find_function(&self, addr: u64) -> Option<&FunctionSymbol> {
        let idx = self.functions.partition_point(|f| f.start <= addr);
        let function = self.functions.get(idx.checked_sub(1)?)?;
        if function.size == 0 || addr < function.start + function.size {
            Some(function)
        } else {
            None
        }
    }

    fn parse_line_info_from_object(
        object: &object::File<'_>,
        endian: RunTimeEndian,
    ) -> Result<Vec<AddressRange>> {
        let load_section = |name: &str| -> &[u8] {
            object
                .section_by_name(name)
                .and_then(|s| s.data().ok())
                .unwrap_or(&[])
        };

        let dwarf = gimli::Dwarf {
            debug_abbrev: gimli::DebugAbbrev::new(load_section(".debug_abbrev"), endian),
            debug_info: gimli::DebugInfo::new(load_section(".debug_info"), endian),
            debug_line: gimli::DebugLine::new(load_section(".debug_line"), endian),
            debug_str: gimli::DebugStr::new(load_section(".debug_str"), endian),
            debug_line_str: gimli::DebugLineStr::new(load_section(".debug_line_str"), endian),
            ..Default::default()
        };

        Self::parse_line_info(&dwarf)
    }

    fn parse_line_info(
        dwarf: &gimli::Dwarf<EndianSlice<'_, RunTimeEndian>>,
    ) -> Result<Vec<AddressRange>> {
        let mut ranges = Vec::new();
        let mut units = dwarf.units();

        while let Ok(Some(header)) = units.next() {
            let unit = dwarf
                .unit(header)
                .map_err(|e| Error::SymbolResolution(format!("Failed to parse unit: {}", e)))?;

            let Some(program) = unit.line_program.clone() else {
                continue;
            };
            let mut rows = program.rows();
            let mut prev_row: Option<(u64, String, u32, u32)> = None;

            while let Ok(Some((header, row))) = rows.next_row() {
                let addr = row.address();

                let file = row
                    .file(header)
                    .map(|f| {
                        let mut path = String::new();
                        if let Some(dir) = f.directory(header)
                            && let Ok(dir) = dwarf.attr_string(&unit, dir)
                            && let Ok(dir) = dir.to_string()
                        {
                            path.push_str(&dir);
                            if !path.ends_with('/') {
                                path.push('/');
                            }
                        }
                        if let Ok(name) = dwarf.attr_string(&unit, f.path_name())
                            && let Ok(name) = name.to_string()
                        {
                            path.push_str(&name);
                        }
                        path
                    })
                    .unwrap_or_default();

                let line = row.line().map(|l| l.get() as u32).unwrap_or(0);
                let column = match row.column() {
                    gimli::ColumnType::LeftEdge => 0,
                    gimli::ColumnType::Column(c) => c.get() as u32,
                };

                // Each row covers the addresses up to the next row
                if let Some((prev_addr, prev_file, prev_line, prev_col)) = prev_row.take()
                    && addr > prev_addr
                    && !prev_file.is_empty()
                {
                    ranges.push(AddressRange {
                        start: prev_addr,
                        end: addr,
                        file: prev_file,
                        line: prev_line,
                        column: prev_col,
                    });
                }

                if !row.end_sequence() {
                    prev_row = Some((addr, file, line, column));
                }
            }
        }

        Ok(ranges)
    }

    fn parse_functions(object: &object::File<'_>) -> Vec<FunctionSymbol> {
        object
            .symbols()
            .filter(|symbol| symbol.kind() == object::SymbolKind::Text && symbol.address() != 0)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                Some(FunctionSymbol {
                    start: symbol.address(),
                    size: symbol.size(),
                    name: rustc_demangle::demangle(name).to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64, line: u32) -> AddressRange {
        AddressRange {
            start,
            end,
            file: "src/lib.rs".to_string(),
            line,
            column: 0,
        }
    }

    fn function(start: u64, size: u64, name: &str) -> FunctionSymbol {
        FunctionSymbol {
            start,
            size,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_find_range() {
        let info = DebugInfo::from_parts(
            vec![range(0x200, 0x210, 7), range(0x100, 0x120, 3)],
            Vec::new(),
        );
        assert_eq!(info.find_range(0x100).map(|r| r.line), Some(3));
        assert_eq!(info.find_range(0x11f).map(|r| r.line), Some(3));
        assert!(info.find_range(0x120).is_none());
        assert!(info.find_range(0x50).is_none());
        assert_eq!(info.find_range(0x205).map(|r| r.line), Some(7));
    }

    #[test]
    fn test_find_function() {
        let info = DebugInfo::from_parts(
            Vec::new(),
            vec![
                function(0x1000, 0x100, "app::work"),
                function(0x2000, 0, "app::unsized"),
            ],
        );
        assert_eq!(info.find_function(0x1050).unwrap().name, "app::work");
        assert!(info.find_function(0x1100).is_none());
        assert_eq!(info.find_function(0x9999).unwrap().name, "app::unsized");
        assert!(info.find_function(0x10).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_own_executable() {
        let exe = std::env::current_exe().unwrap();
        let info = DebugInfo::parse(&exe).unwrap();
        assert!(!info.functions.is_empty());
        assert!(
            info.functions
                .iter()
                .any(|f| f.name.contains("test_parse_own_executable"))
        );
    }
}
