//! pprof export.
//!
//! Encodes a [`HeapProfile`] as a `perftools.profiles.Profile` protobuf
//! readable by `go tool pprof` and compatible viewers. Each unique stack
//! becomes one sample with values `alloc_objects`, `alloc_space`,
//! `inuse_objects` and `inuse_space`. In-use values are always 0 because
//! frees are not tracked; the types are present so allocation profiles from
//! other sources can be viewed alongside.

use crate::error::Result;
use crate::profile::HeapProfile;
use crate::symbols::SymbolResolver;
use pprof::protos::{self, Message};
use std::collections::HashMap;
use std::path::Path;

/// A loaded module and the runtime addresses it covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMapping {
    pub path: String,
    pub start: u64,
    pub end: u64,
    /// The executable symbols are resolved against
    pub is_main: bool,
}

/// Modules loaded in this process. The main executable is reported by
/// the loader without a name and is labeled with `exe_path`.
pub fn loaded_modules(exe_path: &Path) -> Vec<ModuleMapping> {
    let mut modules = Vec::new();
    cmemprof_trace::guard::for_each_loaded_module(|module| {
        if module.span.is_empty() {
            return true;
        }
        let name = module.path.to_string_lossy();
        let is_main = name.is_empty();
        modules.push(ModuleMapping {
            path: if is_main {
                exe_path.to_string_lossy().into_owned()
            } else {
                name.into_owned()
            },
            start: module.span.start as u64,
            end: module.span.end as u64,
            is_main,
        });
        true
    });
    modules
}

/// String table with index 0 reserved for ""
struct Strings {
    table: Vec<String>,
    index: HashMap<String, i64>,
}

impl Strings {
    fn new() -> Self {
        Strings {
            table: vec![String::new()],
            index: HashMap::from([(String::new(), 0)]),
        }
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.table.len() as i64;
        self.table.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }

    fn value_type(&mut self, ty: &str, unit: &str) -> protos::ValueType {
        protos::ValueType {
            ty: self.intern(ty),
            unit: self.intern(unit),
        }
    }
}

/// Build the pprof message for `profile`
pub fn build_profile(
    profile: &HeapProfile,
    resolver: &mut SymbolResolver,
    modules: &[ModuleMapping],
) -> protos::Profile {
    let mut strings = Strings::new();

    let sample_type = vec![
        strings.value_type("alloc_objects", "count"),
        strings.value_type("alloc_space", "bytes"),
        strings.value_type("inuse_objects", "count"),
        strings.value_type("inuse_space", "bytes"),
    ];
    let period_type = strings.value_type("space", "bytes");

    let mapping: Vec<protos::Mapping> = modules
        .iter()
        .enumerate()
        .map(|(i, module)| protos::Mapping {
            id: i as u64 + 1,
            memory_start: module.start,
            memory_limit: module.end,
            filename: strings.intern(&module.path),
            has_functions: module.is_main,
            has_filenames: module.is_main,
            has_line_numbers: module.is_main,
            ..Default::default()
        })
        .collect();

    let mut locations: Vec<protos::Location> = Vec::new();
    let mut location_ids: HashMap<u64, u64> = HashMap::new();
    let mut functions: Vec<protos::Function> = Vec::new();
    let mut function_ids: HashMap<(String, String), u64> = HashMap::new();
    let mut samples = Vec::with_capacity(profile.records().len());

    for record in profile.records() {
        let mut location_id = Vec::with_capacity(record.stack.len());
        for &addr in &record.stack {
            let id = match location_ids.get(&addr) {
                Some(&id) => id,
                None => {
                    let frame = resolver.resolve_return_address(addr);
                    let key = (frame.function.clone(), frame.file.clone());
                    let function_id = match function_ids.get(&key) {
                        Some(&id) => id,
                        None => {
                            let id = functions.len() as u64 + 1;
                            let name = strings.intern(&frame.function);
                            functions.push(protos::Function {
                                id,
                                name,
                                system_name: name,
                                filename: strings.intern(&frame.file),
                                ..Default::default()
                            });
                            function_ids.insert(key, id);
                            id
                        }
                    };
                    let mapping_id = modules
                        .iter()
                        .position(|m| (m.start..m.end).contains(&addr))
                        .map_or(0, |i| i as u64 + 1);

                    let id = locations.len() as u64 + 1;
                    locations.push(protos::Location {
                        id,
                        mapping_id,
                        address: addr,
                        line: vec![protos::Line {
                            function_id,
                            line: i64::from(frame.line),
                            ..Default::default()
                        }],
                        ..Default::default()
                    });
                    location_ids.insert(addr, id);
                    id
                }
            };
            location_id.push(id);
        }

        samples.push(protos::Sample {
            location_id,
            value: vec![
                i64::try_from(record.count).unwrap_or(i64::MAX),
                i64::try_from(record.bytes).unwrap_or(i64::MAX),
                0,
                0,
            ],
            ..Default::default()
        });
    }

    protos::Profile {
        sample_type,
        sample: samples,
        mapping,
        location: locations,
        function: functions,
        string_table: strings.table,
        time_nanos: profile
            .started_at
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or(0),
        duration_nanos: i64::try_from(profile.duration.as_nanos()).unwrap_or(i64::MAX),
        period_type: Some(period_type),
        period: 1,
        ..Default::default()
    }
}

/// Write `profile` to `path` as an uncompressed pprof protobuf
pub fn write_pprof(
    path: &Path,
    profile: &HeapProfile,
    resolver: &mut SymbolResolver,
    modules: &[ModuleMapping],
) -> Result<()> {
    let proto = build_profile(profile, resolver, modules);
    std::fs::write(path, proto.encode_to_vec())?;
    tracing::debug!(
        path = %path.display(),
        samples = proto.sample.len(),
        locations = proto.location.len(),
        "pprof profile written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{AddressRange, DebugInfo, FunctionSymbol};
    use cmemprof_trace::SamplingPolicy;

    fn resolver() -> SymbolResolver {
        let info = DebugInfo::from_parts(
            vec![
                AddressRange {
                    start: 0x1000,
                    end: 0x1100,
                    file: "/work/app/src/cache.rs".to_string(),
                    line: 12,
                    column: 0,
                },
                AddressRange {
                    start: 0x2000,
                    end: 0x2100,
                    file: "/work/app/src/main.rs".to_string(),
                    line: 30,
                    column: 0,
                },
            ],
            vec![
                FunctionSymbol {
                    start: 0x1000,
                    size: 0x100,
                    name: "app::cache::fill".to_string(),
                },
                FunctionSymbol {
                    start: 0x2000,
                    size: 0x100,
                    name: "app::main".to_string(),
                },
            ],
        );
        SymbolResolver::new(info, 0)
    }

    fn modules() -> Vec<ModuleMapping> {
        vec![ModuleMapping {
            path: "/work/app/target/app".to_string(),
            start: 0x1000,
            end: 0x3000,
            is_main: true,
        }]
    }

    fn profile() -> HeapProfile {
        let mut profile = HeapProfile::new(SamplingPolicy::Uniform, 2);
        profile.add_sample(&[0x1010, 0x2010], 100);
        profile.add_sample(&[0x1010, 0x2010], 50);
        profile.add_sample(&[0x2020, 0x9000], 8);
        profile
    }

    fn string(proto: &protos::Profile, idx: i64) -> &str {
        &proto.string_table[idx as usize]
    }

    #[test]
    fn test_sample_types_and_values() {
        let proto = build_profile(&profile(), &mut resolver(), &modules());

        assert_eq!(proto.string_table[0], "");
        let types: Vec<&str> = proto
            .sample_type
            .iter()
            .map(|t| string(&proto, t.ty))
            .collect();
        assert_eq!(
            types,
            ["alloc_objects", "alloc_space", "inuse_objects", "inuse_space"]
        );
        let period = proto.period_type.as_ref().unwrap();
        assert_eq!(string(&proto, period.ty), "space");
        assert_eq!(string(&proto, period.unit), "bytes");

        assert_eq!(proto.sample.len(), 2);
        // Uniform at rate 2: every sample counts twice
        assert_eq!(proto.sample[0].value, vec![4, 300, 0, 0]);
        assert_eq!(proto.sample[1].value, vec![2, 16, 0, 0]);
    }

    #[test]
    fn test_locations_and_functions_are_shared() {
        let proto = build_profile(&profile(), &mut resolver(), &modules());

        // Four distinct addresses, three distinct functions
        assert_eq!(proto.location.len(), 4);
        assert_eq!(proto.function.len(), 3);
        assert_eq!(proto.sample[0].location_id, vec![1, 2]);
        assert_eq!(proto.sample[1].location_id, vec![3, 4]);

        let main_fn = proto.location[1].line[0].function_id;
        assert_eq!(proto.location[2].line[0].function_id, main_fn);
        let main = &proto.function[main_fn as usize - 1];
        assert_eq!(string(&proto, main.name), "app::main");
        assert_eq!(proto.location[1].line[0].line, 30);

        // Only addresses inside the module are mapped
        assert_eq!(proto.mapping.len(), 1);
        assert_eq!(string(&proto, proto.mapping[0].filename), "/work/app/target/app");
        assert_eq!(proto.location[0].mapping_id, 1);
        assert_eq!(proto.location[3].mapping_id, 0);
    }

    #[test]
    fn test_write_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.pprof");
        let mut profile = profile();
        profile.duration = std::time::Duration::from_millis(1500);

        write_pprof(&path, &profile, &mut resolver(), &modules()).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let decoded = protos::Profile::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.sample.len(), 2);
        assert_eq!(decoded.duration_nanos, 1_500_000_000);
        assert_eq!(decoded, build_profile(&profile, &mut resolver(), &modules()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loaded_modules_include_executable() {
        let exe = std::env::current_exe().unwrap();
        let here = test_loaded_modules_include_executable as usize as u64;
        let modules = loaded_modules(&exe);

        let main: Vec<&ModuleMapping> = modules.iter().filter(|m| m.is_main).collect();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].path, exe.to_string_lossy());
        assert!((main[0].start..main[0].end).contains(&here));
    }
}
