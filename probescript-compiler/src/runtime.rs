//! Services consumed by the code generator.
//!
//! The generator does not probe the kernel, resolve symbols or parse format
//! files itself; everything it needs from the outside world arrives through
//! [`RuntimeContext`]. Resolution backends plug in behind the
//! [`SymbolResolver`] and [`ProbeCatalog`] traits.

use crate::ast::{AttachPoint, SourceLocation, UsdtInfo};
use crate::types::{SizedType, StackType};
use probescript_protocol::{FormatTable, ProbeRegistry};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Symbol {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

/// Static address resolution, performed at compile time.
pub trait SymbolResolver {
    fn resolve_kname(&self, name: &str) -> Option<u64>;
    fn resolve_uname(&self, name: &str, target: &str) -> Option<Symbol>;
    fn resolve_cgroupid(&self, path: &str) -> Option<u64>;
}

/// Attach-point discovery: wildcard expansion, USDT notes and tracepoint
/// format records.
pub trait ProbeCatalog {
    /// Ordered set of concrete matches for a (possibly wildcarded) attach
    /// point.
    fn wildcard_matches(&self, attach_point: &AttachPoint) -> Vec<String>;

    fn usdt_info(&self, pid: Option<u32>, target: &str, ns: &str, func: &str) -> Option<UsdtInfo>;

    /// Record name for a resolved `tracepoint:category:event` match, as
    /// registered from the kernel's format file.
    fn tracepoint_record_name(&self, category: &str, event: &str) -> String;
}

/// Resolver used when a program references nothing that needs resolution.
#[derive(Debug, Default)]
pub struct NoResolution;

impl SymbolResolver for NoResolution {
    fn resolve_kname(&self, _name: &str) -> Option<u64> {
        None
    }
    fn resolve_uname(&self, _name: &str, _target: &str) -> Option<Symbol> {
        None
    }
    fn resolve_cgroupid(&self, _path: &str) -> Option<u64> {
        None
    }
}

impl ProbeCatalog for NoResolution {
    fn wildcard_matches(&self, attach_point: &AttachPoint) -> Vec<String> {
        vec![attach_point.func.clone()]
    }
    fn usdt_info(
        &self,
        _pid: Option<u32>,
        _target: &str,
        _ns: &str,
        _func: &str,
    ) -> Option<UsdtInfo> {
        None
    }
    fn tracepoint_record_name(&self, category: &str, event: &str) -> String {
        format!("tracepoint_{category}_{event}")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub has_ktime_get_boot_ns: bool,
}

/// Runtime-configurable limits shared with the user-space consumer.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Global string buffer size for str() and string values.
    pub strlen: u64,
    /// Number of argv entries read by join().
    pub join_argnum: u64,
    /// Bytes per argv entry read by join().
    pub join_argsize: u64,
    pub perf_rb_pages: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            strlen: 64,
            join_argnum: 16,
            join_argsize: 1024,
            perf_rb_pages: 64,
        }
    }
}

/// In-kernel map handle: a load-time file descriptor plus a stable id used
/// in async records addressed to user space.
#[derive(Debug, Clone)]
pub struct MapDescriptor {
    pub fd: i32,
    pub id: u32,
    pub value_type: SizedType,
}

/// Maps that exist independently of any script identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialMap {
    /// Per-process start timestamp for the `elapsed` builtin, key 0.
    Elapsed,
    /// Per-CPU scratch buffer for join().
    Join,
    /// Perf event array backing every async record.
    PerfEvent,
    /// Stack-id maps, one per capture limit.
    Stack(StackType),
}

#[derive(Debug, Default)]
pub struct MapSet {
    named: HashMap<String, MapDescriptor>,
    specials: HashMap<SpecialMap, MapDescriptor>,
}

impl MapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ident: impl Into<String>, desc: MapDescriptor) {
        self.named.insert(ident.into(), desc);
    }

    pub fn insert_special(&mut self, kind: SpecialMap, desc: MapDescriptor) {
        self.specials.insert(kind, desc);
    }

    pub fn get(&self, ident: &str) -> Option<&MapDescriptor> {
        self.named.get(ident)
    }

    pub fn special(&self, kind: SpecialMap) -> Option<&MapDescriptor> {
        self.specials.get(&kind)
    }
}

#[derive(Debug, Clone)]
pub struct Bitfield {
    /// Bytes that must be read to cover the bitfield.
    pub read_bytes: usize,
    pub access_rshift: u32,
    pub mask: u64,
}

#[derive(Debug, Clone)]
pub struct RecordField {
    pub name: String,
    pub offset: usize,
    pub ty: SizedType,
    pub bitfield: Option<Bitfield>,
}

/// Record schema shared by name; never referenced by pointer.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub size: usize,
    pub fields: Vec<RecordField>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&RecordField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Default)]
pub struct StructRegistry {
    records: HashMap<String, Record>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, record: Record) {
        self.records.insert(name.into(), record);
    }

    pub fn get(&self, name: &str) -> Option<&Record> {
        self.records.get(name)
    }
}

/// Call-site metadata recorded for each fallible helper invocation; user
/// space correlates runtime failures back to source locations through the
/// error id in the async record.
#[derive(Debug, Clone)]
pub struct HelperErrorInfo {
    pub func_id: u32,
    pub loc: SourceLocation,
}

/// Everything the generator consumes from and produces for its surroundings.
pub struct RuntimeContext {
    pub maps: MapSet,
    pub structs: StructRegistry,
    pub enums: HashMap<String, u64>,
    pub features: Features,
    pub limits: Limits,
    pub pid: Option<u32>,
    /// PID of a child spawned by the runtime, for the `cpid` builtin.
    pub child_pid: Option<u32>,

    // Format-call tables, one per class. Entries are registered by the
    // analysis phase; lowering assigns offsets in registration order.
    pub printf_args: FormatTable,
    pub system_args: FormatTable,
    pub cat_args: FormatTable,
    pub time_formats: Vec<String>,
    pub strftime_formats: Vec<String>,
    pub non_map_print_types: Vec<SizedType>,

    // Artifacts produced during emission.
    pub probe_ids: ProbeRegistry,
    pub helper_errors: HashMap<u64, HelperErrorInfo>,

    params: Vec<String>,
    pub symbols: Box<dyn SymbolResolver>,
    pub catalog: Box<dyn ProbeCatalog>,
}

impl RuntimeContext {
    pub fn new(symbols: Box<dyn SymbolResolver>, catalog: Box<dyn ProbeCatalog>) -> Self {
        Self {
            maps: MapSet::new(),
            structs: StructRegistry::new(),
            enums: HashMap::new(),
            features: Features::default(),
            limits: Limits::default(),
            pid: None,
            child_pid: None,
            printf_args: FormatTable::new(),
            system_args: FormatTable::new(),
            cat_args: FormatTable::new(),
            time_formats: Vec::new(),
            strftime_formats: Vec::new(),
            non_map_print_types: Vec::new(),
            probe_ids: ProbeRegistry::new(),
            helper_errors: HashMap::new(),
            params: Vec::new(),
            symbols,
            catalog,
        }
    }

    pub fn add_param(&mut self, param: impl Into<String>) {
        self.params.push(param.into());
    }

    /// Positional parameter `$n` (1-based). Out-of-range parameters default
    /// to an empty string in string context and "0" otherwise.
    pub fn get_param(&self, n: usize, is_in_str: bool) -> String {
        if n >= 1 {
            if let Some(p) = self.params.get(n - 1) {
                return p.clone();
            }
        }
        if is_in_str {
            String::new()
        } else {
            "0".to_string()
        }
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Box::new(NoResolution), Box::new(NoResolution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_params_default_by_context() {
        let mut rt = RuntimeContext::default();
        rt.add_param("1234");
        assert_eq!(rt.get_param(1, false), "1234");
        assert_eq!(rt.get_param(2, false), "0");
        assert_eq!(rt.get_param(2, true), "");
        assert_eq!(rt.num_params(), 1);
    }

    #[test]
    fn test_map_set_distinguishes_named_and_special() {
        let mut maps = MapSet::new();
        maps.insert(
            "@counts",
            MapDescriptor {
                fd: 3,
                id: 0,
                value_type: SizedType::uint64(),
            },
        );
        maps.insert_special(
            SpecialMap::Elapsed,
            MapDescriptor {
                fd: 4,
                id: 1,
                value_type: SizedType::uint64(),
            },
        );
        assert_eq!(maps.get("@counts").unwrap().fd, 3);
        assert!(maps.special(SpecialMap::Join).is_none());
        assert_eq!(maps.special(SpecialMap::Elapsed).unwrap().fd, 4);
    }
}
