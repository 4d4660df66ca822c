//! Per-format-call argument tables.
//!
//! The analysis phase registers one entry per printf/system/cat call with the
//! argument types it inferred; the code generator fills in the byte offset of
//! each argument within the emitted perf record. User space indexes the table
//! by the id packed into the record's `async_id` to decode the payload.

use serde::{Deserialize, Serialize};

/// Printable value kinds, as far as the event printer needs to distinguish
/// them. Aggregate layout details stay on the compiler side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    Int,
    UInt,
    String,
    Buffer,
    Pointer,
    KernelSym,
    UserSym,
    Inet,
    Username,
    ProbeName,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgType {
    pub kind: ArgKind,
    pub size: usize,
}

impl ArgType {
    pub fn new(kind: ArgKind, size: usize) -> Self {
        Self { kind, size }
    }
}

/// One argument slot of a format call. `offset` is relative to the start of
/// the perf record, and is written by the code generator once the record
/// struct has been laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatArg {
    pub ty: ArgType,
    pub offset: usize,
}

impl FormatArg {
    pub fn new(ty: ArgType) -> Self {
        Self { ty, offset: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatEntry {
    pub fmt: String,
    pub args: Vec<FormatArg>,
}

impl FormatEntry {
    pub fn new(fmt: impl Into<String>, args: Vec<ArgType>) -> Self {
        Self {
            fmt: fmt.into(),
            args: args.into_iter().map(FormatArg::new).collect(),
        }
    }
}

/// Ordered table of format calls of one class; the id assigned during
/// lowering is the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatTable {
    entries: Vec<FormatEntry>,
}

impl FormatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FormatEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn get(&self, id: usize) -> Option<&FormatEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut FormatEntry> {
        self.entries.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_table_ids_are_push_order() {
        let mut table = FormatTable::new();
        let a = table.push(FormatEntry::new(
            "%d\n",
            vec![ArgType::new(ArgKind::Int, 8)],
        ));
        let b = table.push(FormatEntry::new(
            "%s\n",
            vec![ArgType::new(ArgKind::String, 64)],
        ));
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.get(1).unwrap().fmt, "%s\n");
    }

    #[test]
    fn test_offsets_default_to_zero_until_layout() {
        let entry = FormatEntry::new("%d %d\n", vec![ArgType::new(ArgKind::Int, 8); 2]);
        assert!(entry.args.iter().all(|a| a.offset == 0));
    }
}
