//! Resolved types attached to AST nodes by the semantic analysis phase.

/// Address space a pointer value refers to. Selects the probe-read helper
/// flavor used for dereferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddrSpace {
    #[default]
    None,
    Kernel,
    User,
}

/// Stack capture configuration carried by kstack/ustack values. The limit
/// selects which stack map the id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackType {
    pub limit: u64,
}

impl Default for StackType {
    fn default() -> Self {
        Self { limit: 127 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    None,
    Integer,
    Pointer,
    String,
    Buffer,
    Record,
    Tuple,
    Array,
    Inet,
    KernelSym,
    UserSym,
    KernelStack,
    UserStack,
    Username,
    ProbeName,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizedType {
    pub kind: TypeKind,
    /// Size in bytes.
    pub size: usize,
    pub signed: bool,
    pub addr_space: AddrSpace,
    /// Loads must go through volatile context loads rather than probe reads.
    pub is_ctx_access: bool,
    /// Record resolved through the tracepoint format table.
    pub is_tparg: bool,
    /// Data already copied into BPF-owned memory (e.g. read back from a map).
    pub is_internal: bool,
    /// Argument of a kernel-function-entry probe, read from the typed frame.
    pub is_kfarg: bool,
    pub kfarg_idx: Option<usize>,
    pub record_name: Option<String>,
    pub tuple_elems: Vec<SizedType>,
    pub pointee: Option<Box<SizedType>>,
    pub elem: Option<Box<SizedType>>,
    pub num_elems: usize,
    pub stack_type: Option<StackType>,
}

impl SizedType {
    fn base(kind: TypeKind, size: usize) -> Self {
        Self {
            kind,
            size,
            signed: false,
            addr_space: AddrSpace::None,
            is_ctx_access: false,
            is_tparg: false,
            is_internal: false,
            is_kfarg: false,
            kfarg_idx: None,
            record_name: None,
            tuple_elems: Vec::new(),
            pointee: None,
            elem: None,
            num_elems: 0,
            stack_type: None,
        }
    }

    pub fn none() -> Self {
        Self::base(TypeKind::None, 0)
    }

    pub fn integer(size: usize, signed: bool) -> Self {
        Self {
            signed,
            ..Self::base(TypeKind::Integer, size)
        }
    }

    pub fn uint64() -> Self {
        Self::integer(8, false)
    }

    pub fn int64() -> Self {
        Self::integer(8, true)
    }

    pub fn pointer(pointee: SizedType) -> Self {
        Self {
            pointee: Some(Box::new(pointee)),
            ..Self::base(TypeKind::Pointer, 8)
        }
    }

    pub fn string(size: usize) -> Self {
        Self::base(TypeKind::String, size)
    }

    pub fn buffer(size: usize) -> Self {
        Self::base(TypeKind::Buffer, size)
    }

    pub fn record(name: impl Into<String>, size: usize) -> Self {
        Self {
            record_name: Some(name.into()),
            ..Self::base(TypeKind::Record, size)
        }
    }

    pub fn tuple(elems: Vec<SizedType>) -> Self {
        let size = elems.iter().map(|e| e.size).sum();
        Self {
            tuple_elems: elems,
            ..Self::base(TypeKind::Tuple, size)
        }
    }

    pub fn array(elem: SizedType, num_elems: usize) -> Self {
        let size = elem.size * num_elems;
        Self {
            elem: Some(Box::new(elem)),
            num_elems,
            ..Self::base(TypeKind::Array, size)
        }
    }

    /// Tagged union {af, 16-byte body} produced by ntop().
    pub fn inet() -> Self {
        Self::base(TypeKind::Inet, 24)
    }

    pub fn usym() -> Self {
        Self::base(TypeKind::UserSym, 16)
    }

    pub fn ksym() -> Self {
        Self::base(TypeKind::KernelSym, 8)
    }

    pub fn kstack(stack_type: StackType) -> Self {
        Self {
            stack_type: Some(stack_type),
            ..Self::base(TypeKind::KernelStack, 8)
        }
    }

    pub fn ustack(stack_type: StackType) -> Self {
        Self {
            stack_type: Some(stack_type),
            ..Self::base(TypeKind::UserStack, 8)
        }
    }

    pub fn username() -> Self {
        Self::base(TypeKind::Username, 8)
    }

    pub fn probe_name() -> Self {
        Self::base(TypeKind::ProbeName, 8)
    }

    /// {strftime_id, nsecs} pair produced by strftime().
    pub fn timestamp() -> Self {
        Self::base(TypeKind::Timestamp, 16)
    }

    pub fn with_addr_space(mut self, addr_space: AddrSpace) -> Self {
        self.addr_space = addr_space;
        self
    }

    pub fn ctx_access(mut self) -> Self {
        self.is_ctx_access = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    pub fn is_integer(&self) -> bool {
        self.kind == TypeKind::Integer
    }

    pub fn is_pointer(&self) -> bool {
        self.kind == TypeKind::Pointer
    }

    pub fn is_string(&self) -> bool {
        self.kind == TypeKind::String
    }

    pub fn is_buffer(&self) -> bool {
        self.kind == TypeKind::Buffer
    }

    pub fn is_record(&self) -> bool {
        self.kind == TypeKind::Record
    }

    pub fn is_tuple(&self) -> bool {
        self.kind == TypeKind::Tuple
    }

    pub fn is_array(&self) -> bool {
        self.kind == TypeKind::Array
    }

    pub fn is_none(&self) -> bool {
        self.kind == TypeKind::None
    }

    pub fn is_usym(&self) -> bool {
        self.kind == TypeKind::UserSym
    }

    /// Values that already live in a stack buffer when produced. Such values
    /// are passed by pointer and may be borrowed directly as map keys.
    pub fn is_stack_resident(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::String
                | TypeKind::Buffer
                | TypeKind::Tuple
                | TypeKind::Inet
                | TypeKind::UserSym
                | TypeKind::Timestamp
        )
    }

    /// Values stored into maps or variables by memcpy rather than a scalar
    /// store.
    pub fn needs_memcpy(&self) -> bool {
        self.is_stack_resident() || matches!(self.kind, TypeKind::Record | TypeKind::Array)
    }

    /// Element type for array values.
    pub fn element_type(&self) -> Option<&SizedType> {
        self.elem.as_deref()
    }

    pub fn pointee_type(&self) -> Option<&SizedType> {
        self.pointee.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_size_is_sum_of_elements() {
        let ty = SizedType::tuple(vec![SizedType::uint64(), SizedType::string(16)]);
        assert_eq!(ty.size, 24);
        assert!(ty.is_stack_resident());
    }

    #[test]
    fn test_stack_residency_and_memcpy_classes() {
        assert!(!SizedType::uint64().is_stack_resident());
        assert!(SizedType::string(64).is_stack_resident());
        assert!(SizedType::inet().is_stack_resident());
        assert!(!SizedType::record("task_struct", 128).is_stack_resident());
        assert!(SizedType::record("task_struct", 128).needs_memcpy());
        assert!(SizedType::array(SizedType::integer(4, false), 4).needs_memcpy());
    }
}
