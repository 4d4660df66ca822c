/// pt_regs word offsets for x86_64
///
/// Generated programs receive a `struct pt_regs *` context and read it as an
/// array of u64 words. All offsets returned by this module are indices into
/// that array, not byte offsets.
use tracing::warn;

/// pt_regs indices for x86_64.
///
/// The indices are calculated by dividing each field offset by the size of
/// u64, which gives the array index for accessing pt_regs as a u64 array.
pub mod pt_regs_indices {
    use aya_ebpf_bindings::bindings::pt_regs;

    const U64_SIZE: usize = core::mem::size_of::<u64>();

    pub const R15: usize = core::mem::offset_of!(pt_regs, r15) / U64_SIZE;
    pub const R14: usize = core::mem::offset_of!(pt_regs, r14) / U64_SIZE;
    pub const R13: usize = core::mem::offset_of!(pt_regs, r13) / U64_SIZE;
    pub const R12: usize = core::mem::offset_of!(pt_regs, r12) / U64_SIZE;
    pub const RBP: usize = core::mem::offset_of!(pt_regs, rbp) / U64_SIZE;
    pub const RBX: usize = core::mem::offset_of!(pt_regs, rbx) / U64_SIZE;
    pub const R11: usize = core::mem::offset_of!(pt_regs, r11) / U64_SIZE;
    pub const R10: usize = core::mem::offset_of!(pt_regs, r10) / U64_SIZE;
    pub const R9: usize = core::mem::offset_of!(pt_regs, r9) / U64_SIZE;
    pub const R8: usize = core::mem::offset_of!(pt_regs, r8) / U64_SIZE;
    pub const RAX: usize = core::mem::offset_of!(pt_regs, rax) / U64_SIZE;
    pub const RCX: usize = core::mem::offset_of!(pt_regs, rcx) / U64_SIZE;
    pub const RDX: usize = core::mem::offset_of!(pt_regs, rdx) / U64_SIZE;
    pub const RSI: usize = core::mem::offset_of!(pt_regs, rsi) / U64_SIZE;
    pub const RDI: usize = core::mem::offset_of!(pt_regs, rdi) / U64_SIZE;
    pub const ORIG_RAX: usize = core::mem::offset_of!(pt_regs, orig_rax) / U64_SIZE;
    pub const RIP: usize = core::mem::offset_of!(pt_regs, rip) / U64_SIZE;
    pub const CS: usize = core::mem::offset_of!(pt_regs, cs) / U64_SIZE;
    pub const EFLAGS: usize = core::mem::offset_of!(pt_regs, eflags) / U64_SIZE;
    pub const RSP: usize = core::mem::offset_of!(pt_regs, rsp) / U64_SIZE;
    pub const SS: usize = core::mem::offset_of!(pt_regs, ss) / U64_SIZE;
}

/// System V ABI argument registers: rdi, rsi, rdx, rcx, r8, r9.
pub fn arg_offset(arg_num: usize) -> Option<usize> {
    use pt_regs_indices::*;
    const ARG_REGS: [usize; 6] = [RDI, RSI, RDX, RCX, R8, R9];
    ARG_REGS.get(arg_num).copied()
}

/// Return value lives in rax.
pub fn ret_offset() -> usize {
    pt_regs_indices::RAX
}

/// Program counter (rip).
pub fn pc_offset() -> usize {
    pt_regs_indices::RIP
}

/// Stack pointer (rsp).
pub fn sp_offset() -> usize {
    pt_regs_indices::RSP
}

/// Word distance from the stack pointer to the first stack-passed argument.
/// On x86_64 the return address occupies the first word.
pub fn arg_stack_offset() -> usize {
    1
}

/// Resolve a user-facing register name to its pt_regs word offset.
pub fn register_offset(name: &str) -> Option<usize> {
    use pt_regs_indices::*;
    let idx = match name {
        "r15" => R15,
        "r14" => R14,
        "r13" => R13,
        "r12" => R12,
        "bp" | "rbp" => RBP,
        "bx" | "rbx" => RBX,
        "r11" => R11,
        "r10" => R10,
        "r9" => R9,
        "r8" => R8,
        "ax" | "rax" => RAX,
        "cx" | "rcx" => RCX,
        "dx" | "rdx" => RDX,
        "si" | "rsi" => RSI,
        "di" | "rdi" => RDI,
        "orig_ax" | "orig_rax" => ORIG_RAX,
        "ip" | "rip" => RIP,
        "cs" => CS,
        "flags" | "eflags" => EFLAGS,
        "sp" | "rsp" => RSP,
        "ss" => SS,
        _ => {
            warn!("unknown register name: {}", name);
            return None;
        }
    };
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_registers_follow_sysv_order() {
        assert_eq!(arg_offset(0), Some(pt_regs_indices::RDI));
        assert_eq!(arg_offset(1), Some(pt_regs_indices::RSI));
        assert_eq!(arg_offset(2), Some(pt_regs_indices::RDX));
        assert_eq!(arg_offset(3), Some(pt_regs_indices::RCX));
        assert_eq!(arg_offset(4), Some(pt_regs_indices::R8));
        assert_eq!(arg_offset(5), Some(pt_regs_indices::R9));
        assert_eq!(arg_offset(6), None);
    }

    #[test]
    fn test_register_offsets_match_pt_regs_layout() {
        // pt_regs starts with r15 and stores rsp near the end
        assert_eq!(register_offset("r15"), Some(0));
        assert_eq!(register_offset("ip"), Some(16));
        assert_eq!(register_offset("sp"), Some(19));
        assert_eq!(register_offset("ax"), Some(ret_offset()));
        assert_eq!(register_offset("nosuchreg"), None);
    }
}
