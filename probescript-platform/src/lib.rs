/// Platform-specific utilities for the probescript eBPF code generator
///
/// This crate provides the architecture services the code generator consumes:
/// - `pt_regs` word offsets for probe context access (arguments, return
///   value, program counter, stack pointer, named registers)
/// - the signal-name table used by the `signal()` call
pub mod pt_regs;
pub mod signal;

pub use pt_regs::{
    arg_offset, arg_stack_offset, pc_offset, register_offset, ret_offset, sp_offset,
    pt_regs_indices,
};
pub use signal::signal_name_to_num;
