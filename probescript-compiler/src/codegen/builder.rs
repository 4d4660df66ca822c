//! Typed IR primitives over the raw builder: eBPF-safe allocas, probe reads,
//! helper calls, perf event output and bounded string compares.
//!
//! Every fallible helper call site is assigned a dense error id; failures are
//! reported to user space as helper-error records and execution continues
//! with safe defaults.

use super::{CodeGen, Scoped};
use crate::ast::{SourceLocation, UsdtArgKind};
use crate::runtime::{HelperErrorInfo, SpecialMap};
use crate::types::{AddrSpace, SizedType, StackType, TypeKind};
use crate::{CodeGenError, Result};
use aya_ebpf_bindings::bindings::bpf_func_id::{
    BPF_FUNC_get_current_cgroup_id, BPF_FUNC_get_current_comm, BPF_FUNC_get_current_pid_tgid,
    BPF_FUNC_get_current_task, BPF_FUNC_get_current_uid_gid, BPF_FUNC_get_prandom_u32,
    BPF_FUNC_get_smp_processor_id, BPF_FUNC_get_stackid, BPF_FUNC_ktime_get_boot_ns,
    BPF_FUNC_ktime_get_ns, BPF_FUNC_override_return, BPF_FUNC_perf_event_output,
    BPF_FUNC_probe_read, BPF_FUNC_probe_read_kernel, BPF_FUNC_probe_read_kernel_str,
    BPF_FUNC_probe_read_str, BPF_FUNC_probe_read_user, BPF_FUNC_probe_read_user_str,
    BPF_FUNC_send_signal,
};
use inkwell::intrinsics::Intrinsic;
use inkwell::types::{BasicMetadataTypeEnum, BasicType, BasicTypeEnum, IntType, PointerType, StructType};
use inkwell::values::{
    BasicMetadataValueEnum, BasicValueEnum, FunctionValue, IntValue, PointerValue,
};
use inkwell::{AddressSpace, IntPredicate};
use probescript_protocol::AsyncAction;

/// Flag for bpf_perf_event_output: write to the current CPU's ring.
const BPF_F_CURRENT_CPU: u64 = 0xffff_ffff;
/// Flag for bpf_get_stackid: capture the user-space stack.
const BPF_F_USER_STACK: u64 = 1 << 8;
/// First operand of llvm.bpf.pseudo for map file descriptors.
const BPF_PSEUDO_MAP_FD: u64 = 1;

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    pub(crate) fn i64_t(&self) -> IntType<'ctx> {
        self.context.i64_type()
    }

    pub(crate) fn i32_t(&self) -> IntType<'ctx> {
        self.context.i32_type()
    }

    pub(crate) fn i8_t(&self) -> IntType<'ctx> {
        self.context.i8_type()
    }

    pub(crate) fn ptr_t(&self) -> PointerType<'ctx> {
        self.context.ptr_type(AddressSpace::default())
    }

    pub(crate) fn const_i64(&self, v: u64) -> IntValue<'ctx> {
        self.i64_t().const_int(v, false)
    }

    pub(crate) fn const_i32(&self, v: u64) -> IntValue<'ctx> {
        self.i32_t().const_int(v, false)
    }

    /// LLVM representation of a resolved type. Scalars keep their declared
    /// width; stack-resident aggregates are byte arrays or structs.
    pub(crate) fn llvm_type(&self, ty: &SizedType) -> BasicTypeEnum<'ctx> {
        match ty.kind {
            TypeKind::Integer => {
                let bits = if ty.size == 0 { 64 } else { (ty.size * 8) as u32 };
                self.context.custom_width_int_type(bits).into()
            }
            TypeKind::Pointer
            | TypeKind::KernelSym
            | TypeKind::Username
            | TypeKind::ProbeName
            | TypeKind::KernelStack
            | TypeKind::UserStack
            | TypeKind::None => self.i64_t().into(),
            TypeKind::String | TypeKind::Buffer | TypeKind::Record | TypeKind::Array => {
                self.i8_t().array_type(ty.size as u32).into()
            }
            TypeKind::Tuple => {
                let elems: Vec<BasicTypeEnum> =
                    ty.tuple_elems.iter().map(|e| self.llvm_type(e)).collect();
                self.context.struct_type(&elems, false).into()
            }
            TypeKind::Inet => {
                let body = self.i8_t().array_type(16);
                self.context
                    .struct_type(&[self.i64_t().into(), body.into()], false)
                    .into()
            }
            TypeKind::UserSym | TypeKind::Timestamp => self
                .context
                .struct_type(&[self.i64_t().into(), self.i64_t().into()], false)
                .into(),
        }
    }

    pub(crate) fn struct_size(&self, ty: StructType<'ctx>) -> u64 {
        self.layout.get_abi_size(&ty)
    }

    /// Stack slot in the function entry block, with a lifetime-start marker
    /// at the current insertion point.
    pub(crate) fn create_alloca(
        &mut self,
        ty: BasicTypeEnum<'ctx>,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let current = self
            .builder
            .get_insert_block()
            .ok_or_else(|| CodeGenError::Internal("no insertion block".to_string()))?;
        let function = current
            .get_parent()
            .ok_or_else(|| CodeGenError::Internal("no parent function".to_string()))?;
        let entry = function
            .get_first_basic_block()
            .ok_or_else(|| CodeGenError::Internal("function has no entry block".to_string()))?;

        match entry.get_first_instruction() {
            Some(first) => self.builder.position_before(&first),
            None => self.builder.position_at_end(entry),
        }
        let ptr = self
            .builder
            .build_alloca(ty, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder.position_at_end(current);

        self.create_lifetime_start(ptr)?;
        Ok(ptr)
    }

    pub(crate) fn create_alloca_type(
        &mut self,
        ty: &SizedType,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let llvm_ty = self.llvm_type(ty);
        self.create_alloca(llvm_ty, name)
    }

    pub(crate) fn create_alloca_bytes(
        &mut self,
        size: u64,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let ty = self.i8_t().array_type(size as u32);
        self.create_alloca(ty.into(), name)
    }

    /// Zero-initialized stack slot, for scalar variable storage.
    pub(crate) fn create_alloca_init(
        &mut self,
        ty: &SizedType,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        let ptr = self.create_alloca_type(ty, name)?;
        self.create_memset(ptr, 0, ty.size as u64)?;
        Ok(ptr)
    }

    fn lifetime_intrinsic(&self, name: &str) -> Result<FunctionValue<'ctx>> {
        let intrinsic = Intrinsic::find(name)
            .ok_or_else(|| CodeGenError::Llvm(format!("intrinsic {name} not found")))?;
        intrinsic
            .get_declaration(&self.module, &[self.ptr_t().into()])
            .ok_or_else(|| CodeGenError::Llvm(format!("cannot declare {name}")))
    }

    pub(crate) fn create_lifetime_start(&mut self, ptr: PointerValue<'ctx>) -> Result<()> {
        let f = self.lifetime_intrinsic("llvm.lifetime.start")?;
        let size = self.i64_t().const_int(u64::MAX, true);
        self.builder
            .build_call(f, &[size.into(), ptr.into()], "")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn create_lifetime_end(&mut self, ptr: PointerValue<'ctx>) -> Result<()> {
        let f = self.lifetime_intrinsic("llvm.lifetime.end")?;
        let size = self.i64_t().const_int(u64::MAX, true);
        self.builder
            .build_call(f, &[size.into(), ptr.into()], "")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn create_memset(
        &mut self,
        ptr: PointerValue<'ctx>,
        value: u8,
        len: u64,
    ) -> Result<()> {
        let val = self.i8_t().const_int(value as u64, false);
        let len = self.const_i64(len);
        self.builder
            .build_memset(ptr, 1, val, len)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn create_memcpy(
        &mut self,
        dst: PointerValue<'ctx>,
        src: PointerValue<'ctx>,
        len: u64,
    ) -> Result<()> {
        let len = self.const_i64(len);
        self.builder
            .build_memcpy(dst, 1, src, 1, len)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    /// Byte-wise copy out of the probe context. Context reads must stay
    /// volatile so the optimizer cannot rewrite their widths.
    pub(crate) fn create_ctx_copy(
        &mut self,
        dst: PointerValue<'ctx>,
        src_addr: IntValue<'ctx>,
        len: u64,
    ) -> Result<()> {
        for i in 0..len {
            let addr = self
                .builder
                .build_int_add(src_addr, self.const_i64(i), "ctx_byte_addr")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let src = self
                .builder
                .build_int_to_ptr(addr, self.ptr_t(), "ctx_byte_ptr")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let byte = self.create_volatile_load(self.i8_t().into(), src, "ctx_byte")?;
            let dst_ptr = unsafe {
                self.builder
                    .build_gep(self.i8_t(), dst, &[self.const_i64(i)], "ctx_dst")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
            };
            self.builder
                .build_store(dst_ptr, byte)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        Ok(())
    }

    pub(crate) fn create_volatile_load(
        &mut self,
        ty: BasicTypeEnum<'ctx>,
        ptr: PointerValue<'ctx>,
        name: &str,
    ) -> Result<BasicValueEnum<'ctx>> {
        let load = self
            .builder
            .build_load(ty, ptr, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        load.as_instruction_value()
            .ok_or_else(|| CodeGenError::Internal("load is not an instruction".to_string()))?
            .set_volatile(true)
            .map_err(|e| CodeGenError::Llvm(e.to_string()))?;
        Ok(load)
    }

    /// Volatile 64-bit load from the probe context at a word offset.
    pub(crate) fn create_ctx_load(&mut self, offset: u64, name: &str) -> Result<IntValue<'ctx>> {
        let ctx = self.ctx()?;
        let gep = unsafe {
            self.builder
                .build_gep(
                    self.i64_t(),
                    ctx,
                    &[self.const_i64(offset)],
                    &format!("{name}_ptr"),
                )
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
        };
        Ok(self
            .create_volatile_load(self.i64_t().into(), gep, name)?
            .into_int_value())
    }

    /// Cast an integer to 64 bits, sign-extending when the source is signed.
    pub(crate) fn promote_to_i64(
        &mut self,
        value: IntValue<'ctx>,
        signed: bool,
    ) -> Result<IntValue<'ctx>> {
        self.create_int_cast(value, self.i64_t(), signed)
    }

    pub(crate) fn create_int_cast(
        &mut self,
        value: IntValue<'ctx>,
        ty: IntType<'ctx>,
        signed: bool,
    ) -> Result<IntValue<'ctx>> {
        if value.get_type().get_bit_width() == ty.get_bit_width() {
            return Ok(value);
        }
        self.builder
            .build_int_cast_sign_flag(value, ty, signed, "cast")
            .map_err(|e| CodeGenError::Builder(e.to_string()))
    }

    /// Indirect call through the helper id, the calling convention the BPF
    /// backend lowers to a helper invocation.
    pub(crate) fn create_helper_call(
        &mut self,
        helper_id: u32,
        args: &[BasicValueEnum<'ctx>],
        return_type: BasicTypeEnum<'ctx>,
        name: &str,
    ) -> Result<BasicValueEnum<'ctx>> {
        let arg_types: Vec<BasicMetadataTypeEnum> =
            args.iter().map(|arg| arg.get_type().into()).collect();
        let fn_type = return_type.fn_type(&arg_types, false);

        let helper_addr = self.const_i64(helper_id as u64);
        let helper_fn = self
            .builder
            .build_int_to_ptr(helper_addr, self.ptr_t(), "helper_fn")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let metadata_args: Vec<BasicMetadataValueEnum> =
            args.iter().map(|arg| (*arg).into()).collect();
        let call = self
            .builder
            .build_indirect_call(fn_type, helper_fn, &metadata_args, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        Ok(call
            .try_as_basic_value()
            .left()
            .unwrap_or_else(|| return_type.const_zero()))
    }

    /// Map references are materialized with the BPF pseudo instruction
    /// carrying the map file descriptor, relocated at load time.
    pub(crate) fn create_map_fd(&mut self, fd: i32) -> Result<IntValue<'ctx>> {
        let func = match self.module.get_function("llvm.bpf.pseudo") {
            Some(f) => f,
            None => {
                let fn_type = self
                    .i64_t()
                    .fn_type(&[self.i64_t().into(), self.i64_t().into()], false);
                self.module.add_function("llvm.bpf.pseudo", fn_type, None)
            }
        };
        let call = self
            .builder
            .build_call(
                func,
                &[
                    self.const_i64(BPF_PSEUDO_MAP_FD).into(),
                    self.const_i64(fd as u64).into(),
                ],
                "pseudo",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(call
            .try_as_basic_value()
            .left()
            .ok_or_else(|| CodeGenError::Internal("pseudo call has no value".to_string()))?
            .into_int_value())
    }

    /// Bounded read of kernel or user memory. On failure the destination
    /// keeps its zeroed contents and a helper-error record is emitted.
    pub(crate) fn create_probe_read(
        &mut self,
        dst: PointerValue<'ctx>,
        len: IntValue<'ctx>,
        src: IntValue<'ctx>,
        addr_space: AddrSpace,
        loc: SourceLocation,
    ) -> Result<()> {
        let helper = match addr_space {
            AddrSpace::User => BPF_FUNC_probe_read_user,
            AddrSpace::Kernel => BPF_FUNC_probe_read_kernel,
            AddrSpace::None => BPF_FUNC_probe_read,
        };
        let len = self.create_int_cast(len, self.i32_t(), false)?;
        let src_ptr = self
            .builder
            .build_int_to_ptr(src, self.ptr_t(), "probe_read_src")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let ret = self.create_helper_call(
            helper,
            &[dst.into(), len.into(), src_ptr.into()],
            self.i64_t().into(),
            "probe_read",
        )?;
        self.create_helper_error_cond(ret.into_int_value(), helper, loc)
    }

    /// NUL-terminated bounded read.
    pub(crate) fn create_probe_read_str(
        &mut self,
        dst: PointerValue<'ctx>,
        len: IntValue<'ctx>,
        src: IntValue<'ctx>,
        addr_space: AddrSpace,
        loc: SourceLocation,
    ) -> Result<()> {
        let helper = match addr_space {
            AddrSpace::User => BPF_FUNC_probe_read_user_str,
            AddrSpace::Kernel => BPF_FUNC_probe_read_kernel_str,
            AddrSpace::None => BPF_FUNC_probe_read_str,
        };
        let len = self.create_int_cast(len, self.i32_t(), false)?;
        let src_ptr = self
            .builder
            .build_int_to_ptr(src, self.ptr_t(), "probe_read_str_src")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let ret = self.create_helper_call(
            helper,
            &[dst.into(), len.into(), src_ptr.into()],
            self.i64_t().into(),
            "probe_read_str",
        )?;
        self.create_helper_error_cond(ret.into_int_value(), helper, loc)
    }

    /// Push a byte record to the per-CPU perf ring.
    pub(crate) fn create_perf_event_output(
        &mut self,
        data: PointerValue<'ctx>,
        size: u64,
    ) -> Result<()> {
        let fd = self
            .runtime
            .maps
            .special(SpecialMap::PerfEvent)
            .ok_or_else(|| CodeGenError::MapNotFound("perf_event".to_string()))?
            .fd;
        let map = self.create_map_fd(fd)?;
        let ctx = self.ctx()?;
        self.create_helper_call(
            BPF_FUNC_perf_event_output,
            &[
                ctx.into(),
                map.into(),
                self.const_i64(BPF_F_CURRENT_CPU).into(),
                data.into(),
                self.const_i64(size).into(),
            ],
            self.i64_t().into(),
            "perf_event_output",
        )?;
        Ok(())
    }

    /// Assign a dense call-site id and emit a helper-error record at the
    /// current position. The id is recorded for user-space correlation.
    pub(crate) fn emit_helper_error(
        &mut self,
        func_id: u32,
        ret: IntValue<'ctx>,
        loc: SourceLocation,
    ) -> Result<()> {
        let error_id = self.ids.helper_error;
        self.ids.helper_error += 1;
        self.runtime
            .helper_errors
            .insert(error_id, HelperErrorInfo { func_id, loc });

        let event_ty = self.context.struct_type(
            &[
                self.i64_t().into(),
                self.i64_t().into(),
                self.i32_t().into(),
            ],
            true,
        );
        let buf = self.create_alloca(event_ty.into(), "helper_error_t")?;
        let action = self.const_i64(AsyncAction::HelperError.base());
        self.store_struct_field(event_ty, buf, 0, action.into())?;
        self.store_struct_field(event_ty, buf, 1, self.const_i64(error_id).into())?;
        let ret32 = self.create_int_cast(ret, self.i32_t(), true)?;
        self.store_struct_field(event_ty, buf, 2, ret32.into())?;
        let size = self.struct_size(event_ty);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)
    }

    /// Guard a helper return value: negative returns emit a helper-error
    /// record tagged with a call-site id, then execution continues.
    pub(crate) fn create_helper_error_cond(
        &mut self,
        ret: IntValue<'ctx>,
        func_id: u32,
        loc: SourceLocation,
    ) -> Result<()> {
        let failed_block = self.append_block("helper_failed")?;
        let merge_block = self.append_block("helper_merge")?;

        let ret64 = self.promote_to_i64(ret, true)?;
        let zero = self.const_i64(0);
        let failed = self
            .builder
            .build_int_compare(IntPredicate::SLT, ret64, zero, "helper_ret")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(failed, failed_block, merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(failed_block);
        self.emit_helper_error(func_id, ret64, loc)?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(merge_block);
        Ok(())
    }

    pub(crate) fn store_struct_field(
        &mut self,
        struct_ty: StructType<'ctx>,
        base: PointerValue<'ctx>,
        index: u32,
        value: BasicValueEnum<'ctx>,
    ) -> Result<()> {
        let ptr = self
            .builder
            .build_struct_gep(struct_ty, base, index, "field")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_store(ptr, value)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn struct_field_ptr(
        &mut self,
        struct_ty: StructType<'ctx>,
        base: PointerValue<'ctx>,
        index: u32,
        name: &str,
    ) -> Result<PointerValue<'ctx>> {
        self.builder
            .build_struct_gep(struct_ty, base, index, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))
    }

    // Helper wrappers.

    /// Monotonic or boot-time nanoseconds, by feature capability.
    pub(crate) fn create_get_ns(&mut self) -> Result<IntValue<'ctx>> {
        let helper = if self.runtime.features.has_ktime_get_boot_ns {
            BPF_FUNC_ktime_get_boot_ns
        } else {
            BPF_FUNC_ktime_get_ns
        };
        Ok(self
            .create_helper_call(helper, &[], self.i64_t().into(), "get_ns")?
            .into_int_value())
    }

    pub(crate) fn create_get_pid_tgid(&mut self) -> Result<IntValue<'ctx>> {
        Ok(self
            .create_helper_call(
                BPF_FUNC_get_current_pid_tgid,
                &[],
                self.i64_t().into(),
                "get_pid_tgid",
            )?
            .into_int_value())
    }

    pub(crate) fn create_get_uid_gid(&mut self) -> Result<IntValue<'ctx>> {
        Ok(self
            .create_helper_call(
                BPF_FUNC_get_current_uid_gid,
                &[],
                self.i64_t().into(),
                "get_uid_gid",
            )?
            .into_int_value())
    }

    pub(crate) fn create_get_cpu_id(&mut self) -> Result<IntValue<'ctx>> {
        let cpu = self
            .create_helper_call(
                BPF_FUNC_get_smp_processor_id,
                &[],
                self.i32_t().into(),
                "get_cpu_id",
            )?
            .into_int_value();
        self.promote_to_i64(cpu, false)
    }

    pub(crate) fn create_get_current_task(&mut self) -> Result<IntValue<'ctx>> {
        Ok(self
            .create_helper_call(
                BPF_FUNC_get_current_task,
                &[],
                self.i64_t().into(),
                "get_current_task",
            )?
            .into_int_value())
    }

    pub(crate) fn create_get_cgroup_id(&mut self) -> Result<IntValue<'ctx>> {
        Ok(self
            .create_helper_call(
                BPF_FUNC_get_current_cgroup_id,
                &[],
                self.i64_t().into(),
                "get_cgroup_id",
            )?
            .into_int_value())
    }

    pub(crate) fn create_get_random(&mut self) -> Result<IntValue<'ctx>> {
        let r = self
            .create_helper_call(
                BPF_FUNC_get_prandom_u32,
                &[],
                self.i32_t().into(),
                "get_random",
            )?
            .into_int_value();
        self.promote_to_i64(r, false)
    }

    pub(crate) fn create_get_current_comm(
        &mut self,
        buf: PointerValue<'ctx>,
        size: u64,
        loc: SourceLocation,
    ) -> Result<()> {
        let ret = self.create_helper_call(
            BPF_FUNC_get_current_comm,
            &[buf.into(), self.const_i32(size).into()],
            self.i64_t().into(),
            "get_comm",
        )?;
        self.create_helper_error_cond(ret.into_int_value(), BPF_FUNC_get_current_comm, loc)
    }

    /// Stack id from the per-limit stack map; negative ids report a helper
    /// error and flow through as a safe default.
    pub(crate) fn create_get_stack_id(
        &mut self,
        user: bool,
        stack_type: StackType,
        loc: SourceLocation,
    ) -> Result<IntValue<'ctx>> {
        let fd = self
            .runtime
            .maps
            .special(SpecialMap::Stack(stack_type))
            .ok_or_else(|| CodeGenError::MapNotFound(format!("stack_{}", stack_type.limit)))?
            .fd;
        let map = self.create_map_fd(fd)?;
        let ctx = self.ctx()?;
        let flags = if user { BPF_F_USER_STACK } else { 0 };
        let stackid = self
            .create_helper_call(
                BPF_FUNC_get_stackid,
                &[ctx.into(), map.into(), self.const_i64(flags).into()],
                self.i64_t().into(),
                "get_stackid",
            )?
            .into_int_value();
        self.create_helper_error_cond(stackid, BPF_FUNC_get_stackid, loc)?;
        Ok(stackid)
    }

    pub(crate) fn create_signal(
        &mut self,
        sig: IntValue<'ctx>,
        loc: SourceLocation,
    ) -> Result<()> {
        let ret = self.create_helper_call(
            BPF_FUNC_send_signal,
            &[sig.into()],
            self.i64_t().into(),
            "send_signal",
        )?;
        self.create_helper_error_cond(ret.into_int_value(), BPF_FUNC_send_signal, loc)
    }

    pub(crate) fn create_override_return(&mut self, rc: IntValue<'ctx>) -> Result<()> {
        let ctx = self.ctx()?;
        self.create_helper_call(
            BPF_FUNC_override_return,
            &[ctx.into(), rc.into()],
            self.i64_t().into(),
            "override_return",
        )?;
        Ok(())
    }

    /// Kernel-function-entry argument: the context is a typed frame of
    /// 64-bit slots indexed by argument position.
    pub(crate) fn create_kfunc_arg(&mut self, ty: &SizedType, name: &str) -> Result<IntValue<'ctx>> {
        let idx = ty.kfarg_idx.ok_or_else(|| {
            CodeGenError::Internal(format!("kernel function argument {name} has no frame index"))
        })?;
        let raw = self.create_ctx_load(idx as u64, name)?;
        if ty.size < 8 && ty.size > 0 {
            let narrow = self.create_int_cast(
                raw,
                self.context.custom_width_int_type((ty.size * 8) as u32),
                false,
            )?;
            return self.promote_to_i64(narrow, ty.signed);
        }
        Ok(raw)
    }

    /// Argument of the current USDT location, read via its recipe.
    pub(crate) fn create_usdt_arg_read(
        &mut self,
        arg_num: usize,
        loc: SourceLocation,
    ) -> Result<IntValue<'ctx>> {
        let ap = self.attach_point()?;
        let probe_name = self.probefull.clone();
        let usdt = ap
            .usdt
            .clone()
            .ok_or_else(|| CodeGenError::UsdtNotFound(probe_name.clone()))?;
        let location = usdt
            .locations
            .get(self.current_usdt_location_index)
            .ok_or_else(|| {
                CodeGenError::Internal(format!("usdt location index out of range for {probe_name}"))
            })?;
        let arg = location.args.get(arg_num).cloned().ok_or_else(|| {
            CodeGenError::Internal(format!("usdt argument {arg_num} out of range"))
        })?;

        match &arg.kind {
            UsdtArgKind::Constant(v) => Ok(self.i64_t().const_int(*v as u64, true)),
            UsdtArgKind::Register { reg } => {
                let offset = probescript_platform::register_offset(reg).ok_or_else(|| {
                    CodeGenError::Internal(format!("unknown usdt register \"{reg}\""))
                })?;
                let value = self.create_ctx_load(offset as u64, "usdt_arg")?;
                self.narrow_and_promote(value, arg.size, arg.signed)
            }
            UsdtArgKind::Memory { reg, offset } => {
                let reg_offset = probescript_platform::register_offset(reg).ok_or_else(|| {
                    CodeGenError::Internal(format!("unknown usdt register \"{reg}\""))
                })?;
                let base = self.create_ctx_load(reg_offset as u64, "usdt_base")?;
                let addr = self
                    .builder
                    .build_int_add(
                        base,
                        self.i64_t().const_int(*offset as u64, true),
                        "usdt_addr",
                    )
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let dst = self.create_alloca_bytes(8, "usdt_arg")?;
                self.create_memset(dst, 0, 8)?;
                let len = self.const_i64(arg.size as u64);
                self.create_probe_read(dst, len, addr, AddrSpace::User, loc)?;
                let value = self
                    .builder
                    .build_load(self.i64_t(), dst, "usdt_arg_val")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                self.create_lifetime_end(dst)?;
                self.narrow_and_promote(value, arg.size, arg.signed)
            }
        }
    }

    fn narrow_and_promote(
        &mut self,
        value: IntValue<'ctx>,
        size: usize,
        signed: bool,
    ) -> Result<IntValue<'ctx>> {
        if size >= 8 || size == 0 {
            return Ok(value);
        }
        let narrow =
            self.create_int_cast(value, self.context.custom_width_int_type((size * 8) as u32), false)?;
        self.promote_to_i64(narrow, signed)
    }

    /// usym values associate an address with the pid that resolved it, so
    /// symbolication survives ASLR across processes.
    pub(crate) fn create_usym(&mut self, addr: IntValue<'ctx>) -> Result<Scoped<'ctx>> {
        let usym_ty = self
            .context
            .struct_type(&[self.i64_t().into(), self.i64_t().into()], false);
        let buf = self.create_alloca(usym_ty.into(), "usym")?;
        let pid_tgid = self.create_get_pid_tgid()?;
        let pid = self
            .builder
            .build_right_shift(pid_tgid, self.const_i64(32), false, "pid")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.store_struct_field(usym_ty, buf, 0, addr.into())?;
        self.store_struct_field(usym_ty, buf, 1, pid.into())?;
        Ok(Scoped::owned(buf))
    }

    // Bounded string and buffer compares.

    /// Byte `index` of a compare operand: stack buffers are loaded directly,
    /// external addresses go through a bounded probe read.
    fn compare_operand_byte(
        &mut self,
        operand: BasicValueEnum<'ctx>,
        index: u64,
        addr_space: AddrSpace,
        loc: SourceLocation,
    ) -> Result<IntValue<'ctx>> {
        match operand {
            BasicValueEnum::PointerValue(ptr) => {
                let gep = unsafe {
                    self.builder
                        .build_gep(self.i8_t(), ptr, &[self.const_i64(index)], "strcmp_char")
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?
                };
                Ok(self
                    .builder
                    .build_load(self.i8_t(), gep, "strcmp_byte")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value())
            }
            BasicValueEnum::IntValue(addr) => {
                let byte_addr = self
                    .builder
                    .build_int_add(addr, self.const_i64(index), "strcmp_addr")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let dst = self.create_alloca_bytes(1, "strcmp_read")?;
                self.create_probe_read(dst, self.const_i64(1), byte_addr, addr_space, loc)?;
                let byte = self
                    .builder
                    .build_load(self.i8_t(), dst, "strcmp_byte")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                self.create_lifetime_end(dst)?;
                Ok(byte)
            }
            other => Err(CodeGenError::Internal(format!(
                "invalid compare operand {other:?}"
            ))),
        }
    }

    /// Compare against a string literal without materializing the literal on
    /// the stack. `n` bounds the compare; by default the literal's bytes and
    /// terminator are covered.
    pub(crate) fn create_strcmp_literal(
        &mut self,
        operand: BasicValueEnum<'ctx>,
        addr_space: AddrSpace,
        literal: &str,
        n: Option<u64>,
        loc: SourceLocation,
        inverse: bool,
    ) -> Result<IntValue<'ctx>> {
        let n = n.unwrap_or(literal.len() as u64 + 1);
        self.create_bounded_compare(operand, addr_space, Some(literal), None, n, loc, inverse)
    }

    /// Bounded byte-by-byte compare of two operands; equality stops early at
    /// a NUL terminator.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_strncmp(
        &mut self,
        left: BasicValueEnum<'ctx>,
        left_as: AddrSpace,
        right: BasicValueEnum<'ctx>,
        right_as: AddrSpace,
        n: u64,
        loc: SourceLocation,
        inverse: bool,
    ) -> Result<IntValue<'ctx>> {
        self.create_bounded_compare(left, left_as, None, Some((right, right_as)), n, loc, inverse)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_bounded_compare(
        &mut self,
        left: BasicValueEnum<'ctx>,
        left_as: AddrSpace,
        literal: Option<&str>,
        right: Option<(BasicValueEnum<'ctx>, AddrSpace)>,
        n: u64,
        loc: SourceLocation,
        inverse: bool,
    ) -> Result<IntValue<'ctx>> {
        // inverse=true yields 1 on equality (boolean ==); inverse=false
        // keeps the C convention of 0 on equality.
        let eq_val = if inverse { 1 } else { 0 };
        let ne_val = if inverse { 0 } else { 1 };

        let result = self.create_alloca(self.i64_t().into(), "strcmp.result")?;
        self.builder
            .build_store(result, self.const_i64(eq_val))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let ne_block = self.append_block("strcmp.false")?;
        let done_block = self.append_block("strcmp.done")?;

        let lit_bytes = literal.map(|l| l.as_bytes().to_vec());
        for i in 0..n {
            let left_byte = self.compare_operand_byte(left, i, left_as, loc)?;
            let right_byte = match (&lit_bytes, right) {
                (Some(bytes), _) => {
                    let b = bytes.get(i as usize).copied().unwrap_or(0);
                    self.i8_t().const_int(b as u64, false)
                }
                (None, Some((rhs, rhs_as))) => self.compare_operand_byte(rhs, i, rhs_as, loc)?,
                (None, None) => {
                    return Err(CodeGenError::Internal(
                        "compare needs a literal or a second operand".to_string(),
                    ))
                }
            };

            let differ = self
                .builder
                .build_int_compare(IntPredicate::NE, left_byte, right_byte, "strcmp.cmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let continue_block = self.append_block("strcmp.loop")?;
            self.builder
                .build_conditional_branch(differ, ne_block, continue_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder.position_at_end(continue_block);

            // Both bytes equal here; a terminator means the strings matched.
            let terminated = self
                .builder
                .build_int_compare(
                    IntPredicate::EQ,
                    left_byte,
                    self.i8_t().const_zero(),
                    "strcmp.nul",
                )
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let next_block = self.append_block("strcmp.next")?;
            self.builder
                .build_conditional_branch(terminated, done_block, next_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder.position_at_end(next_block);
        }
        self.builder
            .build_unconditional_branch(done_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(ne_block);
        self.builder
            .build_store(result, self.const_i64(ne_val))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(done_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(done_block);
        let value = self
            .builder
            .build_load(self.i64_t(), result, "strcmp.value")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(result)?;
        Ok(value)
    }
}
