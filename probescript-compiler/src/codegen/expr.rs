//! Expression lowering.
//!
//! Every expression produces a [`Scoped`] value: integers are carried as
//! 64-bit scalars with their signedness applied at promotion points, and
//! stack-resident values (strings, buffers, tuples, symbol tokens) are
//! carried as pointers whose lifetime the consumer ends or takes over.

use super::{CodeGen, Scoped};
use crate::ast::{BinaryOp, ExprKind, Expression, ProbeKind, SourceLocation, UnaryOp};
use crate::types::SizedType;
use crate::{CodeGenError, Result};
use inkwell::values::{BasicValueEnum, IntValue};
use inkwell::IntPredicate;
use tracing::debug;

fn builtin_arg_num(ident: &str, prefix: &str) -> Option<usize> {
    let rest = ident.strip_prefix(prefix)?;
    if rest.len() == 1 && rest.chars().all(|c| c.is_ascii_digit()) {
        rest.parse().ok()
    } else {
        None
    }
}

fn parse_numeric(s: &str) -> Option<i64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    pub(crate) fn compile_expr(&mut self, expr: &Expression) -> Result<Scoped<'ctx>> {
        match &expr.kind {
            ExprKind::Integer(n) => Ok(Scoped::rvalue(self.i64_t().const_int(*n as u64, true))),
            ExprKind::Str(s) => self.compile_string_literal(s, &expr.ty),
            ExprKind::PositionalParameter { n, is_in_str } => {
                self.compile_positional_parameter(*n, *is_in_str)
            }
            ExprKind::PositionalCount => {
                Ok(Scoped::rvalue(self.const_i64(self.runtime.num_params() as u64)))
            }
            ExprKind::Identifier(ident) => match self.runtime.enums.get(ident) {
                Some(v) => Ok(Scoped::rvalue(self.const_i64(*v))),
                None => Err(CodeGenError::UnknownIdentifier {
                    ident: ident.clone(),
                    loc: expr.loc,
                }),
            },
            ExprKind::Builtin(ident) => self.compile_builtin(ident, expr),
            ExprKind::Call { .. } => self.compile_call(expr),
            ExprKind::Map(map) => self.compile_map_load(map),
            ExprKind::Variable(ident) => self.compile_variable(ident, &expr.ty, expr.loc),
            ExprKind::Unop {
                op,
                expr: operand,
                is_post_op,
            } => self.compile_unop(*op, operand, *is_post_op, expr),
            ExprKind::Binop { op, left, right } => self.compile_binop(*op, left, right),
            ExprKind::Ternary { cond, left, right } => {
                self.compile_ternary(cond, left, right, &expr.ty)
            }
            ExprKind::FieldAccess {
                expr: record,
                field,
                index,
            } => self.compile_field_access(record, field, *index, expr),
            ExprKind::ArrayAccess {
                expr: array,
                index,
            } => self.compile_array_access(array, index, expr),
            ExprKind::Cast(inner) => self.compile_cast(inner, &expr.ty),
            ExprKind::Tuple(elems) => self.compile_tuple(elems, &expr.ty),
        }
    }

    /// String literal in a stack slot sized by the semantic type, padded with
    /// zero bytes and NUL-terminated.
    fn compile_string_literal(&mut self, s: &str, ty: &SizedType) -> Result<Scoped<'ctx>> {
        let size = ty.size.max(1);
        let mut bytes = s.as_bytes().to_vec();
        bytes.truncate(size - 1);
        bytes.resize(size - 1, 0);
        let const_str = self.context.const_string(&bytes, true);

        let buf = self.create_alloca_bytes(size as u64, "str")?;
        self.builder
            .build_store(buf, const_str)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(Scoped::owned(buf))
    }

    fn compile_positional_parameter(&mut self, n: usize, is_in_str: bool) -> Result<Scoped<'ctx>> {
        let param = self.runtime.get_param(n, is_in_str);
        if let Some(value) = parse_numeric(&param) {
            return Ok(Scoped::rvalue(self.i64_t().const_int(value as u64, true)));
        }
        let size = param.len() + 1;
        let const_str = self.context.const_string(param.as_bytes(), true);
        let buf = self.create_alloca_bytes(size as u64, "str")?;
        self.create_memset(buf, 0, size as u64)?;
        self.builder
            .build_store(buf, const_str)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(Scoped::owned(buf))
    }

    fn compile_builtin(&mut self, ident: &str, expr: &Expression) -> Result<Scoped<'ctx>> {
        match ident {
            "nsecs" => Ok(Scoped::rvalue(self.create_get_ns()?)),
            "elapsed" => self.compile_elapsed(expr.loc),
            "kstack" | "ustack" => {
                let user = ident == "ustack";
                let stack_type = expr.ty.stack_type.unwrap_or_default();
                let stackid = self.create_get_stack_id(user, stack_type, expr.loc)?;
                let packed = if user {
                    // Kernel addresses are shared between processes; user
                    // stacks are not, so the id is packed with the pid to
                    // keep ASLR'd processes apart when aggregating.
                    let pid_tgid = self.create_get_pid_tgid()?;
                    let pid_high = self
                        .builder
                        .build_left_shift(pid_tgid, self.const_i64(32), "pid_high")
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                    self.builder
                        .build_or(stackid, pid_high, "ustack_id")
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?
                } else {
                    stackid
                };
                Ok(Scoped::rvalue(packed))
            }
            "pid" => {
                let pid_tgid = self.create_get_pid_tgid()?;
                let pid = self
                    .builder
                    .build_right_shift(pid_tgid, self.const_i64(32), false, "pid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(pid))
            }
            "tid" => {
                let pid_tgid = self.create_get_pid_tgid()?;
                let tid = self
                    .builder
                    .build_and(pid_tgid, self.const_i64(0xffff_ffff), "tid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(tid))
            }
            "uid" | "username" => {
                let uid_gid = self.create_get_uid_gid()?;
                let uid = self
                    .builder
                    .build_and(uid_gid, self.const_i64(0xffff_ffff), "uid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(uid))
            }
            "gid" => {
                let uid_gid = self.create_get_uid_gid()?;
                let gid = self
                    .builder
                    .build_right_shift(uid_gid, self.const_i64(32), false, "gid")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(gid))
            }
            "cgroup" => Ok(Scoped::rvalue(self.create_get_cgroup_id()?)),
            "cpu" => Ok(Scoped::rvalue(self.create_get_cpu_id()?)),
            "curtask" => Ok(Scoped::rvalue(self.create_get_current_task()?)),
            "rand" => Ok(Scoped::rvalue(self.create_get_random()?)),
            "comm" => {
                let buf = self.create_alloca_type(&expr.ty, "comm")?;
                // Zero first; older kernels do not pad the copy.
                self.create_memset(buf, 0, expr.ty.size as u64)?;
                self.create_get_current_comm(buf, expr.ty.size as u64, expr.loc)?;
                Ok(Scoped::owned(buf))
            }
            "retval" | "func" => self.compile_ctx_word_builtin(ident, expr),
            _ if builtin_arg_num(ident, "arg").is_some() => {
                self.compile_ctx_word_builtin(ident, expr)
            }
            _ if builtin_arg_num(ident, "sarg").is_some() => {
                let arg_num = builtin_arg_num(ident, "sarg").unwrap();
                self.compile_stack_arg(arg_num, expr)
            }
            "probe" => {
                let probefull = self.probefull.clone();
                let id = self.runtime.probe_ids.register(&probefull);
                Ok(Scoped::rvalue(self.const_i64(id)))
            }
            "args" | "ctx" => {
                let ctx = self.ctx()?;
                let as_int = self
                    .builder
                    .build_ptr_to_int(ctx, self.i64_t(), "ctx_int")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(as_int))
            }
            "cpid" => match self.runtime.child_pid {
                Some(pid) if pid >= 1 => Ok(Scoped::rvalue(self.const_i64(pid as u64))),
                _ => Err(CodeGenError::Internal(
                    "no valid child process pid".to_string(),
                )),
            },
            _ => Err(CodeGenError::UnknownBuiltin {
                ident: ident.to_string(),
                loc: expr.loc,
            }),
        }
    }

    /// nsecs minus the per-process start value stored at key 0.
    fn compile_elapsed(&mut self, loc: SourceLocation) -> Result<Scoped<'ctx>> {
        let desc = self
            .runtime
            .maps
            .special(crate::runtime::SpecialMap::Elapsed)
            .cloned()
            .ok_or_else(|| CodeGenError::MapNotFound("elapsed".to_string()))?;
        let key = self.create_alloca(self.i64_t().into(), "elapsed_key")?;
        self.builder
            .build_store(key, self.const_i64(0))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let start = self.create_map_lookup(&desc, key, loc)?;
        let start_val = start.int_value()?;
        self.release(start)?;
        let now = self.create_get_ns()?;
        let elapsed = self
            .builder
            .build_int_sub(now, start_val, "elapsed")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.create_lifetime_end(key)?;
        Ok(Scoped::rvalue(elapsed))
    }

    /// argN / retval / func: a 64-bit volatile word read from the probe
    /// context at an architecture-specific offset. USDT and kernel-function
    /// providers use their own argument protocols.
    fn compile_ctx_word_builtin(&mut self, ident: &str, expr: &Expression) -> Result<Scoped<'ctx>> {
        if expr.ty.is_kfarg {
            let value = self.create_kfunc_arg(&expr.ty, ident)?;
            return Ok(Scoped::rvalue(value));
        }

        let offset = if ident == "retval" {
            probescript_platform::ret_offset()
        } else if ident == "func" {
            probescript_platform::pc_offset()
        } else {
            let arg_num = builtin_arg_num(ident, "arg")
                .ok_or_else(|| CodeGenError::Internal(format!("bad argument builtin {ident}")))?;
            if self.attach_point()?.kind() == ProbeKind::Usdt {
                let value = self.create_usdt_arg_read(arg_num, expr.loc)?;
                return Ok(Scoped::rvalue(value));
            }
            probescript_platform::arg_offset(arg_num).ok_or_else(|| {
                CodeGenError::Internal(format!("no argument register for {ident}"))
            })?
        };

        let value = self.create_ctx_load(offset as u64, ident)?;
        if expr.ty.is_usym() {
            return self.create_usym(value);
        }
        Ok(Scoped::rvalue(value))
    }

    /// sargN: bounded read of the N-th stack-passed argument.
    fn compile_stack_arg(&mut self, arg_num: usize, expr: &Expression) -> Result<Scoped<'ctx>> {
        let sp = self.create_ctx_load(probescript_platform::sp_offset() as u64, "reg_sp")?;
        let word_offset = (arg_num + probescript_platform::arg_stack_offset()) * 8;
        let src = self
            .builder
            .build_int_add(sp, self.const_i64(word_offset as u64), "sarg_addr")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let dst = self.create_alloca(self.i64_t().into(), "sarg")?;
        let len = self.const_i64(8);
        self.create_probe_read(dst, len, src, expr.ty.addr_space, expr.loc)?;
        let value = self
            .builder
            .build_load(self.i64_t(), dst, "sarg_val")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(dst)?;
        Ok(Scoped::rvalue(value))
    }

    fn compile_variable(
        &mut self,
        ident: &str,
        ty: &SizedType,
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let slot = *self
            .variables
            .get(ident)
            .ok_or_else(|| CodeGenError::UnknownIdentifier {
                ident: ident.to_string(),
                loc,
            })?;
        if ty.needs_memcpy() {
            return Ok(Scoped::borrowed(slot));
        }
        let llvm_ty = self.llvm_type(ty);
        let value = self
            .builder
            .build_load(llvm_ty, slot, ident)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        if let BasicValueEnum::IntValue(v) = value {
            let widened = self.promote_to_i64(v, ty.signed)?;
            return Ok(Scoped::rvalue(widened));
        }
        Ok(Scoped::rvalue(value))
    }

    fn compile_unop(
        &mut self,
        op: UnaryOp,
        operand: &Expression,
        is_post_op: bool,
        expr: &Expression,
    ) -> Result<Scoped<'ctx>> {
        match op {
            UnaryOp::LogicalNot => {
                let scoped = self.compile_expr(operand)?;
                let v = scoped.int_value()?;
                self.release(scoped)?;
                let zero = v.get_type().const_zero();
                let is_zero = self
                    .builder
                    .build_int_compare(IntPredicate::EQ, v, zero, "lnot")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                // Unsigned extension: !0 must become 1, not -1.
                let widened = self.create_int_cast(is_zero, v.get_type(), false)?;
                Ok(Scoped::rvalue(widened))
            }
            UnaryOp::BitwiseNot => {
                let scoped = self.compile_expr(operand)?;
                let v = scoped.int_value()?;
                self.release(scoped)?;
                let r = self
                    .builder
                    .build_not(v, "bnot")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(r))
            }
            UnaryOp::Negate => {
                let scoped = self.compile_expr(operand)?;
                let v = scoped.int_value()?;
                self.release(scoped)?;
                let r = self
                    .builder
                    .build_int_neg(v, "neg")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(r))
            }
            UnaryOp::Dereference => self.compile_dereference(operand, expr),
            UnaryOp::Increment | UnaryOp::Decrement => {
                self.compile_step_op(op == UnaryOp::Increment, operand, is_post_op)
            }
        }
    }

    /// Bounded probe read of the pointee into a temporary, reloaded as a
    /// 64-bit value.
    fn compile_dereference(
        &mut self,
        operand: &Expression,
        expr: &Expression,
    ) -> Result<Scoped<'ctx>> {
        let size = match operand.ty.pointee_type() {
            Some(pointee) => pointee.size,
            None => operand.ty.size,
        };
        let size = size.clamp(1, 8);
        let scoped = self.compile_expr(operand)?;
        let addr = scoped.int_value()?;
        self.release(scoped)?;

        let dst = self.create_alloca(self.i64_t().into(), "deref")?;
        self.create_memset(dst, 0, 8)?;
        let len = self.const_i64(size as u64);
        self.create_probe_read(dst, len, addr, operand.ty.addr_space, expr.loc)?;
        let int_ty = self.context.custom_width_int_type((size * 8) as u32);
        let raw = self
            .builder
            .build_load(int_ty, dst, "deref_val")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        let widened = self.promote_to_i64(raw, expr.ty.signed)?;
        self.create_lifetime_end(dst)?;
        Ok(Scoped::rvalue(widened))
    }

    /// ++ and -- against a map element or scalar variable; yields the old
    /// value for post-ops and the new value for pre-ops.
    fn compile_step_op(
        &mut self,
        increment: bool,
        operand: &Expression,
        is_post_op: bool,
    ) -> Result<Scoped<'ctx>> {
        match &operand.kind {
            ExprKind::Map(map) => {
                let desc = self.map_descriptor(&map.ident)?;
                let key = self.get_map_key(map)?;
                let old_scoped = self.create_map_lookup(&desc, key, map.loc)?;
                let old = old_scoped.int_value()?;
                self.release(old_scoped)?;
                let one = self.const_i64(1);
                let new = if increment {
                    self.builder.build_int_add(old, one, "inc")
                } else {
                    self.builder.build_int_sub(old, one, "dec")
                }
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let newval = self.create_alloca(self.i64_t().into(), &format!("{}_newval", map.ident))?;
                self.builder
                    .build_store(newval, new)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                self.create_map_update(&desc, key, newval, map.loc)?;
                self.create_lifetime_end(key)?;
                self.create_lifetime_end(newval)?;
                Ok(Scoped::rvalue(if is_post_op { old } else { new }))
            }
            ExprKind::Variable(ident) => {
                let slot = *self.variables.get(ident).ok_or_else(|| {
                    CodeGenError::UnknownIdentifier {
                        ident: ident.clone(),
                        loc: operand.loc,
                    }
                })?;
                let llvm_ty = self.llvm_type(&operand.ty);
                let old = self
                    .builder
                    .build_load(llvm_ty, slot, ident)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                let old = self.promote_to_i64(old, operand.ty.signed)?;
                let one = self.const_i64(1);
                let new = if increment {
                    self.builder.build_int_add(old, one, "inc")
                } else {
                    self.builder.build_int_sub(old, one, "dec")
                }
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let narrowed =
                    self.create_int_cast(new, llvm_ty.into_int_type(), operand.ty.signed)?;
                self.builder
                    .build_store(slot, narrowed)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                Ok(Scoped::rvalue(if is_post_op { old } else { new }))
            }
            _ => Err(CodeGenError::Internal(
                "step operator needs a map element or variable".to_string(),
            )),
        }
    }

    fn compile_binop(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
    ) -> Result<Scoped<'ctx>> {
        // && and || are lowered first so short-circuiting works.
        if op == BinaryOp::LogicalAnd {
            return self.compile_logical_and(left, right);
        }
        if op == BinaryOp::LogicalOr {
            return self.compile_logical_or(left, right);
        }

        if left.ty.is_string() {
            return self.compile_string_compare(op, left, right);
        }
        if left.ty.is_buffer() {
            return self.compile_buffer_compare(op, left, right);
        }

        let left_scoped = self.compile_expr(left)?;
        let lhs = left_scoped.int_value()?;
        self.release(left_scoped)?;
        let right_scoped = self.compile_expr(right)?;
        let rhs = right_scoped.int_value()?;
        self.release(right_scoped)?;

        let lsign = left.ty.signed;
        let rsign = right.ty.signed;
        let do_signed = lsign && rsign;
        let lhs = self.promote_to_i64(lhs, lsign)?;
        let rhs = self.promote_to_i64(rhs, rsign)?;

        let b = &self.builder;
        let result: IntValue = match op {
            BinaryOp::Equal => b.build_int_compare(IntPredicate::EQ, lhs, rhs, "eq"),
            BinaryOp::NotEqual => b.build_int_compare(IntPredicate::NE, lhs, rhs, "ne"),
            BinaryOp::LessEqual => {
                let p = if do_signed {
                    IntPredicate::SLE
                } else {
                    IntPredicate::ULE
                };
                b.build_int_compare(p, lhs, rhs, "le")
            }
            BinaryOp::GreaterEqual => {
                let p = if do_signed {
                    IntPredicate::SGE
                } else {
                    IntPredicate::UGE
                };
                b.build_int_compare(p, lhs, rhs, "ge")
            }
            BinaryOp::LessThan => {
                let p = if do_signed {
                    IntPredicate::SLT
                } else {
                    IntPredicate::ULT
                };
                b.build_int_compare(p, lhs, rhs, "lt")
            }
            BinaryOp::GreaterThan => {
                let p = if do_signed {
                    IntPredicate::SGT
                } else {
                    IntPredicate::UGT
                };
                b.build_int_compare(p, lhs, rhs, "gt")
            }
            BinaryOp::ShiftLeft => b.build_left_shift(lhs, rhs, "shl"),
            BinaryOp::ShiftRight => b.build_right_shift(lhs, rhs, false, "shr"),
            BinaryOp::Add => b.build_int_add(lhs, rhs, "add"),
            BinaryOp::Subtract => b.build_int_sub(lhs, rhs, "sub"),
            BinaryOp::Multiply => b.build_int_mul(lhs, rhs, "mul"),
            BinaryOp::Divide => b.build_int_unsigned_div(lhs, rhs, "div"),
            // The instruction set has no signed division; modulo is always
            // unsigned, as warned during analysis.
            BinaryOp::Modulo => b.build_int_unsigned_rem(lhs, rhs, "rem"),
            BinaryOp::BitAnd => b.build_and(lhs, rhs, "band"),
            BinaryOp::BitOr => b.build_or(lhs, rhs, "bor"),
            BinaryOp::BitXor => b.build_xor(lhs, rhs, "bxor"),
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => unreachable!("handled above"),
        }
        .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        // Unsigned extension: a signed extension of i1 would turn
        // comparisons into -1.
        let widened = self.create_int_cast(result, self.i64_t(), false)?;
        Ok(Scoped::rvalue(widened))
    }

    fn string_compare_inverse(op: BinaryOp, loc: SourceLocation) -> Result<bool> {
        match op {
            // Bounded compares follow the C convention of 0 on match, so
            // equality needs the result flipped.
            BinaryOp::Equal => Ok(true),
            BinaryOp::NotEqual => Ok(false),
            _ => Err(CodeGenError::Internal(format!(
                "operator not defined for strings at {loc}"
            ))),
        }
    }

    fn compile_string_compare(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
    ) -> Result<Scoped<'ctx>> {
        let inverse = Self::string_compare_inverse(op, left.loc)?;
        let left_as = left.ty.addr_space;
        let right_as = right.ty.addr_space;

        // A literal operand is compared directly against its bytes instead
        // of being materialized on the stack.
        if let Some(lit) = right.string_literal() {
            let lit = lit.to_string();
            let scoped = self.compile_expr(left)?;
            let value = scoped.expect_value()?;
            let result =
                self.create_strcmp_literal(value, left_as, &lit, None, left.loc, inverse)?;
            self.release(scoped)?;
            return Ok(Scoped::rvalue(result));
        }
        if let Some(lit) = left.string_literal() {
            let lit = lit.to_string();
            let scoped = self.compile_expr(right)?;
            let value = scoped.expect_value()?;
            let result =
                self.create_strcmp_literal(value, right_as, &lit, None, left.loc, inverse)?;
            self.release(scoped)?;
            return Ok(Scoped::rvalue(result));
        }

        let right_scoped = self.compile_expr(right)?;
        let right_value = right_scoped.expect_value()?;
        let left_scoped = self.compile_expr(left)?;
        let left_value = left_scoped.expect_value()?;
        let len = left.ty.size.min(right.ty.size) as u64;
        let result = self.create_strncmp(
            left_value,
            left_as,
            right_value,
            right_as,
            len + 1,
            left.loc,
            inverse,
        )?;
        self.release(left_scoped)?;
        self.release(right_scoped)?;
        Ok(Scoped::rvalue(result))
    }

    fn compile_buffer_compare(
        &mut self,
        op: BinaryOp,
        left: &Expression,
        right: &Expression,
    ) -> Result<Scoped<'ctx>> {
        let inverse = Self::string_compare_inverse(op, left.loc)?;
        let right_scoped = self.compile_expr(right)?;
        let right_value = right_scoped.expect_value()?;
        let left_scoped = self.compile_expr(left)?;
        let left_value = left_scoped.expect_value()?;
        let len = left.ty.size.min(right.ty.size) as u64;
        let result = self.create_strncmp(
            left_value,
            left.ty.addr_space,
            right_value,
            right.ty.addr_space,
            len,
            left.loc,
            inverse,
        )?;
        self.release(left_scoped)?;
        self.release(right_scoped)?;
        Ok(Scoped::rvalue(result))
    }

    /// `a && b` with an explicit CFG; `b` is never evaluated when `a` is
    /// zero.
    fn compile_logical_and(&mut self, left: &Expression, right: &Expression) -> Result<Scoped<'ctx>> {
        let result = self.create_alloca(self.i64_t().into(), "and_result")?;
        let lhs_true_block = self.append_block("and_lhs_true")?;
        let true_block = self.append_block("and_true")?;
        let false_block = self.append_block("and_false")?;
        let merge_block = self.append_block("and_merge")?;

        let left_scoped = self.compile_expr(left)?;
        let lhs = left_scoped.int_value()?;
        self.release(left_scoped)?;
        let lhs_nonzero = self
            .builder
            .build_int_compare(IntPredicate::NE, lhs, lhs.get_type().const_zero(), "lhs_true")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(lhs_nonzero, lhs_true_block, false_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(lhs_true_block);
        let right_scoped = self.compile_expr(right)?;
        let rhs = right_scoped.int_value()?;
        self.release(right_scoped)?;
        let rhs_nonzero = self
            .builder
            .build_int_compare(IntPredicate::NE, rhs, rhs.get_type().const_zero(), "rhs_true")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(rhs_nonzero, true_block, false_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(true_block);
        self.builder
            .build_store(result, self.const_i64(1))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(false_block);
        self.builder
            .build_store(result, self.const_i64(0))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(merge_block);
        let value = self
            .builder
            .build_load(self.i64_t(), result, "and_value")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(result)?;
        Ok(Scoped::rvalue(value))
    }

    fn compile_logical_or(&mut self, left: &Expression, right: &Expression) -> Result<Scoped<'ctx>> {
        let result = self.create_alloca(self.i64_t().into(), "or_result")?;
        let lhs_false_block = self.append_block("or_lhs_false")?;
        let false_block = self.append_block("or_false")?;
        let true_block = self.append_block("or_true")?;
        let merge_block = self.append_block("or_merge")?;

        let left_scoped = self.compile_expr(left)?;
        let lhs = left_scoped.int_value()?;
        self.release(left_scoped)?;
        let lhs_nonzero = self
            .builder
            .build_int_compare(IntPredicate::NE, lhs, lhs.get_type().const_zero(), "lhs_true")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(lhs_nonzero, true_block, lhs_false_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(lhs_false_block);
        let right_scoped = self.compile_expr(right)?;
        let rhs = right_scoped.int_value()?;
        self.release(right_scoped)?;
        let rhs_nonzero = self
            .builder
            .build_int_compare(IntPredicate::NE, rhs, rhs.get_type().const_zero(), "rhs_true")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(rhs_nonzero, true_block, false_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(false_block);
        self.builder
            .build_store(result, self.const_i64(0))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(true_block);
        self.builder
            .build_store(result, self.const_i64(1))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(merge_block);
        let value = self
            .builder
            .build_load(self.i64_t(), result, "or_value")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_lifetime_end(result)?;
        Ok(Scoped::rvalue(value))
    }

    fn compile_ternary(
        &mut self,
        cond: &Expression,
        left: &Expression,
        right: &Expression,
        ty: &SizedType,
    ) -> Result<Scoped<'ctx>> {
        let left_block = self.append_block("ternary_left")?;
        let right_block = self.append_block("ternary_right")?;
        let done_block = self.append_block("ternary_done")?;

        let result = if ty.is_integer() {
            Some(self.create_alloca(self.i64_t().into(), "ternary_result")?)
        } else {
            None
        };
        let buf = if ty.is_stack_resident() {
            Some(self.create_alloca_type(ty, "ternary_buf")?)
        } else {
            None
        };

        let cond_scoped = self.compile_expr(cond)?;
        let cond_value = cond_scoped.int_value()?;
        self.release(cond_scoped)?;
        let nonzero = self
            .builder
            .build_int_compare(
                IntPredicate::NE,
                cond_value,
                cond_value.get_type().const_zero(),
                "true_cond",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(nonzero, left_block, right_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        for (block, arm) in [(left_block, left), (right_block, right)] {
            self.builder.position_at_end(block);
            let scoped = self.compile_expr(arm)?;
            if let Some(result) = result {
                let v = scoped.int_value()?;
                let widened = self.promote_to_i64(v, ty.signed)?;
                self.builder
                    .build_store(result, widened)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            } else if let Some(buf) = buf {
                let src = scoped.ptr_value()?;
                self.create_memcpy(buf, src, ty.size as u64)?;
            }
            self.release(scoped)?;
            self.builder
                .build_unconditional_branch(done_block)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }

        self.builder.position_at_end(done_block);
        if let Some(result) = result {
            let value = self
                .builder
                .build_load(self.i64_t(), result, "ternary_value")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            self.create_lifetime_end(result)?;
            return Ok(Scoped::rvalue(value));
        }
        if let Some(buf) = buf {
            return Ok(Scoped::owned(buf));
        }
        Ok(Scoped::none())
    }

    fn compile_field_access(
        &mut self,
        record_expr: &Expression,
        field_name: &str,
        tuple_index: usize,
        expr: &Expression,
    ) -> Result<Scoped<'ctx>> {
        let inner_ty = &record_expr.ty;

        if inner_ty.is_kfarg {
            let value = self.create_kfunc_arg(&expr.ty, field_name)?;
            return Ok(Scoped::rvalue(value));
        }

        if inner_ty.is_tuple() {
            return self.compile_tuple_access(record_expr, tuple_index);
        }

        let record_name = if inner_ty.is_tparg {
            self.tracepoint_record.clone()
        } else {
            inner_ty.record_name.clone().ok_or_else(|| {
                CodeGenError::Internal(format!("field access on unnamed record at {}", expr.loc))
            })?
        };
        let record = self
            .runtime
            .structs
            .get(&record_name)
            .cloned()
            .ok_or_else(|| CodeGenError::UnknownRecord(record_name.clone()))?;
        let field = record
            .field(field_name)
            .cloned()
            .ok_or_else(|| {
                CodeGenError::Internal(format!("no field {field_name} in {record_name}"))
            })?;

        debug!(record = %record_name, field = %field_name, "lowering field access");

        let mut scoped = self.compile_expr(record_expr)?;

        if inner_ty.is_internal {
            // Already in BPF memory; read at the field offset directly.
            let base = scoped.ptr_value()?;
            let src = unsafe {
                self.builder
                    .build_gep(
                        self.i8_t(),
                        base,
                        &[self.const_i64(field.offset as u64)],
                        "field_src",
                    )
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
            };
            if field.ty.is_record() {
                let dst = self.create_alloca_type(
                    &field.ty,
                    &format!("internal_{record_name}.{field_name}"),
                )?;
                self.create_memcpy(dst, src, field.ty.size as u64)?;
                self.release(scoped)?;
                return Ok(Scoped::owned(dst));
            }
            if field.ty.is_string() || field.ty.is_buffer() {
                // Borrow inside the parent buffer; extend its lifetime.
                let slot = scoped.disarm();
                return Ok(Scoped {
                    value: Some(src.into()),
                    slot,
                });
            }
            let llvm_ty = self.llvm_type(&field.ty);
            let value = self
                .builder
                .build_load(llvm_ty, src, field_name)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let result = if let BasicValueEnum::IntValue(v) = value {
                Scoped::rvalue(self.promote_to_i64(v, field.ty.signed)?)
            } else {
                Scoped::rvalue(value)
            };
            self.release(scoped)?;
            return Ok(result);
        }

        // External pointer (or raw context address): field address is plain
        // arithmetic on the 64-bit base.
        let base = scoped.int_value()?;
        let src = self
            .builder
            .build_int_add(base, self.const_i64(field.offset as u64), "field_addr")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if field.ty.is_record() || field.ty.is_array() {
            // Deferred pointer: the enclosing access chains on it without an
            // intermediate copy.
            let slot = scoped.disarm();
            return Ok(Scoped {
                value: Some(src.into()),
                slot,
            });
        }

        if field.ty.is_string() || field.ty.is_buffer() {
            let dst =
                self.create_alloca_type(&field.ty, &format!("{record_name}.{field_name}"))?;
            if inner_ty.is_ctx_access {
                self.create_ctx_copy(dst, src, field.ty.size as u64)?;
            } else {
                let len = self.const_i64(field.ty.size as u64);
                self.create_probe_read(dst, len, src, inner_ty.addr_space, expr.loc)?;
            }
            self.release(scoped)?;
            return Ok(Scoped::owned(dst));
        }

        if let (true, Some(bitfield)) = (field.ty.is_integer(), &field.bitfield) {
            let raw = if inner_ty.is_ctx_access {
                let ptr = self
                    .builder
                    .build_int_to_ptr(src, self.ptr_t(), "bitfield_ptr")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
                let int_ty = self.context.custom_width_int_type((field.ty.size * 8) as u32);
                self.create_volatile_load(int_ty.into(), ptr, "bitfield_raw")?
                    .into_int_value()
            } else {
                let dst = self
                    .create_alloca_type(&field.ty, &format!("{record_name}.{field_name}"))?;
                // Zeroed so the verifier never sees an uninitialized read.
                self.create_memset(dst, 0, field.ty.size as u64)?;
                let len = self.const_i64(bitfield.read_bytes as u64);
                self.create_probe_read(dst, len, src, inner_ty.addr_space, expr.loc)?;
                let int_ty = self.context.custom_width_int_type((field.ty.size * 8) as u32);
                let raw = self
                    .builder
                    .build_load(int_ty, dst, "bitfield_raw")
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?
                    .into_int_value();
                self.create_lifetime_end(dst)?;
                raw
            };
            let raw = self.promote_to_i64(raw, false)?;
            let shifted = self
                .builder
                .build_right_shift(
                    raw,
                    self.const_i64(bitfield.access_rshift as u64),
                    false,
                    "bitfield_shifted",
                )
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let masked = self
                .builder
                .build_and(shifted, self.const_i64(bitfield.mask), "bitfield_masked")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.release(scoped)?;
            return Ok(Scoped::rvalue(masked));
        }

        if inner_ty.is_ctx_access && (field.ty.is_integer() || field.ty.is_pointer()) {
            let ptr = self
                .builder
                .build_int_to_ptr(src, self.ptr_t(), "ctx_field_ptr")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let bits = if field.ty.size == 0 { 64 } else { (field.ty.size * 8) as u32 };
            let int_ty = self.context.custom_width_int_type(bits);
            let raw = self
                .create_volatile_load(int_ty.into(), ptr, field_name)?
                .into_int_value();
            let widened = self.promote_to_i64(raw, field.ty.signed)?;
            self.release(scoped)?;
            return Ok(Scoped::rvalue(widened));
        }

        let dst = self.create_alloca_type(&field.ty, &format!("{record_name}.{field_name}"))?;
        let len = self.const_i64(field.ty.size as u64);
        self.create_probe_read(dst, len, src, inner_ty.addr_space, expr.loc)?;
        let bits = if field.ty.size == 0 { 64 } else { (field.ty.size * 8) as u32 };
        let int_ty = self.context.custom_width_int_type(bits);
        let raw = self
            .builder
            .build_load(int_ty, dst, field_name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        let widened = self.promote_to_i64(raw, field.ty.signed)?;
        self.create_lifetime_end(dst)?;
        self.release(scoped)?;
        Ok(Scoped::rvalue(widened))
    }

    /// Tuples index by position; stack-resident elements are returned as
    /// borrowed pointers into the tuple buffer.
    fn compile_tuple_access(
        &mut self,
        tuple_expr: &Expression,
        index: usize,
    ) -> Result<Scoped<'ctx>> {
        let elem_ty = tuple_expr
            .ty
            .tuple_elems
            .get(index)
            .cloned()
            .ok_or_else(|| {
                CodeGenError::Internal(format!("tuple index {index} out of range"))
            })?;
        let mut scoped = self.compile_expr(tuple_expr)?;
        let base = scoped.ptr_value()?;
        let struct_ty = match self.llvm_type(&tuple_expr.ty) {
            inkwell::types::BasicTypeEnum::StructType(t) => t,
            _ => {
                return Err(CodeGenError::Internal(
                    "tuple value is not struct shaped".to_string(),
                ))
            }
        };
        let src = self.struct_field_ptr(struct_ty, base, index as u32, "tuple_elem")?;

        if elem_ty.is_stack_resident() {
            let slot = scoped.disarm();
            return Ok(Scoped {
                value: Some(src.into()),
                slot,
            });
        }
        let llvm_ty = self.llvm_type(&elem_ty);
        let value = self
            .builder
            .build_load(llvm_ty, src, "tuple_val")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let result = if let BasicValueEnum::IntValue(v) = value {
            Scoped::rvalue(self.promote_to_i64(v, elem_ty.signed)?)
        } else {
            Scoped::rvalue(value)
        };
        self.release(scoped)?;
        Ok(result)
    }

    fn compile_array_access(
        &mut self,
        array: &Expression,
        index: &Expression,
        expr: &Expression,
    ) -> Result<Scoped<'ctx>> {
        let elem_ty = array
            .ty
            .element_type()
            .cloned()
            .ok_or_else(|| CodeGenError::Internal("array access on non-array".to_string()))?;
        let element_size = elem_ty.size.max(1);

        let array_scoped = self.compile_expr(array)?;
        let base = self.value_as_address(array_scoped.expect_value()?)?;

        let index_scoped = self.compile_expr(index)?;
        let idx = index_scoped.int_value()?;
        self.release(index_scoped)?;
        let idx = self.promote_to_i64(idx, index.ty.signed)?;
        let offset = self
            .builder
            .build_int_mul(idx, self.const_i64(element_size as u64), "elem_offset")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let src = self
            .builder
            .build_int_add(base, offset, "elem_addr")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if elem_ty.is_record() {
            // Chain without dereferencing; field access follows.
            let mut array_scoped = array_scoped;
            let slot = array_scoped.disarm();
            return Ok(Scoped {
                value: Some(src.into()),
                slot,
            });
        }

        let result = if array.ty.is_ctx_access {
            let ptr = self
                .builder
                .build_int_to_ptr(src, self.ptr_t(), "elem_ptr")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let int_ty = self.context.custom_width_int_type((element_size * 8) as u32);
            let raw = self
                .create_volatile_load(int_ty.into(), ptr, "elem")?
                .into_int_value();
            self.promote_to_i64(raw, elem_ty.signed)?
        } else {
            let dst = self.create_alloca(self.i64_t().into(), "array_access")?;
            self.create_memset(dst, 0, 8)?;
            let len = self.const_i64(element_size as u64);
            self.create_probe_read(dst, len, src, array.ty.addr_space, expr.loc)?;
            let int_ty = self.context.custom_width_int_type((element_size * 8) as u32);
            let raw = self
                .builder
                .build_load(int_ty, dst, "elem")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            self.create_lifetime_end(dst)?;
            self.promote_to_i64(raw, elem_ty.signed)?
        };
        self.release(array_scoped)?;
        Ok(Scoped::rvalue(result))
    }

    pub(crate) fn value_as_address(&mut self, value: BasicValueEnum<'ctx>) -> Result<IntValue<'ctx>> {
        match value {
            BasicValueEnum::IntValue(v) => Ok(v),
            BasicValueEnum::PointerValue(p) => self
                .builder
                .build_ptr_to_int(p, self.i64_t(), "as_addr")
                .map_err(|e| CodeGenError::Builder(e.to_string())),
            other => Err(CodeGenError::Internal(format!(
                "value {other:?} has no address"
            ))),
        }
    }

    fn compile_cast(&mut self, inner: &Expression, ty: &SizedType) -> Result<Scoped<'ctx>> {
        let scoped = self.compile_expr(inner)?;
        if !ty.is_integer() {
            return Ok(scoped);
        }
        let v = scoped.int_value()?;
        self.release(scoped)?;
        let bits = if ty.size == 0 { 64 } else { (ty.size * 8) as u32 };
        let int_ty = self.context.custom_width_int_type(bits);
        let cast = self.create_int_cast(v, int_ty, ty.signed)?;
        Ok(Scoped::rvalue(cast))
    }

    fn compile_tuple(&mut self, elems: &[Expression], ty: &SizedType) -> Result<Scoped<'ctx>> {
        let struct_ty = match self.llvm_type(ty) {
            inkwell::types::BasicTypeEnum::StructType(t) => t,
            _ => {
                return Err(CodeGenError::Internal(
                    "tuple type is not struct shaped".to_string(),
                ))
            }
        };
        let buf = self.create_alloca(struct_ty.into(), "tuple")?;
        for (i, elem) in elems.iter().enumerate() {
            let scoped = self.compile_expr(elem)?;
            let dst = self.struct_field_ptr(struct_ty, buf, i as u32, "tuple_field")?;
            if elem.ty.is_stack_resident() {
                let src = scoped.ptr_value()?;
                self.create_memcpy(dst, src, elem.ty.size as u64)?;
            } else {
                let v = scoped.int_value()?;
                let field_ty = struct_ty
                    .get_field_type_at_index(i as u32)
                    .ok_or_else(|| CodeGenError::Internal("tuple field out of range".to_string()))?;
                let narrowed = self.create_int_cast(v, field_ty.into_int_type(), elem.ty.signed)?;
                self.builder
                    .build_store(dst, narrowed)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            self.release(scoped)?;
        }
        Ok(Scoped::owned(buf))
    }
}
