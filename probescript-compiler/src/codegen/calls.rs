//! Call lowering: map aggregations, async output records, address
//! resolution and read utilities.

use super::{CodeGen, Scoped};
use crate::ast::{ExprKind, Expression, MapAccess, SourceLocation};
use crate::{CodeGenError, Result};
use inkwell::types::BasicTypeEnum;
use inkwell::values::{IntValue, PointerValue};
use inkwell::IntPredicate;
use probescript_protocol::AsyncAction;
use tracing::debug;

const AF_INET: u64 = 2;
const AF_INET6: u64 = 10;

/// Format-call classes share the lowering but use distinct id spaces and
/// tables.
#[derive(Clone, Copy)]
enum FormatClass {
    Printf,
    System,
    Cat,
}

impl FormatClass {
    fn action(self) -> AsyncAction {
        match self {
            FormatClass::Printf => AsyncAction::Printf,
            FormatClass::System => AsyncAction::System,
            FormatClass::Cat => AsyncAction::Cat,
        }
    }

    fn name(self) -> &'static str {
        match self {
            FormatClass::Printf => "printf",
            FormatClass::System => "system",
            FormatClass::Cat => "cat",
        }
    }
}

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    pub(crate) fn compile_call(&mut self, expr: &Expression) -> Result<Scoped<'ctx>> {
        let ExprKind::Call { func, args, map } = &expr.kind else {
            return Err(CodeGenError::Internal("not a call expression".to_string()));
        };
        debug!(func = %func, "lowering call");

        match func.as_str() {
            "count" => self.compile_count(Self::expect_map(func, map, expr.loc)?, expr.loc),
            "sum" => self.compile_sum(Self::expect_map(func, map, expr.loc)?, args, expr.loc),
            "min" => {
                self.compile_min_max(Self::expect_map(func, map, expr.loc)?, args, true, expr.loc)
            }
            "max" => {
                self.compile_min_max(Self::expect_map(func, map, expr.loc)?, args, false, expr.loc)
            }
            "avg" | "stats" => {
                self.compile_avg(Self::expect_map(func, map, expr.loc)?, args, expr.loc)
            }
            "hist" => self.compile_hist(Self::expect_map(func, map, expr.loc)?, args, expr.loc),
            "lhist" => self.compile_lhist(Self::expect_map(func, map, expr.loc)?, args, expr.loc),
            "delete" => self.compile_delete(args, expr.loc),
            "str" => self.compile_str(args, expr.loc),
            "buf" => self.compile_buf(args, expr.loc),
            "kaddr" => {
                let name = Self::expect_string_literal(func, args, 0)?;
                let addr = self
                    .runtime
                    .symbols
                    .resolve_kname(&name)
                    .ok_or_else(|| CodeGenError::SymbolResolution(name.clone()))?;
                Ok(Scoped::rvalue(self.const_i64(addr)))
            }
            "uaddr" => {
                let name = Self::expect_string_literal(func, args, 0)?;
                let target = self.attach_point()?.target.clone();
                let sym = self
                    .runtime
                    .symbols
                    .resolve_uname(&name, &target)
                    .filter(|s| s.address != 0)
                    .ok_or_else(|| CodeGenError::SymbolResolution(format!("{target}:{name}")))?;
                Ok(Scoped::rvalue(self.const_i64(sym.address)))
            }
            "cgroupid" => {
                let path = Self::expect_string_literal(func, args, 0)?;
                let id = self
                    .runtime
                    .symbols
                    .resolve_cgroupid(&path)
                    .ok_or_else(|| CodeGenError::SymbolResolution(path.clone()))?;
                Ok(Scoped::rvalue(self.const_i64(id)))
            }
            "reg" => {
                let name = Self::expect_string_literal(func, args, 0)?;
                let offset = probescript_platform::register_offset(&name).ok_or_else(|| {
                    CodeGenError::Internal(format!("no offset for register \"{name}\""))
                })?;
                let value = self.create_ctx_load(offset as u64, &format!("reg_{name}"))?;
                Ok(Scoped::rvalue(value))
            }
            "join" => self.compile_join(args, expr.loc),
            "ksym" | "kptr" | "uptr" => {
                // Transparent wrappers; the child value passes through.
                self.compile_expr(&args[0])
            }
            "usym" => {
                let scoped = self.compile_expr(&args[0])?;
                let addr = scoped.int_value()?;
                self.release(scoped)?;
                self.create_usym(addr)
            }
            "ntop" => self.compile_ntop(args, expr.loc),
            "printf" => self.compile_format_output(args, FormatClass::Printf, expr.loc),
            "system" => self.compile_format_output(args, FormatClass::System, expr.loc),
            "cat" => self.compile_format_output(args, FormatClass::Cat, expr.loc),
            "exit" => self.compile_exit(),
            "print" => self.compile_print(args, expr.loc),
            "clear" | "zero" => self.compile_map_reset(func, args),
            "time" => self.compile_time(),
            "strftime" => self.compile_strftime(args),
            "kstack" | "ustack" => {
                let user = func == "ustack";
                let stack_type = expr.ty.stack_type.unwrap_or_default();
                let stackid = self.create_get_stack_id(user, stack_type, expr.loc)?;
                let packed = if user {
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
            "signal" => self.compile_signal(args, expr.loc),
            "sizeof" => Ok(Scoped::rvalue(self.const_i64(args[0].ty.size as u64))),
            "strncmp" => self.compile_strncmp_call(args, expr.loc),
            "override" => {
                let scoped = self.compile_expr(&args[0])?;
                let v = scoped.int_value()?;
                self.release(scoped)?;
                let rc = self.promote_to_i64(v, args[0].ty.signed)?;
                self.create_override_return(rc)?;
                Ok(Scoped::none())
            }
            _ => Err(CodeGenError::UnknownCall {
                func: func.clone(),
                loc: expr.loc,
            }),
        }
    }

    fn expect_map<'a>(
        func: &str,
        map: &'a Option<MapAccess>,
        loc: SourceLocation,
    ) -> Result<&'a MapAccess> {
        map.as_ref().ok_or_else(|| {
            CodeGenError::Internal(format!("{func}() without a destination map at {loc}"))
        })
    }

    fn expect_string_literal(func: &str, args: &[Expression], index: usize) -> Result<String> {
        args.get(index)
            .and_then(|a| a.string_literal())
            .map(str::to_string)
            .ok_or_else(|| {
                CodeGenError::Internal(format!("{func}() argument {index} must be a literal"))
            })
    }

    /// Read-modify-write helper shared by the counting aggregations.
    fn map_increment(
        &mut self,
        map: &MapAccess,
        key: PointerValue<'ctx>,
        delta: IntValue<'ctx>,
        loc: SourceLocation,
    ) -> Result<()> {
        let desc = self.map_descriptor(&map.ident)?;
        let old_scoped = self.create_map_lookup(&desc, key, loc)?;
        let old = old_scoped.int_value()?;
        self.release(old_scoped)?;
        let new = self
            .builder
            .build_int_add(old, delta, "sum")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let newval = self.create_alloca(self.i64_t().into(), &format!("{}_val", map.ident))?;
        self.builder
            .build_store(newval, new)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.create_map_update(&desc, key, newval, loc)?;
        self.create_lifetime_end(key)?;
        self.create_lifetime_end(newval)
    }

    fn compile_count(&mut self, map: &MapAccess, loc: SourceLocation) -> Result<Scoped<'ctx>> {
        let key = self.get_map_key(map)?;
        let one = self.const_i64(1);
        self.map_increment(map, key, one, loc)?;
        Ok(Scoped::none())
    }

    fn compile_sum(
        &mut self,
        map: &MapAccess,
        args: &[Expression],
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let key = self.get_map_key(map)?;
        let scoped = self.compile_expr(&args[0])?;
        let v = scoped.int_value()?;
        self.release(scoped)?;
        let delta = self.promote_to_i64(v, args[0].ty.signed)?;
        self.map_increment(map, key, delta, loc)?;
        Ok(Scoped::none())
    }

    /// min() stores `0xffffffff - value` so an uninitialized (zero) slot
    /// always loses the signed-greater-or-equal race on first observation;
    /// readback undoes the encoding.
    fn compile_min_max(
        &mut self,
        map: &MapAccess,
        args: &[Expression],
        is_min: bool,
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let desc = self.map_descriptor(&map.ident)?;
        let key = self.get_map_key(map)?;
        let old_scoped = self.create_map_lookup(&desc, key, loc)?;
        let old = old_scoped.int_value()?;
        self.release(old_scoped)?;
        let newval = self.create_alloca(self.i64_t().into(), &format!("{}_val", map.ident))?;

        let scoped = self.compile_expr(&args[0])?;
        let v = scoped.int_value()?;
        self.release(scoped)?;
        let value = self.promote_to_i64(v, args[0].ty.signed)?;
        let candidate = if is_min {
            self.builder
                .build_int_sub(self.const_i64(0xffff_ffff), value, "inverted")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
        } else {
            value
        };

        let ge_block = self.append_block("min.ge")?;
        let lt_block = self.append_block("min.lt")?;
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::SGE, candidate, old, "min_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, ge_block, lt_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(ge_block);
        self.builder
            .build_store(newval, candidate)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.create_map_update(&desc, key, newval, loc)?;
        self.builder
            .build_unconditional_branch(lt_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(lt_block);
        self.create_lifetime_end(key)?;
        self.create_lifetime_end(newval)?;
        Ok(Scoped::none())
    }

    /// avg()/stats() store the count under bucket key 0 and the running
    /// total under bucket key 1; the division happens at print time.
    fn compile_avg(
        &mut self,
        map: &MapAccess,
        args: &[Expression],
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let count_bucket = self.const_i64(0);
        let count_key = self.get_hist_map_key(map, count_bucket)?;
        let one = self.const_i64(1);
        self.map_increment(map, count_key, one, loc)?;

        let total_bucket = self.const_i64(1);
        let total_key = self.get_hist_map_key(map, total_bucket)?;
        let scoped = self.compile_expr(&args[0])?;
        let v = scoped.int_value()?;
        self.release(scoped)?;
        let delta = self.promote_to_i64(v, args[0].ty.signed)?;
        self.map_increment(map, total_key, delta, loc)?;
        Ok(Scoped::none())
    }

    fn compile_hist(
        &mut self,
        map: &MapAccess,
        args: &[Expression],
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let log2 = self.ensure_log2_function()?;
        let scoped = self.compile_expr(&args[0])?;
        let v = scoped.int_value()?;
        self.release(scoped)?;
        let value = self.promote_to_i64(v, args[0].ty.signed)?;
        let bucket = self
            .builder
            .build_call(log2, &[value.into()], "log2")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| CodeGenError::Internal("log2 returned no value".to_string()))?
            .into_int_value();
        let key = self.get_hist_map_key(map, bucket)?;
        let one = self.const_i64(1);
        self.map_increment(map, key, one, loc)?;
        Ok(Scoped::none())
    }

    fn compile_lhist(
        &mut self,
        map: &MapAccess,
        args: &[Expression],
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let linear = self.ensure_linear_function()?;

        let mut values = Vec::with_capacity(4);
        for (i, arg) in args.iter().take(4).enumerate() {
            let scoped = self.compile_expr(arg)?;
            let v = scoped.int_value()?;
            self.release(scoped)?;
            // The value keeps its signedness; range parameters are unsigned.
            let signed = i == 0 && arg.ty.signed;
            values.push(self.promote_to_i64(v, signed)?);
        }
        let bucket = self
            .builder
            .build_call(
                linear,
                &[
                    values[0].into(),
                    values[1].into(),
                    values[2].into(),
                    values[3].into(),
                ],
                "linear",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| CodeGenError::Internal("linear returned no value".to_string()))?
            .into_int_value();
        let key = self.get_hist_map_key(map, bucket)?;
        let one = self.const_i64(1);
        self.map_increment(map, key, one, loc)?;
        Ok(Scoped::none())
    }

    fn compile_delete(&mut self, args: &[Expression], loc: SourceLocation) -> Result<Scoped<'ctx>> {
        let ExprKind::Map(map) = &args[0].kind else {
            return Err(CodeGenError::Internal(
                "delete() needs a map argument".to_string(),
            ));
        };
        let desc = self.map_descriptor(&map.ident)?;
        let key = self.get_map_key(map)?;
        self.create_map_delete(&desc, key, loc)?;
        self.create_lifetime_end(key)?;
        Ok(Scoped::none())
    }

    /// str(ptr[, n]): NUL-terminated bounded read into the global string
    /// buffer; n+1 is clamped to the configured maximum.
    fn compile_str(&mut self, args: &[Expression], loc: SourceLocation) -> Result<Scoped<'ctx>> {
        let max = self.runtime.limits.strlen;

        let strlen = self.create_alloca(self.i64_t().into(), "strlen")?;
        self.create_memset(strlen, 0, 8)?;
        if args.len() > 1 {
            let scoped = self.compile_expr(&args[1])?;
            let n = scoped.int_value()?;
            self.release(scoped)?;
            // One extra byte for the terminator written by the helper.
            let proposed = self
                .builder
                .build_int_add(n, self.const_i64(1), "proposed_strlen")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let max_val = self.const_i64(max);
            let fits = self
                .builder
                .build_int_compare(IntPredicate::ULE, proposed, max_val, "str.min.cmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let chosen = self
                .builder
                .build_select(fits, proposed, max_val, "str.min.select")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(strlen, chosen)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        } else {
            self.builder
                .build_store(strlen, self.const_i64(max))
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }

        let buf = self.create_alloca_bytes(max, "str")?;
        self.create_memset(buf, 0, max)?;
        let scoped = self.compile_expr(&args[0])?;
        let addr = self.value_as_address(scoped.expect_value()?)?;
        let len = self
            .builder
            .build_load(self.i64_t(), strlen, "strlen_val")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        self.create_probe_read_str(buf, len, addr, args[0].ty.addr_space, loc)?;
        self.release(scoped)?;
        self.create_lifetime_end(strlen)?;
        Ok(Scoped::owned(buf))
    }

    /// buf(ptr[, n]): length-prefixed byte record, bounded by the configured
    /// maximum.
    fn compile_buf(&mut self, args: &[Expression], loc: SourceLocation) -> Result<Scoped<'ctx>> {
        let max = self.runtime.limits.strlen;

        let (length, fixed_len): (IntValue<'ctx>, u64) = if args.len() > 1 {
            let fixed = args[1]
                .integer_literal()
                .map(|n| n as u64)
                .unwrap_or(max)
                .min(max);
            let scoped = self.compile_expr(&args[1])?;
            let proposed = scoped.int_value()?;
            self.release(scoped)?;
            let max_val = self.const_i64(max);
            let fits = self
                .builder
                .build_int_compare(IntPredicate::ULE, proposed, max_val, "length.cmp")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let chosen = self
                .builder
                .build_select(fits, proposed, max_val, "length.select")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            (chosen, fixed)
        } else {
            let elem_size = args[0]
                .ty
                .element_type()
                .map(|e| e.size)
                .unwrap_or(1)
                .max(1);
            let fixed = (args[0].ty.num_elems.max(1) * elem_size) as u64;
            (self.const_i64(fixed), fixed)
        };

        let buf_ty = {
            let fields: Vec<BasicTypeEnum> = vec![
                self.i8_t().into(),
                self.i8_t().array_type(fixed_len as u32).into(),
            ];
            self.named_struct(&format!("buffer_{fixed_len}_t"), &fields, false)
        };
        let buf = self.create_alloca(buf_ty.into(), "buffer")?;

        let len_field = self.struct_field_ptr(buf_ty, buf, 0, "buffer_len")?;
        let len_byte = self.create_int_cast(length, self.i8_t(), false)?;
        self.builder
            .build_store(len_field, len_byte)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let data_field = self.struct_field_ptr(buf_ty, buf, 1, "buffer_data")?;
        self.create_memset(data_field, 0, fixed_len)?;

        let scoped = self.compile_expr(&args[0])?;
        let addr = self.value_as_address(scoped.expect_value()?)?;
        self.create_probe_read(data_field, length, addr, args[0].ty.addr_space, loc)?;
        self.release(scoped)?;
        Ok(Scoped::owned(buf))
    }

    /// join(argv): under a guard that the scratch map value is available,
    /// read up to join_argnum pointers and emit their strings in one record.
    fn compile_join(&mut self, args: &[Expression], loc: SourceLocation) -> Result<Scoped<'ctx>> {
        let argnum = self.runtime.limits.join_argnum;
        let argsize = self.runtime.limits.join_argsize;
        let join_fd = self
            .runtime
            .maps
            .special(crate::runtime::SpecialMap::Join)
            .ok_or_else(|| CodeGenError::MapNotFound("join".to_string()))?
            .fd;

        let scoped = self.compile_expr(&args[0])?;
        let argv = self.value_as_address(scoped.expect_value()?)?;
        let addr_space = args[0].ty.addr_space;
        self.release(scoped)?;

        let first = self.create_alloca(self.i64_t().into(), "join_first")?;
        let second = self.create_alloca(self.i64_t().into(), "join_second")?;

        let zero_key = self.create_alloca(self.i32_t().into(), "join_key")?;
        self.builder
            .build_store(zero_key, self.const_i32(0))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let scratch = self.create_map_lookup_raw(join_fd, zero_key)?;

        let notzero_block = self.append_block("joinnotzero")?;
        let zero_block = self.append_block("joinzero")?;
        let available = self
            .builder
            .build_is_not_null(scratch, "joinzerocond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(available, notzero_block, zero_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(notzero_block);
        let action = self.const_i64(AsyncAction::Join.base());
        self.store_bytes_word(scratch, 0, action)?;
        let join_id = self.const_i64(self.ids.join as u64);
        self.store_bytes_word(scratch, 8, join_id)?;
        self.ids.join += 1;

        // argv[0]
        let arr = self.create_alloca(self.i64_t().into(), "join_r0")?;
        let eight = self.const_i64(8);
        self.create_probe_read(arr, eight, argv, addr_space, loc)?;
        let arg0_ptr = self
            .builder
            .build_load(self.i64_t(), arr, "join_arg0")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value();
        let dst = self.bytes_offset_ptr(scratch, 16)?;
        let argsize_val = self.const_i64(argsize);
        self.create_probe_read_str(dst, argsize_val, arg0_ptr, addr_space, loc)?;

        for i in 1..argnum {
            let elem_addr = self
                .builder
                .build_int_add(argv, self.const_i64(8 * i), "join_elem")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(first, elem_addr)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let elem = self
                .builder
                .build_load(self.i64_t(), first, "join_elem_addr")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            let eight = self.const_i64(8);
            self.create_probe_read(second, eight, elem, addr_space, loc)?;
            let arg_ptr = self
                .builder
                .build_load(self.i64_t(), second, "join_arg")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            let dst = self.bytes_offset_ptr(scratch, 16 + i * argsize)?;
            let argsize_val = self.const_i64(argsize);
            self.create_probe_read_str(dst, argsize_val, arg_ptr, addr_space, loc)?;
        }

        self.create_perf_event_output(scratch, 16 + argnum * argsize)?;
        self.builder
            .build_unconditional_branch(zero_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(zero_block);
        self.create_lifetime_end(first)?;
        self.create_lifetime_end(second)?;
        self.create_lifetime_end(zero_key)?;
        Ok(Scoped::none())
    }

    fn bytes_offset_ptr(
        &mut self,
        base: PointerValue<'ctx>,
        offset: u64,
    ) -> Result<PointerValue<'ctx>> {
        unsafe {
            self.builder
                .build_gep(self.i8_t(), base, &[self.const_i64(offset)], "offset_ptr")
                .map_err(|e| CodeGenError::Builder(e.to_string()))
        }
    }

    fn store_bytes_word(
        &mut self,
        base: PointerValue<'ctx>,
        offset: u64,
        value: IntValue<'ctx>,
    ) -> Result<()> {
        let ptr = self.bytes_offset_ptr(base, offset)?;
        let store = self
            .builder
            .build_store(ptr, value)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        store
            .set_alignment(1)
            .map_err(|e| CodeGenError::Llvm(e.to_string()))?;
        Ok(())
    }

    /// ntop([af,] addr): tagged union {af, 16-byte body}; af defaults by
    /// operand size (4-byte and plain integers read as IPv4).
    fn compile_ntop(&mut self, args: &[Expression], loc: SourceLocation) -> Result<Scoped<'ctx>> {
        let inet_ty = {
            let fields: Vec<BasicTypeEnum> =
                vec![self.i64_t().into(), self.i8_t().array_type(16).into()];
            self.named_struct("inet_t", &fields, false)
        };
        let buf = self.create_alloca(inet_ty.into(), "inet")?;

        let (af, inet_expr) = if args.len() == 1 {
            let inet = &args[0];
            let af = if inet.ty.is_integer() || inet.ty.size == 4 {
                self.const_i64(AF_INET)
            } else {
                self.const_i64(AF_INET6)
            };
            (af, inet)
        } else {
            let scoped = self.compile_expr(&args[0])?;
            let v = scoped.int_value()?;
            self.release(scoped)?;
            (self.promote_to_i64(v, true)?, &args[1])
        };
        self.store_struct_field(inet_ty, buf, 0, af.into())?;

        let body = self.struct_field_ptr(inet_ty, buf, 1, "inet_body")?;
        self.create_memset(body, 0, 16)?;

        let scoped = self.compile_expr(inet_expr)?;
        if inet_expr.ty.is_array() {
            let addr = self.value_as_address(scoped.expect_value()?)?;
            let len = self.const_i64(inet_expr.ty.size as u64);
            self.create_probe_read(body, len, addr, inet_expr.ty.addr_space, loc)?;
        } else {
            let v = scoped.int_value()?;
            let narrow = self.create_int_cast(v, self.i32_t(), false)?;
            let store = self
                .builder
                .build_store(body, narrow)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            store
                .set_alignment(1)
                .map_err(|e| CodeGenError::Llvm(e.to_string()))?;
        }
        self.release(scoped)?;
        Ok(Scoped::owned(buf))
    }

    /// printf/system/cat: a packed record {async_id, args...} whose field
    /// offsets are published to the per-format table for the event printer.
    fn compile_format_output(
        &mut self,
        args: &[Expression],
        class: FormatClass,
        _loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let id = match class {
            FormatClass::Printf => self.ids.printf,
            FormatClass::System => self.ids.system,
            FormatClass::Cat => self.ids.cat,
        };

        let payload = &args[1..];
        let mut fields: Vec<BasicTypeEnum> = vec![self.i64_t().into()];
        for arg in payload {
            fields.push(self.llvm_type(&arg.ty));
        }
        let struct_ty = self.named_struct(&format!("{}_{}_t", class.name(), id), &fields, false);
        let struct_size = self.struct_size(struct_ty);

        // Publish the payload offsets; user space decodes records with them.
        let offsets: Vec<usize> = (0..payload.len())
            .map(|i| {
                self.layout
                    .offset_of_element(&struct_ty, (i + 1) as u32)
                    .unwrap_or(0) as usize
            })
            .collect();
        let table = match class {
            FormatClass::Printf => &mut self.runtime.printf_args,
            FormatClass::System => &mut self.runtime.system_args,
            FormatClass::Cat => &mut self.runtime.cat_args,
        };
        if let Some(entry) = table.get_mut(id) {
            for (slot, offset) in entry.args.iter_mut().zip(offsets) {
                slot.offset = offset;
            }
        }

        let record = self.create_alloca(struct_ty.into(), &format!("{}_args", class.name()))?;
        // The struct is not packed; padding must not leak stale bytes.
        self.create_memset(record, 0, struct_size)?;

        let async_id = self.const_i64(id as u64 + class.action().base());
        self.store_struct_field(struct_ty, record, 0, async_id.into())?;

        for (i, arg) in payload.iter().enumerate() {
            let scoped = self.compile_expr(arg)?;
            let dst = self.struct_field_ptr(struct_ty, record, (i + 1) as u32, "fmt_arg")?;
            if arg.ty.needs_memcpy() {
                let src = scoped.ptr_value()?;
                self.create_memcpy(dst, src, arg.ty.size as u64)?;
            } else {
                let v = scoped.int_value()?;
                let field_ty = struct_ty
                    .get_field_type_at_index((i + 1) as u32)
                    .ok_or_else(|| {
                        CodeGenError::Internal("format field out of range".to_string())
                    })?;
                let narrowed = self.create_int_cast(v, field_ty.into_int_type(), arg.ty.signed)?;
                self.builder
                    .build_store(dst, narrowed)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            self.release(scoped)?;
        }

        match class {
            FormatClass::Printf => self.ids.printf += 1,
            FormatClass::System => self.ids.system += 1,
            FormatClass::Cat => self.ids.cat += 1,
        }

        self.create_perf_event_output(record, struct_size)?;
        self.create_lifetime_end(record)?;
        Ok(Scoped::none())
    }

    /// exit(): emit the exit record, return 0, and divert any trailing
    /// statements into a dead block.
    fn compile_exit(&mut self) -> Result<Scoped<'ctx>> {
        let perfdata = self.create_alloca(self.i64_t().into(), "perfdata")?;
        self.builder
            .build_store(perfdata, self.const_i64(AsyncAction::Exit.base()))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.create_perf_event_output(perfdata, 8)?;
        self.create_lifetime_end(perfdata)?;
        self.create_ret_zero()?;
        self.open_unreachable_block("deadcode")?;
        Ok(Scoped::none())
    }

    fn compile_print(&mut self, args: &[Expression], loc: SourceLocation) -> Result<Scoped<'ctx>> {
        if let ExprKind::Map(map) = &args[0].kind {
            return self.compile_print_map(map, &args[1..]);
        }
        self.compile_print_non_map(&args[0], loc)
    }

    /// print(@map[, top[, div]]): {async, map_id, top, div} with unused
    /// slots zeroed.
    fn compile_print_map(
        &mut self,
        map: &MapAccess,
        extra: &[Expression],
    ) -> Result<Scoped<'ctx>> {
        let desc = self.map_descriptor(&map.ident)?;
        let fields: Vec<BasicTypeEnum> = vec![
            self.i64_t().into(),
            self.i32_t().into(),
            self.i32_t().into(),
            self.i32_t().into(),
        ];
        let struct_ty = self.named_struct("print_t", &fields, true);
        let buf = self.create_alloca(struct_ty.into(), &format!("print_{}", map.ident))?;

        let action = self.const_i64(AsyncAction::Print.base());
        self.store_struct_field(struct_ty, buf, 0, action.into())?;
        self.store_struct_field(struct_ty, buf, 1, self.const_i32(desc.id as u64).into())?;

        for (i, arg) in extra.iter().take(2).enumerate() {
            let scoped = self.compile_expr(arg)?;
            let v = scoped.int_value()?;
            self.release(scoped)?;
            let narrowed = self.create_int_cast(v, self.i32_t(), false)?;
            self.store_struct_field(struct_ty, buf, (i + 2) as u32, narrowed.into())?;
        }
        for i in extra.len().min(2)..2 {
            self.store_struct_field(struct_ty, buf, (i + 2) as u32, self.const_i32(0).into())?;
        }

        let size = self.struct_size(struct_ty);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        Ok(Scoped::none())
    }

    /// print(scalar): {async, id, payload} with the payload width taken from
    /// the declared type.
    fn compile_print_non_map(
        &mut self,
        arg: &Expression,
        _loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let scoped = self.compile_expr(arg)?;

        let size = arg.ty.size.max(1);
        let fields: Vec<BasicTypeEnum> = vec![
            self.i64_t().into(),
            self.i64_t().into(),
            self.i8_t().array_type(size as u32).into(),
        ];
        let struct_ty = self.named_struct(&format!("print_nonmap_{size}_t"), &fields, true);
        let buf = self.create_alloca(struct_ty.into(), "print_nonmap")?;
        let struct_size = self.struct_size(struct_ty);

        let action = self.const_i64(AsyncAction::PrintNonMap.base());
        self.store_struct_field(struct_ty, buf, 0, action.into())?;
        let id = self.const_i64(self.ids.non_map_print as u64);
        self.store_struct_field(struct_ty, buf, 1, id.into())?;

        let content = self.struct_field_ptr(struct_ty, buf, 2, "print_content")?;
        self.create_memset(content, 0, size as u64)?;
        if arg.ty.needs_memcpy() {
            let src = scoped.ptr_value()?;
            self.create_memcpy(content, src, size as u64)?;
        } else {
            let v = scoped.int_value()?;
            let store = self
                .builder
                .build_store(content, v)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            store
                .set_alignment(1)
                .map_err(|e| CodeGenError::Llvm(e.to_string()))?;
        }
        self.release(scoped)?;

        self.ids.non_map_print += 1;
        self.create_perf_event_output(buf, struct_size)?;
        self.create_lifetime_end(buf)?;
        Ok(Scoped::none())
    }

    /// clear(@m) / zero(@m): {async, map_id}.
    fn compile_map_reset(&mut self, func: &str, args: &[Expression]) -> Result<Scoped<'ctx>> {
        let ExprKind::Map(map) = &args[0].kind else {
            return Err(CodeGenError::Internal(format!(
                "{func}() needs a map argument"
            )));
        };
        let desc = self.map_descriptor(&map.ident)?;
        let action = if func == "clear" {
            AsyncAction::Clear
        } else {
            AsyncAction::Zero
        };

        let fields: Vec<BasicTypeEnum> = vec![self.i64_t().into(), self.i32_t().into()];
        let struct_ty = self.named_struct(&format!("{func}_t"), &fields, true);
        let buf = self.create_alloca(struct_ty.into(), &format!("{func}_{}", map.ident))?;

        self.store_struct_field(struct_ty, buf, 0, self.const_i64(action.base()).into())?;
        self.store_struct_field(struct_ty, buf, 1, self.const_i32(desc.id as u64).into())?;

        let size = self.struct_size(struct_ty);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        Ok(Scoped::none())
    }

    fn compile_time(&mut self) -> Result<Scoped<'ctx>> {
        let fields: Vec<BasicTypeEnum> = vec![self.i64_t().into(), self.i32_t().into()];
        let struct_ty = self.named_struct("time_t", &fields, true);
        let buf = self.create_alloca(struct_ty.into(), "time_t")?;

        let action = self.const_i64(AsyncAction::Time.base());
        self.store_struct_field(struct_ty, buf, 0, action.into())?;
        let id = self.const_i32(self.ids.time as u64);
        self.store_struct_field(struct_ty, buf, 1, id.into())?;
        self.ids.time += 1;

        let size = self.struct_size(struct_ty);
        self.create_perf_event_output(buf, size)?;
        self.create_lifetime_end(buf)?;
        Ok(Scoped::none())
    }

    /// strftime(fmt, ns): a {fmt_id, nsecs} value consumed inside format
    /// records; user space picks the format out of its table by id.
    fn compile_strftime(&mut self, args: &[Expression]) -> Result<Scoped<'ctx>> {
        let fields: Vec<BasicTypeEnum> = vec![self.i64_t().into(), self.i64_t().into()];
        let struct_ty = self.named_struct("strftime_t", &fields, true);
        let buf = self.create_alloca(struct_ty.into(), "strftime_args")?;

        let id = self.const_i64(self.ids.strftime as u64);
        self.store_struct_field(struct_ty, buf, 0, id.into())?;
        self.ids.strftime += 1;

        let scoped = self.compile_expr(&args[1])?;
        let ns = scoped.int_value()?;
        self.release(scoped)?;
        self.store_struct_field(struct_ty, buf, 1, ns.into())?;
        Ok(Scoped::owned(buf))
    }

    fn compile_signal(&mut self, args: &[Expression], loc: SourceLocation) -> Result<Scoped<'ctx>> {
        if let Some(name) = args[0].string_literal() {
            let sig = probescript_platform::signal_name_to_num(name)
                .filter(|sig| *sig >= 1)
                .ok_or_else(|| {
                    CodeGenError::Internal(format!("invalid signal name \"{name}\""))
                })?;
            let sig = self.const_i32(sig as u64);
            self.create_signal(sig, loc)?;
            return Ok(Scoped::none());
        }
        let scoped = self.compile_expr(&args[0])?;
        let v = scoped.int_value()?;
        self.release(scoped)?;
        let sig = self.create_int_cast(v, self.i32_t(), args[0].ty.signed)?;
        self.create_signal(sig, loc)?;
        Ok(Scoped::none())
    }

    /// strncmp(a, b, n): C convention, 0 exactly when the first n bytes
    /// match. A literal operand skips its stack copy.
    fn compile_strncmp_call(
        &mut self,
        args: &[Expression],
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let n = args[2].integer_literal().ok_or_else(|| {
            CodeGenError::Internal("strncmp() length must be a literal".to_string())
        })? as u64;

        let left = &args[0];
        let right = &args[1];

        if let Some(lit) = right.string_literal() {
            let lit = lit.to_string();
            let scoped = self.compile_expr(left)?;
            let value = scoped.expect_value()?;
            let result = self.create_strcmp_literal(
                value,
                left.ty.addr_space,
                &lit,
                Some(n),
                loc,
                false,
            )?;
            self.release(scoped)?;
            return Ok(Scoped::rvalue(result));
        }
        if let Some(lit) = left.string_literal() {
            let lit = lit.to_string();
            let scoped = self.compile_expr(right)?;
            let value = scoped.expect_value()?;
            let result = self.create_strcmp_literal(
                value,
                right.ty.addr_space,
                &lit,
                Some(n),
                loc,
                false,
            )?;
            self.release(scoped)?;
            return Ok(Scoped::rvalue(result));
        }

        let right_scoped = self.compile_expr(right)?;
        let right_value = right_scoped.expect_value()?;
        let left_scoped = self.compile_expr(left)?;
        let left_value = left_scoped.expect_value()?;
        let result = self.create_strncmp(
            left_value,
            left.ty.addr_space,
            right_value,
            right.ty.addr_space,
            n,
            loc,
            false,
        )?;
        self.release(left_scoped)?;
        self.release(right_scoped)?;
        Ok(Scoped::rvalue(result))
    }
}
