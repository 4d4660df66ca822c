//! Map access and key shaping.
//!
//! Keys and values are always passed to helpers by pointer into stack
//! memory. Scalar key components are widened to 64 bits with their sign
//! preserved; stack-resident components are copied (or, for a single-component
//! key, borrowed in place).

use super::{CodeGen, Scoped};
use crate::ast::{MapAccess, SourceLocation};
use crate::runtime::MapDescriptor;
use crate::{CodeGenError, Result};
use aya_ebpf_bindings::bindings::bpf_func_id::{
    BPF_FUNC_map_delete_elem, BPF_FUNC_map_lookup_elem, BPF_FUNC_map_update_elem,
};
use inkwell::values::{IntValue, PointerValue};

/// bpf_map_update_elem flag: create or update.
const BPF_ANY: u64 = 0;

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    pub(crate) fn map_descriptor(&self, ident: &str) -> Result<MapDescriptor> {
        self.runtime
            .maps
            .get(ident)
            .cloned()
            .ok_or_else(|| CodeGenError::MapNotFound(ident.to_string()))
    }

    /// Look an element up, yielding the stored value or a zeroed default if
    /// absent. Scalars come back as a 64-bit value; aggregate values come
    /// back as an owned stack copy.
    pub(crate) fn create_map_lookup(
        &mut self,
        map: &MapDescriptor,
        key: PointerValue<'ctx>,
        loc: SourceLocation,
    ) -> Result<Scoped<'ctx>> {
        let value_type = map.value_type.clone();
        let map_ptr = self.create_map_fd(map.fd)?;
        let found = self
            .create_helper_call(
                BPF_FUNC_map_lookup_elem,
                &[map_ptr.into(), key.into()],
                self.ptr_t().into(),
                "lookup_elem",
            )?
            .into_pointer_value();

        let value = self.create_alloca_type(&value_type, "lookup_elem_val")?;

        let hit_block = self.append_block("lookup_success")?;
        let miss_block = self.append_block("lookup_failure")?;
        let merge_block = self.append_block("lookup_merge")?;

        let is_null = self
            .builder
            .build_is_null(found, "map_lookup_cond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(is_null, miss_block, hit_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(hit_block);
        if value_type.needs_memcpy() {
            self.create_memcpy(value, found, value_type.size as u64)?;
        } else {
            let ty = self.llvm_type(&value_type);
            let loaded = self
                .builder
                .build_load(ty, found, "stored")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(value, loaded)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        // Absent elements read as zero; the miss is still reported so user
        // space can tell silence from zeroes.
        self.builder.position_at_end(miss_block);
        self.create_memset(value, 0, value_type.size as u64)?;
        let zero = self.const_i64(0);
        self.emit_helper_error(BPF_FUNC_map_lookup_elem, zero, loc)?;
        self.builder
            .build_unconditional_branch(merge_block)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(merge_block);
        if value_type.needs_memcpy() {
            Ok(Scoped::owned(value))
        } else {
            let ty = self.llvm_type(&value_type);
            let loaded = self
                .builder
                .build_load(ty, value, "value")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
                .into_int_value();
            let widened = self.promote_to_i64(loaded, value_type.signed)?;
            self.create_lifetime_end(value)?;
            Ok(Scoped::rvalue(widened))
        }
    }

    /// Raw lookup returning the kernel's value pointer (possibly null).
    /// Callers branch on null themselves; used for scratch maps whose value
    /// region is written in place.
    pub(crate) fn create_map_lookup_raw(
        &mut self,
        fd: i32,
        key: PointerValue<'ctx>,
    ) -> Result<PointerValue<'ctx>> {
        let map_ptr = self.create_map_fd(fd)?;
        Ok(self
            .create_helper_call(
                BPF_FUNC_map_lookup_elem,
                &[map_ptr.into(), key.into()],
                self.ptr_t().into(),
                "lookup_elem",
            )?
            .into_pointer_value())
    }

    pub(crate) fn create_map_update(
        &mut self,
        map: &MapDescriptor,
        key: PointerValue<'ctx>,
        value: PointerValue<'ctx>,
        loc: SourceLocation,
    ) -> Result<()> {
        let map_ptr = self.create_map_fd(map.fd)?;
        let ret = self.create_helper_call(
            BPF_FUNC_map_update_elem,
            &[
                map_ptr.into(),
                key.into(),
                value.into(),
                self.const_i64(BPF_ANY).into(),
            ],
            self.i64_t().into(),
            "update_elem",
        )?;
        self.create_helper_error_cond(ret.into_int_value(), BPF_FUNC_map_update_elem, loc)
    }

    pub(crate) fn create_map_delete(
        &mut self,
        map: &MapDescriptor,
        key: PointerValue<'ctx>,
        loc: SourceLocation,
    ) -> Result<()> {
        let map_ptr = self.create_map_fd(map.fd)?;
        let ret = self.create_helper_call(
            BPF_FUNC_map_delete_elem,
            &[map_ptr.into(), key.into()],
            self.i64_t().into(),
            "delete_elem",
        )?;
        self.create_helper_error_cond(ret.into_int_value(), BPF_FUNC_map_delete_elem, loc)
    }

    /// Bytes a key component occupies: widened scalars take a full word.
    fn key_component_size(ty: &crate::types::SizedType) -> usize {
        if ty.is_stack_resident() {
            ty.size
        } else {
            8
        }
    }

    /// Build the key for a map reference on the stack. The returned slot is
    /// always released by the caller, including the single stack-resident
    /// component case where the component's own buffer is borrowed.
    pub(crate) fn get_map_key(&mut self, map: &MapAccess) -> Result<PointerValue<'ctx>> {
        if map.keys.is_empty() {
            // Keyless map: a fixed zero key.
            let key = self.create_alloca(self.i64_t().into(), &format!("{}_key", map.ident))?;
            self.builder
                .build_store(key, self.const_i64(0))
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            return Ok(key);
        }

        if map.keys.len() == 1 {
            let expr = &map.keys[0];
            let mut scoped = self.compile_expr(expr)?;
            if expr.ty.is_stack_resident() {
                let ptr = scoped.ptr_value()?;
                // Ownership moves to the key; release happens after the map op.
                let _ = scoped.disarm();
                return Ok(ptr);
            }
            let widened = {
                let v = scoped.int_value()?;
                self.promote_to_i64(v, expr.ty.signed)?
            };
            self.release(scoped)?;
            let key = self.create_alloca(self.i64_t().into(), &format!("{}_key", map.ident))?;
            self.builder
                .build_store(key, widened)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            return Ok(key);
        }

        let size: usize = map.keys.iter().map(|e| Self::key_component_size(&e.ty)).sum();
        let key = self.create_alloca_bytes(size as u64, &format!("{}_key", map.ident))?;
        self.fill_key_components(key, &map.keys, 0)?;
        Ok(key)
    }

    /// As [`get_map_key`], with the bucket index appended in a trailing
    /// 64-bit slot. A keyless histogram uses the bucket alone.
    pub(crate) fn get_hist_map_key(
        &mut self,
        map: &MapAccess,
        bucket: IntValue<'ctx>,
    ) -> Result<PointerValue<'ctx>> {
        if map.keys.is_empty() {
            let key = self.create_alloca(self.i64_t().into(), &format!("{}_key", map.ident))?;
            self.builder
                .build_store(key, bucket)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            return Ok(key);
        }

        let components: usize = map.keys.iter().map(|e| Self::key_component_size(&e.ty)).sum();
        let size = components + 8;
        let key = self.create_alloca_bytes(size as u64, &format!("{}_key", map.ident))?;
        let offset = self.fill_key_components(key, &map.keys, 0)?;
        self.store_key_word(key, offset, bucket)?;
        Ok(key)
    }

    fn fill_key_components(
        &mut self,
        key: PointerValue<'ctx>,
        keys: &[crate::ast::Expression],
        mut offset: usize,
    ) -> Result<usize> {
        for expr in keys {
            let scoped = self.compile_expr(expr)?;
            if expr.ty.is_stack_resident() {
                let src = scoped.ptr_value()?;
                let dst = unsafe {
                    self.builder
                        .build_gep(
                            self.i8_t(),
                            key,
                            &[self.const_i64(offset as u64)],
                            "key_component",
                        )
                        .map_err(|e| CodeGenError::Builder(e.to_string()))?
                };
                self.create_memcpy(dst, src, expr.ty.size as u64)?;
                self.release(scoped)?;
                offset += expr.ty.size;
            } else {
                let widened = {
                    let v = scoped.int_value()?;
                    self.promote_to_i64(v, expr.ty.signed)?
                };
                self.release(scoped)?;
                self.store_key_word(key, offset, widened)?;
                offset += 8;
            }
        }
        Ok(offset)
    }

    /// Unaligned 64-bit store into a byte-shaped key.
    fn store_key_word(
        &mut self,
        key: PointerValue<'ctx>,
        offset: usize,
        value: IntValue<'ctx>,
    ) -> Result<()> {
        let dst = unsafe {
            self.builder
                .build_gep(
                    self.i8_t(),
                    key,
                    &[self.const_i64(offset as u64)],
                    "key_slot",
                )
                .map_err(|e| CodeGenError::Builder(e.to_string()))?
        };
        let store = self
            .builder
            .build_store(dst, value)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        store
            .set_alignment(1)
            .map_err(|e| CodeGenError::Llvm(e.to_string()))?;
        Ok(())
    }

    /// Map read: `@m[keys]` as an expression.
    pub(crate) fn compile_map_load(&mut self, map: &MapAccess) -> Result<Scoped<'ctx>> {
        let desc = self.map_descriptor(&map.ident)?;
        let key = self.get_map_key(map)?;
        let value = self.create_map_lookup(&desc, key, map.loc)?;
        self.create_lifetime_end(key)?;
        Ok(value)
    }
}
