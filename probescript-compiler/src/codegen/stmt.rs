//! Statement lowering: assignments, control flow, jumps and predicates.

use super::CodeGen;
use crate::ast::{Expression, JumpKind, MapAccess, SourceLocation, Statement};
use crate::types::SizedType;
use crate::{CodeGenError, Result};
use inkwell::IntPredicate;

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    pub(crate) fn compile_statement(&mut self, stmt: &Statement) -> Result<()> {
        match stmt {
            Statement::Expr(expr) => {
                let scoped = self.compile_expr(expr)?;
                self.release(scoped)
            }
            Statement::AssignMap { map, expr, loc } => self.compile_assign_map(map, expr, *loc),
            Statement::AssignVar { ident, ty, expr } => self.compile_assign_var(ident, ty, expr),
            Statement::If {
                cond,
                then_stmts,
                else_stmts,
            } => self.compile_if(cond, then_stmts, else_stmts.as_deref()),
            Statement::While { cond, stmts } => self.compile_while(cond, stmts),
            Statement::Unroll { count, stmts } => {
                for _ in 0..*count {
                    for stmt in stmts {
                        self.compile_statement(stmt)?;
                    }
                }
                Ok(())
            }
            Statement::Jump { kind, loc } => self.compile_jump(*kind, *loc),
        }
    }

    fn compile_assign_map(
        &mut self,
        map: &MapAccess,
        expr: &Expression,
        loc: SourceLocation,
    ) -> Result<()> {
        let scoped = self.compile_expr(expr)?;

        // Aggregation calls update the map themselves.
        let Some(value) = scoped.value() else {
            return self.release(scoped);
        };

        let desc = self.map_descriptor(&map.ident)?;
        let key = self.get_map_key(map)?;

        let mut self_alloca = None;
        let val = if expr.ty.is_stack_resident() {
            scoped.ptr_value()?
        } else if map.ty.is_record() {
            if expr.ty.is_internal {
                scoped.ptr_value()?
            } else {
                // The value is an external pointer; pull the whole record
                // into a stack slot so the map sees BPF-owned bytes.
                let dst = self.create_alloca_type(&map.ty, &format!("{}_val", map.ident))?;
                let addr = self.value_as_address(value)?;
                let len = self.const_i64(map.ty.size as u64);
                self.create_probe_read(dst, len, addr, expr.ty.addr_space, loc)?;
                self_alloca = Some(dst);
                dst
            }
        } else if map.ty.is_pointer() {
            let dst = self.create_alloca(self.i64_t().into(), &format!("{}_ptr", map.ident))?;
            let addr = self.value_as_address(value)?;
            self.builder
                .build_store(dst, addr)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self_alloca = Some(dst);
            dst
        } else {
            // Integers are always stored 64-bit wide in map values.
            let v = scoped.int_value()?;
            let widened = self.promote_to_i64(v, map.ty.signed)?;
            let dst = self.create_alloca(self.i64_t().into(), &format!("{}_val", map.ident))?;
            self.builder
                .build_store(dst, widened)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self_alloca = Some(dst);
            dst
        };

        self.create_map_update(&desc, key, val, loc)?;
        self.create_lifetime_end(key)?;
        if let Some(dst) = self_alloca {
            self.create_lifetime_end(dst)?;
        }
        self.release(scoped)
    }

    fn compile_assign_var(
        &mut self,
        ident: &str,
        ty: &SizedType,
        expr: &Expression,
    ) -> Result<()> {
        let scoped = self.compile_expr(expr)?;

        if !self.variables.contains_key(ident) {
            let slot = self.create_alloca_init(ty, ident)?;
            self.variables.insert(ident.to_string(), slot);
        }
        let slot = self.variables[ident];

        if ty.needs_memcpy() {
            let src = scoped.ptr_value()?;
            self.create_memcpy(slot, src, ty.size as u64)?;
        } else {
            let v = scoped.int_value()?;
            let slot_ty = self.llvm_type(ty).into_int_type();
            let narrowed = self.create_int_cast(v, slot_ty, ty.signed)?;
            self.builder
                .build_store(slot, narrowed)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        self.release(scoped)
    }

    fn compile_if(
        &mut self,
        cond: &Expression,
        then_stmts: &[Statement],
        else_stmts: Option<&[Statement]>,
    ) -> Result<()> {
        let if_true = self.append_block("if_body")?;
        let if_end = self.append_block("if_end")?;
        let if_else = if else_stmts.is_some() {
            Some(self.append_block("else_body")?)
        } else {
            None
        };

        let scoped = self.compile_expr(cond)?;
        let value = scoped.int_value()?;
        self.release(scoped)?;
        let nonzero = self
            .builder
            .build_int_compare(
                IntPredicate::NE,
                value,
                value.get_type().const_zero(),
                "true_cond",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder
            .build_conditional_branch(nonzero, if_true, if_else.unwrap_or(if_end))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(if_true);
        for stmt in then_stmts {
            self.compile_statement(stmt)?;
        }
        self.builder
            .build_unconditional_branch(if_end)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if let (Some(block), Some(stmts)) = (if_else, else_stmts) {
            self.builder.position_at_end(block);
            for stmt in stmts {
                self.compile_statement(stmt)?;
            }
            self.builder
                .build_unconditional_branch(if_end)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }

        self.builder.position_at_end(if_end);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expression, stmts: &[Statement]) -> Result<()> {
        let while_cond = self.append_block("while_cond")?;
        let while_body = self.append_block("while_body")?;
        let while_end = self.append_block("while_end")?;

        self.loops.push((while_cond, while_end));

        self.builder
            .build_unconditional_branch(while_cond)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(while_cond);
        let scoped = self.compile_expr(cond)?;
        let value = scoped.int_value()?;
        self.release(scoped)?;
        let nonzero = self
            .builder
            .build_int_compare(
                IntPredicate::NE,
                value,
                value.get_type().const_zero(),
                "true_cond",
            )
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(nonzero, while_body, while_end)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(while_body);
        for stmt in stmts {
            self.compile_statement(stmt)?;
        }
        self.builder
            .build_unconditional_branch(while_cond)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(while_end);
        self.loops.pop();
        Ok(())
    }

    fn compile_jump(&mut self, kind: JumpKind, loc: SourceLocation) -> Result<()> {
        match kind {
            JumpKind::Return => self.create_ret_zero()?,
            JumpKind::Break => {
                let (_, break_target) = *self.loops.last().ok_or_else(|| {
                    CodeGenError::Internal(format!("break outside of a loop at {loc}"))
                })?;
                self.builder
                    .build_unconditional_branch(break_target)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
            JumpKind::Continue => {
                let (continue_target, _) = *self.loops.last().ok_or_else(|| {
                    CodeGenError::Internal(format!("continue outside of a loop at {loc}"))
                })?;
                self.builder
                    .build_unconditional_branch(continue_target)
                    .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            }
        }

        // Instructions after an unconditional branch land in a synthetic
        // block the optimizer erases; nothing may leak into neighbors.
        self.open_unreachable_block("unreach")
    }

    pub(crate) fn create_ret_zero(&mut self) -> Result<()> {
        let zero = self.const_i64(0);
        self.builder
            .build_return(Some(&zero))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        Ok(())
    }

    pub(crate) fn open_unreachable_block(&mut self, name: &str) -> Result<()> {
        let block = self.append_block(name)?;
        self.builder.position_at_end(block);
        Ok(())
    }

    /// A zero-valued predicate returns 0 from the program before the body
    /// runs.
    pub(crate) fn compile_predicate(&mut self, pred: &Expression) -> Result<()> {
        let pred_false = self.append_block("pred_false")?;
        let pred_true = self.append_block("pred_true")?;

        let scoped = self.compile_expr(pred)?;
        let value = scoped.int_value()?;
        self.release(scoped)?;
        // Unsigned widening; casts in predicates are allowed.
        let widened = self.create_int_cast(value, self.i64_t(), false)?;
        let is_zero = self
            .builder
            .build_int_compare(IntPredicate::EQ, widened, self.const_i64(0), "predcond")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(is_zero, pred_false, pred_true)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(pred_false);
        self.create_ret_zero()?;

        self.builder.position_at_end(pred_true);
        Ok(())
    }
}
