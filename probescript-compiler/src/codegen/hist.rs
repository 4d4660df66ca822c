//! Histogram bucket index helpers.
//!
//! Both functions are emitted once per module, flagged always-inline and
//! placed in a "helpers" section so the optimizer folds them into each
//! caller.

use super::CodeGen;
use crate::{CodeGenError, Result};
use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::module::Linkage;
use inkwell::values::{FunctionValue, IntValue, PointerValue};
use inkwell::IntPredicate;

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    fn mark_inline_helper(&self, func: FunctionValue<'ctx>) {
        let kind = Attribute::get_named_enum_kind_id("alwaysinline");
        func.add_attribute(
            AttributeLoc::Function,
            self.context.create_enum_attribute(kind, 0),
        );
        func.set_section(Some("helpers"));
    }

    fn load_word(&mut self, ptr: PointerValue<'ctx>, name: &str) -> Result<IntValue<'ctx>> {
        Ok(self
            .builder
            .build_load(self.i64_t(), ptr, name)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?
            .into_int_value())
    }

    /// Power-of-two bucket index:
    ///
    ///   bucket 0 for n < 0, bucket 1 for n == 0, otherwise
    ///   2 + floor(log2(n)) via 5-step binary descent over shifts
    ///   {16, 8, 4, 2, 1} of the exponent.
    pub(crate) fn ensure_log2_function(&mut self) -> Result<FunctionValue<'ctx>> {
        if let Some(func) = self.log2_func {
            return Ok(func);
        }
        let saved = self.builder.get_insert_block();

        let fn_type = self.i64_t().fn_type(&[self.i64_t().into()], false);
        let func = self
            .module
            .add_function("log2", fn_type, Some(Linkage::Internal));
        self.mark_inline_helper(func);

        let entry = self.context.append_basic_block(func, "entry");
        self.builder.position_at_end(entry);

        let arg = func
            .get_first_param()
            .ok_or_else(|| CodeGenError::Internal("log2 has no parameter".to_string()))?
            .into_int_value();
        let n_alloc = self
            .builder
            .build_alloca(self.i64_t(), "n")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_store(n_alloc, arg)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let result = self
            .builder
            .build_alloca(self.i64_t(), "result")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_store(result, self.const_i64(0))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        let is_negative = self.context.append_basic_block(func, "hist.is_less_than_zero");
        let not_negative = self
            .context
            .append_basic_block(func, "hist.is_not_less_than_zero");
        let n = self.load_word(n_alloc, "n")?;
        let neg = self
            .builder
            .build_int_compare(IntPredicate::SLT, n, self.const_i64(0), "lt_zero")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(neg, is_negative, not_negative)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(is_negative);
        let r = self.load_word(result, "result")?;
        self.builder
            .build_return(Some(&r))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(not_negative);
        let is_zero = self.context.append_basic_block(func, "hist.is_zero");
        let not_zero = self.context.append_basic_block(func, "hist.is_not_zero");
        let n = self.load_word(n_alloc, "n")?;
        let zero = self
            .builder
            .build_int_compare(IntPredicate::EQ, n, self.const_i64(0), "eq_zero")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(zero, is_zero, not_zero)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(is_zero);
        self.builder
            .build_store(result, self.const_i64(1))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let r = self.load_word(result, "result")?;
        self.builder
            .build_return(Some(&r))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(not_zero);
        self.builder
            .build_store(result, self.const_i64(2))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        for i in (0..5).rev() {
            let n = self.load_word(n_alloc, "n")?;
            let threshold = self.const_i64(1 << (1 << i));
            let ge = self
                .builder
                .build_int_compare(IntPredicate::UGE, n, threshold, "ge")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let ge64 = self.promote_to_i64(ge, false)?;
            let shift = self
                .builder
                .build_left_shift(ge64, self.const_i64(i as u64), "shift")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let shifted = self
                .builder
                .build_right_shift(n, shift, false, "n_shifted")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(n_alloc, shifted)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            let r = self.load_word(result, "result")?;
            let r2 = self
                .builder
                .build_int_add(r, shift, "result_next")
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
            self.builder
                .build_store(result, r2)
                .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        }
        let r = self.load_word(result, "result")?;
        self.builder
            .build_return(Some(&r))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if let Some(block) = saved {
            self.builder.position_at_end(block);
        }
        self.log2_func = Some(func);
        Ok(func)
    }

    /// Range-and-step bucket index:
    ///
    ///   0 for value < min, 1 + (max - min) / step for value > max,
    ///   1 + (value - min) / step otherwise. Division is unsigned.
    pub(crate) fn ensure_linear_function(&mut self) -> Result<FunctionValue<'ctx>> {
        if let Some(func) = self.linear_func {
            return Ok(func);
        }
        let saved = self.builder.get_insert_block();

        let i64_t = self.i64_t();
        let fn_type = i64_t.fn_type(
            &[i64_t.into(), i64_t.into(), i64_t.into(), i64_t.into()],
            false,
        );
        let func = self
            .module
            .add_function("linear", fn_type, Some(Linkage::Internal));
        self.mark_inline_helper(func);

        let entry = self.context.append_basic_block(func, "entry");
        self.builder.position_at_end(entry);

        let params: Vec<IntValue> = func
            .get_param_iter()
            .map(|p| p.into_int_value())
            .collect();
        let (value, min, max, step) = (params[0], params[1], params[2], params[3]);

        let lt_min = self.context.append_basic_block(func, "lhist.lt_min");
        let ge_min = self.context.append_basic_block(func, "lhist.ge_min");
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::SLT, value, min, "value_lt_min")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, lt_min, ge_min)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(lt_min);
        self.builder
            .build_return(Some(&self.const_i64(0)))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(ge_min);
        let gt_max = self.context.append_basic_block(func, "lhist.gt_max");
        let le_max = self.context.append_basic_block(func, "lhist.le_max");
        let cmp = self
            .builder
            .build_int_compare(IntPredicate::SGT, value, max, "value_gt_max")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_conditional_branch(cmp, gt_max, le_max)
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(gt_max);
        let range = self
            .builder
            .build_int_sub(max, min, "range")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let div = self
            .builder
            .build_int_unsigned_div(range, step, "range_buckets")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let bucket = self
            .builder
            .build_int_add(div, self.const_i64(1), "bucket")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_return(Some(&bucket))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        self.builder.position_at_end(le_max);
        let delta = self
            .builder
            .build_int_sub(value, min, "delta")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let div = self
            .builder
            .build_int_unsigned_div(delta, step, "delta_buckets")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        let bucket = self
            .builder
            .build_int_add(div, self.const_i64(1), "bucket")
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;
        self.builder
            .build_return(Some(&bucket))
            .map_err(|e| CodeGenError::Builder(e.to_string()))?;

        if let Some(block) = saved {
            self.builder.position_at_end(block);
        }
        self.linear_func = Some(func);
        Ok(func)
    }
}
