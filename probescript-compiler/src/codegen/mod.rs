//! eBPF code generation.
//!
//! [`CodeGen`] owns the LLVM module and walks the typed AST, emitting one
//! function per resolved attach point. Lowering is split across submodules:
//! IR primitives in `builder`, map access and key shaping in `maps`,
//! histogram index helpers in `hist`, expressions in `expr`, statements in
//! `stmt`, calls in `calls` and the probe driver in `probes`.

mod builder;
mod calls;
mod expr;
mod hist;
mod maps;
mod probes;
mod stmt;

use crate::ast::{AttachPoint, Program};
use crate::runtime::RuntimeContext;
use crate::{CodeGenError, Result};
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{
    FileType, InitializationConfig, Target, TargetData, TargetMachine, TargetTriple,
};
use inkwell::types::StructType;
use inkwell::values::{BasicValueEnum, FunctionValue, IntValue, PointerValue};
use inkwell::OptimizationLevel;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Compilation advances monotonically; any out-of-order pipeline call is a
/// precondition violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Ir,
    Opt,
    Done,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Ir => "IR",
            Phase::Opt => "OPT",
            Phase::Done => "DONE",
        }
    }
}

/// Compiled relocatable object, ready to hand to a loader.
pub struct CompiledObject {
    bytes: Vec<u8>,
}

impl CompiledObject {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Identifier counters for every asynchronous-event producer. Snapshotted
/// and restored by the probe driver so that sibling programs expanded from
/// one probe assign identical ids.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AsyncIds {
    pub printf: usize,
    pub system: usize,
    pub cat: usize,
    pub time: usize,
    pub strftime: usize,
    pub join: usize,
    pub non_map_print: usize,
    pub helper_error: u64,
}

/// Value produced by expression lowering: the value itself plus an optional
/// on-stack buffer whose lifetime the consumer must end, either by calling
/// [`CodeGen::release`] or by disarming to take ownership.
#[must_use]
pub(crate) struct Scoped<'ctx> {
    value: Option<BasicValueEnum<'ctx>>,
    slot: Option<PointerValue<'ctx>>,
}

impl<'ctx> Scoped<'ctx> {
    /// No value was produced (the expression performed its effects itself).
    pub fn none() -> Self {
        Self {
            value: None,
            slot: None,
        }
    }

    /// A scalar with no stack storage to release.
    pub fn rvalue(value: impl Into<BasicValueEnum<'ctx>>) -> Self {
        Self {
            value: Some(value.into()),
            slot: None,
        }
    }

    /// A stack buffer owned by this value.
    pub fn owned(ptr: PointerValue<'ctx>) -> Self {
        Self {
            value: Some(ptr.into()),
            slot: Some(ptr),
        }
    }

    /// A stack buffer whose lifetime is managed elsewhere.
    pub fn borrowed(ptr: PointerValue<'ctx>) -> Self {
        Self {
            value: Some(ptr.into()),
            slot: None,
        }
    }

    pub fn value(&self) -> Option<BasicValueEnum<'ctx>> {
        self.value
    }

    pub fn expect_value(&self) -> Result<BasicValueEnum<'ctx>> {
        self.value
            .ok_or_else(|| CodeGenError::Internal("expression produced no value".to_string()))
    }

    pub fn int_value(&self) -> Result<IntValue<'ctx>> {
        match self.expect_value()? {
            BasicValueEnum::IntValue(v) => Ok(v),
            other => Err(CodeGenError::Internal(format!(
                "expected integer value, got {other:?}"
            ))),
        }
    }

    pub fn ptr_value(&self) -> Result<PointerValue<'ctx>> {
        match self.expect_value()? {
            BasicValueEnum::PointerValue(p) => Ok(p),
            other => Err(CodeGenError::Internal(format!(
                "expected pointer value, got {other:?}"
            ))),
        }
    }

    /// Transfer ownership of the stack buffer to the caller. The buffer is
    /// no longer released by [`CodeGen::release`].
    pub fn disarm(&mut self) -> Option<PointerValue<'ctx>> {
        self.slot.take()
    }
}

pub struct CodeGen<'ctx, 'rt> {
    pub(crate) context: &'ctx Context,
    pub module: Module<'ctx>,
    pub(crate) builder: Builder<'ctx>,
    target_machine: TargetMachine,
    pub(crate) layout: TargetData,
    pub(crate) runtime: &'rt mut RuntimeContext,
    phase: Phase,

    // Per-program state, reset by the probe driver.
    pub(crate) variables: HashMap<String, PointerValue<'ctx>>,
    pub(crate) loops: Vec<(BasicBlock<'ctx>, BasicBlock<'ctx>)>,
    pub(crate) ctx_param: Option<PointerValue<'ctx>>,
    pub(crate) probefull: String,
    pub(crate) current_attach_point: Option<AttachPoint>,
    pub(crate) current_usdt_location_index: usize,
    pub(crate) tracepoint_record: String,

    pub(crate) ids: AsyncIds,
    pub(crate) next_probe_index: HashMap<String, usize>,
    pub(crate) log2_func: Option<FunctionValue<'ctx>>,
    pub(crate) linear_func: Option<FunctionValue<'ctx>>,
    struct_cache: HashMap<String, StructType<'ctx>>,
}

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    pub fn new(context: &'ctx Context, runtime: &'rt mut RuntimeContext) -> Result<Self> {
        let module = context.create_module("probescript");
        let builder = context.create_builder();

        Target::initialize_bpf(&InitializationConfig::default());

        let triple = TargetTriple::create("bpf-pc-linux");
        let target = Target::from_triple(&triple)
            .map_err(|e| CodeGenError::TargetMachine(format!("bpf-pc-linux: {e}")))?;
        let target_machine = target
            .create_target_machine(
                &triple,
                "generic",
                "+alu32",
                OptimizationLevel::Aggressive,
                inkwell::targets::RelocMode::PIC,
                inkwell::targets::CodeModel::Small,
            )
            .ok_or_else(|| CodeGenError::TargetMachine("bpf-pc-linux".to_string()))?;

        let layout = target_machine.get_target_data();
        module.set_data_layout(&layout.get_data_layout());
        module.set_triple(&triple);

        Ok(Self {
            context,
            module,
            builder,
            target_machine,
            layout,
            runtime,
            phase: Phase::Init,
            variables: HashMap::new(),
            loops: Vec::new(),
            ctx_param: None,
            probefull: String::new(),
            current_attach_point: None,
            current_usdt_location_index: 0,
            tracepoint_record: String::new(),
            ids: AsyncIds::default(),
            next_probe_index: HashMap::new(),
            log2_func: None,
            linear_func: None,
            struct_cache: HashMap::new(),
        })
    }

    /// Named struct types, created once and reused across programs.
    pub(crate) fn named_struct(
        &mut self,
        name: &str,
        fields: &[inkwell::types::BasicTypeEnum<'ctx>],
        packed: bool,
    ) -> StructType<'ctx> {
        if let Some(ty) = self.struct_cache.get(name) {
            return *ty;
        }
        let ty = self.context.opaque_struct_type(name);
        ty.set_body(fields, packed);
        self.struct_cache.insert(name.to_string(), ty);
        ty
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn expect_phase(&self, expected: Phase) -> Result<()> {
        if self.phase != expected {
            return Err(CodeGenError::Phase {
                expected: expected.name(),
                actual: self.phase.name(),
            });
        }
        Ok(())
    }

    /// Walk the program and emit IR for every probe.
    pub fn generate_ir(&mut self, program: &Program) -> Result<()> {
        self.expect_phase(Phase::Init)?;
        info!("generating IR for {} probes", program.probes.len());
        for probe in &program.probes {
            self.compile_probe(probe)?;
        }
        self.phase = Phase::Ir;
        Ok(())
    }

    /// Run the module optimizer at O3; the O3 pipeline carries the function
    /// inliner and the histogram helpers rely on the leading always-inliner.
    pub fn optimize(&mut self) -> Result<()> {
        self.expect_phase(Phase::Ir)?;
        self.module
            .run_passes(
                "always-inline,default<O3>",
                &self.target_machine,
                PassBuilderOptions::create(),
            )
            .map_err(|e| CodeGenError::Llvm(e.to_string()))?;
        self.phase = Phase::Opt;
        debug!("module optimized");
        Ok(())
    }

    /// Write the module as a relocatable object file.
    pub fn emit_elf(&self, path: &Path) -> Result<()> {
        self.expect_phase(Phase::Opt)?;
        self.target_machine
            .write_to_file(&self.module, FileType::Object, path)
            .map_err(|e| CodeGenError::ObjectEmission {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        info!("wrote object file {}", path.display());
        Ok(())
    }

    /// Produce the relocatable object in memory and finish the pipeline.
    pub fn emit(&mut self) -> Result<CompiledObject> {
        self.expect_phase(Phase::Opt)?;
        let buffer = self
            .target_machine
            .write_to_memory_buffer(&self.module, FileType::Object)
            .map_err(|e| CodeGenError::Llvm(e.to_string()))?;
        self.phase = Phase::Done;
        Ok(CompiledObject {
            bytes: buffer.as_slice().to_vec(),
        })
    }

    /// generate_ir + optimize + emit.
    pub fn compile(&mut self, program: &Program) -> Result<CompiledObject> {
        self.generate_ir(program)?;
        self.optimize()?;
        self.emit()
    }

    /// Textual IR, for inspection and tests.
    pub fn dump_ir(&self) -> String {
        self.module.print_to_string().to_string()
    }

    /// End the lifetime of the stack buffer owned by `scoped`, if any.
    pub(crate) fn release(&mut self, mut scoped: Scoped<'ctx>) -> Result<()> {
        if let Some(slot) = scoped.disarm() {
            self.create_lifetime_end(slot)?;
        }
        Ok(())
    }

    pub(crate) fn current_function(&self) -> Result<FunctionValue<'ctx>> {
        self.builder
            .get_insert_block()
            .and_then(|b| b.get_parent())
            .ok_or_else(|| CodeGenError::Internal("no current function".to_string()))
    }

    pub(crate) fn append_block(&self, name: &str) -> Result<BasicBlock<'ctx>> {
        Ok(self.context.append_basic_block(self.current_function()?, name))
    }

    pub(crate) fn ctx(&self) -> Result<PointerValue<'ctx>> {
        self.ctx_param
            .ok_or_else(|| CodeGenError::Internal("no probe context".to_string()))
    }

    pub(crate) fn attach_point(&self) -> Result<&AttachPoint> {
        self.current_attach_point
            .as_ref()
            .ok_or_else(|| CodeGenError::Internal("no current attach point".to_string()))
    }
}
