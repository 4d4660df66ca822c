//! Probe driver: resolves attach-point wildcards, expands USDT locations
//! and emits one program per resolved match.

use super::CodeGen;
use crate::ast::{Probe, ProbeKind};
use crate::{CodeGenError, Result};
use inkwell::values::FunctionValue;
use tracing::{debug, info};

impl<'ctx, 'rt> CodeGen<'ctx, 'rt> {
    pub(crate) fn compile_probe(&mut self, probe: &Probe) -> Result<()> {
        let first = probe
            .attach_points
            .first()
            .ok_or_else(|| CodeGenError::Internal("probe without attach points".to_string()))?
            .clone();

        // USDT argument recipes differ per resolved location, so those
        // probes always expand.
        let need_expansion = probe.need_expansion || first.kind() == ProbeKind::Usdt;

        self.current_attach_point = Some(first);

        if !need_expansion {
            // One program attached to every wildcard match.
            self.probefull = probe.name();
            self.set_tracepoint_record_from_attach_point()?;
            let section_base = self.probefull.clone();
            self.generate_program(probe, &section_base)?;
            self.current_attach_point = None;
            return Ok(());
        }

        // One program per match: snapshot the async-event counters so every
        // sibling assigns the same ids.
        let saved_ids = self.ids;

        for attach_point in &probe.attach_points {
            self.current_attach_point = Some(attach_point.clone());

            let matches: Vec<String> = match attach_point.kind() {
                ProbeKind::Begin | ProbeKind::End => vec![attach_point.provider.clone()],
                _ => self.runtime.catalog.wildcard_matches(attach_point),
            };
            debug!(
                attach_point = %attach_point.name(),
                matches = matches.len(),
                "expanding probe"
            );

            self.tracepoint_record.clear();
            for matched in &matches {
                self.ids = saved_ids;

                match attach_point.kind() {
                    ProbeKind::Usdt => {
                        self.compile_usdt_match(probe, matched, saved_ids)?;
                    }
                    ProbeKind::Begin | ProbeKind::End => {
                        self.probefull = attach_point.provider.clone();
                        let section_base = self.probefull.clone();
                        self.generate_program(probe, &section_base)?;
                    }
                    ProbeKind::Tracepoint | ProbeKind::Uprobe | ProbeKind::Uretprobe => {
                        // Matches carry `category:function`.
                        let (category, func) = matched.split_once(':').ok_or_else(|| {
                            CodeGenError::Internal(format!(
                                "match \"{matched}\" has no category part"
                            ))
                        })?;
                        if attach_point.kind() == ProbeKind::Tracepoint {
                            self.tracepoint_record = self
                                .runtime
                                .catalog
                                .tracepoint_record_name(category, func);
                        }
                        self.probefull = attach_point.name_with_target(category, func);
                        let section_base = self.probefull.clone();
                        self.generate_program(probe, &section_base)?;
                    }
                    _ => {
                        self.probefull = attach_point.name_with(matched);
                        let section_base = self.probefull.clone();
                        self.generate_program(probe, &section_base)?;
                    }
                }
            }
        }

        self.current_attach_point = None;
        Ok(())
    }

    /// A USDT note can exist at several code locations with different
    /// argument recipes; each location gets its own program.
    fn compile_usdt_match(
        &mut self,
        probe: &Probe,
        matched: &str,
        saved_ids: super::AsyncIds,
    ) -> Result<()> {
        let attach_point = self.attach_point()?.clone();

        // Matches carry `target:ns:function`.
        let mut parts = matched.splitn(3, ':');
        let (target, ns, func_id) = match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(n), Some(f)) => (t.to_string(), n.to_string(), f.to_string()),
            _ => {
                return Err(CodeGenError::Internal(format!(
                    "usdt match \"{matched}\" is not target:ns:function"
                )))
            }
        };

        let mut resolved = attach_point;
        resolved.target = target;
        resolved.ns = ns;
        self.probefull = resolved.name_with(&func_id);

        let usdt = self
            .runtime
            .catalog
            .usdt_info(self.runtime.pid, &resolved.target, &resolved.ns, &func_id)
            .ok_or_else(|| CodeGenError::UsdtNotFound(self.probefull.clone()))?;
        let num_locations = usdt.num_locations();
        resolved.usdt = Some(usdt);
        self.current_attach_point = Some(resolved);

        self.current_usdt_location_index = 0;
        for i in 0..num_locations {
            self.ids = saved_ids;
            let section_base = format!("{}_loc{i}", self.probefull);
            self.generate_program(probe, &section_base)?;
            self.current_usdt_location_index += 1;
        }
        Ok(())
    }

    fn set_tracepoint_record_from_attach_point(&mut self) -> Result<()> {
        let attach_point = self.attach_point()?;
        if attach_point.kind() == ProbeKind::Tracepoint {
            let category = attach_point.target.clone();
            let func = attach_point.func.clone();
            self.tracepoint_record = self.runtime.catalog.tracepoint_record_name(&category, &func);
        } else {
            self.tracepoint_record.clear();
        }
        Ok(())
    }

    /// Signature `(i8* ctx) -> i64`, section `s_<name>_<index>` with a
    /// per-probe-name monotonic index, predicate gate, body, `return 0`.
    fn generate_program(&mut self, probe: &Probe, section_base: &str) -> Result<FunctionValue<'ctx>> {
        let index = {
            let counter = self
                .next_probe_index
                .entry(probe.name())
                .or_insert(1);
            let index = *counter;
            *counter += 1;
            index
        };

        let fn_type = self
            .i64_t()
            .fn_type(&[self.ptr_t().into()], false);
        let function = self.module.add_function(section_base, fn_type, None);
        function.set_section(Some(&format!("s_{section_base}_{index}")));

        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);

        self.ctx_param = Some(
            function
                .get_first_param()
                .ok_or_else(|| CodeGenError::Internal("program has no context".to_string()))?
                .into_pointer_value(),
        );

        if let Some(pred) = &probe.predicate {
            self.compile_predicate(pred)?;
        }

        self.variables.clear();
        for stmt in &probe.stmts {
            self.compile_statement(stmt)?;
        }
        self.create_ret_zero()?;

        info!(program = %section_base, index, "emitted program");
        Ok(function)
    }
}
