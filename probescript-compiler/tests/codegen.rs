//! End-to-end code generation tests: build typed programs, generate IR and
//! check the emitted module shape.

use inkwell::context::Context;
use probescript_compiler::ast::{
    AttachPoint, BinaryOp, ExprKind, Expression, MapAccess, Probe, Program, SourceLocation,
    Statement, UsdtArg, UsdtArgKind, UsdtInfo, UsdtLocation,
};
use probescript_compiler::runtime::{
    MapDescriptor, ProbeCatalog, RuntimeContext, SpecialMap, SymbolResolver,
};
use probescript_compiler::types::{SizedType, StackType};
use probescript_compiler::{CodeGen, CodeGenError};
use probescript_protocol::{ArgKind, ArgType, FormatEntry};

fn loc() -> SourceLocation {
    SourceLocation::new(1, 1)
}

fn int(n: i64) -> Expression {
    Expression::new(ExprKind::Integer(n), SizedType::int64(), loc())
}

fn string(s: &str, size: usize) -> Expression {
    Expression::new(ExprKind::Str(s.to_string()), SizedType::string(size), loc())
}

fn builtin(name: &str, ty: SizedType) -> Expression {
    Expression::new(ExprKind::Builtin(name.to_string()), ty, loc())
}

fn binop(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::new(
        ExprKind::Binop {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        SizedType::uint64(),
        loc(),
    )
}

fn map_access(ident: &str, keys: Vec<Expression>) -> MapAccess {
    MapAccess {
        ident: ident.to_string(),
        keys,
        ty: SizedType::uint64(),
        loc: loc(),
    }
}

fn aggregation(func: &str, map: MapAccess, args: Vec<Expression>) -> Statement {
    let expr = Expression::new(
        ExprKind::Call {
            func: func.to_string(),
            args,
            map: Some(map.clone()),
        },
        SizedType::none(),
        loc(),
    );
    Statement::AssignMap {
        map,
        expr,
        loc: loc(),
    }
}

fn call_stmt(func: &str, args: Vec<Expression>) -> Statement {
    Statement::Expr(Expression::new(
        ExprKind::Call {
            func: func.to_string(),
            args,
            map: None,
        },
        SizedType::none(),
        loc(),
    ))
}

fn attach_point(provider: &str, target: &str, func: &str) -> AttachPoint {
    AttachPoint {
        provider: provider.to_string(),
        target: target.to_string(),
        ns: String::new(),
        func: func.to_string(),
        usdt: None,
    }
}

fn probe(attach_points: Vec<AttachPoint>, predicate: Option<Expression>, stmts: Vec<Statement>) -> Probe {
    Probe {
        attach_points,
        predicate,
        stmts,
        need_expansion: false,
    }
}

struct FixedMatches(Vec<String>);

impl ProbeCatalog for FixedMatches {
    fn wildcard_matches(&self, _attach_point: &AttachPoint) -> Vec<String> {
        self.0.clone()
    }
    fn usdt_info(
        &self,
        _pid: Option<u32>,
        _target: &str,
        _ns: &str,
        _func: &str,
    ) -> Option<UsdtInfo> {
        Some(UsdtInfo {
            locations: vec![
                UsdtLocation {
                    args: vec![UsdtArg {
                        size: 8,
                        signed: false,
                        kind: UsdtArgKind::Register {
                            reg: "di".to_string(),
                        },
                    }],
                },
                UsdtLocation {
                    args: vec![UsdtArg {
                        size: 4,
                        signed: true,
                        kind: UsdtArgKind::Memory {
                            reg: "bp".to_string(),
                            offset: -8,
                        },
                    }],
                },
            ],
        })
    }
    fn tracepoint_record_name(&self, category: &str, event: &str) -> String {
        format!("tracepoint_{category}_{event}")
    }
}

struct FixedSymbols;

impl SymbolResolver for FixedSymbols {
    fn resolve_kname(&self, name: &str) -> Option<u64> {
        (name == "vfs_read").then_some(0xffff_ffff_8100_0000)
    }
    fn resolve_uname(&self, _name: &str, _target: &str) -> Option<probescript_compiler::runtime::Symbol> {
        None
    }
    fn resolve_cgroupid(&self, _path: &str) -> Option<u64> {
        None
    }
}

fn test_runtime(matches: Vec<&str>) -> RuntimeContext {
    let mut rt = RuntimeContext::new(
        Box::new(FixedSymbols),
        Box::new(FixedMatches(matches.into_iter().map(String::from).collect())),
    );
    rt.maps.insert_special(
        SpecialMap::PerfEvent,
        MapDescriptor {
            fd: 3,
            id: 0,
            value_type: SizedType::uint64(),
        },
    );
    rt.maps.insert_special(
        SpecialMap::Stack(StackType::default()),
        MapDescriptor {
            fd: 4,
            id: 1,
            value_type: SizedType::uint64(),
        },
    );
    rt
}

fn add_map(rt: &mut RuntimeContext, ident: &str, fd: i32, id: u32) {
    rt.maps.insert(
        ident,
        MapDescriptor {
            fd,
            id,
            value_type: SizedType::uint64(),
        },
    );
}

#[test]
fn test_count_by_comm_emits_one_program_per_attach_point() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@", 5, 2);

    let comm = builtin("comm", SizedType::string(16));
    let program = Program {
        probes: vec![probe(
            vec![attach_point("kprobe", "", "do_nanosleep")],
            None,
            vec![aggregation("count", map_access("@", vec![comm]), vec![])],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let func = gen.module.get_function("kprobe:do_nanosleep").unwrap();
    assert_eq!(
        func.get_section().unwrap().to_str().unwrap(),
        "s_kprobe:do_nanosleep_1"
    );
    let ir = gen.dump_ir();
    assert!(ir.contains("llvm.bpf.pseudo"));
    // lookup miss falls back to a zeroed value before the increment
    assert!(ir.contains("lookup_failure"));
}

#[test]
fn test_hist_lowers_through_inlined_log2() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@start", 5, 2);
    add_map(&mut rt, "@ms", 6, 3);

    let begin = probe(
        vec![attach_point("BEGIN", "", "")],
        None,
        vec![Statement::AssignMap {
            map: map_access("@start", vec![]),
            expr: builtin("nsecs", SizedType::uint64()),
            loc: loc(),
        }],
    );
    let delta = binop(
        BinaryOp::Divide,
        binop(
            BinaryOp::Subtract,
            builtin("nsecs", SizedType::uint64()),
            Expression::new(ExprKind::Map(map_access("@start", vec![])), SizedType::uint64(), loc()),
        ),
        int(1_000_000),
    );
    let kretprobe = probe(
        vec![attach_point("kretprobe", "", "do_sys_open")],
        None,
        vec![aggregation("hist", map_access("@ms", vec![]), vec![delta])],
    );

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&Program {
        probes: vec![begin, kretprobe],
    })
    .unwrap();

    assert!(gen.module.get_function("BEGIN").is_some());
    assert!(gen.module.get_function("kretprobe:do_sys_open").is_some());
    let log2 = gen.module.get_function("log2").unwrap();
    assert_eq!(log2.get_section().unwrap().to_str().unwrap(), "helpers");
    let ir = gen.dump_ir();
    assert!(ir.contains("hist.is_less_than_zero"));
    assert!(ir.contains("alwaysinline") || ir.contains("#0"));
}

#[test]
fn test_predicate_gates_printf_and_publishes_offsets() {
    let mut rt = test_runtime(vec![]);
    rt.printf_args.push(FormatEntry::new(
        "%d %s\n",
        vec![
            ArgType::new(ArgKind::UInt, 8),
            ArgType::new(ArgKind::String, 16),
        ],
    ));

    let predicate = binop(
        BinaryOp::Equal,
        builtin("pid", SizedType::uint64()),
        int(1234),
    );
    let printf = call_stmt(
        "printf",
        vec![
            string("%d %s\n", 8),
            builtin("pid", SizedType::uint64()),
            builtin("comm", SizedType::string(16)),
        ],
    );
    let program = Program {
        probes: vec![probe(
            vec![attach_point("tracepoint", "syscalls", "sys_enter_read")],
            Some(predicate),
            vec![printf],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let ir = gen.dump_ir();
    assert!(ir.contains("pred_false"));
    assert!(ir.contains("pred_true"));
    drop(gen);

    // {id: u64, pid: u64, comm: [16 x u8]} lays out at offsets 8 and 16.
    let entry = rt.printf_args.get(0).unwrap();
    assert_eq!(entry.args[0].offset, 8);
    assert_eq!(entry.args[1].offset, 16);
}

#[test]
fn test_ustack_id_is_packed_with_pid() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@", 5, 2);

    let ustack = builtin("ustack", SizedType::ustack(StackType::default()));
    let program = Program {
        probes: vec![probe(
            vec![attach_point("uprobe", "/bin/bash", "readline")],
            None,
            vec![aggregation("count", map_access("@", vec![ustack]), vec![])],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let ir = gen.dump_ir();
    assert!(ir.contains("pid_high"));
    assert!(ir.contains("ustack_id"));
}

#[test]
fn test_if_else_splits_into_distinct_map_updates() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@big", 5, 2);
    add_map(&mut rt, "@small", 6, 3);

    let cond = binop(
        BinaryOp::GreaterThan,
        builtin("arg2", SizedType::uint64()),
        int(4096),
    );
    let program = Program {
        probes: vec![probe(
            vec![attach_point("kprobe", "", "vfs_read")],
            None,
            vec![Statement::If {
                cond,
                then_stmts: vec![aggregation("count", map_access("@big", vec![]), vec![])],
                else_stmts: Some(vec![aggregation(
                    "count",
                    map_access("@small", vec![]),
                    vec![],
                )]),
            }],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let ir = gen.dump_ir();
    assert!(ir.contains("if_body"));
    assert!(ir.contains("else_body"));
    assert!(ir.contains("if_end"));
}

#[test]
fn test_strncmp_exit_emits_async_record_and_dead_block() {
    let mut rt = test_runtime(vec![]);

    let strncmp = Expression::new(
        ExprKind::Call {
            func: "strncmp".to_string(),
            args: vec![
                builtin("comm", SizedType::string(16)),
                string("ssh", 4),
                int(3),
            ],
            map: None,
        },
        SizedType::uint64(),
        loc(),
    );
    let cond = binop(BinaryOp::Equal, strncmp, int(0));
    let program = Program {
        probes: vec![probe(
            vec![attach_point("profile", "hz", "99")],
            None,
            vec![Statement::If {
                cond,
                then_stmts: vec![call_stmt("exit", vec![])],
                else_stmts: None,
            }],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let ir = gen.dump_ir();
    // literal compare without a stack copy of "ssh"
    assert!(ir.contains("strcmp.loop"));
    // exit record class tag, then the dead block for trailing statements
    assert!(ir.contains("30000"));
    assert!(ir.contains("deadcode"));
}

#[test]
fn test_wildcard_expansion_allocates_monotonic_sections() {
    let mut rt = test_runtime(vec!["do_sys_open", "do_sys_close"]);
    add_map(&mut rt, "@", 5, 2);

    let mut p = probe(
        vec![attach_point("kprobe", "", "do_sys_*")],
        None,
        vec![aggregation(
            "count",
            map_access(
                "@",
                vec![builtin("probe", SizedType::probe_name())],
            ),
            vec![],
        )],
    );
    p.need_expansion = true;

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&Program { probes: vec![p] }).unwrap();

    let first = gen.module.get_function("kprobe:do_sys_open").unwrap();
    let second = gen.module.get_function("kprobe:do_sys_close").unwrap();
    assert_eq!(
        first.get_section().unwrap().to_str().unwrap(),
        "s_kprobe:do_sys_open_1"
    );
    assert_eq!(
        second.get_section().unwrap().to_str().unwrap(),
        "s_kprobe:do_sys_close_2"
    );
    drop(gen);

    // probe ids assigned in emission order, stable across reruns
    assert_eq!(rt.probe_ids.resolve(0), Some("kprobe:do_sys_open"));
    assert_eq!(rt.probe_ids.resolve(1), Some("kprobe:do_sys_close"));
}

#[test]
fn test_probe_registry_is_deterministic_across_runs() {
    let run = || {
        let mut rt = test_runtime(vec!["do_sys_open", "do_sys_close"]);
        add_map(&mut rt, "@", 5, 2);
        let mut p = probe(
            vec![attach_point("kprobe", "", "do_sys_*")],
            None,
            vec![aggregation(
                "count",
                map_access("@", vec![builtin("probe", SizedType::probe_name())]),
                vec![],
            )],
        );
        p.need_expansion = true;
        let context = Context::create();
        let mut gen = CodeGen::new(&context, &mut rt).unwrap();
        gen.generate_ir(&Program { probes: vec![p] }).unwrap();
        drop(gen);
        rt.probe_ids.iter().map(String::from).collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_usdt_probes_expand_per_location() {
    let mut rt = test_runtime(vec!["/bin/bash:bash:readline"]);
    add_map(&mut rt, "@", 5, 2);

    let p = probe(
        vec![attach_point("usdt", "/bin/bash", "readline")],
        None,
        vec![aggregation(
            "count",
            map_access("@", vec![builtin("arg0", SizedType::uint64())]),
            vec![],
        )],
    );

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&Program { probes: vec![p] }).unwrap();

    // two locations, one program each, suffixed _loc<i>
    assert!(gen
        .module
        .get_function("usdt:/bin/bash:bash:readline_loc0")
        .is_some());
    assert!(gen
        .module
        .get_function("usdt:/bin/bash:bash:readline_loc1")
        .is_some());
}

#[test]
fn test_modulo_is_always_unsigned() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@", 5, 2);

    let modulo = binop(
        BinaryOp::Modulo,
        Expression::new(ExprKind::Integer(-7), SizedType::int64(), loc()),
        int(3),
    );
    let program = Program {
        probes: vec![probe(
            vec![attach_point("kprobe", "", "vfs_read")],
            None,
            vec![Statement::AssignMap {
                map: map_access("@", vec![]),
                expr: modulo,
                loc: loc(),
            }],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let ir = gen.dump_ir();
    assert!(ir.contains("urem"));
    assert!(!ir.contains("srem"));
}

#[test]
fn test_short_circuit_and_evaluates_rhs_conditionally() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@", 5, 2);

    let and = binop(
        BinaryOp::LogicalAnd,
        builtin("pid", SizedType::uint64()),
        builtin("tid", SizedType::uint64()),
    );
    let program = Program {
        probes: vec![probe(
            vec![attach_point("kprobe", "", "vfs_read")],
            None,
            vec![Statement::AssignMap {
                map: map_access("@", vec![]),
                expr: and,
                loc: loc(),
            }],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let ir = gen.dump_ir();
    // the right operand lives in its own block, entered only when lhs != 0
    assert!(ir.contains("and_lhs_true"));
    assert!(ir.contains("and_merge"));
}

#[test]
fn test_min_uses_inverted_encoding() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@", 5, 2);

    let program = Program {
        probes: vec![probe(
            vec![attach_point("kprobe", "", "vfs_read")],
            None,
            vec![aggregation(
                "min",
                map_access("@", vec![]),
                vec![builtin("arg0", SizedType::uint64())],
            )],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();

    let ir = gen.dump_ir();
    assert!(ir.contains("4294967295"));
    assert!(ir.contains("min.ge"));
}

#[test]
fn test_pipeline_enforces_phase_order() {
    let mut rt = test_runtime(vec![]);
    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();

    match gen.optimize() {
        Err(CodeGenError::Phase { expected, actual }) => {
            assert_eq!(expected, "IR");
            assert_eq!(actual, "INIT");
        }
        other => panic!("expected phase error, got {other:?}"),
    }
    assert!(gen.emit().is_err());

    gen.generate_ir(&Program { probes: vec![] }).unwrap();
    assert!(gen.generate_ir(&Program { probes: vec![] }).is_err());
    gen.optimize().unwrap();
    let object = gen.emit().unwrap();
    assert!(!object.as_bytes().is_empty());
}

#[test]
fn test_emit_elf_writes_relocatable_object() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@", 5, 2);

    let program = Program {
        probes: vec![probe(
            vec![attach_point("kprobe", "", "do_nanosleep")],
            None,
            vec![aggregation("count", map_access("@", vec![]), vec![])],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();
    gen.optimize().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probes.o");
    gen.emit_elf(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    // ELF magic
    assert_eq!(&bytes[..4], b"\x7fELF");
}

#[test]
fn test_helper_error_sites_are_registered_densely() {
    let mut rt = test_runtime(vec![]);
    add_map(&mut rt, "@", 5, 2);

    let program = Program {
        probes: vec![probe(
            vec![attach_point("kprobe", "", "do_nanosleep")],
            None,
            vec![aggregation("count", map_access("@", vec![]), vec![])],
        )],
    };

    let context = Context::create();
    let mut gen = CodeGen::new(&context, &mut rt).unwrap();
    gen.generate_ir(&program).unwrap();
    drop(gen);

    // lookup miss + update guard at minimum
    assert!(rt.helper_errors.len() >= 2);
    let mut ids: Vec<u64> = rt.helper_errors.keys().copied().collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..ids.len() as u64).collect::<Vec<_>>());
}
