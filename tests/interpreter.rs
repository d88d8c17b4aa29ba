//! Hand-assembled programs driven straight through the Runner.

use flow_vm::interpreter::Fault;
use flow_vm::matching::{MatchCase, MatchOp, MatchTable};
use flow_vm::memory::ArenaLimits;
use flow_vm::{FlowType, Instruction, NativeRegistry, Opcode, Program, Runner};

fn ins(op: Opcode, a: u16, b: u16, c: u16) -> Instruction {
    Instruction::new(op, a, b, c)
}

fn run_program(program: &Program, registry: &NativeRegistry) -> bool {
    program.validate().expect("program must validate");
    let handler = program.handler(0).expect("one handler");
    Runner::new(program, handler, registry).run()
}

#[test]
fn exit_immediate_yields_verdict() {
    let mut program = Program::new();
    program.create_handler(
        "main",
        1,
        vec![ins(Opcode::Imov, 0, 1, 0), ins(Opcode::Exit, 1, 0, 0)],
    );
    assert!(run_program(&program, &NativeRegistry::new()));

    let mut deny = Program::new();
    deny.create_handler("main", 1, vec![ins(Opcode::Exit, 0, 0, 0)]);
    assert!(!run_program(&deny, &NativeRegistry::new()));
}

#[test]
fn string_prefix_branches_to_accept() {
    let mut program = Program::new();
    let hello = program.add_string(b"hello");
    let he = program.add_string(b"he");
    program.create_handler(
        "main",
        3,
        vec![
            ins(Opcode::Sconst, 0, hello, 0),
            ins(Opcode::Sconst, 1, he, 0),
            ins(Opcode::Scmpbeg, 2, 0, 1),
            ins(Opcode::Jz, 2, 5, 0),
            ins(Opcode::Exit, 1, 0, 0),
            ins(Opcode::Exit, 0, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn native_function_writes_result_slot() {
    let mut registry = NativeRegistry::new();
    registry.register_function("len", FlowType::Number, |params| {
        let length = params.string(1).len();
        params.set_number(length as i64);
    });

    let mut program = Program::new();
    let len_id = program
        .add_native(flow_vm::NativeKind::Function, "len", FlowType::Number)
        .unwrap();
    let abcd = program.add_string(b"abcd");
    program.create_handler(
        "main",
        4,
        vec![
            ins(Opcode::Sconst, 1, abcd, 0),
            ins(Opcode::Imov, 0, 0, 0),
            ins(Opcode::Call, len_id, 2, 0),
            ins(Opcode::Imov, 2, 4, 0),
            ins(Opcode::Ncmpeq, 3, 0, 2),
            ins(Opcode::Jn, 3, 7, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    program.link(&registry).unwrap();
    assert!(run_program(&program, &registry));
}

fn match_program(input: &[u8]) -> (Program, NativeRegistry) {
    let mut program = Program::new();
    let a = program.add_string(b"/a");
    let b = program.add_string(b"/b");
    let subject = program.add_string(input);
    let table = program.add_match(MatchTable::new(
        MatchOp::Eq,
        vec![
            MatchCase {
                literal: u32::from(a),
                target: 2,
            },
            MatchCase {
                literal: u32::from(b),
                target: 3,
            },
        ],
        4,
    ));
    program.create_handler(
        "main",
        1,
        vec![
            ins(Opcode::Sconst, 0, subject, 0),
            ins(Opcode::Smatcheq, 0, table, 0),
            ins(Opcode::Exit, 1, 0, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    (program, NativeRegistry::new())
}

#[test]
fn match_eq_routes_by_literal() {
    let (program, registry) = match_program(b"/a");
    assert!(run_program(&program, &registry));

    let (program, registry) = match_program(b"/b");
    assert!(!run_program(&program, &registry));

    // No case matches; the else target decides.
    let (program, registry) = match_program(b"/c");
    assert!(run_program(&program, &registry));
}

#[test]
fn match_prefix_prefers_longest_literal() {
    let mut program = Program::new();
    let root = program.add_string(b"/");
    let api = program.add_string(b"/api");
    let subject = program.add_string(b"/api/v1/users");
    let table = program.add_match(MatchTable::new(
        MatchOp::Prefix,
        vec![
            MatchCase {
                literal: u32::from(root),
                target: 2,
            },
            MatchCase {
                literal: u32::from(api),
                target: 3,
            },
        ],
        2,
    ));
    program.create_handler(
        "main",
        1,
        vec![
            ins(Opcode::Sconst, 0, subject, 0),
            ins(Opcode::Smatchbeg, 0, table, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn division_by_zero_produces_zero() {
    let mut program = Program::new();
    program.create_handler(
        "main",
        3,
        vec![
            ins(Opcode::Imov, 0, 10, 0),
            ins(Opcode::Imov, 1, 0, 0),
            ins(Opcode::Ndiv, 2, 0, 1),
            ins(Opcode::Jn, 2, 5, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(!run_program(&program, &NativeRegistry::new()));
}

#[test]
fn native_handler_short_circuits_the_run() {
    let mut registry = NativeRegistry::new();
    registry.register_handler("accept", |params| params.set_verdict(true));
    registry.register_handler("pass", |params| params.set_verdict(false));

    let mut program = Program::new();
    let accept = program
        .add_native(flow_vm::NativeKind::Handler, "accept", FlowType::Boolean)
        .unwrap();
    program.create_handler(
        "main",
        1,
        vec![
            ins(Opcode::Imov, 0, 0, 0),
            ins(Opcode::Handler, accept, 1, 0),
            ins(Opcode::Exit, 0, 0, 0),
        ],
    );
    program.link(&registry).unwrap();
    assert!(run_program(&program, &registry));

    let mut program = Program::new();
    let pass = program
        .add_native(flow_vm::NativeKind::Handler, "pass", FlowType::Boolean)
        .unwrap();
    program.create_handler(
        "main",
        1,
        vec![
            ins(Opcode::Imov, 0, 0, 0),
            ins(Opcode::Handler, pass, 1, 0),
            ins(Opcode::Exit, 0, 0, 0),
        ],
    );
    program.link(&registry).unwrap();
    assert!(!run_program(&program, &registry));
}

#[test]
fn number_to_string_round_trips() {
    let mut program = Program::new();
    let minus = program.add_number(-123_456);
    program.create_handler(
        "main",
        5,
        vec![
            ins(Opcode::Nconst, 0, minus, 0),
            ins(Opcode::I2s, 1, 0, 0),
            ins(Opcode::S2i, 2, 1, 0),
            ins(Opcode::Nconst, 3, minus, 0),
            ins(Opcode::Ncmpeq, 4, 2, 3),
            ins(Opcode::Jn, 4, 7, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn concat_substring_and_length_agree() {
    let mut program = Program::new();
    let foo = program.add_string(b"foo");
    let bar = program.add_string(b"bar");
    program.create_handler(
        "main",
        11,
        vec![
            ins(Opcode::Sconst, 0, foo, 0),
            ins(Opcode::Sconst, 1, bar, 0),
            ins(Opcode::Sadd, 2, 0, 1),
            ins(Opcode::Slen, 3, 2, 0),
            ins(Opcode::Imov, 4, 6, 0),
            ins(Opcode::Ncmpeq, 5, 3, 4),
            // substr(foobar, 3, 3) == "bar"
            ins(Opcode::Imov, 6, 3, 0),
            ins(Opcode::Imov, 7, 3, 0),
            ins(Opcode::Ssubstr, 8, 2, 6),
            ins(Opcode::Scmpeq, 9, 8, 1),
            ins(Opcode::Band, 10, 5, 9),
            ins(Opcode::Jn, 10, 13, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn cidr_membership_checks_both_ways() {
    let mut program = Program::new();
    let inside = program.add_ipaddr("192.168.1.7".parse().unwrap());
    let outside = program.add_ipaddr("10.0.0.1".parse().unwrap());
    let net = program.add_cidr("192.168.0.0/16".parse().unwrap());
    program.create_handler(
        "main",
        7,
        vec![
            ins(Opcode::Pconst, 0, inside, 0),
            ins(Opcode::Cconst, 1, net, 0),
            ins(Opcode::Pincidr, 2, 0, 1),
            ins(Opcode::Pconst, 3, outside, 0),
            ins(Opcode::Pincidr, 4, 3, 1),
            ins(Opcode::Bnot, 5, 4, 0),
            ins(Opcode::Band, 6, 2, 5),
            ins(Opcode::Jn, 6, 9, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn ip_to_string_is_canonical() {
    let mut program = Program::new();
    let ip = program.add_ipaddr("192.168.1.7".parse().unwrap());
    let text = program.add_string(b"192.168.1.7");
    program.create_handler(
        "main",
        4,
        vec![
            ins(Opcode::Pconst, 0, ip, 0),
            ins(Opcode::P2s, 1, 0, 0),
            ins(Opcode::Sconst, 2, text, 0),
            ins(Opcode::Scmpeq, 3, 1, 2),
            ins(Opcode::Jn, 3, 6, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn regex_match_publishes_capture_groups() {
    let mut program = Program::new();
    let re = program.add_regex(r"^/(\w+)/(\d+)$").unwrap();
    let subject = program.add_string(b"/users/42");
    let expected = program.add_string(b"42");
    program.create_handler(
        "main",
        6,
        vec![
            ins(Opcode::Sconst, 0, subject, 0),
            ins(Opcode::Sregmatch, 1, 0, re),
            ins(Opcode::Jz, 1, 8, 0),
            ins(Opcode::Imov, 2, 2, 0),
            ins(Opcode::Sreggroup, 3, 2, 0),
            ins(Opcode::Sconst, 4, expected, 0),
            ins(Opcode::Scmpeq, 5, 3, 4),
            ins(Opcode::Jn, 5, 9, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn missing_regex_group_reads_as_empty_string() {
    let mut program = Program::new();
    let re = program.add_regex(r"^/(\w+)$").unwrap();
    let subject = program.add_string(b"/users");
    program.create_handler(
        "main",
        5,
        vec![
            ins(Opcode::Sconst, 0, subject, 0),
            ins(Opcode::Sregmatch, 1, 0, re),
            // Group 9 does not exist; SREGGROUP must hand back "".
            ins(Opcode::Imov, 2, 9, 0),
            ins(Opcode::Sreggroup, 3, 2, 0),
            ins(Opcode::Sisempty, 4, 3, 0),
            ins(Opcode::Jn, 4, 7, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn number_array_feeds_native_sum() {
    let mut registry = NativeRegistry::new();
    registry.register_function("sum", FlowType::Number, |params| {
        let total: i64 = params.number_array(1).iter().sum();
        params.set_number(total);
    });

    let mut program = Program::new();
    let sum = program
        .add_native(flow_vm::NativeKind::Function, "sum", FlowType::Number)
        .unwrap();
    program.create_handler(
        "main",
        4,
        vec![
            ins(Opcode::Annew, 1, 3, 0),
            ins(Opcode::Aniniti, 1, 0, 1),
            ins(Opcode::Aniniti, 1, 1, 2),
            ins(Opcode::Aniniti, 1, 2, 3),
            ins(Opcode::Imov, 0, 0, 0),
            ins(Opcode::Call, sum, 2, 0),
            ins(Opcode::Imov, 2, 6, 0),
            ins(Opcode::Ncmpeq, 3, 0, 2),
            ins(Opcode::Jn, 3, 10, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    program.link(&registry).unwrap();
    assert!(run_program(&program, &registry));
}

#[test]
fn string_array_elements_are_copied() {
    let mut registry = NativeRegistry::new();
    registry.register_function("count", FlowType::Number, |params| {
        let items = params.string_array(1).len();
        params.set_number(items as i64);
    });

    let mut program = Program::new();
    let count = program
        .add_native(flow_vm::NativeKind::Function, "count", FlowType::Number)
        .unwrap();
    let a = program.add_string(b"a");
    let b = program.add_string(b"bb");
    program.create_handler(
        "main",
        5,
        vec![
            ins(Opcode::Asnew, 1, 2, 0),
            ins(Opcode::Sconst, 2, a, 0),
            ins(Opcode::Asinit, 1, 0, 2),
            ins(Opcode::Sconst, 2, b, 0),
            ins(Opcode::Asinit, 1, 1, 2),
            ins(Opcode::Imov, 0, 0, 0),
            ins(Opcode::Call, count, 2, 0),
            ins(Opcode::Imov, 3, 2, 0),
            ins(Opcode::Ncmpeq, 4, 0, 3),
            ins(Opcode::Jn, 4, 11, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    program.link(&registry).unwrap();
    assert!(run_program(&program, &registry));
}

#[test]
fn url_codec_round_trips() {
    let mut program = Program::new();
    let raw = program.add_string(b"a b+c%");
    let encoded = program.add_string(b"a+b%2Bc%25");
    program.create_handler(
        "main",
        7,
        vec![
            ins(Opcode::Sconst, 0, raw, 0),
            ins(Opcode::Surlenc, 1, 0, 0),
            ins(Opcode::Sconst, 2, encoded, 0),
            ins(Opcode::Scmpeq, 3, 1, 2),
            ins(Opcode::Surldec, 4, 1, 0),
            ins(Opcode::Scmpeq, 5, 4, 0),
            ins(Opcode::Band, 6, 3, 5),
            ins(Opcode::Jn, 6, 9, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn tick_counter_is_monotonic() {
    let mut program = Program::new();
    program.create_handler(
        "main",
        3,
        vec![
            ins(Opcode::Nticks, 0, 0, 0),
            ins(Opcode::Nop, 0, 0, 0),
            ins(Opcode::Nticks, 1, 0, 0),
            ins(Opcode::Ncmplt, 2, 0, 1),
            ins(Opcode::Jn, 2, 6, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}

#[test]
fn string_arena_exhaustion_aborts_with_false() {
    let mut program = Program::new();
    let big = program.add_string(&[b'x'; 256]);
    program.create_handler(
        "main",
        3,
        vec![
            ins(Opcode::Sconst, 0, big, 0),
            ins(Opcode::Sadd, 1, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    program.validate().unwrap();
    let registry = NativeRegistry::new();
    let handler = program.handler(0).unwrap();
    let limits = ArenaLimits {
        string_bytes: 64,
        object_bytes: 64,
    };

    let mut runner = Runner::with_limits(&program, handler, &registry, limits);
    assert!(!runner.run());

    let mut runner = Runner::with_limits(&program, handler, &registry, limits);
    assert!(matches!(runner.run_checked(), Err(Fault::Memory(_))));
}

#[test]
fn unvalidated_pool_reference_faults_instead_of_panicking() {
    let mut program = Program::new();
    // Number pool is empty; validation would reject this program.
    program.create_handler(
        "main",
        1,
        vec![ins(Opcode::Nconst, 0, 5, 0), ins(Opcode::Exit, 1, 0, 0)],
    );
    assert!(program.validate().is_err());

    let registry = NativeRegistry::new();
    let handler = program.handler(0).unwrap();
    let mut runner = Runner::new(&program, handler, &registry);
    assert!(matches!(
        runner.run_checked(),
        Err(Fault::PoolRange { pool: "numbers", .. })
    ));
}

#[test]
fn user_context_reaches_native_callbacks() {
    struct Request {
        path: &'static str,
        seen: bool,
    }

    let mut registry = NativeRegistry::new();
    registry.register_handler("req.accept_api", |params| {
        let verdict = {
            let request = params
                .runner()
                .context_mut::<Request>()
                .expect("request context");
            request.seen = true;
            request.path.starts_with("/api")
        };
        params.set_verdict(verdict);
    });

    let mut program = Program::new();
    let accept = program
        .add_native(
            flow_vm::NativeKind::Handler,
            "req.accept_api",
            FlowType::Boolean,
        )
        .unwrap();
    program.create_handler(
        "main",
        1,
        vec![
            ins(Opcode::Imov, 0, 0, 0),
            ins(Opcode::Handler, accept, 1, 0),
            ins(Opcode::Exit, 0, 0, 0),
        ],
    );
    program.link(&registry).unwrap();
    program.validate().unwrap();

    let handler = program.handler(0).unwrap();
    let mut request = Request {
        path: "/api/users",
        seen: false,
    };
    let mut runner = Runner::new(&program, handler, &registry);
    runner.set_user_context(&mut request);
    assert!(runner.run());
    assert!(request.seen);
}

#[test]
fn shift_amounts_clamp_to_six_bits() {
    let mut program = Program::new();
    let expected = program.add_number(4);
    program.create_handler(
        "main",
        5,
        vec![
            ins(Opcode::Imov, 0, 1, 0),
            // 66 & 63 == 2
            ins(Opcode::Imov, 1, 66, 0),
            ins(Opcode::Nshl, 2, 0, 1),
            ins(Opcode::Nconst, 3, expected, 0),
            ins(Opcode::Ncmpeq, 4, 2, 3),
            ins(Opcode::Jn, 4, 7, 0),
            ins(Opcode::Exit, 0, 0, 0),
            ins(Opcode::Exit, 1, 0, 0),
        ],
    );
    assert!(run_program(&program, &NativeRegistry::new()));
}
