//! Program image round-trips and registry descriptor serialization.

use flow_vm::ast::{CalleeKind, Expr, HandlerDecl, Stmt, Unit};
use flow_vm::compiler::compile_linked;
use flow_vm::matching::MatchOp;
use flow_vm::serial::{read_program, write_program, SerialError};
use flow_vm::{generate, FlowType, Literal, NativeRegistry, Opcode, Runner};

fn sample_registry() -> NativeRegistry {
    let mut registry = NativeRegistry::new();
    registry.register_handler("accept", |params| params.set_verdict(true));
    registry.register_function("strlen", FlowType::Number, |params| {
        let length = params.string(1).len() as i64;
        params.set_number(length);
    });
    registry
}

/// A unit touching every pool: numbers, strings, IPs, CIDRs, regexes,
/// match tables and natives.
fn sample_unit() -> Unit {
    let call_accept = Stmt::Expr(Expr::Call {
        callee: "accept".into(),
        kind: CalleeKind::Handler,
        ty: FlowType::Boolean,
        args: Vec::new(),
    });
    Unit {
        variables: Vec::new(),
        handlers: vec![HandlerDecl {
            name: "main".into(),
            variables: Vec::new(),
            body: Stmt::Compound(vec![
                Stmt::Cond {
                    condition: Expr::Binary {
                        op: Opcode::Pincidr,
                        ty: FlowType::Boolean,
                        lhs: Box::new(Expr::Literal(Literal::IpAddr(
                            "192.168.1.7".parse().unwrap(),
                        ))),
                        rhs: Box::new(Expr::Literal(Literal::Cidr(
                            "192.168.0.0/16".parse().unwrap(),
                        ))),
                    },
                    then_stmt: Box::new(Stmt::Match {
                        condition: Expr::string("/users/42"),
                        op: MatchOp::Regex,
                        cases: vec![(Literal::Regex(r"^/users/\d+$".into()), call_accept)],
                        else_stmt: None,
                    }),
                    else_stmt: None,
                },
                Stmt::Expr(Expr::Call {
                    callee: "strlen".into(),
                    kind: CalleeKind::Function,
                    ty: FlowType::Number,
                    args: vec![Expr::string("unused tail")],
                }),
            ]),
        }],
    }
}

#[test]
fn image_round_trip_preserves_pools_and_verdict() {
    let registry = sample_registry();
    let ir = generate(&sample_unit()).unwrap();
    let program = compile_linked(&ir, &registry).unwrap();

    let mut image = Vec::new();
    write_program(&program, &mut image).unwrap();

    let mut loaded = read_program(&mut image.as_slice()).unwrap();
    assert_eq!(loaded.numbers(), program.numbers());
    assert_eq!(loaded.strings(), program.strings());
    assert_eq!(loaded.ipaddrs(), program.ipaddrs());
    assert_eq!(loaded.cidrs(), program.cidrs());
    assert_eq!(loaded.matches(), program.matches());
    assert_eq!(loaded.handlers(), program.handlers());
    assert_eq!(
        loaded
            .regexes()
            .iter()
            .map(|r| r.pattern())
            .collect::<Vec<_>>(),
        program
            .regexes()
            .iter()
            .map(|r| r.pattern())
            .collect::<Vec<_>>()
    );

    // Loaded images come back unlinked.
    assert!(loaded.validate().is_err());
    loaded.link(&registry).unwrap();
    loaded.validate().unwrap();

    let index = loaded.find_handler("main").unwrap();
    let handler = loaded.handler(index).unwrap();
    assert!(Runner::new(&loaded, handler, &registry).run());
}

#[test]
fn bad_magic_is_rejected() {
    let image = b"JUNKxxxxxxxxxxxxxxxx".to_vec();
    assert!(matches!(
        read_program(&mut image.as_slice()),
        Err(SerialError::BadMagic)
    ));
}

#[test]
fn truncated_images_surface_io_errors() {
    let registry = sample_registry();
    let ir = generate(&sample_unit()).unwrap();
    let program = compile_linked(&ir, &registry).unwrap();

    let mut image = Vec::new();
    write_program(&program, &mut image).unwrap();
    image.truncate(image.len() / 2);
    assert!(matches!(
        read_program(&mut image.as_slice()),
        Err(SerialError::Io(_))
    ));
}

#[test]
fn registry_descriptors_serialize_stably() {
    let registry = sample_registry();
    let descriptors = registry.descriptors();
    let json = serde_json::to_value(&descriptors).unwrap();
    assert_eq!(
        json,
        serde_json::json!([
            {"kind": "Handler", "name": "accept", "return_type": "Boolean"},
            {"kind": "Function", "name": "strlen", "return_type": "Number"},
        ])
    );
}

#[test]
fn unregistering_removes_the_callback() {
    let mut registry = sample_registry();
    assert!(registry.find("strlen").is_some());
    assert!(registry.unregister("strlen"));
    assert!(registry.find("strlen").is_none());
    assert!(!registry.unregister("strlen"));
}
