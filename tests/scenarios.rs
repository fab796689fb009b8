use opi::bytecode::Insn;
use opi::ir::{BinOp, Ir, Module, Pattern, StructDecl, Ty};
use opi::{CompileOptions, Outcome, Program, Vm, compile};

fn checked() -> CompileOptions {
    CompileOptions { verify_lifetimes: true, ..CompileOptions::default() }
}

fn build(body: Ir) -> Program {
    compile(&Module { types: Vec::new(), body }, &checked()).unwrap()
}

fn returned(outcome: Outcome) -> opi::Value {
    match outcome {
        Outcome::Returned(v) => v,
        Outcome::Yielded(..) => panic!("unexpected yield"),
    }
}

fn is_zero(offset: usize) -> Ir {
    Ir::binop(BinOp::Eq, Ir::var(offset), Ir::num(0.0))
}

fn minus_one(offset: usize) -> Ir {
    Ir::binop(BinOp::Sub, Ir::var(offset), Ir::num(1.0))
}

/// fix f = x => if x == 0 then "f" else g(x - 1)
///     g = x => if x == 0 then "g" else f(x - 1)
fn ping_pong(body: Ir) -> Ir {
    let f = Ir::func(1, vec![0], Ir::if_(is_zero(0), Ir::str("f"), Ir::apply(Ir::var(1), vec![minus_one(0)])));
    let g = Ir::func(1, vec![1], Ir::if_(is_zero(0), Ir::str("g"), Ir::apply(Ir::var(1), vec![minus_one(0)])));
    Ir::Fix { fns: vec![f, g], body: Some(Box::new(body)) }
}

#[test]
fn add_applied_to_three_and_two() {
    let add = Ir::func(2, vec![], Ir::binop(BinOp::Add, Ir::var(1), Ir::var(0)));
    for inline in [true, false] {
        let opts = CompileOptions { inline, ..checked() };
        let body = Ir::apply(add.clone(), vec![Ir::num(3.0), Ir::num(2.0)]);
        let program = compile(&Module { types: Vec::new(), body }, &opts).unwrap();
        let mut vm = Vm::new(&program);
        let v = returned(vm.run());
        assert_eq!(v.as_num(), Some(5.0), "inline={inline}");
    }
}

#[test]
fn host_calls_a_returned_function() {
    let add = Ir::func(2, vec![], Ir::binop(BinOp::Add, Ir::var(1), Ir::var(0)));
    let program = build(add);
    let mut vm = Vm::new(&program);
    let f = returned(vm.run());
    let v = returned(vm.call(f, &[opi::Value::Num(3.0), opi::Value::Num(2.0)]).unwrap());
    assert_eq!(v.as_num(), Some(5.0));
    vm.release(f);
}

#[test]
fn countdown_does_not_grow_the_stack() {
    let countdown = Ir::func(1, vec![0], Ir::if_(is_zero(0), Ir::num(0.0), Ir::apply(Ir::var(1), vec![minus_one(0)])));
    let program = build(Ir::Fix {
        fns: vec![countdown],
        body: Some(Box::new(Ir::apply(Ir::var(0), vec![Ir::num(100_000.0)]))),
    });
    let mut vm = Vm::new(&program);
    let v = returned(vm.run());
    assert_eq!(v.as_num(), Some(0.0));
    assert!(vm.stats().max_depth <= 2);
    assert!(vm.stats().tail_calls >= 100_000);
}

#[test]
fn mutually_recursive_closures_are_freed_with_their_scope() {
    let program = build(Ir::Block {
        exprs: vec![ping_pong(Ir::apply(Ir::var(1), vec![Ir::num(5.0)])), Ir::nil()],
        keep: false,
    });
    let mut vm = Vm::new(&program);
    let v = returned(vm.run());
    assert_eq!(v, opi::Value::Nil);
    let stats = vm.heap().stats();
    assert_eq!(stats.groups_collected, 1);
    // Pooled "f" and "g" strings remain.
    assert_eq!(stats.live, 2);
}

#[test]
fn group_survives_while_one_member_is_held() {
    // The host keeps f; g is reachable only through f.
    let program = build(ping_pong(Ir::var(1)));
    let mut vm = Vm::new(&program);
    let f = returned(vm.run());
    let pooled = 2;
    assert_eq!(vm.heap().stats().live, pooled + 2);
    assert_eq!(vm.heap().stats().groups_collected, 0);

    let v = returned(vm.call(f, &[opi::Value::Num(3.0)]).unwrap());
    assert_eq!(vm.render(v), "\"g\"");
    vm.release(v);
    assert_eq!(vm.heap().stats().live, pooled + 2);

    vm.release(f);
    assert_eq!(vm.heap().stats().groups_collected, 1);
    assert_eq!(vm.heap().stats().live, pooled);
}

#[test]
fn nested_match_with_failing_inner_field() {
    // match (1 . 2) { ((a . _) . b) => a + b } else "else"
    let pattern = Pattern::Unpack {
        ty: Ty::Cons,
        fields: vec![(0, Pattern::Unpack { ty: Ty::Cons, fields: vec![(0, Pattern::Bind)] }), (1, Pattern::Bind)],
    };
    let body = Ir::Match {
        pattern,
        value: Box::new(Ir::binop(BinOp::Cons, Ir::num(1.0), Ir::num(2.0))),
        then: Box::new(Ir::binop(BinOp::Add, Ir::var(1), Ir::var(0))),
        else_: Some(Box::new(Ir::str("else"))),
    };
    let program = build(body);
    let mut vm = Vm::new(&program);
    let v = returned(vm.run());
    assert_eq!(vm.render(v), "\"else\"");
}

#[test]
fn statically_known_struct_skips_runtime_tests() {
    let types = vec![
        StructDecl { name: "A".into(), fields: vec!["x".into()] },
        StructDecl { name: "B".into(), fields: vec!["y".into()] },
    ];
    let value = || Box::new(Ir::Struct { ty: 0, fields: vec![Ir::num(7.0)] });
    let arm = |ty| Ir::Match {
        pattern: Pattern::Unpack { ty: Ty::Struct(ty), fields: vec![(0, Pattern::Bind)] },
        value: value(),
        then: Box::new(Ir::var(0)),
        else_: Some(Box::new(Ir::str("other"))),
    };
    for (ty, expected) in [(0, "7"), (1, "\"other\"")] {
        let program = compile(&Module { types: types.clone(), body: arm(ty) }, &checked()).unwrap();
        let tests = program.entry_unit().code.iter().filter(|i| matches!(i, Insn::TestTy { .. })).count();
        assert_eq!(tests, 0);
        let mut vm = Vm::new(&program);
        let v = returned(vm.run());
        assert_eq!(vm.render(v), expected);
    }
}

#[test]
fn yield_then_resume_reaches_return() {
    // generator = () => { yield 1; yield 2; 3 }
    let generator = Ir::func(
        0,
        vec![],
        Ir::Block {
            exprs: vec![Ir::Yield(Box::new(Ir::num(1.0))), Ir::Yield(Box::new(Ir::num(2.0))), Ir::num(3.0)],
            keep: false,
        },
    );
    let program = build(generator);
    let mut vm = Vm::new(&program);
    let generator = returned(vm.run());

    let mut seen = Vec::new();
    let mut outcome = vm.call(generator, &[]).unwrap();
    let last = loop {
        match outcome {
            Outcome::Yielded(v, s) => {
                seen.push(v.as_num());
                outcome = vm.resume(s);
            }
            Outcome::Returned(v) => break v,
        }
    };
    assert_eq!(seen, vec![Some(1.0), Some(2.0)]);
    assert_eq!(last.as_num(), Some(3.0));
    vm.release(generator);
    // The capture-free function lives in the constant pool.
    assert_eq!(vm.heap().stats().live, 1);
}
