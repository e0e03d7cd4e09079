use netbee_expr::{
    parse, BinaryOp, Builtin, ColumnKind, ExpectedKind, Expr, ExprError, ExprKind, FieldSource,
    SymbolScope, VariableKind,
};

/// Scope fixture with one of everything the parser can resolve.
struct TestScope;

impl SymbolScope for TestScope {
    fn alias(&self, name: &str) -> Option<&str> {
        match name {
            "ETHERTYPE_IP" => Some("0x0800"),
            "loop_a" => Some("loop_b + 1"),
            "loop_b" => Some("loop_a + 1"),
            _ => None,
        }
    }

    fn variable_kind(&self, name: &str) -> Option<VariableKind> {
        match name {
            "counter" => Some(VariableKind::Number),
            "scratch" => Some(VariableKind::Buffer),
            "nextproto" => Some(VariableKind::Protocol),
            _ => None,
        }
    }

    fn is_lookup_table(&self, name: &str) -> bool {
        name == "flows"
    }

    fn lookup_column_kind(&self, table: &str, column: &str) -> Option<ColumnKind> {
        if table != "flows" {
            return None;
        }
        match column {
            "srcaddr" | "dstaddr" => Some(ColumnKind::Buffer),
            "count" => Some(ColumnKind::Number),
            _ => None,
        }
    }

    fn lookup_key_count(&self, table: &str) -> Option<usize> {
        (table == "flows").then_some(2)
    }
}

#[test]
fn number_literals_by_radix() {
    for (src, value) in [("255", 255u32), ("0xff", 255), ("0b11111111", 255)] {
        match parse(src, ExpectedKind::NumberOnly, &TestScope).unwrap() {
            Expr::Number(n) => assert_eq!(n, value),
            other => panic!("unexpected tree for {src}: {other:?}"),
        }
    }
}

#[test]
fn kind_discipline_at_the_root() {
    assert!(parse("1 + 2", ExpectedKind::NumberOnly, &TestScope).is_ok());
    assert!(matches!(
        parse("1 + 2", ExpectedKind::BufferOnly, &TestScope),
        Err(ExprError::TypeMismatch { .. })
    ));
    assert!(matches!(
        parse("'ab'", ExpectedKind::NumberOnly, &TestScope),
        Err(ExprError::TypeMismatch { .. })
    ));
    assert!(parse("1 == 2", ExpectedKind::BooleanOnly, &TestScope).is_ok());
}

#[test]
fn any_kind_is_one_of_the_three() {
    for src in ["1 + 1", "'x'", "1 == 1", "$counter", "$scratch"] {
        let kind = parse(src, ExpectedKind::Any, &TestScope).unwrap().kind();
        assert!(
            matches!(kind, ExprKind::Number | ExprKind::Buffer | ExprKind::Boolean),
            "{src} produced {kind:?}"
        );
    }
}

#[test]
fn precedence_binds_mul_over_add_over_cmp() {
    let expr = parse("1 + 2 * 3 == 7", ExpectedKind::BooleanOnly, &TestScope).unwrap();
    match expr {
        Expr::Binary { op, lhs, .. } => {
            assert_eq!(op, BinaryOp::Eq);
            match *lhs {
                Expr::Binary { op, .. } => assert_eq!(op, BinaryOp::Add),
                other => panic!("lhs of == is {other:?}"),
            }
        }
        other => panic!("root is {other:?}"),
    }
}

#[test]
fn alias_expands_to_fresh_tokens() {
    let expr = parse(
        "this.type == ETHERTYPE_IP",
        ExpectedKind::BooleanOnly,
        &TestScope,
    );
    // Buffer field vs number literal is a kind clash, so compare as numbers.
    assert!(expr.is_err());

    let expr = parse(
        "buf2int(this.type) == ETHERTYPE_IP",
        ExpectedKind::BooleanOnly,
        &TestScope,
    )
    .unwrap();
    match expr {
        Expr::Binary { rhs, .. } => match *rhs {
            Expr::Number(n) => assert_eq!(n, 0x0800),
            other => panic!("alias value is {other:?}"),
        },
        other => panic!("root is {other:?}"),
    }
}

#[test]
fn alias_cycles_are_rejected() {
    assert!(matches!(
        parse("loop_a", ExpectedKind::Any, &TestScope),
        Err(ExprError::AliasCycle(_))
    ));
}

#[test]
fn unknown_names_are_reported() {
    assert!(matches!(
        parse("$missing", ExpectedKind::Any, &TestScope),
        Err(ExprError::UnknownName(_))
    ));
    assert!(matches!(
        parse("flows.nosuch", ExpectedKind::Any, &TestScope),
        Err(ExprError::UnknownName(_))
    ));
    assert!(matches!(
        parse("nosuchfn(1)", ExpectedKind::Any, &TestScope),
        Err(ExprError::UnknownName(_))
    ));
}

#[test]
fn slicing_is_buffer_only() {
    assert!(parse("$scratch[0:4]", ExpectedKind::BufferOnly, &TestScope).is_ok());
    assert!(matches!(
        parse("$counter[0:4]", ExpectedKind::Any, &TestScope),
        Err(ExprError::TypeMismatch { .. })
    ));
}

#[test]
fn field_references_resolve_sources() {
    match parse("this.flags", ExpectedKind::BufferOnly, &TestScope).unwrap() {
        Expr::FieldRef { source, field, .. } => {
            assert_eq!(source, FieldSource::This);
            assert_eq!(field, "flags");
        }
        other => panic!("{other:?}"),
    }

    match parse("ip.src", ExpectedKind::BufferOnly, &TestScope).unwrap() {
        Expr::FieldRef { source, .. } => {
            assert_eq!(source, FieldSource::Proto("ip".to_string()))
        }
        other => panic!("{other:?}"),
    }

    // `flows` names a table, so the dotted form reads a cell instead.
    match parse("flows.count", ExpectedKind::NumberOnly, &TestScope).unwrap() {
        Expr::LookupCell { table, column, .. } => {
            assert_eq!(table, "flows");
            assert_eq!(column, "count");
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn buffer_comparisons_have_no_ordering() {
    assert!(parse("'ab' == 'cd'", ExpectedKind::BooleanOnly, &TestScope).is_ok());
    assert!(matches!(
        parse("'ab' < 'cd'", ExpectedKind::BooleanOnly, &TestScope),
        Err(ExprError::TypeMismatch { .. })
    ));
}

#[test]
fn update_splits_keys_from_data() {
    let expr = parse(
        "updatelookuptable(flows, this.src, this.dst, $counter)",
        ExpectedKind::Any,
        &TestScope,
    )
    .unwrap();
    match expr {
        Expr::Call(Builtin::UpdateLookup { keys, data, .. }) => {
            assert_eq!(keys.len(), 2);
            assert_eq!(data.len(), 1);
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn check_requires_exact_key_arity() {
    assert!(parse(
        "checklookuptable(flows, this.src, this.dst)",
        ExpectedKind::Any,
        &TestScope
    )
    .is_ok());
    assert!(parse("checklookuptable(flows, this.src)", ExpectedKind::Any, &TestScope).is_err());
}

#[test]
fn regex_arguments_keep_their_escapes() {
    let expr = parse(
        "hasstring(this.payload, 'GET\\s+/', 1)",
        ExpectedKind::Any,
        &TestScope,
    )
    .unwrap();
    match expr {
        Expr::Call(Builtin::HasString { pattern, .. }) => {
            assert!(pattern.is_match(b"GET  /index"));
        }
        other => panic!("{other:?}"),
    }
}

#[test]
fn nul_escape_in_pattern_fails_load() {
    assert!(matches!(
        parse("hasstring(this.payload, 'a\\x00b')", ExpectedKind::Any, &TestScope),
        Err(ExprError::RegexInvalidNul)
    ));
}

#[test]
fn empty_expression_is_a_syntax_error() {
    assert!(matches!(
        parse("   ", ExpectedKind::Any, &TestScope),
        Err(ExprError::Syntax { .. })
    ));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn decimal_literals_round_trip(n in 0u32..=u32::MAX) {
            let expr = parse(&n.to_string(), ExpectedKind::NumberOnly, &TestScope).unwrap();
            prop_assert!(matches!(expr, Expr::Number(v) if v == n));
        }

        #[test]
        fn hex_literals_round_trip(n in 0u32..=u32::MAX) {
            let expr = parse(&format!("{n:#x}"), ExpectedKind::NumberOnly, &TestScope).unwrap();
            prop_assert!(matches!(expr, Expr::Number(v) if v == n));
        }
    }
}
