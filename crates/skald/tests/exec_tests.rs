//! End-to-end execution tests: compile a source string, run it on a fresh
//! VM, and assert on printed output or the raised error.

use pretty_assertions::assert_eq;
use skald::{CollectStringPrint, ErrorKind, RunError, Vm, VmConfig, compile};

/// Compiles and runs a program, returning everything it printed.
fn run_program(source: &str) -> String {
    run_with_config(source, VmConfig::default())
}

fn run_with_config(source: &str, config: VmConfig) -> String {
    let program = compile(source, "test").unwrap_or_else(|diagnostics| {
        panic!("unexpected compile errors: {diagnostics:#?}");
    });
    let mut vm = Vm::with_writer(config, CollectStringPrint::new());
    if let Err(err) = vm.run(&program) {
        panic!("unexpected runtime error: {err}");
    }
    vm.into_writer().into_output()
}

/// Compiles and runs a program that must raise a runtime error.
fn run_error(source: &str) -> RunError {
    run_error_with_config(source, VmConfig::default())
}

fn run_error_with_config(source: &str, config: VmConfig) -> RunError {
    let program = compile(source, "test").unwrap_or_else(|diagnostics| {
        panic!("unexpected compile errors: {diagnostics:#?}");
    });
    let mut vm = Vm::with_writer(config, CollectStringPrint::new());
    vm.run(&program).expect_err("program should raise a runtime error")
}

// ============================================================================
// Core scenarios
// ============================================================================

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_program("print(1 + 2 * 3)"), "7\n");
}

#[test]
fn recursive_fibonacci() {
    let source = "fn f(n) if n <= 1 then return n end return f(n-1)+f(n-2) end print(f(10))";
    assert_eq!(run_program(source), "55\n");
}

#[test]
fn push_and_negative_index() {
    assert_eq!(run_program("let a = [1,2,3] push(a, 4) print(a[-1])"), "4\n");
}

#[test]
fn closure_captures_local_after_frame_returns() {
    let source = "fn make(x) fn g() return x end return g end let c = make(42) print(c())";
    assert_eq!(run_program(source), "42\n");
}

#[test]
fn dict_subscript_update() {
    let source = "let d = {\"k\":1} d[\"k\"] = d[\"k\"] + 1 print(d[\"k\"])";
    assert_eq!(run_program(source), "2\n");
}

#[test]
fn match_with_guard() {
    let source = "fn describe(v) match v case 0 then return \"zero\" case n if n < 0 then return \"neg\" case _ then return \"pos\" end end print(describe(-3))";
    assert_eq!(run_program(source), "neg\n");
}

// ============================================================================
// Expressions and operators
// ============================================================================

#[test]
fn integer_division_truncates_toward_zero() {
    assert_eq!(run_program("print(7 / 2) print(-7 / 2)"), "3\n-3\n");
}

#[test]
fn mixed_arithmetic_promotes_to_float() {
    assert_eq!(run_program("print(1 + 0.5)"), "1.5\n");
    assert_eq!(run_program("print(3 / 2.0)"), "1.5\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_program("print(\"foo\" + \"bar\")"), "foobar\n");
}

#[test]
fn interned_strings_compare_equal_by_content() {
    assert_eq!(run_program("print(\"ab\" == \"a\" + \"b\")"), "true\n");
}

#[test]
fn numeric_equality_promotes() {
    assert_eq!(run_program("print(1 == 1.0) print(1 == 1.5)"), "true\nfalse\n");
}

#[test]
fn string_comparison_is_lexicographic() {
    assert_eq!(run_program("print(\"apple\" < \"banana\")"), "true\n");
}

#[test]
fn truthiness_is_nil_and_false_only() {
    let source = "if 0 then print(\"zero\") end if \"\" then print(\"empty\") end if nil then print(\"nil\") end";
    assert_eq!(run_program(source), "zero\nempty\n");
}

#[test]
fn and_or_short_circuit_left_to_right() {
    let source = "fn loud(tag, v) print(tag) return v end print(loud(\"a\", false) and loud(\"b\", true)) print(loud(\"c\", 1) or loud(\"d\", 2))";
    assert_eq!(run_program(source), "a\nfalse\nc\n1\n");
}

#[test]
fn not_operator() {
    assert_eq!(run_program("print(not nil) print(not 0)"), "true\nfalse\n");
}

#[test]
fn unary_negation_wraps() {
    assert_eq!(run_program("print(-(3 + 4))"), "-7\n");
}

#[test]
fn range_builds_inclusive_array() {
    assert_eq!(run_program("print(1..4)"), "[1, 2, 3, 4]\n");
    assert_eq!(run_program("print(len(3..1))"), "0\n");
}

#[test]
fn chained_assignment_is_right_associative() {
    assert_eq!(run_program("let a = 0 let b = 0 a = b = 5 print(a, b)"), "5 5\n");
}

#[test]
fn hex_and_binary_literals() {
    assert_eq!(run_program("print(0xFF + 0b101)"), "260\n");
}

#[test]
fn float_printing_keeps_decimal_point() {
    assert_eq!(run_program("print(2.0) print(2.5)"), "2.0\n2.5\n");
}

// ============================================================================
// Statements
// ============================================================================

#[test]
fn while_loop() {
    assert_eq!(run_program("let i = 0 while i < 3 do print(i) i = i + 1 end"), "0\n1\n2\n");
}

#[test]
fn counting_for_is_inclusive() {
    assert_eq!(run_program("let total = 0 for i in 1 to 4 do total = total + i end print(total)"), "10\n");
}

#[test]
fn for_over_array_yields_elements() {
    assert_eq!(run_program("for x in [10, 20] do print(x) end"), "10\n20\n");
}

#[test]
fn for_over_dict_yields_keys_in_insertion_order() {
    assert_eq!(
        run_program("for k in {\"a\": 1, \"b\": 2} do print(k) end"),
        "a\nb\n"
    );
}

#[test]
fn for_over_string_yields_characters() {
    assert_eq!(run_program("for ch in \"hi\" do print(ch) end"), "h\ni\n");
}

#[test]
fn elif_chain() {
    let source = "fn sign(n) if n > 0 then return 1 elif n < 0 then return -1 else return 0 end end print(sign(-9), sign(0), sign(4))";
    assert_eq!(run_program(source), "-1 0 1\n");
}

#[test]
fn shadowing_reads_outer_binding_in_initializer() {
    assert_eq!(
        run_program("fn f() let x = 1 let x = x + 1 return x end print(f())"),
        "2\n"
    );
}

#[test]
fn arrow_function_bodies() {
    assert_eq!(run_program("fn double(x) -> x * 2\nprint(double(21))"), "42\n");
}

#[test]
fn anonymous_function_expression() {
    assert_eq!(run_program("let f = fn (x) -> x + 1\nprint(f(1))"), "2\n");
}

// ============================================================================
// Collections
// ============================================================================

#[test]
fn member_access_reads_nil_for_missing_keys() {
    assert_eq!(run_program("let d = {} print(d.missing)"), "nil\n");
}

#[test]
fn member_assignment_creates_entries() {
    assert_eq!(run_program("let d = {} d.name = \"ada\" print(d.name)"), "ada\n");
}

#[test]
fn subscript_on_missing_key_is_an_error() {
    let err = run_error("let d = {} print(d[\"missing\"])");
    assert_eq!(err.kind, ErrorKind::KeyMissing);
}

#[test]
fn numeric_dict_keys_promote() {
    assert_eq!(run_program("let d = {1: \"one\"} print(d[1.0])"), "one\n");
}

#[test]
fn string_indexing_yields_one_character_strings() {
    assert_eq!(run_program("let s = \"abc\" print(s[0], s[-1])"), "a c\n");
}

#[test]
fn string_write_is_an_error() {
    let err = run_error("let s = \"abc\" s[0] = \"x\"");
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn nested_array_printing() {
    assert_eq!(run_program("print([1, [2, \"x\"], {\"k\": nil}])"), "[1, [2, \"x\"], {\"k\": nil}]\n");
}

#[test]
fn array_pattern_destructures() {
    let source = "match [1, [2, 3]] case [a, [b, c]] then print(a + b + c) end";
    assert_eq!(run_program(source), "6\n");
}

#[test]
fn match_falls_through_to_next_case_on_guard_failure() {
    let source = "match 5 case n if n > 10 then print(\"big\") case n then print(\"small\", n) end";
    assert_eq!(run_program(source), "small 5\n");
}

#[test]
fn match_cases_evaluate_top_to_bottom() {
    let source = "match 1 case 1 then print(\"first\") case 1 then print(\"second\") end";
    assert_eq!(run_program(source), "first\n");
}

// ============================================================================
// Builtins
// ============================================================================

#[test]
fn len_of_collections() {
    assert_eq!(
        run_program("print(len([1,2,3]), len({\"a\":1}), len(\"hello\"))"),
        "3 1 5\n"
    );
}

#[test]
fn pop_returns_last_element() {
    assert_eq!(run_program("let a = [1, 2] print(pop(a)) print(len(a))"), "2\n1\n");
}

#[test]
fn pop_from_empty_array_is_an_error() {
    assert_eq!(run_error("pop([])").kind, ErrorKind::IndexOutOfRange);
}

#[test]
fn conversions() {
    assert_eq!(
        run_program("print(int(\"42\"), int(3.9), int(-3.9), float(1), str(12) + \"!\")"),
        "42 3 -3 1.0 12!"
            .to_owned()
            + "\n"
    );
}

#[test]
fn type_names() {
    assert_eq!(
        run_program("print(type(nil), type(1), type(1.0), type(\"s\"), type([]), type({}), type(print))"),
        "nil int float string array dict function\n"
    );
}

#[test]
fn min_max_abs() {
    assert_eq!(run_program("print(min(3, 1, 2), max(3, 1, 2), abs(-5))"), "1 3 5\n");
}

#[test]
fn keys_values_has() {
    assert_eq!(
        run_program("let d = {\"a\": 1, \"b\": 2} print(keys(d), values(d), has(d, \"a\"), has(d, \"z\"))"),
        "[\"a\", \"b\"] [1, 2] true false\n"
    );
}

#[test]
fn contains_checks_membership() {
    assert_eq!(
        run_program("print(contains([1,2], 2), contains(\"hello\", \"ell\"), contains({\"k\":1}, \"k\"))"),
        "true true true\n"
    );
}

#[test]
fn chars_splits_a_string() {
    assert_eq!(run_program("print(chars(\"ab\"))"), "[\"a\", \"b\"]\n");
}

#[test]
fn string_helpers() {
    assert_eq!(
        run_program("print(upper(\"abc\"), lower(\"ABC\"), trim(\"  x  \"))"),
        "ABC abc x\n"
    );
    assert_eq!(run_program("print(split(\"a,b,c\", \",\"))"), "[\"a\", \"b\", \"c\"]\n");
    assert_eq!(run_program("print(split(\"ab\", \"\"))"), "[\"a\", \"b\"]\n");
    assert_eq!(run_program("print(join([1, 2, 3], \"-\"))"), "1-2-3\n");
    assert_eq!(run_program("print(find(\"hello\", \"llo\"), find(\"hello\", \"z\"))"), "2 -1\n");
    assert_eq!(run_program("print(replace(\"a.b.c\", \".\", \"/\"))"), "a/b/c\n");
}

#[test]
fn slice_clamps_and_normalizes() {
    assert_eq!(run_program("print(slice([1,2,3,4], 1, 3))"), "[2, 3]\n");
    assert_eq!(run_program("print(slice(\"hello\", 1, -1))"), "ell\n");
    assert_eq!(run_program("print(slice([1,2], 0, 99))"), "[1, 2]\n");
    assert_eq!(run_program("print(slice([1,2], 5, 1))"), "[]\n");
}

#[test]
fn sort_reverse_concat() {
    assert_eq!(run_program("print(sort([3, 1.5, 2]))"), "[1.5, 2, 3]\n");
    assert_eq!(run_program("print(sort([\"pear\", \"apple\"]))"), "[\"apple\", \"pear\"]\n");
    assert_eq!(run_program("print(reverse([1, 2, 3]))"), "[3, 2, 1]\n");
    assert_eq!(run_program("print(concat([1], [2, 3]))"), "[1, 2, 3]\n");
    assert_eq!(run_error("sort([1, \"a\"])").kind, ErrorKind::TypeMismatch);
}

#[test]
fn rounding_and_sqrt() {
    assert_eq!(
        run_program("print(floor(2.7), ceil(2.1), round(2.5), floor(-2.5))"),
        "2 3 3 -3\n"
    );
    assert_eq!(run_program("print(sqrt(9))"), "3.0\n");
}

#[test]
fn recording_tracer_observes_instructions() {
    use skald::{Opcode, RecordingTracer};

    let program = compile("print(1 + 2)", "test").expect("compiles");
    let config = VmConfig {
        trace_execution: true,
        ..VmConfig::default()
    };
    let mut vm = skald::Vm::with_writer_and_tracer(config, CollectStringPrint::new(), RecordingTracer::new());
    vm.run(&program).expect("runs");
    let events = vm.tracer().events();
    assert!(!events.is_empty());
    assert!(events.iter().any(|event| event.opcode == Opcode::Add));
    assert_eq!(events.last().expect("nonempty").opcode, Opcode::Halt);
}

#[test]
fn host_registered_builtin_is_callable() {
    let program = compile("print(shout(\"hi\"))", "test").expect("compiles");
    let mut vm = Vm::with_writer(VmConfig::default(), CollectStringPrint::new());
    vm.register_builtin("shout", 1, |ctx, args| {
        let text = ctx.as_str(args[0]).unwrap_or_default().to_uppercase();
        Ok(ctx.string(&text))
    });
    vm.run(&program).expect("runs");
    assert_eq!(vm.into_writer().into_output(), "HI\n");
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn undefined_variable() {
    let err = run_error("print(nope)");
    assert_eq!(err.kind, ErrorKind::UndefinedName);
    assert!(err.message.contains("nope"));
}

#[test]
fn assignment_to_undefined_variable() {
    assert_eq!(run_error("nope = 1").kind, ErrorKind::UndefinedName);
}

#[test]
fn division_by_zero() {
    assert_eq!(run_error("print(1 / 0)").kind, ErrorKind::DivisionByZero);
    assert_eq!(run_error("print(1 % 0)").kind, ErrorKind::DivisionByZero);
}

#[test]
fn float_division_by_zero_follows_ieee() {
    assert_eq!(run_program("print(1.0 / 0.0)"), "inf\n");
}

#[test]
fn calling_a_non_function() {
    assert_eq!(run_error("let x = 3 x()").kind, ErrorKind::NotCallable);
}

#[test]
fn wrong_arity() {
    let err = run_error("fn f(a, b) return a end f(1)");
    assert_eq!(err.kind, ErrorKind::Arity);
    assert!(err.message.contains("expects 2 arguments, got 1"));
}

#[test]
fn comparing_incompatible_types_is_an_error() {
    assert_eq!(run_error("print(1 < \"a\")").kind, ErrorKind::TypeMismatch);
}

#[test]
fn index_out_of_range_reports_index_and_length() {
    let err = run_error("let a = [1] print(a[3])");
    assert_eq!(err.kind, ErrorKind::IndexOutOfRange);
    assert!(err.message.contains('3'));
}

#[test]
fn value_stack_limit() {
    let config = VmConfig {
        stack_max: 64,
        call_depth_max: 1_000_000,
        ..VmConfig::default()
    };
    let err = run_error_with_config("fn f(n) return f(n + 1) end f(0)", config);
    assert_eq!(err.kind, ErrorKind::StackOverflow);
}

#[test]
fn call_depth_limit() {
    let config = VmConfig {
        call_depth_max: 32,
        ..VmConfig::default()
    };
    let err = run_error_with_config("fn f() return f() end f()", config);
    assert_eq!(err.kind, ErrorKind::CallDepthExceeded);
}

#[test]
fn error_carries_line_and_call_trace() {
    let source = "fn inner()\n  return 1 / 0\nend\nfn outer()\n  return inner()\nend\nouter()";
    let err = run_error(source);
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    assert_eq!(err.line, 2);
    let names: Vec<&str> = err.trace.iter().map(|frame| frame.name.as_ref()).collect();
    assert_eq!(names, ["inner", "outer", "test"]);
    assert_eq!(err.trace[1].line, 5);
}

#[test]
fn vm_survives_a_runtime_error() {
    let mut vm = Vm::with_writer(VmConfig::default(), CollectStringPrint::new());
    let bad = compile("let x = 1 print(x / 0)", "bad").expect("compiles");
    assert!(vm.run(&bad).is_err());
    let good = compile("print(x + 1)", "good").expect("compiles");
    vm.run(&good).expect("globals survive the failed run");
    assert_eq!(vm.into_writer().into_output(), "2\n");
}

// ============================================================================
// Closures and upvalues
// ============================================================================

#[test]
fn counter_closures_keep_independent_state() {
    let source = "fn counter() let n = 0 return fn () n = n + 1 return n end end \
                  let a = counter() let b = counter() a() a() print(a(), b())";
    assert_eq!(run_program(source), "3 1\n");
}

#[test]
fn sibling_closures_share_one_cell() {
    let source = "fn pair() let n = 0 fn inc() n = n + 1 end fn get() return n end return [inc, get] end \
                  let p = pair() p[0]() p[0]() print(p[1]())";
    assert_eq!(run_program(source), "2\n");
}

#[test]
fn loop_variable_is_captured_per_iteration() {
    let source = "let fns = [] for x in [1, 2, 3] do push(fns, fn () -> x) end \
                  print(fns[0](), fns[1](), fns[2]())";
    assert_eq!(run_program(source), "1 2 3\n");
}

#[test]
fn upvalue_chain_through_two_levels() {
    let source = "fn outer(x) fn middle() fn inner() return x end return inner end return middle()() end \
                  print(outer(7))";
    assert_eq!(run_program(source), "7\n");
}

#[test]
fn globals_persist_across_runs() {
    let mut vm = Vm::with_writer(VmConfig::default(), CollectStringPrint::new());
    let first = compile("let shared = 10", "first").expect("compiles");
    vm.run(&first).expect("runs");
    let second = compile("print(shared)", "second").expect("compiles");
    vm.run(&second).expect("runs");
    assert_eq!(vm.into_writer().into_output(), "10\n");
}
