//! Compile-time diagnostics: kinds, positions, and resynchronization.

use skald::{Diagnostic, DiagnosticKind, compile};

fn diagnostics(source: &str) -> Vec<Diagnostic> {
    compile(source, "test").expect_err("source should fail to compile")
}

fn first_kind(source: &str) -> DiagnosticKind {
    diagnostics(source)[0].kind
}

#[test]
fn valid_programs_compile() {
    assert!(compile("print(1)", "test").is_ok());
    assert!(compile("", "test").is_ok(), "an empty program is valid");
    assert!(compile("// just a comment", "test").is_ok());
}

#[test]
fn unterminated_string() {
    assert_eq!(first_kind("let s = \"abc"), DiagnosticKind::UnterminatedString);
}

#[test]
fn unterminated_block_comment() {
    assert_eq!(first_kind("let x = 1 /* lost"), DiagnosticKind::UnterminatedComment);
}

#[test]
fn invalid_escape_sequence() {
    assert_eq!(first_kind("let s = \"a\\q\""), DiagnosticKind::InvalidEscape);
}

#[test]
fn integer_literal_out_of_range() {
    assert_eq!(first_kind("let n = 99999999999999999999"), DiagnosticKind::InvalidNumber);
}

#[test]
fn missing_hex_digits() {
    assert_eq!(first_kind("let n = 0x"), DiagnosticKind::InvalidNumber);
}

#[test]
fn unexpected_token_reports_position() {
    let all = diagnostics("let x = \nlet y = 2 )");
    assert_eq!(all[0].kind, DiagnosticKind::UnexpectedToken);
    assert_eq!(all[0].line, 2, "error should point at the second line");
}

#[test]
fn const_without_initializer() {
    assert_eq!(first_kind("const k"), DiagnosticKind::UndefinedConstInit);
}

#[test]
fn const_global_reassignment() {
    assert_eq!(first_kind("const k = 1 k = 2"), DiagnosticKind::ConstReassignment);
}

#[test]
fn const_captured_by_closure_stays_const() {
    let source = "fn outer() const k = 1 fn inner() k = 2 end end";
    assert_eq!(first_kind(source), DiagnosticKind::ConstReassignment);
}

#[test]
fn invalid_assignment_target() {
    assert_eq!(first_kind("f() = 3"), DiagnosticKind::InvalidAssignmentTarget);
}

#[test]
fn return_outside_function() {
    assert_eq!(first_kind("return 3"), DiagnosticKind::ReturnOutsideFunction);
}

#[test]
fn duplicate_parameter() {
    assert_eq!(first_kind("fn f(a, a) end"), DiagnosticKind::DuplicateLocal);
}

#[test]
fn resynchronization_reports_errors_on_separate_statements() {
    // Three broken statements; recovery must reach at least the first two
    // instead of giving up at the first.
    let all = diagnostics("let = 1\nprint(]\nlet ok = 2 ok = )");
    assert!(
        all.len() >= 2,
        "expected multiple diagnostics after resynchronization, got {all:#?}"
    );
    let lines: Vec<u32> = all.iter().map(|d| d.line).collect();
    assert!(lines.windows(2).all(|pair| pair[0] <= pair[1]), "diagnostics in source order");
}

#[test]
fn missing_end_is_reported() {
    let all = diagnostics("if true then print(1)");
    assert!(all.iter().any(|d| d.message.contains("'end'")), "got {all:#?}");
}

#[test]
fn diagnostics_render_with_position_and_kind() {
    let rendered = diagnostics("let s = \"abc")[0].to_string();
    assert!(rendered.contains("unterminated_string"), "got {rendered}");
    assert!(rendered.starts_with("1:"), "got {rendered}");
}

#[test]
fn failed_compile_produces_no_program() {
    // A parse error anywhere poisons the whole unit.
    assert!(compile("print(1)\nlet = 2", "test").is_err());
}
