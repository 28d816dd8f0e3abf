// Integration tests for the Fun compiler and VM.
//
// Exercises complete Fun programs end to end through `compile_string` and
// `Vm::run`, covering the concrete end-to-end scenarios and testable
// properties: arithmetic, control flow, functions, classes, arrays/maps,
// integer clamping, error handling, and the debugger.

use fun::compiler::compile_string;
use fun::value::Value;
use fun::vm::Vm;
use std::rc::Rc;

fn run(src: &str) -> Vec<Value> {
    let bc = compile_string(src, None).expect("compile");
    let mut vm = Vm::new();
    vm.run(Rc::new(bc)).expect("run");
    vm.drain_output()
}

fn run_fails(src: &str) {
    let bc = compile_string(src, None).expect("compile");
    let mut vm = Vm::new();
    let result = vm.run(Rc::new(bc));
    assert!(result.is_err(), "expected a runtime error for: {}", src);
}

// S1 - arithmetic and print
#[test]
fn arithmetic_and_print() {
    let out = run("number a = 2\nnumber b = 3\nprint(a + b * 4)\n");
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], Value::Int(14)));
}

// S2 - while with break and continue
#[test]
fn while_break_and_continue() {
    let src = "number i = 0\nwhile i < 10\n  i = i + 1\n  if i == 3\n    continue\n  if i == 7\n    break\n  print(i)\n";
    let out = run(src);
    let want = [1, 2, 4, 5, 6];
    assert_eq!(out.len(), want.len());
    for (v, w) in out.iter().zip(want.iter()) {
        assert!(matches!(v, Value::Int(n) if n == w));
    }
}

// S3 - array literal, for-in, and map literal indexing
#[test]
fn array_and_map_literals() {
    let src = "xs = [10, 20, 30]\ntotal = 0\nfor x in xs\n  total = total + x\nprint(total)\nm = { \"a\": 1, \"b\": 2 }\nprint(m[\"a\"] + m[\"b\"])\n";
    let out = run(src);
    assert_eq!(out.len(), 2);
    assert!(matches!(out[0], Value::Int(60)));
    assert!(matches!(out[1], Value::Int(3)));
}

// S4 - recursive function
#[test]
fn recursive_factorial() {
    let out = run("fun fact(n)\n  if n <= 1\n    return 1\n  return n * fact(n - 1)\nprint(fact(6))\n");
    assert!(matches!(out[0], Value::Int(720)));
}

// S5 - class with bound method mutating instance state
#[test]
fn class_method_mutates_instance() {
    let src = "class Counter(number start)\n  n = start\n  fun inc(this)\n    this.n = this.n + 1\n    return this.n\nc = Counter(10)\nprint(c.inc())\nprint(c.inc())\n";
    let out = run(src);
    assert_eq!(out.len(), 2);
    assert!(matches!(out[0], Value::Int(11)));
    assert!(matches!(out[1], Value::Int(12)));
}

// S6 - integer width clamping, unsigned wrap and signed sign-extension
#[test]
fn integer_width_clamp() {
    let out = run("uint8 x = 300\nprint(x)\nint8 y = 200\nprint(y)\n");
    assert_eq!(out.len(), 2);
    assert!(matches!(out[0], Value::Int(44)));
    assert!(matches!(out[1], Value::Int(-56)));
}

#[test]
fn short_circuit_and_does_not_call_rhs() {
    let src = "fun boom()\n  print(\"called\")\n  return true\nprint(false && boom())\n";
    let out = run(src);
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], Value::Int(0)));
}

#[test]
fn short_circuit_or_does_not_call_rhs() {
    let src = "fun boom()\n  print(\"called\")\n  return false\nprint(true || boom())\n";
    let out = run(src);
    assert_eq!(out.len(), 1);
    assert!(matches!(out[0], Value::Int(1)));
}

#[test]
fn map_literal_insertion_order_is_reversed_from_source() {
    let src = "m = { \"a\": 1, \"b\": 2 }\nks = keys(m)\nprint(ks[0])\nprint(ks[1])\n";
    let out = run(src);
    assert_eq!(out.len(), 2);
    assert!(matches!(&out[0], Value::Str(s) if s == "b"));
    assert!(matches!(&out[1], Value::Str(s) if s == "a"));
}

#[test]
fn equality_int_bool_coercion() {
    let out = run("print(1 == true)\nprint(0 == false)\n");
    assert_eq!(out.len(), 2);
    assert!(matches!(out[0], Value::Bool(true)));
    assert!(matches!(out[1], Value::Bool(true)));
}

#[test]
fn map_filter_reduce_pipeline() {
    let src = "fun double(x)\n  return x * 2\nfun isEven(x)\n  return x % 2 == 0\nfun add(a, b)\n  return a + b\narr = [1, 2, 3, 4]\ndoubled = map(arr, double)\nevens = filter(doubled, isEven)\nprint(reduce(evens, 0, add))\n";
    let out = run(src);
    assert!(matches!(out[0], Value::Int(20)));
}

#[test]
fn array_slice_and_concat() {
    let src = "xs = [1, 2, 3, 4, 5]\nys = xs[1:3]\nprint(ys)\nzs = xs[1:-1]\nprint(len(zs))\n";
    let out = run(src);
    assert_eq!(out.len(), 2);
    assert!(matches!(out[1], Value::Int(3)));
}

#[test]
fn typeof_on_plain_identifier_is_runtime() {
    let out = run("x = 5\nprint(typeof(x))\n");
    assert!(matches!(&out[0], Value::Str(s) if s == "Number"));
}

#[test]
fn typeof_on_declared_width_is_compile_time() {
    let out = run("uint16 x = 5\nprint(typeof(x))\n");
    assert!(matches!(&out[0], Value::Str(s) if s == "Uint16"));
}

#[test]
fn missing_class_argument_reports_type_error() {
    let src = "class Point(number x, number y)\n\np = Point(1)\n";
    let out = run(src);
    assert_eq!(out.len(), 1);
    assert!(matches!(&out[0], Value::Str(s) if s.starts_with("TypeError:")));
}

#[test]
fn division_by_zero_is_fatal() {
    run_fails("print(1 / 0)\n");
}

#[test]
fn odd_indentation_is_rejected_at_compile_time() {
    let result = compile_string("if 1\n   print(\"x\")\n", None);
    assert!(result.is_err());
}

#[test]
fn tab_indentation_is_rejected_at_compile_time() {
    let result = compile_string("if 1\n\tprint(\"x\")\n", None);
    assert!(result.is_err());
}

#[test]
fn nested_function_closures_over_globals() {
    let src = "number total = 0\nfun add_to_total(n)\n  total = total + n\n  return total\nprint(add_to_total(3))\nprint(add_to_total(4))\n";
    let out = run(src);
    assert!(matches!(out[0], Value::Int(3)));
    assert!(matches!(out[1], Value::Int(7)));
}

#[test]
fn error_trap_receives_runtime_errors_without_panicking() {
    let bc = compile_string("print(1 / 0)\n", None).expect("compile");
    let mut vm = Vm::new();
    let trapped = Rc::new(std::cell::RefCell::new(false));
    let trapped2 = trapped.clone();
    vm.install_error_trap(Box::new(move |_vm, _err| {
        *trapped2.borrow_mut() = true;
    }));
    let _ = vm.run(Rc::new(bc));
    assert!(*trapped.borrow());
}

#[test]
fn debugger_breakpoint_fires_for_matching_file_and_line() {
    let mut vm = Vm::new();
    let id = vm.debugger.add_breakpoint("test.fun".to_string(), 1);
    assert_eq!(vm.debugger.list_breakpoints().len(), 1);
    assert_eq!(vm.debugger.list_breakpoints()[0].id, id);
    assert!(vm.debugger.breakpoint_hits("test.fun", 1));
    assert!(!vm.debugger.breakpoint_hits("test.fun", 2));
    assert!(!vm.debugger.breakpoint_hits("other.fun", 1));
}

#[test]
fn repl_session_persists_globals_across_lines() {
    use fun::compiler::ReplSession;
    let mut session = ReplSession::new();
    let mut vm = Vm::new();

    let bc1 = session.compile_line("x = 10\n").expect("compile line 1");
    vm.run(Rc::new(bc1)).expect("run line 1");

    let bc2 = session.compile_line("print(x + 5)\n").expect("compile line 2");
    vm.run(Rc::new(bc2)).expect("run line 2");

    let out = vm.drain_output();
    assert!(matches!(out[0], Value::Int(15)));
}
