//! End-to-end tests: parse, optimize, lower, place, and execute.

use capstan_codegen::CallConv;
use capstan_jit::{JITBuilder, JITModule};

fn compile(text: &str, optimize: bool) -> JITModule {
    let mut module = capstan_reader::parse_module(text).expect("parse");
    if optimize {
        capstan_codegen::optimize(&mut module).expect("optimize");
    }
    let compilation = capstan_codegen::lower(&mut module, CallConv::host_default()).expect("lower");
    JITBuilder::new().finish(compilation).expect("finalize")
}

fn run_i64(text: &str, optimize: bool) -> i64 {
    let jit = compile(text, optimize);
    let entry = jit.lookup("main").expect("main");
    let main: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(entry) };
    main(0, 0)
}

fn run_f64(text: &str, optimize: bool) -> f64 {
    let jit = compile(text, optimize);
    let entry = jit.lookup("main").expect("main");
    let main: extern "C" fn(i64, i64) -> f64 = unsafe { std::mem::transmute(entry) };
    main(0, 0)
}

#[test]
fn returns_a_constant() {
    assert_eq!(run_i64(include_str!("../../../demos/simple.ir"), true), 42);
}

#[test]
fn integer_arithmetic() {
    let text = "\
func main returns i64
    a = mov 7i64
    b = mov -3i64
    q = idiv a b
    r = irem a b
    base = add q 10i64
    scaled = mul base 100i64
    tens = mul r 10i64
    u = div 7i64 2i64
    partial = add scaled tens
    total = add partial u
    return total
endfunc
";
    // (7 / -3 + 10) * 100 + (7 rem -3) * 10 + 7 / 2 = 800 + 10 + 3.
    assert_eq!(run_i64(text, true), 813);
}

#[test]
fn variable_shift_counts() {
    let text = "\
func main returns i64
    n = mov 1i64
    k = mov 5i64
    big = shl n k
    back = shr big 2i64
    return back
endfunc
";
    assert_eq!(run_i64(text, true), 8);
}

#[test]
fn shifted_value_may_live_in_rcx() {
    // `pad` holds RAX so `t` lands in RCX while the count sits elsewhere;
    // loading the count into CL must not clobber the value being shifted.
    let text = "\
func main returns i64
    pad = mov 1i64
    t = mov 6i64
    c = mov 2i64
    x = shl t c
    r = add x pad
    return r
endfunc
";
    assert_eq!(run_i64(text, true), 25);
}

#[test]
fn counting_loop_through_a_slot() {
    let text = include_str!("../../../demos/count.ir");
    assert_eq!(run_i64(text, false), 11);
    // Same result with the slot promoted away.
    assert_eq!(run_i64(text, true), 11);
}

#[test]
fn register_rotation_uses_one_scratch() {
    let text = "\
func main returns i64
    goto loop 1i64 2i64 3i64 10i64
block loop
    arg a i64
    arg b i64
    arg c i64
    arg n i64
    n1 = sub n 1i64
    keep = icmp_g n1 0i64
    if keep goto loop b c a n1 else out a b c
block out
    arg x i64
    arg y i64
    arg z i64
    hundreds = mul x 100i64
    tens = mul y 10i64
    sum = add hundreds tens
    total = add sum z
    return total
endfunc
";
    // Nine full rotations of (1,2,3) land back at (1,2,3).
    assert_eq!(run_i64(text, true), 123);
    assert_eq!(run_i64(text, false), 123);
}

#[test]
fn ternary_and_compares() {
    let text = "\
func main returns i64
    a = mov 5i64
    b = mov 9i64
    c = icmp_l a b
    picked = ternary c a b
    gt = icmp_g a b
    other = ternary gt a b
    sum = shl picked 4i64
    total = add sum other
    return total
endfunc
";
    // picked = 5, other = 9: 5*16 + 9.
    assert_eq!(run_i64(text, true), 89);
}

#[test]
fn not_complements_while_bool_tests() {
    let text = "\
func main returns i64
    a = mov 12i64
    flipped = not a
    nz = mov 7i64
    isset = bool nz
    wide = zext i64 isset
    r = add flipped wide
    return r
endfunc
";
    // !12 + (7 != 0) = -13 + 1.
    assert_eq!(run_i64(text, true), -12);
}

#[test]
fn float_compare_controls_branches() {
    let text = "\
func main returns i64
    x = mov 2.5f64
    y = mov 3.5f64
    c = fcmp_l x y
    if c goto yes
    return 0i64
block yes
    return 1i64
endfunc
";
    assert_eq!(run_i64(text, true), 1);
}

#[test]
fn inlined_leaf_behaves_identically() {
    let text = "\
func double returns i64
    arg n i64
    r = add n n
    return r
endfunc
func main returns i64
    p = symbol_lookup double
    x = call_eval i64 p 21i64
    y = call_eval i64 p x
    return y
endfunc
";
    assert_eq!(run_i64(text, false), 84);
    assert_eq!(run_i64(text, true), 84);
}

#[test]
fn calls_into_the_host() {
    extern "C" fn add_pair(a: i64, b: i64) -> i64 {
        a.wrapping_add(b)
    }
    let text = "\
func main returns i64
    p = symbol_lookup add_pair
    r = call_eval i64 p 40i64 2i64
    return r
endfunc
";
    let mut module = capstan_reader::parse_module(text).expect("parse");
    capstan_codegen::optimize(&mut module).expect("optimize");
    let compilation =
        capstan_codegen::lower(&mut module, CallConv::host_default()).expect("lower");
    let mut builder = JITBuilder::new();
    builder.symbol("add_pair", add_pair as *const u8);
    let jit = builder.finish(compilation).expect("finalize");
    let entry = jit.lookup("main").expect("main");
    let main: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(entry) };
    assert_eq!(main(0, 0), 42);
}

#[test]
fn sixteen_live_values_force_spills() {
    // Sum 1..=20 with every addend kept live until the end.
    let mut text = String::from("func main returns i64\n");
    for n in 1..=20 {
        text.push_str(&format!("    v{n} = mov {n}i64\n"));
    }
    text.push_str("    acc = add v1 v2\n");
    for n in 3..=20 {
        text.push_str(&format!("    acc{n} = add acc{} v{n}\n", if n == 3 {
            "".to_string()
        } else {
            (n - 1).to_string()
        }));
    }
    text.push_str("    return acc20\nendfunc\n");
    assert_eq!(run_i64(&text, true), 210);
}

#[test]
fn stack_passed_arguments_reload_from_the_frame() {
    // Eight integer arguments: the last two arrive on the caller's stack and
    // are legalized into loads from incoming-argument slots.
    let text = "\
func many returns i64
    arg a i64
    arg b i64
    arg c i64
    arg d i64
    arg e i64
    arg f i64
    arg g i64
    arg h i64
    s1 = add a b
    s2 = add s1 c
    s3 = add s2 d
    s4 = add s3 e
    s5 = add s4 f
    s6 = add s5 g
    s7 = add s6 h
    return s7
endfunc
func main returns i64
    return 0i64
endfunc
";
    let jit = compile(text, true);
    let entry = jit.lookup("many").expect("many");
    let many: extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64) -> i64 =
        unsafe { std::mem::transmute(entry) };
    assert_eq!(many(1, 2, 3, 4, 5, 6, 7, 8), 36);
}

#[test]
fn leibniz_series_approximates_pi() {
    let value = run_f64(include_str!("../../../demos/pi.ir"), true);
    assert!(
        (value - std::f64::consts::PI).abs() < 5e-9,
        "got {value}, expected pi"
    );
}

#[test]
fn gravity_integration() {
    let value = run_f64(include_str!("../../../demos/gravity.ir"), true);
    assert!(
        (value - 4.9e8).abs() < 1.0,
        "got {value}, expected about 4.9e8"
    );
}
