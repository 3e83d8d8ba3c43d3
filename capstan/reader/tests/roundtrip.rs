//! Parse/print round-trip and IR-shape checks for the optimization passes.

use capstan_codegen::ir::Opcode;
use capstan_codegen::write;
use capstan_reader::parse_module;

#[test]
fn print_parse_print_is_stable() {
    let text = "\
func helper returns i64
    arg n i64
    r = add n n
    return r
endfunc
func main returns i64
    stack_slot cell 8
    store cell 5i64
    v = load i64 cell
    c = cmp_g v 1i64
    if c goto big
    small = add v 1i64
    return small
block big
    arg w i64
    r = mul w 2i64
    return r
endfunc
";
    let first = parse_module(text).unwrap();
    let printed = write::module_to_string(&first);
    let second = parse_module(&printed).unwrap();
    let reprinted = write::module_to_string(&second);
    assert_eq!(printed, reprinted);
}

#[test]
fn branch_splitting_makes_if_terminal() {
    // `if` in the middle of the entry block forces a split; the trailing
    // statements move to a fresh block that inherits the live values.
    let text = "\
func main returns i64
    arg a i64
    c = cmp_g a 0i64
    if c goto big
    r = add a 1i64
    return r
block big
    return 100i64
endfunc
";
    let module = parse_module(text).unwrap();
    let func = &module.functions[0];
    assert_eq!(func.layout.len(), 3);
    for block in &func.layout {
        let insts = &func.dfg.blocks[*block].insts;
        for (k, inst) in insts.iter().enumerate() {
            let is_last = k + 1 == insts.len();
            assert_eq!(func.dfg.insts[*inst].opcode.is_terminator(), is_last);
        }
    }
}

#[test]
fn mem2reg_eliminates_slots() {
    let text = include_str!("../../../demos/count.ir");
    let mut module = parse_module(text).unwrap();
    assert_eq!(module.functions[0].active_slots.len(), 1);
    capstan_codegen::optimize(&mut module).unwrap();
    assert!(module.functions[0].active_slots.is_empty());
    // No loads or stores survive.
    let func = &module.functions[0];
    for block in &func.layout {
        for inst in &func.dfg.blocks[*block].insts {
            assert!(!matches!(
                func.dfg.insts[*inst].opcode,
                Opcode::Load | Opcode::Store
            ));
        }
    }
}

#[test]
fn empty_blocks_are_removed() {
    let text = "\
func main returns i64
    arg a i64
    goto forward a
block forward
    arg x i64
    goto exit x x
block exit
    arg p i64
    arg q i64
    r = add p q
    return r
endfunc
";
    let mut module = parse_module(text).unwrap();
    assert_eq!(module.functions[0].layout.len(), 3);
    capstan_codegen::optimize(&mut module).unwrap();
    let func = &module.functions[0];
    assert_eq!(func.layout.len(), 2);
    // The entry now jumps straight to `exit`, doubling its argument.
    let entry_term = func.terminator(func.layout[0]).unwrap();
    assert_eq!(
        func.dfg.insts[entry_term].operands[0].as_text(),
        Some("exit")
    );
    assert_eq!(func.dfg.insts[entry_term].operands.len(), 3);
}

#[test]
fn dead_loop_params_are_removed() {
    let text = "\
func main returns i64
    goto loop 0i64 7i64
block loop
    arg i i64
    arg unused i64
    i1 = add i 1i64
    c = icmp_l i1 10i64
    if c goto loop i1 unused else out i1
block out
    arg r i64
    return r
endfunc
";
    let mut module = parse_module(text).unwrap();
    capstan_codegen::optimize(&mut module).unwrap();
    let func = &module.functions[0];
    let looph = func.block_by_name("loop").unwrap();
    assert_eq!(func.dfg.blocks[looph].params.len(), 1);
}

#[test]
fn inlining_removes_leaf_calls() {
    let text = include_str!("../../../demos/gravity.ir");
    let mut module = parse_module(text).unwrap();
    capstan_codegen::optimize(&mut module).unwrap();
    let main = &module.functions[module.find_function("main").unwrap()];
    for block in &main.layout {
        for inst in &main.dfg.blocks[*block].insts {
            assert!(!matches!(
                main.dfg.insts[*inst].opcode,
                Opcode::Call | Opcode::CallEval
            ));
        }
    }
}

#[test]
fn statics_parse_and_print() {
    let text = "\
static answer i64 42i64
func main returns iptr
    p = symbol_lookup answer
    return p
endfunc
";
    let module = parse_module(text).unwrap();
    assert_eq!(module.statics.len(), 1);
    let printed = write::module_to_string(&module);
    assert!(printed.starts_with("static answer i64 42"));
    parse_module(&printed).unwrap();
}
