//! End-to-end scenarios driven through `Program`, mirroring what the driver
//! does with a source file: load it as the program entry and inspect the
//! accumulated diagnostics.

use dyvac::Program;

fn diagnostics_of(source: &str) -> (bool, Vec<String>) {
    let mut program = Program::new();
    let index = program.load_source(source, true);
    let module = &program.modules[index];
    let messages = module
        .diagnostics
        .iter()
        .map(|d| d.message.clone())
        .collect();
    (module.contains_error(), messages)
}

#[test]
fn hello() {
    let (failed, messages) = diagnostics_of("print(\"Hello\")\n");
    assert!(!failed);
    assert!(messages.is_empty());
}

#[test]
fn missing_implementation() {
    let (failed, messages) = diagnostics_of("fun f(x)\n");
    assert!(failed);
    assert!(messages
        .iter()
        .any(|m| m.contains("f requires an implementation")));
}

#[test]
fn yield_outside_subscript() {
    let (failed, messages) = diagnostics_of("fun g(x) = yield x\n");
    assert!(failed);
    assert!(messages
        .iter()
        .any(|m| m.contains("'yield' can only occur in a subscript")));
}

#[test]
fn indentation_mismatch() {
    let source = "fun f() =\n  a\n   b\n";
    let mut program = Program::new();
    let index = program.load_source(source, true);
    let module = &program.modules[index];

    assert!(module.contains_error());
    let diagnostic = module
        .diagnostics
        .iter()
        .find(|d| {
            d.message
                .contains("dedendation does not match the current indentation")
        })
        .expect("the mismatch is diagnosed");

    // The note lists the exact prefix of the enclosing block
    assert_eq!(diagnostic.notes.len(), 1);
    assert!(diagnostic.notes[0].message.contains("\"  \""));
}

#[test]
fn subscript_with_two_yields() {
    let source = "subscript s(self) =\n  yield self.x\n  yield self.y\n";
    let mut program = Program::new();
    let index = program.load_source(source, true);
    let module = &program.modules[index];

    assert!(module.contains_error());
    let diagnostic = module
        .diagnostics
        .iter()
        .find(|d| d.message.contains("subscript cannot project more than once"))
        .expect("the extra projection is diagnosed");

    // The note points at the first yield
    assert_eq!(diagnostic.notes.len(), 1);
    let file = program.sources.get(module.source);
    assert_eq!(file.text_of(diagnostic.notes[0].site), "yield self.x");
}

#[test]
fn undefined_use() {
    let (failed, messages) = diagnostics_of("print(x)\n");
    assert!(failed);
    assert!(messages.iter().any(|m| m.contains("undefined symbol 'x'")));
}

#[test]
fn run_is_gated_on_errors() {
    let mut program = Program::new();
    let good = program.load_source("print(\"ok\")\n", true);
    let bad = program.load_source("print(nope)\n", true);

    assert!(program.run(good));
    assert!(!program.run(bad));
    assert!(program.contains_error());
}

#[test]
fn ir_textual_form() {
    let mut program = Program::new();
    let index = program.load_source("print(\"Hello\")\n", true);
    let module = &program.modules[index];

    let rendered = module.ir.to_string();
    assert!(rendered.starts_with("fun $main() =\n"), "IR was: {rendered}");
    assert!(rendered.contains("invoke print(\"Hello\")"), "IR was: {rendered}");
    assert!(rendered.contains("return unit"), "IR was: {rendered}");
}

#[test]
fn yield_on_one_path_only_is_extraneous_on_the_rejoin() {
    let source = "\
subscript s(x) =
  if x do
    yield x
  yield x
";
    let mut program = Program::new();
    let index = program.load_source(source, true);
    let module = &program.modules[index];

    assert!(module.contains_error());
    assert!(module
        .diagnostics
        .iter()
        .any(|d| d.message.contains("subscript cannot project more than once")));
}

#[test]
fn ir_invariants_hold_after_the_passes() {
    use dyvac::ir::Value;

    let source = "\
fun f(x, y) =
  let (a, b) = (x, y)
  if a do
    return a + b
  return b
print(f(x: 1, y: 2))
";
    let mut program = Program::new();
    let index = program.load_source(source, true);
    let module = &program.modules[index];
    assert!(
        !module.contains_error(),
        "diagnostics: {:?}",
        module.diagnostics.iter().collect::<Vec<_>>()
    );

    for function in module.ir.functions.values() {
        // Every recorded use names an operand position holding the value
        for id in function.instruction_ids() {
            let value = Value::Register(id);
            for u in function.uses_of(&value) {
                assert_eq!(
                    function.instruction(u.user).kind.operand(u.index as usize),
                    Some(&value)
                );
            }
        }

        // Block windows map back to their blocks, with one terminator at
        // the end
        for block in function.blocks.indices() {
            for id in function.instructions_in(block) {
                assert_eq!(function.container(id), block);
            }

            let ids: Vec<_> = function.instructions_in(block).collect();
            for (i, id) in ids.iter().enumerate() {
                let is_terminator = function.instruction(*id).kind.is_terminator();
                assert_eq!(is_terminator, i + 1 == ids.len());
            }
        }
    }
}

#[test]
fn subscript_regions_and_yields_compose() {
    let source = "\
subscript first(pair) =
  yield pair.0
let p = (1, 2)
print(first[p])
";
    let mut program = Program::new();
    let index = program.load_source(source, true);
    let module = &program.modules[index];
    assert!(
        !module.contains_error(),
        "diagnostics: {:?}",
        module.diagnostics.iter().collect::<Vec<_>>()
    );

    let subscript = module.ir.get("first").expect("the subscript was lowered");
    assert!(subscript.is_subscript);
}
