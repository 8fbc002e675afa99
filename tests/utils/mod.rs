// Integration test utilities
//
// Hand-compiled method bodies for `demo/Fixtures` (source `demo/Fixtures.java`),
// laid out the way javac emits them: line markers before the first
// instruction of each statement, full frames after every branch target.

#![allow(dead_code)]

use linescope::filter::ClassFilter;
use linescope::method::{
    ClassFile, ClassVersion, Cond, ExceptionHandler, Frame, Insn, Label, MethodBody, ValueKind,
    VerificationType, CONSTRUCTOR,
};
use linescope::planner::DispatchMode;
use linescope::registry::{Registry, SourceCounts};
use linescope::transformer::{ClassTransformer, Loader};
use linescope::vm::Machine;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CLASS: &str = "demo/Fixtures";
pub const SOURCE: &str = "demo/Fixtures.java";

fn method(
    name: &str,
    descriptor: &str,
    is_static: bool,
    max_stack: u16,
    max_locals: u16,
    instructions: Vec<Insn>,
) -> MethodBody {
    MethodBody {
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        is_static,
        max_stack,
        max_locals,
        instructions,
        handlers: Vec::new(),
    }
}

fn frame(locals: Vec<VerificationType>) -> Insn {
    Insn::Frame(Frame {
        locals,
        stack: Vec::new(),
    })
}

fn ints(n: usize) -> Vec<VerificationType> {
    vec![VerificationType::Integer; n]
}

/// `static int answer()`, line 3
pub fn one_liner() -> MethodBody {
    method(
        "answer",
        "()I",
        true,
        1,
        0,
        vec![
            Insn::LineNumber(3),
            Insn::IConst(42),
            Insn::ValueReturn(ValueKind::Int),
        ],
    )
}

/// `static int sign(int x)`: `if (x < 0)` line 6, `return -1` line 7,
/// `return 1` line 8
pub fn conditional() -> MethodBody {
    method(
        "sign",
        "(I)I",
        true,
        1,
        1,
        vec![
            Insn::LineNumber(6),
            Insn::Load(ValueKind::Int, 0),
            Insn::If(Cond::Ge, Label(0)),
            Insn::LineNumber(7),
            Insn::IConst(-1),
            Insn::ValueReturn(ValueKind::Int),
            Insn::Label(Label(0)),
            Insn::LineNumber(8),
            frame(ints(1)),
            Insn::IConst(1),
            Insn::ValueReturn(ValueKind::Int),
        ],
    )
}

/// `static int sum(int n)`: `int total = 0` line 11, `for (int i = 0; i < n;
/// i++)` line 12, `total += i` line 13, `return total` line 14
pub fn for_loop() -> MethodBody {
    method(
        "sum",
        "(I)I",
        true,
        2,
        3,
        vec![
            Insn::LineNumber(11),
            Insn::IConst(0),
            Insn::Store(ValueKind::Int, 1),
            Insn::LineNumber(12),
            Insn::IConst(0),
            Insn::Store(ValueKind::Int, 2),
            Insn::Label(Label(0)),
            frame(ints(3)),
            Insn::Load(ValueKind::Int, 2),
            Insn::Load(ValueKind::Int, 0),
            Insn::IfICmp(Cond::Ge, Label(1)),
            Insn::LineNumber(13),
            Insn::Load(ValueKind::Int, 1),
            Insn::Load(ValueKind::Int, 2),
            Insn::IAdd,
            Insn::Store(ValueKind::Int, 1),
            Insn::LineNumber(12),
            Insn::Iinc(2, 1),
            Insn::Goto(Label(0)),
            Insn::Label(Label(1)),
            frame(ints(2)),
            Insn::LineNumber(14),
            Insn::Load(ValueKind::Int, 1),
            Insn::ValueReturn(ValueKind::Int),
        ],
    )
}

/// `static int countdown(int n)`: `int steps = 0` line 17, `while (n > 0)`
/// line 18, `n--` line 19, `steps++` line 20, `return steps` line 22
pub fn while_loop() -> MethodBody {
    method(
        "countdown",
        "(I)I",
        true,
        1,
        2,
        vec![
            Insn::LineNumber(17),
            Insn::IConst(0),
            Insn::Store(ValueKind::Int, 1),
            Insn::Label(Label(0)),
            frame(ints(2)),
            Insn::LineNumber(18),
            Insn::Load(ValueKind::Int, 0),
            Insn::If(Cond::Le, Label(1)),
            Insn::LineNumber(19),
            Insn::Iinc(0, -1),
            Insn::LineNumber(20),
            Insn::Iinc(1, 1),
            Insn::Goto(Label(0)),
            Insn::Label(Label(1)),
            frame(ints(2)),
            Insn::LineNumber(22),
            Insn::Load(ValueKind::Int, 1),
            Insn::ValueReturn(ValueKind::Int),
        ],
    )
}

/// `static int safeDiv(int a, int b)`: `return a / b` line 26 inside a try,
/// `catch (ArithmeticException e)` line 27, `return 0` line 28
pub fn exception_catch() -> MethodBody {
    let mut m = method(
        "safeDiv",
        "(II)I",
        true,
        2,
        3,
        vec![
            Insn::Label(Label(0)),
            Insn::LineNumber(26),
            Insn::Load(ValueKind::Int, 0),
            Insn::Load(ValueKind::Int, 1),
            Insn::IDiv,
            Insn::ValueReturn(ValueKind::Int),
            Insn::Label(Label(1)),
            Insn::Label(Label(2)),
            Insn::Frame(Frame {
                locals: ints(2),
                stack: vec![VerificationType::Object(
                    "java/lang/ArithmeticException".to_string(),
                )],
            }),
            Insn::LineNumber(27),
            Insn::Store(ValueKind::Ref, 2),
            Insn::LineNumber(28),
            Insn::IConst(0),
            Insn::ValueReturn(ValueKind::Int),
        ],
    );
    m.handlers.push(ExceptionHandler {
        start: Label(0),
        end: Label(1),
        handler: Label(2),
        catch_type: Some("java/lang/ArithmeticException".to_string()),
    });
    m
}

/// `static void explode(int n)`: `int i = 0` line 31, `if (i == n) throw new
/// IllegalStateException()` line 33, `i++` line 34, inside `while (true)`
pub fn loop_throwing() -> MethodBody {
    method(
        "explode",
        "(I)V",
        true,
        2,
        2,
        vec![
            Insn::LineNumber(31),
            Insn::IConst(0),
            Insn::Store(ValueKind::Int, 1),
            Insn::Label(Label(0)),
            frame(ints(2)),
            Insn::LineNumber(33),
            Insn::Load(ValueKind::Int, 1),
            Insn::Load(ValueKind::Int, 0),
            Insn::IfICmp(Cond::Ne, Label(1)),
            Insn::New("java/lang/IllegalStateException".to_string()),
            Insn::Dup,
            Insn::InvokeInit("java/lang/IllegalStateException".to_string()),
            Insn::Throw,
            Insn::Label(Label(1)),
            frame(ints(2)),
            Insn::LineNumber(34),
            Insn::Iinc(1, 1),
            Insn::Goto(Label(0)),
        ],
    )
}

/// Constructor: `super()` line 37, `for (int i = 0; i < 2; i++)` line 38,
/// loop body line 39, closing brace line 40
pub fn constructor_with_loop() -> MethodBody {
    let this = VerificationType::Object(CLASS.to_string());
    method(
        CONSTRUCTOR,
        "()V",
        false,
        2,
        2,
        vec![
            Insn::LineNumber(37),
            Insn::Load(ValueKind::Ref, 0),
            Insn::InvokeInit("java/lang/Object".to_string()),
            Insn::LineNumber(38),
            Insn::IConst(0),
            Insn::Store(ValueKind::Int, 1),
            Insn::Label(Label(0)),
            frame(vec![this.clone(), VerificationType::Integer]),
            Insn::Load(ValueKind::Int, 1),
            Insn::IConst(2),
            Insn::IfICmp(Cond::Ge, Label(1)),
            Insn::LineNumber(39),
            Insn::Nop,
            Insn::LineNumber(38),
            Insn::Iinc(1, 1),
            Insn::Goto(Label(0)),
            Insn::Label(Label(1)),
            frame(vec![this]),
            Insn::LineNumber(40),
            Insn::Return,
        ],
    )
}

/// Instance method `int twice(int x)`, line 43
pub fn instance_method() -> MethodBody {
    method(
        "twice",
        "(I)I",
        false,
        2,
        2,
        vec![
            Insn::LineNumber(43),
            Insn::Load(ValueKind::Int, 1),
            Insn::IConst(2),
            Insn::IMul,
            Insn::ValueReturn(ValueKind::Int),
        ],
    )
}

/// `static int classify(int x)`: `switch (x)` line 46, `case 0` line 47,
/// `case 1` line 48, `default` line 49
pub fn switch_method() -> MethodBody {
    method(
        "classify",
        "(I)I",
        true,
        1,
        1,
        vec![
            Insn::LineNumber(46),
            Insn::Load(ValueKind::Int, 0),
            Insn::TableSwitch {
                low: 0,
                targets: vec![Label(0), Label(1)],
                default: Label(2),
            },
            Insn::Label(Label(0)),
            frame(ints(1)),
            Insn::LineNumber(47),
            Insn::IConst(10),
            Insn::ValueReturn(ValueKind::Int),
            Insn::Label(Label(1)),
            frame(ints(1)),
            Insn::LineNumber(48),
            Insn::IConst(20),
            Insn::ValueReturn(ValueKind::Int),
            Insn::Label(Label(2)),
            frame(ints(1)),
            Insn::LineNumber(49),
            Insn::IConst(-1),
            Insn::ValueReturn(ValueKind::Int),
        ],
    )
}

/// Instance method `long accumulate(Object tag, long base, int n, int stop)`:
/// `for (int i = 0; i < n; i++)` line 52, `base += 6 / (stop - i)` line 53,
/// `return base` line 54. Throws `ArithmeticException` once `i == stop`.
pub fn instance_loop() -> MethodBody {
    let this = VerificationType::Object(CLASS.to_string());
    let tag = VerificationType::Object("java/lang/Object".to_string());
    let params = vec![
        this,
        tag,
        VerificationType::Long,
        VerificationType::Integer,
        VerificationType::Integer,
    ];
    let mut in_loop = params.clone();
    in_loop.push(VerificationType::Integer);
    method(
        "accumulate",
        "(Ljava/lang/Object;JII)J",
        false,
        4,
        6,
        vec![
            Insn::LineNumber(52),
            Insn::IConst(0),
            Insn::Store(ValueKind::Int, 5),
            Insn::Label(Label(0)),
            frame(in_loop),
            Insn::Load(ValueKind::Int, 5),
            Insn::Load(ValueKind::Int, 3),
            Insn::IfICmp(Cond::Ge, Label(1)),
            Insn::LineNumber(53),
            Insn::Load(ValueKind::Long, 2),
            Insn::IConst(6),
            Insn::Load(ValueKind::Int, 4),
            Insn::Load(ValueKind::Int, 5),
            Insn::ISub,
            Insn::IDiv,
            Insn::I2L,
            Insn::LAdd,
            Insn::Store(ValueKind::Long, 2),
            Insn::LineNumber(52),
            Insn::Iinc(5, 1),
            Insn::Goto(Label(0)),
            Insn::Label(Label(1)),
            frame(params),
            Insn::LineNumber(54),
            Insn::Load(ValueKind::Long, 2),
            Insn::ValueReturn(ValueKind::Long),
        ],
    )
}

/// Every fixture method in one class
pub fn fixture_class(major: u16) -> ClassFile {
    ClassFile {
        name: CLASS.to_string(),
        source_file: Some("Fixtures.java".to_string()),
        version: ClassVersion::new(major),
        methods: vec![
            one_liner(),
            conditional(),
            for_loop(),
            while_loop(),
            exception_catch(),
            loop_throwing(),
            constructor_with_loop(),
            instance_method(),
            switch_method(),
            instance_loop(),
        ],
    }
}

/// Transformer instrumenting everything under `demo/`
pub fn transformer(registry: Arc<Registry>, dispatch: DispatchMode) -> ClassTransformer {
    ClassTransformer::new(ClassFilter::none().include_prefix("demo/"), registry, dispatch)
}

/// Registry plus a machine with the instrumented fixture class loaded
pub fn instrumented_machine(dispatch: DispatchMode) -> (Arc<Registry>, Machine) {
    let registry = Arc::new(Registry::new());
    let class = transformer(registry.clone(), dispatch)
        .transform(Loader::Application, fixture_class(52));
    let mut machine = Machine::new(registry.clone());
    machine.load(class).expect("instrumented fixture class verifies");
    (registry, machine)
}

/// Run one update cycle and return the accumulated counts of the fixture
/// source, zero entries removed
pub fn line_counts(registry: &Registry) -> BTreeMap<u32, u64> {
    registry.update_listeners(&mut SourceCounts::new());
    registry
        .accumulated()
        .remove(SOURCE)
        .unwrap_or_default()
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .collect()
}
