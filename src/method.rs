//! Method instruction-stream model
//!
//! A JVM-shaped representation of loaded classes: methods carry a descriptor,
//! stack/local limits, an instruction list with pseudo-instructions for labels,
//! source line markers and full stack-map frames, and an exception handler
//! table. The planner, rewriter, verifier and VM all operate on this model.
//!
//! Every value occupies exactly one local slot and one stack slot, including
//! longs and doubles.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Internal name of the root exception type
pub const THROWABLE: &str = "java/lang/Throwable";

/// Constructor method name
pub const CONSTRUCTOR: &str = "<init>";

/// Errors describing a structurally invalid method
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid method descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Label {0} defined more than once")]
    DuplicateLabel(Label),

    #[error("Label {0} referenced but never defined")]
    UndefinedLabel(Label),
}

/// Branch target marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Class file format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassVersion {
    pub major: u16,
    #[serde(default)]
    pub minor: u16,
}

impl ClassVersion {
    /// First format version whose runtime links dynamically resolved call sites
    pub const DYNAMIC_CALL_SITES: u16 = 51;

    pub const fn new(major: u16) -> Self {
        Self { major, minor: 0 }
    }

    /// Whether the target runtime supports dynamically resolved call sites
    pub fn supports_dynamic_call_sites(self) -> bool {
        self.major >= Self::DYNAMIC_CALL_SITES
    }
}

/// Operand kind for loads, stores and returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

impl ValueKind {
    fn mnemonic_prefix(self) -> char {
        match self {
            ValueKind::Int => 'i',
            ValueKind::Long => 'l',
            ValueKind::Float => 'f',
            ValueKind::Double => 'd',
            ValueKind::Ref => 'a',
        }
    }
}

/// Type-state of one local or stack entry as recorded in a stack-map frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    Uninitialized(Label),
    Object(String),
}

impl VerificationType {
    /// Whether a value of type `self` may flow into a slot declared `target`
    ///
    /// References are not checked against a class hierarchy: any initialized
    /// reference (or null) is assignable to any object type.
    pub fn is_assignable_to(&self, target: &VerificationType) -> bool {
        match (self, target) {
            (_, VerificationType::Top) => true,
            (VerificationType::Null, VerificationType::Object(_)) => true,
            (VerificationType::Object(_), VerificationType::Object(_)) => true,
            (a, b) => a == b,
        }
    }

    /// Whether the type can be read with a load of `kind`
    pub fn matches_kind(&self, kind: ValueKind) -> bool {
        match kind {
            ValueKind::Int => *self == VerificationType::Integer,
            ValueKind::Long => *self == VerificationType::Long,
            ValueKind::Float => *self == VerificationType::Float,
            ValueKind::Double => *self == VerificationType::Double,
            ValueKind::Ref => matches!(
                self,
                VerificationType::Null
                    | VerificationType::Object(_)
                    | VerificationType::UninitializedThis
                    | VerificationType::Uninitialized(_)
            ),
        }
    }

    /// The type a store of `kind` leaves in a local
    pub fn for_store(kind: ValueKind) -> VerificationType {
        match kind {
            ValueKind::Int => VerificationType::Integer,
            ValueKind::Long => VerificationType::Long,
            ValueKind::Float => VerificationType::Float,
            ValueKind::Double => VerificationType::Double,
            ValueKind::Ref => VerificationType::Object("java/lang/Object".to_string()),
        }
    }
}

impl fmt::Display for VerificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationType::Top => write!(f, "top"),
            VerificationType::Integer => write!(f, "int"),
            VerificationType::Float => write!(f, "float"),
            VerificationType::Long => write!(f, "long"),
            VerificationType::Double => write!(f, "double"),
            VerificationType::Null => write!(f, "null"),
            VerificationType::UninitializedThis => write!(f, "uninitializedThis"),
            VerificationType::Uninitialized(label) => write!(f, "uninitialized({label})"),
            VerificationType::Object(name) => write!(f, "{name}"),
        }
    }
}

/// Full stack-map frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub locals: Vec<VerificationType>,
    #[serde(default)]
    pub stack: Vec<VerificationType>,
}

/// Comparison used by conditional jumps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    pub fn holds(self, lhs: i32, rhs: i32) -> bool {
        match self {
            Cond::Eq => lhs == rhs,
            Cond::Ne => lhs != rhs,
            Cond::Lt => lhs < rhs,
            Cond::Ge => lhs >= rhs,
            Cond::Gt => lhs > rhs,
            Cond::Le => lhs <= rhs,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Ge => "ge",
            Cond::Gt => "gt",
            Cond::Le => "le",
        }
    }
}

/// Loadable constant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Str(String),
}

/// What a dynamically resolved counter call site does once bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiteKind {
    /// `()V`: add one visit
    Visit,
    /// `(J)V`: add the long popped from the stack
    Add,
}

/// Dynamically resolved call site bound to one line's counter
///
/// The bootstrap arguments are the line identity; the runtime resolves them to
/// a counter handle on first execution and reuses it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallSite {
    pub kind: SiteKind,
    pub source: String,
    pub line: u32,
}

impl CallSite {
    pub fn visit(source: &str, line: u32) -> Self {
        Self {
            kind: SiteKind::Visit,
            source: source.to_string(),
            line,
        }
    }

    pub fn add(source: &str, line: u32) -> Self {
        Self {
            kind: SiteKind::Add,
            source: source.to_string(),
            line,
        }
    }
}

/// One entry of a method's instruction stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Insn {
    // Pseudo-instructions
    Label(Label),
    LineNumber(u32),
    Frame(Frame),

    // Constants
    Nop,
    IConst(i32),
    LConst(i64),
    AConstNull,
    Ldc(Constant),

    // Locals
    Load(ValueKind, u16),
    Store(ValueKind, u16),
    Iinc(u16, i32),

    // Operand stack
    Pop,
    Dup,

    // Arithmetic
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    I2L,
    LAdd,

    // Control flow
    If(Cond, Label),
    IfICmp(Cond, Label),
    Goto(Label),
    TableSwitch {
        low: i32,
        targets: Vec<Label>,
        default: Label,
    },
    Return,
    ValueReturn(ValueKind),
    Throw,

    // Objects
    New(String),
    /// Invoke the no-argument constructor of the given class on the popped reference
    InvokeInit(String),

    // Counter hooks
    GetRegistry,
    LookupCounter,
    CounterAdd,
    InvokeDynamic(CallSite),
}

impl Insn {
    /// Labels, line markers and frames do not execute
    pub fn is_pseudo(&self) -> bool {
        matches!(self, Insn::Label(_) | Insn::LineNumber(_) | Insn::Frame(_))
    }

    /// Instructions emitted by the rewriter to drive registry counters
    pub fn is_hook(&self) -> bool {
        matches!(
            self,
            Insn::GetRegistry | Insn::LookupCounter | Insn::CounterAdd | Insn::InvokeDynamic(_)
        )
    }

    /// Normal method exits (not `Throw`)
    pub fn is_return(&self) -> bool {
        matches!(self, Insn::Return | Insn::ValueReturn(_))
    }

    /// Control never falls through to the next instruction
    pub fn is_unconditional_transfer(&self) -> bool {
        matches!(
            self,
            Insn::Goto(_)
                | Insn::TableSwitch { .. }
                | Insn::Return
                | Insn::ValueReturn(_)
                | Insn::Throw
        )
    }

    /// Every label this instruction may jump to
    pub fn jump_targets(&self) -> Vec<Label> {
        match self {
            Insn::If(_, target) | Insn::IfICmp(_, target) | Insn::Goto(target) => vec![*target],
            Insn::TableSwitch {
                targets, default, ..
            } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Label(label) => write!(f, "{label}:"),
            Insn::LineNumber(line) => write!(f, "  LINENUMBER {line}"),
            Insn::Frame(frame) => {
                let locals: Vec<String> = frame.locals.iter().map(|t| t.to_string()).collect();
                let stack: Vec<String> = frame.stack.iter().map(|t| t.to_string()).collect();
                write!(
                    f,
                    "  FRAME [{}] [{}]",
                    locals.join(", "),
                    stack.join(", ")
                )
            }
            Insn::Nop => write!(f, "    nop"),
            Insn::IConst(v) => write!(f, "    iconst {v}"),
            Insn::LConst(v) => write!(f, "    lconst {v}"),
            Insn::AConstNull => write!(f, "    aconst_null"),
            Insn::Ldc(Constant::Int(v)) => write!(f, "    ldc {v}"),
            Insn::Ldc(Constant::Long(v)) => write!(f, "    ldc {v}L"),
            Insn::Ldc(Constant::Str(s)) => write!(f, "    ldc \"{s}\""),
            Insn::Load(kind, slot) => write!(f, "    {}load {slot}", kind.mnemonic_prefix()),
            Insn::Store(kind, slot) => write!(f, "    {}store {slot}", kind.mnemonic_prefix()),
            Insn::Iinc(slot, delta) => write!(f, "    iinc {slot} {delta}"),
            Insn::Pop => write!(f, "    pop"),
            Insn::Dup => write!(f, "    dup"),
            Insn::IAdd => write!(f, "    iadd"),
            Insn::ISub => write!(f, "    isub"),
            Insn::IMul => write!(f, "    imul"),
            Insn::IDiv => write!(f, "    idiv"),
            Insn::IRem => write!(f, "    irem"),
            Insn::I2L => write!(f, "    i2l"),
            Insn::LAdd => write!(f, "    ladd"),
            Insn::If(cond, target) => write!(f, "    if{} {target}", cond.suffix()),
            Insn::IfICmp(cond, target) => write!(f, "    if_icmp{} {target}", cond.suffix()),
            Insn::Goto(target) => write!(f, "    goto {target}"),
            Insn::TableSwitch {
                low,
                targets,
                default,
            } => {
                let labels: Vec<String> = targets.iter().map(|l| l.to_string()).collect();
                write!(
                    f,
                    "    tableswitch {low} [{}] default {default}",
                    labels.join(", ")
                )
            }
            Insn::Return => write!(f, "    return"),
            Insn::ValueReturn(kind) => write!(f, "    {}return", kind.mnemonic_prefix()),
            Insn::Throw => write!(f, "    athrow"),
            Insn::New(class) => write!(f, "    new {class}"),
            Insn::InvokeInit(class) => write!(f, "    invokespecial {class}.<init>()V"),
            Insn::GetRegistry => write!(f, "    getregistry"),
            Insn::LookupCounter => write!(f, "    lookupcounter"),
            Insn::CounterAdd => write!(f, "    counteradd"),
            Insn::InvokeDynamic(site) => {
                let name = match site.kind {
                    SiteKind::Visit => "visitLine ()V",
                    SiteKind::Add => "addVisits (J)V",
                };
                write!(f, "    invokedynamic {name} [{}:{}]", site.source, site.line)
            }
        }
    }
}

/// Exception handler table entry; `end` is exclusive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub start: Label,
    pub end: Label,
    pub handler: Label,
    /// `None` catches every exception
    #[serde(default)]
    pub catch_type: Option<String>,
}

/// Field type from a JVM descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Object(String),
    /// Array type, holding its full descriptor (e.g. `[I`)
    Array(String),
}

impl FieldType {
    /// Frame type of a parameter of this type
    pub fn verification_type(&self) -> VerificationType {
        match self {
            FieldType::Boolean
            | FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Int => VerificationType::Integer,
            FieldType::Float => VerificationType::Float,
            FieldType::Long => VerificationType::Long,
            FieldType::Double => VerificationType::Double,
            FieldType::Array(descriptor) => VerificationType::Object(descriptor.clone()),
            FieldType::Object(name) => VerificationType::Object(name.clone()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            FieldType::Boolean
            | FieldType::Byte
            | FieldType::Char
            | FieldType::Short
            | FieldType::Int => ValueKind::Int,
            FieldType::Float => ValueKind::Float,
            FieldType::Long => ValueKind::Long,
            FieldType::Double => ValueKind::Double,
            FieldType::Object(_) | FieldType::Array(_) => ValueKind::Ref,
        }
    }
}

/// Parsed method descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    /// `None` for `V`
    pub returns: Option<FieldType>,
}

impl MethodDescriptor {
    /// Parse a descriptor such as `(IJLjava/lang/String;[I)V`
    pub fn parse(descriptor: &str) -> Result<Self, ModelError> {
        let invalid = || ModelError::InvalidDescriptor(descriptor.to_string());

        let rest = descriptor.strip_prefix('(').ok_or_else(invalid)?;
        let close = rest.find(')').ok_or_else(invalid)?;
        let (mut params_str, ret_str) = (&rest[..close], &rest[close + 1..]);

        let mut params = Vec::new();
        while !params_str.is_empty() {
            let (field, remaining) = parse_field_type(params_str).ok_or_else(invalid)?;
            params.push(field);
            params_str = remaining;
        }

        let returns = if ret_str == "V" {
            None
        } else {
            match parse_field_type(ret_str) {
                Some((field, "")) => Some(field),
                _ => return Err(invalid()),
            }
        };

        Ok(Self { params, returns })
    }
}

fn parse_field_type(s: &str) -> Option<(FieldType, &str)> {
    let first = s.chars().next()?;
    let rest = &s[1..];
    let simple = match first {
        'Z' => Some(FieldType::Boolean),
        'B' => Some(FieldType::Byte),
        'C' => Some(FieldType::Char),
        'S' => Some(FieldType::Short),
        'I' => Some(FieldType::Int),
        'F' => Some(FieldType::Float),
        'J' => Some(FieldType::Long),
        'D' => Some(FieldType::Double),
        _ => None,
    };
    if let Some(field) = simple {
        return Some((field, rest));
    }

    match first {
        'L' => {
            let end = rest.find(';')?;
            if end == 0 {
                return None;
            }
            Some((FieldType::Object(rest[..end].to_string()), &rest[end + 1..]))
        }
        '[' => {
            let (_, remaining) = parse_field_type(rest)?;
            let consumed = s.len() - remaining.len();
            Some((FieldType::Array(s[..consumed].to_string()), remaining))
        }
        _ => None,
    }
}

/// Code body of one method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub name: String,
    pub descriptor: String,
    #[serde(default)]
    pub is_static: bool,
    pub max_stack: u16,
    pub max_locals: u16,
    pub instructions: Vec<Insn>,
    #[serde(default)]
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR
    }

    pub fn parsed_descriptor(&self) -> Result<MethodDescriptor, ModelError> {
        MethodDescriptor::parse(&self.descriptor)
    }

    /// Type-state of the locals on method entry: the receiver (if any)
    /// followed by every declared parameter
    pub fn entry_locals(&self, class_name: &str) -> Result<Vec<VerificationType>, ModelError> {
        let descriptor = self.parsed_descriptor()?;
        let mut locals = Vec::with_capacity(descriptor.params.len() + 1);
        if !self.is_static {
            if self.is_constructor() {
                locals.push(VerificationType::UninitializedThis);
            } else {
                locals.push(VerificationType::Object(class_name.to_string()));
            }
        }
        locals.extend(descriptor.params.iter().map(FieldType::verification_type));
        Ok(locals)
    }

    /// Map every label to the index of its definition, checking that each
    /// label is defined once and that every referenced label exists
    pub fn label_table(&self) -> Result<HashMap<Label, usize>, ModelError> {
        let mut positions = HashMap::new();
        for (index, insn) in self.instructions.iter().enumerate() {
            if let Insn::Label(label) = insn {
                if positions.insert(*label, index).is_some() {
                    return Err(ModelError::DuplicateLabel(*label));
                }
            }
        }

        let referenced = self
            .instructions
            .iter()
            .flat_map(Insn::jump_targets)
            .chain(
                self.handlers
                    .iter()
                    .flat_map(|h| [h.start, h.end, h.handler]),
            );
        for label in referenced {
            if !positions.contains_key(&label) {
                return Err(ModelError::UndefinedLabel(label));
            }
        }

        Ok(positions)
    }

    /// The first label number above every label defined in the method, or
    /// `None` when `u32::MAX` is already taken
    pub fn next_free_label(&self) -> Option<u32> {
        self.instructions
            .iter()
            .filter_map(|insn| match insn {
                Insn::Label(label) => Some(label.0.checked_add(1)),
                _ => None,
            })
            .try_fold(0, |max, next| next.map(|next| max.max(next)))
    }

    /// Human-readable listing, one instruction per line
    pub fn listing(&self) -> String {
        let mut out = format!(
            "{}{} (max_stack={}, max_locals={})\n",
            self.name, self.descriptor, self.max_stack, self.max_locals
        );
        for insn in &self.instructions {
            out.push_str(&insn.to_string());
            out.push('\n');
        }
        for handler in &self.handlers {
            out.push_str(&format!(
                "  TRYCATCH {} {} {} {}\n",
                handler.start,
                handler.end,
                handler.handler,
                handler.catch_type.as_deref().unwrap_or("any")
            ));
        }
        out
    }
}

/// A loaded class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassFile {
    /// Internal name, e.g. `com/acme/Widget`
    pub name: String,
    /// Source file attribute, e.g. `Widget.java`
    #[serde(default)]
    pub source_file: Option<String>,
    pub version: ClassVersion,
    pub methods: Vec<MethodBody>,
}

impl ClassFile {
    /// Source path used as line identity: package directory + source file
    ///
    /// `com/acme/Widget` compiled from `Widget.java` gives `com/acme/Widget.java`.
    pub fn source_path(&self) -> Option<String> {
        let source_file = self.source_file.as_ref()?;
        let package = match self.name.rfind('/') {
            Some(idx) => &self.name[..=idx],
            None => "",
        };
        Some(format!("{package}{source_file}"))
    }

    pub fn method(&self, name: &str) -> Option<&MethodBody> {
        self.methods.iter().find(|m| m.name == name)
    }
}
