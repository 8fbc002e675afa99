//! Reference interpreter for the method model
//!
//! Executes original and rewritten method bodies so instrumentation can be
//! observed end to end: hooks drive the shared [`Registry`], exceptions unwind
//! through handler tables in table order, and the limits a method declares
//! (`max_stack`, `max_locals`) are enforced on every push and slot access.
//!
//! Every class is verified when loaded. Dynamically resolved call sites are
//! linked on first execution and the bound [`LineCounter`] is cached per
//! instruction.
//!
//! There is no class hierarchy: a typed handler catches its exact class, and
//! `java/lang/Throwable` or `java/lang/Exception` handlers catch everything.

use crate::method::{
    ClassFile, Constant, FieldType, Insn, Label, MethodBody, SiteKind, ValueKind, CONSTRUCTOR,
    THROWABLE,
};
use crate::registry::{LineCounter, Registry};
use crate::verifier::{self, VerifyError};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, trace};

pub const ARITHMETIC_EXCEPTION: &str = "java/lang/ArithmeticException";
pub const NULL_POINTER_EXCEPTION: &str = "java/lang/NullPointerException";
const EXCEPTION: &str = "java/lang/Exception";

/// Default step budget per top-level invocation
pub const DEFAULT_FUEL: u64 = 10_000_000;

#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("Class {0} is not loaded")]
    NoSuchClass(String),

    #[error("Method {class}.{method} not found")]
    NoSuchMethod { class: String, method: String },

    #[error("Bad arguments for {method}: {reason}")]
    BadArguments { method: String, reason: String },

    #[error("Uncaught exception {0}")]
    Uncaught(String),

    #[error("Operand stack overflow (max_stack {limit}) in {method}")]
    StackOverflow { method: String, limit: u16 },

    #[error("Operand stack underflow in {method}")]
    StackUnderflow { method: String },

    #[error("Local {slot} read before assignment in {method}")]
    UnsetLocal { method: String, slot: u16 },

    #[error("Type mismatch in {method}: expected {expected}, found {found}")]
    TypeMismatch {
        method: String,
        expected: &'static str,
        found: String,
    },

    #[error("Call site {path}:{line} could not be linked")]
    UnlinkedCallSite { path: String, line: u32 },

    #[error("Control fell off the end of {0}")]
    FellOffEnd(String),

    #[error("Fuel exhausted after {0} steps")]
    OutOfFuel(u64),
}

/// Heap reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(usize);

/// Runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Ref(ObjectRef),
    Str(Arc<str>),
    Registry,
    Counter(LineCounter),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Null
            | Value::Ref(_)
            | Value::Str(_)
            | Value::Registry
            | Value::Counter(_) => ValueKind::Ref,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}L"),
            Value::Float(v) => write!(f, "{v}f"),
            Value::Double(v) => write!(f, "{v}d"),
            Value::Null => write!(f, "null"),
            Value::Ref(r) => write!(f, "@{}", r.0),
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Registry => write!(f, "<registry>"),
            Value::Counter(c) => write!(f, "<counter {}>", c.index()),
        }
    }
}

#[derive(Debug)]
struct HeapObject {
    class: String,
    initialized: bool,
}

struct LoadedMethod {
    body: MethodBody,
    params: Vec<FieldType>,
    labels: HashMap<Label, usize>,
    /// Bound counter per instruction, only populated for `InvokeDynamic`
    sites: Vec<OnceLock<LineCounter>>,
}

struct LoadedClass {
    name: String,
    methods: Vec<LoadedMethod>,
}

impl LoadedClass {
    fn method(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.body.name == name)
    }
}

enum Outcome {
    Return(Option<Value>),
    Throw(ObjectRef),
}

/// Interpreter state: loaded classes and the object heap
pub struct Machine {
    registry: Arc<Registry>,
    classes: HashMap<String, Arc<LoadedClass>>,
    heap: Vec<HeapObject>,
    fuel: u64,
    steps: u64,
}

impl Machine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            classes: HashMap::new(),
            heap: Vec::new(),
            fuel: DEFAULT_FUEL,
            steps: 0,
        }
    }

    /// Limit the number of executed instructions per top-level invocation
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Verify and load a class, replacing any earlier class of the same name
    pub fn load(&mut self, class: ClassFile) -> Result<(), VmError> {
        verifier::verify_class(&class)?;

        let mut methods = Vec::with_capacity(class.methods.len());
        for body in class.methods {
            let params = body
                .parsed_descriptor()
                .map_err(|e| VmError::BadArguments {
                    method: body.name.clone(),
                    reason: e.to_string(),
                })?
                .params;
            let labels = body.label_table().map_err(|e| VmError::BadArguments {
                method: body.name.clone(),
                reason: e.to_string(),
            })?;
            let sites = (0..body.instructions.len()).map(|_| OnceLock::new()).collect();
            methods.push(LoadedMethod {
                body,
                params,
                labels,
                sites,
            });
        }

        debug!(class = %class.name, methods = methods.len(), "Loaded class");
        self.classes.insert(
            class.name.clone(),
            Arc::new(LoadedClass {
                name: class.name,
                methods,
            }),
        );
        Ok(())
    }

    pub fn is_loaded(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Allocate an instance and run its no-argument constructor, if it has one
    pub fn construct(&mut self, class: &str) -> Result<Value, VmError> {
        let object = self.allocate(class);
        self.steps = 0;
        match self.initialize(class, object)? {
            None => Ok(Value::Ref(object)),
            Some(thrown) => Err(VmError::Uncaught(self.class_of(thrown).to_string())),
        }
    }

    /// Invoke a method by name; instance methods take the receiver first
    pub fn invoke(
        &mut self,
        class: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let loaded = self.class(class)?;
        let index = loaded
            .method(method)
            .ok_or_else(|| VmError::NoSuchMethod {
                class: class.to_string(),
                method: method.to_string(),
            })?;

        self.steps = 0;
        match self.execute(&loaded, index, args)? {
            Outcome::Return(value) => Ok(value),
            Outcome::Throw(thrown) => Err(VmError::Uncaught(self.class_of(thrown).to_string())),
        }
    }

    /// Class name of a heap object
    pub fn class_of(&self, object: ObjectRef) -> &str {
        &self.heap[object.0].class
    }

    fn class(&self, name: &str) -> Result<Arc<LoadedClass>, VmError> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| VmError::NoSuchClass(name.to_string()))
    }

    fn allocate(&mut self, class: &str) -> ObjectRef {
        self.heap.push(HeapObject {
            class: class.to_string(),
            initialized: false,
        });
        ObjectRef(self.heap.len() - 1)
    }

    fn new_exception(&mut self, class: &str) -> ObjectRef {
        let object = self.allocate(class);
        self.heap[object.0].initialized = true;
        object
    }

    /// Run `<init>()V` of `class` on `object`; classes that are not loaded
    /// initialize trivially. Returns the exception thrown, if any.
    fn initialize(&mut self, class: &str, object: ObjectRef) -> Result<Option<ObjectRef>, VmError> {
        let ctor = self
            .classes
            .get(class)
            .cloned()
            .and_then(|loaded| loaded.method(CONSTRUCTOR).map(|index| (loaded, index)));

        if let Some((loaded, index)) = ctor {
            if let Outcome::Throw(thrown) = self.execute(&loaded, index, vec![Value::Ref(object)])? {
                return Ok(Some(thrown));
            }
        }
        self.heap[object.0].initialized = true;
        Ok(None)
    }

    fn catches(&self, catch_type: Option<&str>, thrown: ObjectRef) -> bool {
        match catch_type {
            None => true,
            Some(THROWABLE) | Some(EXCEPTION) => true,
            Some(name) => self.class_of(thrown) == name,
        }
    }

    fn bind_arguments(
        method: &LoadedMethod,
        args: Vec<Value>,
    ) -> Result<Vec<Option<Value>>, VmError> {
        let body = &method.body;
        let receiver = usize::from(!body.is_static);
        let bad = |reason: String| VmError::BadArguments {
            method: body.name.clone(),
            reason,
        };

        if args.len() != method.params.len() + receiver {
            return Err(bad(format!(
                "expected {} arguments, got {}",
                method.params.len() + receiver,
                args.len()
            )));
        }
        if receiver == 1 && args[0].kind() != ValueKind::Ref {
            return Err(bad("receiver must be a reference".to_string()));
        }
        for (position, (param, arg)) in method.params.iter().zip(&args[receiver..]).enumerate() {
            if param.kind() != arg.kind() {
                return Err(bad(format!(
                    "argument {position} should be {:?}, got {arg}",
                    param.kind()
                )));
            }
        }
        if args.len() > body.max_locals as usize {
            return Err(bad("arguments exceed max_locals".to_string()));
        }

        let mut locals: Vec<Option<Value>> = vec![None; body.max_locals as usize];
        for (slot, arg) in args.into_iter().enumerate() {
            locals[slot] = Some(arg);
        }
        Ok(locals)
    }

    fn execute(
        &mut self,
        class: &Arc<LoadedClass>,
        method_index: usize,
        args: Vec<Value>,
    ) -> Result<Outcome, VmError> {
        let method = &class.methods[method_index];
        let body = &method.body;
        let mut locals = Self::bind_arguments(method, args)?;
        let mut stack = Operands::new(&body.name, body.max_stack);
        let insns = &body.instructions;
        let mut pc = 0usize;

        trace!(class = %class.name, method = %body.name, "enter");

        loop {
            let Some(insn) = insns.get(pc) else {
                return Err(VmError::FellOffEnd(body.name.clone()));
            };
            let at = pc;
            pc += 1;

            if insn.is_pseudo() {
                continue;
            }
            self.steps += 1;
            if self.steps > self.fuel {
                return Err(VmError::OutOfFuel(self.fuel));
            }

            let mut thrown: Option<ObjectRef> = None;

            match insn {
                Insn::Label(_) | Insn::LineNumber(_) | Insn::Frame(_) => {}
                Insn::Nop => {}
                Insn::IConst(v) => stack.push(Value::Int(*v))?,
                Insn::LConst(v) => stack.push(Value::Long(*v))?,
                Insn::AConstNull => stack.push(Value::Null)?,
                Insn::Ldc(Constant::Int(v)) => stack.push(Value::Int(*v))?,
                Insn::Ldc(Constant::Long(v)) => stack.push(Value::Long(*v))?,
                Insn::Ldc(Constant::Str(s)) => stack.push(Value::Str(Arc::from(s.as_str())))?,

                Insn::Load(kind, slot) => {
                    let value = locals
                        .get(*slot as usize)
                        .and_then(Option::as_ref)
                        .ok_or_else(|| VmError::UnsetLocal {
                            method: body.name.clone(),
                            slot: *slot,
                        })?;
                    stack.check_kind(value, *kind)?;
                    stack.push(value.clone())?;
                }
                Insn::Store(kind, slot) => {
                    let value = stack.pop()?;
                    stack.check_kind(&value, *kind)?;
                    let Some(local) = locals.get_mut(*slot as usize) else {
                        return Err(VmError::UnsetLocal {
                            method: body.name.clone(),
                            slot: *slot,
                        });
                    };
                    *local = Some(value);
                }
                Insn::Iinc(slot, delta) => match locals.get_mut(*slot as usize) {
                    Some(Some(Value::Int(v))) => *v = v.wrapping_add(*delta),
                    _ => {
                        return Err(VmError::UnsetLocal {
                            method: body.name.clone(),
                            slot: *slot,
                        })
                    }
                },

                Insn::Pop => {
                    stack.pop()?;
                }
                Insn::Dup => {
                    let top = stack.peek()?.clone();
                    stack.push(top)?;
                }

                Insn::IAdd | Insn::ISub | Insn::IMul | Insn::IDiv | Insn::IRem => {
                    let rhs = stack.pop_int()?;
                    let lhs = stack.pop_int()?;
                    let result = match insn {
                        Insn::IAdd => Some(lhs.wrapping_add(rhs)),
                        Insn::ISub => Some(lhs.wrapping_sub(rhs)),
                        Insn::IMul => Some(lhs.wrapping_mul(rhs)),
                        Insn::IDiv if rhs != 0 => Some(lhs.wrapping_div(rhs)),
                        Insn::IRem if rhs != 0 => Some(lhs.wrapping_rem(rhs)),
                        _ => None,
                    };
                    match result {
                        Some(value) => stack.push(Value::Int(value))?,
                        None => thrown = Some(self.new_exception(ARITHMETIC_EXCEPTION)),
                    }
                }
                Insn::I2L => {
                    let v = stack.pop_int()?;
                    stack.push(Value::Long(i64::from(v)))?;
                }
                Insn::LAdd => {
                    let rhs = stack.pop_long()?;
                    let lhs = stack.pop_long()?;
                    stack.push(Value::Long(lhs.wrapping_add(rhs)))?;
                }

                Insn::If(cond, target) => {
                    if cond.holds(stack.pop_int()?, 0) {
                        pc = method.labels[target];
                    }
                }
                Insn::IfICmp(cond, target) => {
                    let rhs = stack.pop_int()?;
                    let lhs = stack.pop_int()?;
                    if cond.holds(lhs, rhs) {
                        pc = method.labels[target];
                    }
                }
                Insn::Goto(target) => pc = method.labels[target],
                Insn::TableSwitch {
                    low,
                    targets,
                    default,
                } => {
                    let key = stack.pop_int()?;
                    let target = i64::from(key)
                        .checked_sub(i64::from(*low))
                        .and_then(|offset| usize::try_from(offset).ok())
                        .and_then(|offset| targets.get(offset))
                        .unwrap_or(default);
                    pc = method.labels[target];
                }

                Insn::Return => return Ok(Outcome::Return(None)),
                Insn::ValueReturn(kind) => {
                    let value = stack.pop()?;
                    stack.check_kind(&value, *kind)?;
                    return Ok(Outcome::Return(Some(value)));
                }
                Insn::Throw => match stack.pop()? {
                    Value::Ref(object) => thrown = Some(object),
                    Value::Null => thrown = Some(self.new_exception(NULL_POINTER_EXCEPTION)),
                    other => {
                        return Err(stack.mismatch("throwable reference", &other));
                    }
                },

                Insn::New(class_name) => {
                    let object = self.allocate(class_name);
                    stack.push(Value::Ref(object))?;
                }
                Insn::InvokeInit(class_name) => match stack.pop()? {
                    Value::Ref(object) => thrown = self.initialize(class_name, object)?,
                    Value::Null => thrown = Some(self.new_exception(NULL_POINTER_EXCEPTION)),
                    other => return Err(stack.mismatch("object reference", &other)),
                },

                Insn::GetRegistry => stack.push(Value::Registry)?,
                Insn::LookupCounter => {
                    let line = stack.pop_int()?;
                    let path = match stack.pop()? {
                        Value::Str(path) => path,
                        other => return Err(stack.mismatch("source path string", &other)),
                    };
                    match stack.pop()? {
                        Value::Registry => {}
                        other => return Err(stack.mismatch("registry", &other)),
                    }
                    let counter = u32::try_from(line)
                        .ok()
                        .and_then(|line| self.registry.bootstrap(&path, line))
                        .ok_or_else(|| VmError::UnlinkedCallSite {
                            path: path.to_string(),
                            line: line as u32,
                        })?;
                    stack.push(Value::Counter(counter))?;
                }
                Insn::CounterAdd => {
                    let count = stack.pop_long()?;
                    let counter = match stack.pop()? {
                        Value::Counter(counter) => counter,
                        other => return Err(stack.mismatch("line counter", &other)),
                    };
                    let count = u64::try_from(count)
                        .map_err(|_| stack.mismatch("non-negative count", &Value::Long(count)))?;
                    counter.add(count);
                }
                Insn::InvokeDynamic(site) => {
                    let counter = match method.sites[at].get() {
                        Some(counter) => counter.clone(),
                        None => {
                            let counter = self
                                .registry
                                .bootstrap(&site.source, site.line)
                                .ok_or_else(|| VmError::UnlinkedCallSite {
                                    path: site.source.clone(),
                                    line: site.line,
                                })?;
                            trace!(path = %site.source, line = site.line, "linked call site");
                            method.sites[at].get_or_init(|| counter).clone()
                        }
                    };
                    match site.kind {
                        SiteKind::Visit => counter.increment(),
                        SiteKind::Add => {
                            let count = stack.pop_long()?;
                            let count = u64::try_from(count).map_err(|_| {
                                stack.mismatch("non-negative count", &Value::Long(count))
                            })?;
                            counter.add(count);
                        }
                    }
                }
            }

            if let Some(exception) = thrown {
                let handler = body.handlers.iter().find(|h| {
                    method.labels[&h.start] <= at
                        && at < method.labels[&h.end]
                        && self.catches(h.catch_type.as_deref(), exception)
                });
                match handler {
                    Some(handler) => {
                        stack.clear();
                        stack.push(Value::Ref(exception))?;
                        pc = method.labels[&handler.handler];
                    }
                    None => return Ok(Outcome::Throw(exception)),
                }
            }
        }
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("heap", &self.heap.len())
            .field("fuel", &self.fuel)
            .finish()
    }
}

/// Bounded operand stack of one activation
struct Operands<'a> {
    method: &'a str,
    limit: u16,
    values: Vec<Value>,
}

impl<'a> Operands<'a> {
    fn new(method: &'a str, limit: u16) -> Self {
        Self {
            method,
            limit,
            values: Vec::with_capacity(limit as usize),
        }
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.values.len() >= self.limit as usize {
            return Err(VmError::StackOverflow {
                method: self.method.to_string(),
                limit: self.limit,
            });
        }
        self.values.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.values.pop().ok_or_else(|| VmError::StackUnderflow {
            method: self.method.to_string(),
        })
    }

    fn peek(&self) -> Result<&Value, VmError> {
        self.values.last().ok_or_else(|| VmError::StackUnderflow {
            method: self.method.to_string(),
        })
    }

    fn pop_int(&mut self) -> Result<i32, VmError> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(self.mismatch("int", &other)),
        }
    }

    fn pop_long(&mut self) -> Result<i64, VmError> {
        match self.pop()? {
            Value::Long(v) => Ok(v),
            other => Err(self.mismatch("long", &other)),
        }
    }

    fn clear(&mut self) {
        self.values.clear();
    }

    fn check_kind(&self, value: &Value, kind: ValueKind) -> Result<(), VmError> {
        if value.kind() == kind {
            Ok(())
        } else {
            Err(self.mismatch(kind_name(kind), value))
        }
    }

    fn mismatch(&self, expected: &'static str, found: &Value) -> VmError {
        VmError::TypeMismatch {
            method: self.method.to_string(),
            expected,
            found: found.to_string(),
        }
    }
}

fn kind_name(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Int => "int",
        ValueKind::Long => "long",
        ValueKind::Float => "float",
        ValueKind::Double => "double",
        ValueKind::Ref => "reference",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ClassVersion, Cond, ExceptionHandler, Frame, VerificationType};

    fn class(methods: Vec<MethodBody>) -> ClassFile {
        ClassFile {
            name: "demo/Calc".to_string(),
            source_file: Some("Calc.java".to_string()),
            version: ClassVersion::new(52),
            methods,
        }
    }

    fn static_method(name: &str, descriptor: &str, max_stack: u16, max_locals: u16, instructions: Vec<Insn>) -> MethodBody {
        MethodBody {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static: true,
            max_stack,
            max_locals,
            instructions,
            handlers: Vec::new(),
        }
    }

    fn machine_with(methods: Vec<MethodBody>) -> Machine {
        let mut vm = Machine::new(Arc::new(Registry::new()));
        vm.load(class(methods)).unwrap();
        vm
    }

    #[test]
    fn test_arithmetic() {
        let mut vm = machine_with(vec![static_method(
            "calc",
            "(II)I",
            2,
            2,
            vec![
                Insn::Load(ValueKind::Int, 0),
                Insn::Load(ValueKind::Int, 1),
                Insn::IMul,
                Insn::IConst(4),
                Insn::ISub,
                Insn::ValueReturn(ValueKind::Int),
            ],
        )]);
        let result = vm
            .invoke("demo/Calc", "calc", vec![Value::Int(6), Value::Int(7)])
            .unwrap();
        assert_eq!(result.and_then(|v| v.as_int()), Some(38));
    }

    #[test]
    fn test_division_by_zero_uncaught() {
        let mut vm = machine_with(vec![static_method(
            "div",
            "(I)I",
            2,
            1,
            vec![
                Insn::IConst(10),
                Insn::Load(ValueKind::Int, 0),
                Insn::IDiv,
                Insn::ValueReturn(ValueKind::Int),
            ],
        )]);
        let err = vm.invoke("demo/Calc", "div", vec![Value::Int(0)]).unwrap_err();
        assert!(matches!(err, VmError::Uncaught(ref c) if c == ARITHMETIC_EXCEPTION));
    }

    #[test]
    fn test_typed_handler_catches() {
        let mut m = static_method(
            "safe",
            "(I)I",
            2,
            1,
            vec![
                Insn::Label(Label(0)),
                Insn::IConst(10),
                Insn::Load(ValueKind::Int, 0),
                Insn::IDiv,
                Insn::Label(Label(1)),
                Insn::ValueReturn(ValueKind::Int),
                Insn::Label(Label(2)),
                Insn::Frame(Frame {
                    locals: vec![VerificationType::Integer],
                    stack: vec![VerificationType::Object(ARITHMETIC_EXCEPTION.to_string())],
                }),
                Insn::Pop,
                Insn::IConst(-1),
                Insn::ValueReturn(ValueKind::Int),
            ],
        );
        m.handlers.push(ExceptionHandler {
            start: Label(0),
            end: Label(1),
            handler: Label(2),
            catch_type: Some(ARITHMETIC_EXCEPTION.to_string()),
        });
        let mut vm = machine_with(vec![m]);
        let caught = vm.invoke("demo/Calc", "safe", vec![Value::Int(0)]).unwrap();
        assert_eq!(caught.and_then(|v| v.as_int()), Some(-1));
        let normal = vm.invoke("demo/Calc", "safe", vec![Value::Int(5)]).unwrap();
        assert_eq!(normal.and_then(|v| v.as_int()), Some(2));
    }

    #[test]
    fn test_stack_limit_enforced() {
        let mut vm = machine_with(vec![static_method(
            "push",
            "()V",
            1,
            0,
            vec![Insn::IConst(1), Insn::IConst(2), Insn::Return],
        )]);
        let err = vm.invoke("demo/Calc", "push", vec![]).unwrap_err();
        assert!(matches!(err, VmError::StackOverflow { limit: 1, .. }));
    }

    #[test]
    fn test_fuel_stops_infinite_loop() {
        let mut vm = machine_with(vec![static_method(
            "spin",
            "()V",
            0,
            0,
            vec![
                Insn::Label(Label(0)),
                Insn::Frame(Frame {
                    locals: vec![],
                    stack: vec![],
                }),
                Insn::Goto(Label(0)),
            ],
        )]);
        vm = vm.with_fuel(1_000);
        let err = vm.invoke("demo/Calc", "spin", vec![]).unwrap_err();
        assert!(matches!(err, VmError::OutOfFuel(1_000)));
    }

    #[test]
    fn test_bad_arguments() {
        let mut vm = machine_with(vec![static_method(
            "id",
            "(I)I",
            1,
            1,
            vec![Insn::Load(ValueKind::Int, 0), Insn::ValueReturn(ValueKind::Int)],
        )]);
        assert!(matches!(
            vm.invoke("demo/Calc", "id", vec![]),
            Err(VmError::BadArguments { .. })
        ));
        assert!(matches!(
            vm.invoke("demo/Calc", "id", vec![Value::Long(1)]),
            Err(VmError::BadArguments { .. })
        ));
        assert!(matches!(
            vm.invoke("demo/Calc", "missing", vec![]),
            Err(VmError::NoSuchMethod { .. })
        ));
    }

    #[test]
    fn test_load_rejects_unverifiable_class() {
        let mut vm = Machine::new(Arc::new(Registry::new()));
        let bad = class(vec![static_method(
            "f",
            "()I",
            1,
            1,
            vec![Insn::Load(ValueKind::Int, 0), Insn::ValueReturn(ValueKind::Int)],
        )]);
        assert!(matches!(vm.load(bad), Err(VmError::Verify(_))));
        assert!(!vm.is_loaded("demo/Calc"));
    }

    #[test]
    fn test_table_switch() {
        let frame = || {
            Insn::Frame(Frame {
                locals: vec![VerificationType::Integer],
                stack: vec![],
            })
        };
        let mut vm = machine_with(vec![static_method(
            "pick",
            "(I)I",
            1,
            1,
            vec![
                Insn::Load(ValueKind::Int, 0),
                Insn::TableSwitch {
                    low: 1,
                    targets: vec![Label(0), Label(1)],
                    default: Label(2),
                },
                Insn::Label(Label(0)),
                frame(),
                Insn::IConst(10),
                Insn::ValueReturn(ValueKind::Int),
                Insn::Label(Label(1)),
                frame(),
                Insn::IConst(20),
                Insn::ValueReturn(ValueKind::Int),
                Insn::Label(Label(2)),
                frame(),
                Insn::IConst(-1),
                Insn::ValueReturn(ValueKind::Int),
            ],
        )]);
        let mut pick = |n| {
            vm.invoke("demo/Calc", "pick", vec![Value::Int(n)])
                .unwrap()
                .and_then(|v| v.as_int())
        };
        assert_eq!(pick(1), Some(10));
        assert_eq!(pick(2), Some(20));
        assert_eq!(pick(0), Some(-1));
        assert_eq!(pick(i32::MIN), Some(-1));
    }

    #[test]
    fn test_dynamic_site_links_once() {
        let registry = Arc::new(Registry::new());
        registry.register_line("demo/Calc.java", 3);
        let mut vm = Machine::new(registry.clone());
        vm.load(class(vec![static_method(
            "hit",
            "()V",
            0,
            0,
            vec![
                Insn::InvokeDynamic(crate::method::CallSite::visit("demo/Calc.java", 3)),
                Insn::Return,
            ],
        )]))
        .unwrap();

        for _ in 0..3 {
            vm.invoke("demo/Calc", "hit", vec![]).unwrap();
        }
        let mut delta = crate::registry::SourceCounts::new();
        registry.update_listeners(&mut delta);
        assert_eq!(delta["demo/Calc.java"][&3], 3);
    }

    #[test]
    fn test_unlinked_call_site() {
        let mut vm = machine_with(vec![static_method(
            "hit",
            "()V",
            0,
            0,
            vec![
                Insn::InvokeDynamic(crate::method::CallSite::visit("nowhere.java", 1)),
                Insn::Return,
            ],
        )]);
        assert!(matches!(
            vm.invoke("demo/Calc", "hit", vec![]),
            Err(VmError::UnlinkedCallSite { line: 1, .. })
        ));
    }

    #[test]
    fn test_throw_null_raises_npe() {
        let mut vm = machine_with(vec![static_method(
            "boom",
            "()V",
            1,
            0,
            vec![Insn::AConstNull, Insn::Throw],
        )]);
        let err = vm.invoke("demo/Calc", "boom", vec![]).unwrap_err();
        assert!(matches!(err, VmError::Uncaught(ref c) if c == NULL_POINTER_EXCEPTION));
    }

    #[test]
    fn test_loop_with_conditional() {
        let frame = Frame {
            locals: vec![VerificationType::Integer, VerificationType::Integer],
            stack: vec![],
        };
        let mut vm = machine_with(vec![static_method(
            "sum",
            "(I)I",
            2,
            2,
            vec![
                Insn::IConst(0),
                Insn::Store(ValueKind::Int, 1),
                Insn::Label(Label(0)),
                Insn::Frame(frame.clone()),
                Insn::Load(ValueKind::Int, 0),
                Insn::If(Cond::Le, Label(1)),
                Insn::Load(ValueKind::Int, 1),
                Insn::Load(ValueKind::Int, 0),
                Insn::IAdd,
                Insn::Store(ValueKind::Int, 1),
                Insn::Iinc(0, -1),
                Insn::Goto(Label(0)),
                Insn::Label(Label(1)),
                Insn::Frame(frame),
                Insn::Load(ValueKind::Int, 1),
                Insn::ValueReturn(ValueKind::Int),
            ],
        )]);
        let result = vm.invoke("demo/Calc", "sum", vec![Value::Int(4)]).unwrap();
        assert_eq!(result.and_then(|v| v.as_int()), Some(10));
    }
}
