//! Load-time method verification
//!
//! A linear type-state check in the spirit of split verification: stack-map
//! frames declare the state at every join, and each instruction is checked
//! against the state flowing into it.
//!
//! Checked:
//! - every label defined exactly once, every referenced label defined
//! - a `Frame` after every jump target and handler entry; handler entry frames
//!   hold exactly one reference on the stack
//! - frames fit in `max_locals` / `max_stack`
//! - local loads, stores and `iinc` against the current local types
//! - state flowing into a frame, a jump target or a covering handler is
//!   assignable to the declared frame
//! - in constructors, no handler covers code before the receiver is
//!   initialized
//!
//! The operand stack is not simulated; the VM bounds it at run time.

use crate::method::{
    ClassFile, Frame, Insn, Label, MethodBody, ModelError, ValueKind, VerificationType,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyErrorKind {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("No frame at branch target {0}")]
    MissingFrame(Label),

    #[error("Handler at {0} must start with exactly one reference on the stack")]
    HandlerStack(Label),

    #[error("Frame at instruction {at} exceeds max_locals/max_stack")]
    FrameTooLarge { at: usize },

    #[error("Local {slot} out of range at instruction {at}")]
    LocalOutOfRange { slot: u16, at: usize },

    #[error("Local {slot} holds {found}, expected {expected:?} at instruction {at}")]
    LocalType {
        slot: u16,
        expected: ValueKind,
        found: VerificationType,
        at: usize,
    },

    #[error("Local {slot} holds {found}, not assignable to {declared} declared at {target}")]
    IncompatibleFrame {
        slot: usize,
        found: VerificationType,
        declared: VerificationType,
        target: String,
    },

    #[error("Handler at {0} covers code before the receiver is initialized")]
    HandlerBeforeInit(Label),
}

/// Verification failure in one method
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}.{method}: {kind}")]
pub struct VerifyError {
    pub class: String,
    pub method: String,
    pub kind: VerifyErrorKind,
}

/// Verify every method of a class
pub fn verify_class(class: &ClassFile) -> Result<(), VerifyError> {
    for method in &class.methods {
        verify_method(&class.name, method).map_err(|kind| VerifyError {
            class: class.name.clone(),
            method: method.name.clone(),
            kind,
        })?;
    }
    Ok(())
}

/// Verify one method of `class_name`
pub fn verify_method(class_name: &str, method: &MethodBody) -> Result<(), VerifyErrorKind> {
    Verifier::new(class_name, method)?.run()
}

struct Verifier<'a> {
    class_name: &'a str,
    method: &'a MethodBody,
    labels: HashMap<Label, usize>,
    max_locals: usize,
}

impl<'a> Verifier<'a> {
    fn new(class_name: &'a str, method: &'a MethodBody) -> Result<Self, VerifyErrorKind> {
        let labels = method.label_table()?;
        Ok(Self {
            class_name,
            method,
            labels,
            max_locals: method.max_locals as usize,
        })
    }

    fn run(&self) -> Result<(), VerifyErrorKind> {
        self.check_frames()?;
        self.check_handlers()?;
        self.check_locals()
    }

    /// The frame declared at `label`, skipping other labels and line markers
    fn frame_at(&self, label: Label) -> Result<&'a Frame, VerifyErrorKind> {
        let start = self.labels[&label];
        for insn in &self.method.instructions[start + 1..] {
            match insn {
                Insn::Label(_) | Insn::LineNumber(_) => continue,
                Insn::Frame(frame) => return Ok(frame),
                _ => break,
            }
        }
        Err(VerifyErrorKind::MissingFrame(label))
    }

    fn check_frames(&self) -> Result<(), VerifyErrorKind> {
        for (at, insn) in self.method.instructions.iter().enumerate() {
            if let Insn::Frame(frame) = insn {
                if frame.locals.len() > self.max_locals
                    || frame.stack.len() > self.method.max_stack as usize
                {
                    return Err(VerifyErrorKind::FrameTooLarge { at });
                }
            }
            for target in insn.jump_targets() {
                self.frame_at(target)?;
            }
        }
        Ok(())
    }

    fn check_handlers(&self) -> Result<(), VerifyErrorKind> {
        for handler in &self.method.handlers {
            let frame = self.frame_at(handler.handler)?;
            let single_reference = frame.stack.len() == 1
                && matches!(
                    frame.stack[0],
                    VerificationType::Object(_) | VerificationType::Null
                );
            if !single_reference {
                return Err(VerifyErrorKind::HandlerStack(handler.handler));
            }
        }

        if self.method.is_constructor() && !self.method.is_static {
            if let Some(init_at) = self.receiver_init_index() {
                for handler in &self.method.handlers {
                    if self.labels[&handler.start] < init_at {
                        return Err(VerifyErrorKind::HandlerBeforeInit(handler.handler));
                    }
                }
            }
        }
        Ok(())
    }

    /// Index of the first `InvokeInit` applied to local 0
    fn receiver_init_index(&self) -> Option<usize> {
        let mut last_real: Option<&Insn> = None;
        for (at, insn) in self.method.instructions.iter().enumerate() {
            if insn.is_pseudo() {
                continue;
            }
            if matches!(insn, Insn::InvokeInit(_))
                && matches!(last_real, Some(Insn::Load(ValueKind::Ref, 0)))
            {
                return Some(at);
            }
            last_real = Some(insn);
        }
        None
    }

    fn padded(&self, locals: &[VerificationType]) -> Vec<VerificationType> {
        let mut padded = locals.to_vec();
        padded.resize(self.max_locals, VerificationType::Top);
        padded
    }

    fn check_assignable(
        &self,
        state: &[VerificationType],
        declared: &[VerificationType],
        target: impl Fn() -> String,
    ) -> Result<(), VerifyErrorKind> {
        for (slot, found) in state.iter().enumerate() {
            let declared = declared.get(slot).unwrap_or(&VerificationType::Top);
            if !found.is_assignable_to(declared) {
                return Err(VerifyErrorKind::IncompatibleFrame {
                    slot,
                    found: found.clone(),
                    declared: declared.clone(),
                    target: target(),
                });
            }
        }
        Ok(())
    }

    fn check_locals(&self) -> Result<(), VerifyErrorKind> {
        let entry = self.method.entry_locals(self.class_name)?;
        if entry.len() > self.max_locals {
            return Err(VerifyErrorKind::LocalOutOfRange {
                slot: entry.len() as u16 - 1,
                at: 0,
            });
        }

        let covering: Vec<(usize, usize, Vec<VerificationType>, Label)> = self
            .method
            .handlers
            .iter()
            .map(|h| -> Result<_, VerifyErrorKind> {
                let frame = self.frame_at(h.handler)?;
                Ok((
                    self.labels[&h.start],
                    self.labels[&h.end],
                    self.padded(&frame.locals),
                    h.handler,
                ))
            })
            .collect::<Result<_, _>>()?;

        let mut state = Some(self.padded(&entry));
        let mut last_real: Option<&Insn> = None;

        for (at, insn) in self.method.instructions.iter().enumerate() {
            match insn {
                Insn::Frame(frame) => {
                    let declared = self.padded(&frame.locals);
                    if let Some(current) = &state {
                        self.check_assignable(current, &declared, || format!("frame {at}"))?;
                    }
                    state = Some(declared);
                    continue;
                }
                Insn::Label(_) | Insn::LineNumber(_) => continue,
                _ => {}
            }

            // Dead code after an unconditional transfer, until the next frame
            let Some(current) = state.as_mut() else {
                continue;
            };

            for (start, end, declared, handler) in &covering {
                if *start < at && at < *end {
                    self.check_assignable(current, declared, || format!("handler {handler}"))?;
                }
            }

            match insn {
                Insn::Load(kind, slot) | Insn::Store(kind, slot) => {
                    let index = *slot as usize;
                    if index >= self.max_locals {
                        return Err(VerifyErrorKind::LocalOutOfRange { slot: *slot, at });
                    }
                    if matches!(insn, Insn::Load(..)) {
                        if !current[index].matches_kind(*kind) {
                            return Err(VerifyErrorKind::LocalType {
                                slot: *slot,
                                expected: *kind,
                                found: current[index].clone(),
                                at,
                            });
                        }
                    } else {
                        current[index] = VerificationType::for_store(*kind);
                    }
                }
                Insn::Iinc(slot, _) => {
                    let index = *slot as usize;
                    if index >= self.max_locals {
                        return Err(VerifyErrorKind::LocalOutOfRange { slot: *slot, at });
                    }
                    if current[index] != VerificationType::Integer {
                        return Err(VerifyErrorKind::LocalType {
                            slot: *slot,
                            expected: ValueKind::Int,
                            found: current[index].clone(),
                            at,
                        });
                    }
                }
                Insn::InvokeInit(_)
                    if matches!(last_real, Some(Insn::Load(ValueKind::Ref, 0)))
                        && current.first() == Some(&VerificationType::UninitializedThis) =>
                {
                    current[0] = VerificationType::Object(self.class_name.to_string());
                }
                _ => {}
            }

            for target in insn.jump_targets() {
                let declared = self.padded(&self.frame_at(target)?.locals);
                self.check_assignable(current, &declared, || target.to_string())?;
            }

            if insn.is_unconditional_transfer() {
                state = None;
            }
            last_real = Some(insn);
        }

        Ok(())
    }
}
