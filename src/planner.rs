//! Instrumentation planning
//!
//! The analysis pass: scan a method once and produce an immutable
//! [`MethodPlan`] describing where line hooks go, which strategy emits them and
//! how they dispatch to the registry. Nothing here touches the registry or
//! mutates the method; the rewriter consumes the plan.
//!
//! # Strategy selection
//!
//! ```text
//! loop-bearing?  constructor?   strategy
//!     no             -          Direct
//!     yes           yes         Direct   (receiver not yet initialized)
//!     yes           no          Batched
//! ```
//!
//! A method is loop-bearing when some jump targets a label already seen earlier
//! in the forward scan.

use crate::method::{ClassVersion, Insn, Label, MethodBody, ModelError, VerificationType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Rewrite-time errors for malformed or unsupported method shapes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Method already contains coverage hooks")]
    AlreadyInstrumented,

    #[error("Batched strategy needs {needed} local slots, limit is {limit}")]
    TooManyLocals { needed: usize, limit: usize },

    #[error("No free labels left for the batched handler region")]
    LabelSpaceExhausted,
}

/// How line hooks are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Increment the registry counter at every line boundary
    Direct,
    /// Count into method-local slots and flush on exit
    Batched,
}

/// How a hook reaches its counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dispatch {
    /// Dynamically resolved call site bound once to the line's counter
    DynamicSite,
    /// Registry lookup by (source path, line) on every call
    StaticCall,
}

/// Configured dispatch preference
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Pick from the class format version
    #[default]
    Auto,
    Dynamic,
    Static,
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DispatchMode::Auto),
            "dynamic" => Ok(DispatchMode::Dynamic),
            "static" => Ok(DispatchMode::Static),
            other => Err(format!("unknown dispatch mode '{other}'")),
        }
    }
}

impl Dispatch {
    /// Choose dispatch once per class from the runtime capability
    pub fn select(mode: DispatchMode, version: ClassVersion) -> Self {
        match mode {
            DispatchMode::Dynamic => Dispatch::DynamicSite,
            DispatchMode::Static => Dispatch::StaticCall,
            DispatchMode::Auto if version.supports_dynamic_call_sites() => Dispatch::DynamicSite,
            DispatchMode::Auto => Dispatch::StaticCall,
        }
    }
}

/// Hook position: emit the hook for `line` before instruction `insert_at`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMarker {
    pub insert_at: usize,
    pub line: u32,
}

/// Result of analysing one method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPlan {
    pub strategy: Strategy,
    pub dispatch: Dispatch,
    /// Ordered by `insert_at`
    pub markers: Vec<LineMarker>,
    /// Distinct lines in first-seen order; the k-th gets batch slot k
    pub lines: Vec<u32>,
    pub loop_bearing: bool,
    /// Locals declared in the synthetic handler frame (Batched only)
    pub handler_locals: Vec<VerificationType>,
    /// Unused labels for the handler region start, end and entry (Batched only)
    pub region_labels: Option<[Label; 3]>,
}

impl MethodPlan {
    /// Batch slot of a line, relative to the method's original `max_locals`
    pub fn slot_of(&self, line: u32) -> Option<usize> {
        self.lines.iter().position(|&l| l == line)
    }

    pub fn is_noop(&self) -> bool {
        self.markers.is_empty()
    }
}

impl fmt::Display for MethodPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} loop={} lines={:?}",
            self.strategy, self.dispatch, self.loop_bearing, self.lines
        )
    }
}

/// True when a jump targets a label already seen in the forward scan
pub fn has_backward_jump(instructions: &[Insn]) -> bool {
    let mut seen: HashSet<Label> = HashSet::new();
    for insn in instructions {
        if let Insn::Label(label) = insn {
            seen.insert(*label);
        }
        if insn.jump_targets().iter().any(|target| seen.contains(target)) {
            return true;
        }
    }
    false
}

/// Hook positions: before the first real instruction after each line marker,
/// or just after it when that instruction is `New`
pub fn line_markers(instructions: &[Insn]) -> Vec<LineMarker> {
    let mut markers = Vec::new();
    let mut pending: Option<u32> = None;

    for (index, insn) in instructions.iter().enumerate() {
        match insn {
            Insn::LineNumber(line) => pending = Some(*line),
            Insn::Label(_) | Insn::Frame(_) => {}
            Insn::New(_) => {
                if let Some(line) = pending.take() {
                    markers.push(LineMarker {
                        insert_at: index + 1,
                        line,
                    });
                }
            }
            _ => {
                if let Some(line) = pending.take() {
                    markers.push(LineMarker {
                        insert_at: index,
                        line,
                    });
                }
            }
        }
    }

    markers
}

/// Analyse one method of `class_name`
pub fn plan_method(
    class_name: &str,
    method: &MethodBody,
    dispatch: Dispatch,
) -> Result<MethodPlan, PlanError> {
    method.label_table()?;
    if method.instructions.iter().any(Insn::is_hook) {
        return Err(PlanError::AlreadyInstrumented);
    }

    let loop_bearing = has_backward_jump(&method.instructions);
    let markers = line_markers(&method.instructions);

    let mut lines = Vec::new();
    for marker in &markers {
        if !lines.contains(&marker.line) {
            lines.push(marker.line);
        }
    }

    let strategy = if loop_bearing && !method.is_constructor() && !markers.is_empty() {
        Strategy::Batched
    } else {
        Strategy::Direct
    };

    let (handler_locals, region_labels) = match strategy {
        Strategy::Direct => (Vec::new(), None),
        Strategy::Batched => {
            let needed = method.max_locals as usize + lines.len();
            if needed > u16::MAX as usize {
                return Err(PlanError::TooManyLocals {
                    needed,
                    limit: u16::MAX as usize,
                });
            }
            (
                handler_locals(class_name, method)?,
                Some(reserve_region_labels(method)?),
            )
        }
    };

    Ok(MethodPlan {
        strategy,
        dispatch,
        markers,
        lines,
        loop_bearing,
        handler_locals,
        region_labels,
    })
}

fn reserve_region_labels(method: &MethodBody) -> Result<[Label; 3], PlanError> {
    let first = method
        .next_free_label()
        .ok_or(PlanError::LabelSpaceExhausted)?;
    let last = first.checked_add(2).ok_or(PlanError::LabelSpaceExhausted)?;
    Ok([Label(first), Label(first + 1), Label(last)])
}

/// Entry type-state (receiver, parameters) padded with `Top` to `max_locals`
///
/// A slot is declared `Top` instead when the method stores an incompatible
/// value into it or some frame disagrees with its entry type, since the
/// handler can be reached from anywhere in the body.
fn handler_locals(class_name: &str, method: &MethodBody) -> Result<Vec<VerificationType>, PlanError> {
    let mut locals = method.entry_locals(class_name)?;
    locals.resize(method.max_locals as usize, VerificationType::Top);

    for insn in &method.instructions {
        match insn {
            Insn::Store(kind, slot) => {
                let slot = *slot as usize;
                if slot < locals.len()
                    && !VerificationType::for_store(*kind).is_assignable_to(&locals[slot])
                {
                    locals[slot] = VerificationType::Top;
                }
            }
            Insn::Frame(frame) => {
                for (slot, declared) in locals.iter_mut().enumerate() {
                    let in_frame = frame.locals.get(slot).unwrap_or(&VerificationType::Top);
                    if !in_frame.is_assignable_to(declared) {
                        *declared = VerificationType::Top;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(locals)
}
