//! Hook emission
//!
//! The pure emission pass: `(method, plan, source path) -> method`. All
//! decisions were taken by the planner; this module only lays out
//! instructions, widens frames and grows the method's limits.
//!
//! # Batched layout
//!
//! ```text
//!     iconst 0; istore base+0        ; one zeroed slot per distinct line
//!     ...
//! Ls: <original body>                ; line boundary: iinc base+k 1
//!     <flush> ; return               ; before every return
//! Le:
//! Lh: FRAME [entry.., int..] [Throwable]
//!     <flush>
//!     athrow
//!
//! handlers: <original..>, (Ls, Le, Lh, any)
//! ```

use crate::method::{
    CallSite, Constant, ExceptionHandler, Frame, Insn, Label, MethodBody, ValueKind,
    VerificationType, THROWABLE,
};
use crate::planner::{Dispatch, MethodPlan, Strategy};

/// Stack slots used by the StaticCall visit sequence
const STATIC_CALL_STACK: u16 = 3;

/// Apply `plan` to `method`, attributing lines to `source`
pub fn rewrite(method: &MethodBody, plan: &MethodPlan, source: &str) -> MethodBody {
    if plan.is_noop() {
        return method.clone();
    }
    match (plan.strategy, plan.region_labels) {
        (Strategy::Batched, Some(labels)) => rewrite_batched(method, plan, source, labels),
        _ => rewrite_direct(method, plan, source),
    }
}

fn rewrite_direct(method: &MethodBody, plan: &MethodPlan, source: &str) -> MethodBody {
    let mut out = Vec::with_capacity(method.instructions.len() + plan.markers.len() * 6);
    let mut markers = plan.markers.iter().peekable();

    for (index, insn) in method.instructions.iter().enumerate() {
        while let Some(marker) = markers.next_if(|m| m.insert_at == index) {
            emit_visit(&mut out, plan.dispatch, source, marker.line);
        }
        out.push(insn.clone());
    }
    for marker in markers {
        emit_visit(&mut out, plan.dispatch, source, marker.line);
    }

    let max_stack = match plan.dispatch {
        Dispatch::DynamicSite => method.max_stack,
        Dispatch::StaticCall => method.max_stack.saturating_add(STATIC_CALL_STACK),
    };

    MethodBody {
        max_stack,
        instructions: out,
        ..method.clone()
    }
}

fn rewrite_batched(
    method: &MethodBody,
    plan: &MethodPlan,
    source: &str,
    [try_start, try_end, handler]: [Label; 3],
) -> MethodBody {
    let base = method.max_locals;
    let slot_count = plan.lines.len() as u16;
    let slot = |line: u32| -> u16 { base + plan.slot_of(line).unwrap_or_default() as u16 };

    let mut out = Vec::with_capacity(method.instructions.len() * 2 + plan.lines.len() * 4);
    for k in 0..slot_count {
        out.push(Insn::IConst(0));
        out.push(Insn::Store(ValueKind::Int, base + k));
    }
    out.push(Insn::Label(try_start));

    let mut markers = plan.markers.iter().peekable();
    for (index, insn) in method.instructions.iter().enumerate() {
        while let Some(marker) = markers.next_if(|m| m.insert_at == index) {
            out.push(Insn::Iinc(slot(marker.line), 1));
        }
        match insn {
            Insn::Frame(frame) => out.push(Insn::Frame(widen_frame(frame, base, slot_count))),
            insn if insn.is_return() => {
                emit_flush(&mut out, plan, source, base);
                out.push(insn.clone());
            }
            insn => out.push(insn.clone()),
        }
    }
    for marker in markers {
        out.push(Insn::Iinc(slot(marker.line), 1));
    }

    let mut handler_locals = plan.handler_locals.clone();
    handler_locals.resize(base as usize, VerificationType::Top);
    handler_locals.extend((0..slot_count).map(|_| VerificationType::Integer));

    out.push(Insn::Label(try_end));
    out.push(Insn::Label(handler));
    out.push(Insn::Frame(Frame {
        locals: handler_locals,
        stack: vec![VerificationType::Object(THROWABLE.to_string())],
    }));
    emit_flush(&mut out, plan, source, base);
    out.push(Insn::Throw);

    let mut handlers = method.handlers.clone();
    handlers.push(ExceptionHandler {
        start: try_start,
        end: try_end,
        handler,
        catch_type: None,
    });

    let max_stack = match plan.dispatch {
        Dispatch::DynamicSite => method.max_stack.saturating_add(1).max(2),
        Dispatch::StaticCall => method
            .max_stack
            .saturating_add(STATIC_CALL_STACK)
            .max(STATIC_CALL_STACK + 1),
    };

    MethodBody {
        max_stack,
        max_locals: base + slot_count,
        instructions: out,
        handlers,
        ..method.clone()
    }
}

fn emit_visit(out: &mut Vec<Insn>, dispatch: Dispatch, source: &str, line: u32) {
    match dispatch {
        Dispatch::DynamicSite => out.push(Insn::InvokeDynamic(CallSite::visit(source, line))),
        Dispatch::StaticCall => {
            emit_lookup(out, source, line);
            out.push(Insn::LConst(1));
            out.push(Insn::CounterAdd);
        }
    }
}

/// Add every batch slot to its counter; zero slots leave the counter untouched
fn emit_flush(out: &mut Vec<Insn>, plan: &MethodPlan, source: &str, base: u16) {
    for (k, &line) in plan.lines.iter().enumerate() {
        let slot = base + k as u16;
        match plan.dispatch {
            Dispatch::DynamicSite => {
                out.push(Insn::Load(ValueKind::Int, slot));
                out.push(Insn::I2L);
                out.push(Insn::InvokeDynamic(CallSite::add(source, line)));
            }
            Dispatch::StaticCall => {
                emit_lookup(out, source, line);
                out.push(Insn::Load(ValueKind::Int, slot));
                out.push(Insn::I2L);
                out.push(Insn::CounterAdd);
            }
        }
    }
}

fn emit_lookup(out: &mut Vec<Insn>, source: &str, line: u32) {
    out.push(Insn::GetRegistry);
    out.push(Insn::Ldc(Constant::Str(source.to_string())));
    out.push(Insn::Ldc(Constant::Int(line as i32)));
    out.push(Insn::LookupCounter);
}

/// Pad a frame's locals with `Top` up to `base`, then declare the batch slots
fn widen_frame(frame: &Frame, base: u16, slot_count: u16) -> Frame {
    let mut locals = frame.locals.clone();
    locals.resize(base as usize, VerificationType::Top);
    locals.extend((0..slot_count).map(|_| VerificationType::Integer));
    Frame {
        locals,
        stack: frame.stack.clone(),
    }
}
