//! Worklist-based fixpoint engine over one method's instruction sequence
//!
//! Abstractly executes the stack machine instruction by instruction,
//! propagating provenance values through frames, merging slot-wise at
//! control-flow joins and recording every discovered edge. An instruction
//! index is either unvisited (no frame yet), pending (queued for
//! (re)processing) or stable; the engine runs until the pending queue is
//! empty.
//!
//! Exception successors use a stricter admission policy than normal ones:
//! a handler index is merged and queued only the first time any protected
//! instruction reaches it. Later exceptional edges are still recorded but
//! do not requeue the handler. This trades some handler-frame precision
//! for a bound on fixpoint iterations and is preserved from the system
//! this engine reimplements.

use super::interp;
use super::value::{ValueArena, ValueId};
use crate::error::{AnalysisError, AnalysisResult};
use crate::ir::{opcodes, parse_method_descriptor, InsnKind, JvmType, MethodDef, StackOp};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use tracing::debug;

/// Abstract machine state at one instruction boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stack: Vec<ValueId>,
    pub locals: Vec<ValueId>,
}

/// Control-flow exit of an instruction. The source index is the key of the
/// surrounding edge map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub target: usize,
    pub exceptional: bool,
}

/// Per-source edge sets; ordered for deterministic serialisation.
pub type EdgeMap = BTreeMap<usize, BTreeSet<Edge>>;

/// Converged result of one method's abstract execution.
#[derive(Debug)]
pub struct FlowResult {
    pub arena: ValueArena,
    pub frames: Vec<Option<Frame>>,
    pub edges: EdgeMap,
    /// Receiver (for instance methods) followed by the declared parameters,
    /// read from the seed frame's locals.
    pub arguments: Vec<ValueId>,
}

struct Engine<'a> {
    method: &'a MethodDef,
    arena: ValueArena,
    frames: Vec<Option<Frame>>,
    edges: EdgeMap,
    exception_seen: HashSet<usize>,
    queue: VecDeque<usize>,
    queued: HashSet<usize>,
    uninit: ValueId,
}

/// Run the engine for one method of `owner`.
pub fn analyze(owner: &str, method: &MethodDef) -> AnalysisResult<FlowResult> {
    if method.insns.is_empty() {
        return Err(AnalysisError::rejected("method has no code"));
    }
    let (params, _ret) = parse_method_descriptor(&method.descriptor)
        .ok_or_else(|| AnalysisError::rejected(format!("bad descriptor {}", method.descriptor)))?;

    let mut arena = ValueArena::new();
    let uninit = arena.new_leaf(None, None);

    let mut locals = vec![uninit; method.max_locals];
    let mut arguments = Vec::new();
    let mut slot = 0usize;
    if !method.is_static {
        let receiver = arena.new_leaf(Some(JvmType::Reference(owner.to_string())), None);
        arguments.push(receiver);
        if locals.is_empty() {
            return Err(AnalysisError::rejected("arguments exceed max_locals"));
        }
        locals[0] = receiver;
        slot = 1;
    }
    for param in &params {
        let value = arena.new_leaf(Some(param.clone()), None);
        arguments.push(value);
        if slot + param.width() > locals.len() {
            return Err(AnalysisError::rejected("arguments exceed max_locals"));
        }
        locals[slot] = value;
        slot += param.width();
    }

    let mut engine = Engine {
        method,
        arena,
        frames: vec![None; method.insns.len()],
        edges: EdgeMap::new(),
        exception_seen: HashSet::new(),
        queue: VecDeque::new(),
        queued: HashSet::new(),
        uninit,
    };
    engine.frames[0] = Some(Frame {
        stack: Vec::new(),
        locals,
    });
    engine.enqueue(0);
    engine.run()?;

    if engine.frames[0].is_none() {
        return Err(AnalysisError::rejected("no frame for the entry instruction"));
    }
    Ok(FlowResult {
        arena: engine.arena,
        frames: engine.frames,
        edges: engine.edges,
        arguments,
    })
}

impl<'a> Engine<'a> {
    fn run(&mut self) -> AnalysisResult<()> {
        let mut steps = 0usize;
        while let Some(index) = self.queue.pop_front() {
            self.queued.remove(&index);
            steps += 1;

            let frame = self.frames[index]
                .clone()
                .ok_or_else(|| AnalysisError::internal("pending instruction without a frame"))?;
            let mut out = frame.clone();
            self.execute(index, &mut out)?;

            for succ in self.normal_successors(index)? {
                self.record_edge(index, succ, false);
                self.merge_into(succ, out.clone())?;
            }
            for h in 0..self.method.handlers.len() {
                let handler = self.method.handlers[h].clone();
                if handler.start <= index && index < handler.end {
                    if handler.handler >= self.method.insns.len() {
                        return Err(AnalysisError::rejected("exception handler out of bounds"));
                    }
                    self.record_edge(index, handler.handler, true);
                    if self.exception_seen.insert(handler.handler) {
                        let caught = handler
                            .catch_type
                            .unwrap_or_else(|| "java/lang/Throwable".to_string());
                        let exception =
                            self.arena.new_leaf(Some(JvmType::Reference(caught)), None);
                        let handler_frame = Frame {
                            stack: vec![exception],
                            locals: frame.locals.clone(),
                        };
                        self.merge_into(handler.handler, handler_frame)?;
                    }
                }
            }
        }
        debug!(steps, values = self.arena.len(), "fixpoint reached");
        Ok(())
    }

    fn enqueue(&mut self, index: usize) {
        if self.queued.insert(index) {
            self.queue.push_back(index);
        }
    }

    fn record_edge(&mut self, from: usize, target: usize, exceptional: bool) {
        self.edges
            .entry(from)
            .or_default()
            .insert(Edge { target, exceptional });
    }

    /// Install or join an outgoing frame at `target`, queueing it when the
    /// state changed.
    fn merge_into(&mut self, target: usize, incoming: Frame) -> AnalysisResult<()> {
        let existing = match self.frames[target].clone() {
            None => {
                self.frames[target] = Some(incoming);
                self.enqueue(target);
                return Ok(());
            }
            Some(existing) => existing,
        };
        if existing.stack.len() != incoming.stack.len() {
            return Err(AnalysisError::rejected("incompatible stack heights at join"));
        }
        let stack: Vec<ValueId> = existing
            .stack
            .iter()
            .zip(&incoming.stack)
            .map(|(&a, &b)| self.arena.merge(a, b))
            .collect();
        let locals: Vec<ValueId> = existing
            .locals
            .iter()
            .zip(&incoming.locals)
            .map(|(&a, &b)| self.arena.merge(a, b))
            .collect();
        let merged = Frame { stack, locals };
        if merged != existing {
            self.frames[target] = Some(merged);
            self.enqueue(target);
        }
        Ok(())
    }

    /// Non-exceptional successor indices of `index`, bounds-checked.
    fn normal_successors(&self, index: usize) -> AnalysisResult<Vec<usize>> {
        let len = self.method.insns.len();
        let fall = || {
            if index + 1 >= len {
                Err(AnalysisError::rejected("execution falls off the end of the code"))
            } else {
                Ok(index + 1)
            }
        };
        let succs = match &self.method.insns[index].kind {
            InsnKind::Goto { target } => vec![*target],
            InsnKind::If { target } => vec![fall()?, *target],
            InsnKind::Switch { default, targets } => {
                let mut all = vec![*default];
                all.extend(targets.iter().copied());
                all
            }
            InsnKind::Return | InsnKind::Athrow => Vec::new(),
            // jsr/ret reject inside execute before successors are asked for.
            InsnKind::Jsr { .. } | InsnKind::Ret { .. } => Vec::new(),
            _ => vec![fall()?],
        };
        for &s in &succs {
            if s >= len {
                return Err(AnalysisError::rejected("jump target out of bounds"));
            }
        }
        Ok(succs)
    }

    fn pop(frame: &mut Frame) -> AnalysisResult<ValueId> {
        frame
            .stack
            .pop()
            .ok_or_else(|| AnalysisError::rejected("stack underflow"))
    }

    fn width(&self, v: ValueId) -> usize {
        self.arena.get(v).width()
    }

    /// Apply the instruction at `index` to `frame` in place.
    fn execute(&mut self, index: usize, frame: &mut Frame) -> AnalysisResult<()> {
        let opcode = self.method.insns[index].opcode;
        let kind = self.method.insns[index].kind.clone();
        match &kind {
            InsnKind::Const(literal) => {
                let v = interp::const_leaf(&mut self.arena, index, literal);
                frame.stack.push(v);
            }
            InsnKind::Load { slot } => {
                let v = *frame
                    .locals
                    .get(*slot)
                    .ok_or_else(|| AnalysisError::rejected("local slot out of bounds"))?;
                frame.stack.push(v);
            }
            InsnKind::Store { slot } => {
                let v = Self::pop(frame)?;
                if *slot >= frame.locals.len() {
                    return Err(AnalysisError::rejected("local slot out of bounds"));
                }
                frame.locals[*slot] = v;
                if self.width(v) == 2 && *slot + 1 < frame.locals.len() {
                    frame.locals[*slot + 1] = self.uninit;
                }
                // Storing into the upper half of a category-2 value kills it.
                if *slot > 0 && self.width(frame.locals[*slot - 1]) == 2 {
                    frame.locals[*slot - 1] = self.uninit;
                }
            }
            InsnKind::Iinc { slot, .. } => {
                let old = *frame
                    .locals
                    .get(*slot)
                    .ok_or_else(|| AnalysisError::rejected("local slot out of bounds"))?;
                frame.locals[*slot] = interp::iinc(&mut self.arena, index, old);
            }
            InsnKind::Stack(op) => self.execute_stack_op(*op, frame)?,
            InsnKind::Unary => {
                let v = Self::pop(frame)?;
                let r = interp::unary(&mut self.arena, index, opcode, v)?;
                frame.stack.push(r);
            }
            InsnKind::Binary => {
                let b = Self::pop(frame)?;
                let a = Self::pop(frame)?;
                let r = interp::binary(&mut self.arena, index, opcode, a, b)?;
                frame.stack.push(r);
            }
            InsnKind::ArrayLoad => {
                let idx = Self::pop(frame)?;
                let arr = Self::pop(frame)?;
                let r = interp::array_load(&mut self.arena, index, opcode, arr, idx)?;
                frame.stack.push(r);
            }
            InsnKind::ArrayStore => {
                let value = Self::pop(frame)?;
                let idx = Self::pop(frame)?;
                let arr = Self::pop(frame)?;
                interp::consumed(&mut self.arena, index, &[arr, idx, value]);
            }
            InsnKind::Goto { .. } => {}
            InsnKind::If { .. } => {
                let operands = if if_operand_count(opcode)? == 2 {
                    let b = Self::pop(frame)?;
                    let a = Self::pop(frame)?;
                    vec![a, b]
                } else {
                    vec![Self::pop(frame)?]
                };
                interp::consumed(&mut self.arena, index, &operands);
            }
            InsnKind::Switch { .. } => {
                let key = Self::pop(frame)?;
                interp::consumed(&mut self.arena, index, &[key]);
            }
            InsnKind::Return => {
                if opcode != opcodes::RETURN {
                    let v = Self::pop(frame)?;
                    interp::consumed(&mut self.arena, index, &[v]);
                }
            }
            InsnKind::Athrow => {
                let v = Self::pop(frame)?;
                interp::consumed(&mut self.arena, index, &[v]);
            }
            InsnKind::Field(field) => {
                let operands = match opcode {
                    opcodes::GETSTATIC => Vec::new(),
                    opcodes::GETFIELD | opcodes::PUTSTATIC => vec![Self::pop(frame)?],
                    opcodes::PUTFIELD => {
                        let value = Self::pop(frame)?;
                        let object = Self::pop(frame)?;
                        vec![object, value]
                    }
                    _ => {
                        return Err(AnalysisError::internal(format!(
                            "opcode {opcode:#04x} decoded as field access"
                        )))
                    }
                };
                if let Some(v) = interp::field(&mut self.arena, index, opcode, field, &operands)? {
                    frame.stack.push(v);
                }
            }
            InsnKind::New(class) => {
                let v = interp::new_object(&mut self.arena, index, class);
                frame.stack.push(v);
            }
            InsnKind::NewArray { element } => {
                let length = Self::pop(frame)?;
                let v = interp::new_array(&mut self.arena, index, element, length);
                frame.stack.push(v);
            }
            InsnKind::MultiNewArray { ty, dims } => {
                let mut lengths = Vec::with_capacity(*dims as usize);
                for _ in 0..*dims {
                    lengths.push(Self::pop(frame)?);
                }
                lengths.reverse();
                let v = interp::multi_new_array(&mut self.arena, index, ty, &lengths);
                frame.stack.push(v);
            }
            InsnKind::ArrayLength => {
                let arr = Self::pop(frame)?;
                let v = interp::array_length(&mut self.arena, index, arr);
                frame.stack.push(v);
            }
            InsnKind::CheckCast(class) => {
                let v = Self::pop(frame)?;
                let r = interp::check_cast(&mut self.arena, index, class, v);
                frame.stack.push(r);
            }
            InsnKind::InstanceOf(_) => {
                let v = Self::pop(frame)?;
                let r = interp::instance_of(&mut self.arena, index, v);
                frame.stack.push(r);
            }
            InsnKind::Invoke { kind, target } => {
                let (params, ret) = parse_method_descriptor(&target.descriptor).ok_or_else(|| {
                    AnalysisError::rejected(format!("bad call descriptor {}", target.descriptor))
                })?;
                let mut args = Vec::with_capacity(params.len() + 1);
                for _ in 0..params.len() {
                    args.push(Self::pop(frame)?);
                }
                if kind.has_receiver() {
                    args.push(Self::pop(frame)?);
                }
                args.reverse();
                let v = interp::invoke(&mut self.arena, index, &ret, &args);
                if ret != JvmType::Void {
                    frame.stack.push(v);
                }
            }
            InsnKind::Monitor => {
                let v = Self::pop(frame)?;
                interp::consumed(&mut self.arena, index, &[v]);
            }
            InsnKind::Jsr { .. } | InsnKind::Ret { .. } => {
                return Err(AnalysisError::rejected("jsr/ret subroutines are not supported"));
            }
        }
        Ok(())
    }

    fn execute_stack_op(&mut self, op: StackOp, frame: &mut Frame) -> AnalysisResult<()> {
        let illegal = || AnalysisError::rejected("illegal use of a stack instruction");
        match op {
            StackOp::Nop => {}
            StackOp::Pop => {
                let v = Self::pop(frame)?;
                if self.width(v) != 1 {
                    return Err(illegal());
                }
            }
            StackOp::Pop2 => {
                let v = Self::pop(frame)?;
                if self.width(v) == 1 {
                    let w = Self::pop(frame)?;
                    if self.width(w) != 1 {
                        return Err(illegal());
                    }
                }
            }
            StackOp::Dup => {
                let v = Self::pop(frame)?;
                if self.width(v) != 1 {
                    return Err(illegal());
                }
                frame.stack.push(v);
                frame.stack.push(v);
            }
            StackOp::DupX1 => {
                let v1 = Self::pop(frame)?;
                let v2 = Self::pop(frame)?;
                if self.width(v1) != 1 || self.width(v2) != 1 {
                    return Err(illegal());
                }
                frame.stack.push(v1);
                frame.stack.push(v2);
                frame.stack.push(v1);
            }
            StackOp::DupX2 => {
                let v1 = Self::pop(frame)?;
                let v2 = Self::pop(frame)?;
                if self.width(v1) != 1 {
                    return Err(illegal());
                }
                if self.width(v2) == 2 {
                    frame.stack.push(v1);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                } else {
                    let v3 = Self::pop(frame)?;
                    frame.stack.push(v1);
                    frame.stack.push(v3);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                }
            }
            StackOp::Dup2 => {
                let v1 = Self::pop(frame)?;
                if self.width(v1) == 2 {
                    frame.stack.push(v1);
                    frame.stack.push(v1);
                } else {
                    let v2 = Self::pop(frame)?;
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                }
            }
            StackOp::Dup2X1 => {
                let v1 = Self::pop(frame)?;
                let v2 = Self::pop(frame)?;
                if self.width(v1) == 2 {
                    frame.stack.push(v1);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                } else {
                    let v3 = Self::pop(frame)?;
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                    frame.stack.push(v3);
                    frame.stack.push(v2);
                    frame.stack.push(v1);
                }
            }
            StackOp::Dup2X2 => {
                let v1 = Self::pop(frame)?;
                let v2 = Self::pop(frame)?;
                match (self.width(v1), self.width(v2)) {
                    (2, 2) => {
                        frame.stack.push(v1);
                        frame.stack.push(v2);
                        frame.stack.push(v1);
                    }
                    (2, 1) => {
                        let v3 = Self::pop(frame)?;
                        frame.stack.push(v1);
                        frame.stack.push(v3);
                        frame.stack.push(v2);
                        frame.stack.push(v1);
                    }
                    (1, _) => {
                        let v3 = Self::pop(frame)?;
                        if self.width(v3) == 2 {
                            frame.stack.push(v2);
                            frame.stack.push(v1);
                            frame.stack.push(v3);
                            frame.stack.push(v2);
                            frame.stack.push(v1);
                        } else {
                            let v4 = Self::pop(frame)?;
                            frame.stack.push(v2);
                            frame.stack.push(v1);
                            frame.stack.push(v4);
                            frame.stack.push(v3);
                            frame.stack.push(v2);
                            frame.stack.push(v1);
                        }
                    }
                    _ => return Err(illegal()),
                }
            }
            StackOp::Swap => {
                let v1 = Self::pop(frame)?;
                let v2 = Self::pop(frame)?;
                if self.width(v1) != 1 || self.width(v2) != 1 {
                    return Err(illegal());
                }
                frame.stack.push(v1);
                frame.stack.push(v2);
            }
        }
        Ok(())
    }
}

/// Operand count of a conditional branch.
fn if_operand_count(opcode: u8) -> AnalysisResult<usize> {
    use opcodes::*;
    match opcode {
        IFEQ..=IFLE | IFNULL | IFNONNULL => Ok(1),
        IF_ICMPEQ..=IF_ACMPNE => Ok(2),
        _ => Err(AnalysisError::internal(format!(
            "opcode {opcode:#04x} is not a conditional branch"
        ))),
    }
}
