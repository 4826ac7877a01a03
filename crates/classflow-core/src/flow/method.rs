//! Method-level analysis and graph serialisation
//!
//! Runs the fixpoint engine for one method, derives the ordered argument
//! list and the per-instruction line numbers, collects the call targets the
//! whole-program worklist feeds on, and renders the method's slice of the
//! output document.

use super::engine::{self, EdgeMap};
use super::value::{ValueArena, ValueId};
use crate::error::AnalysisResult;
use crate::ir::{CallKind, ConstValue, Insn, InsnKind, LineEntry, MethodDef};
use crate::xml::{self, XmlElement};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexSet;
use std::collections::{HashMap, HashSet};

/// Line value used before the first marker of the line-number table.
pub const UNKNOWN_LINE: i32 = -1;

/// Converged analysis result for one method.
#[derive(Debug)]
pub struct MethodGraph {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
    pub insns: Vec<Insn>,
    pub arena: ValueArena,
    /// Receiver (for instance methods) followed by the declared parameters.
    pub arguments: Vec<ValueId>,
    pub edges: EdgeMap,
    /// One line number per instruction, forward-filled from the sparse table.
    pub lines: Vec<i32>,
    /// Distinct `(owner, name)` pairs referenced by call instructions, in
    /// first-reference order.
    pub call_targets: IndexSet<(String, String)>,
}

impl MethodGraph {
    /// Analyse one method of `owner`.
    pub fn analyze(owner: &str, method: &MethodDef) -> AnalysisResult<MethodGraph> {
        let result = engine::analyze(owner, method)?;
        let lines = fill_lines(&method.line_table, method.insns.len());
        let mut call_targets = IndexSet::new();
        for insn in &method.insns {
            if let InsnKind::Invoke { kind, target } = &insn.kind {
                if *kind != CallKind::Dynamic {
                    call_targets.insert((target.owner.clone(), target.name.clone()));
                }
            }
        }
        Ok(MethodGraph {
            owner: owner.to_string(),
            name: method.name.clone(),
            descriptor: method.descriptor.clone(),
            insns: method.insns.clone(),
            arena: result.arena,
            arguments: result.arguments,
            edges: result.edges,
            lines,
            call_targets,
        })
    }

    /// Globally unique method id, `java:<owner dotted>.<name>[<descriptor>]`.
    pub fn qualified_method_id(owner: &str, name: &str, descriptor: &str) -> String {
        format!("java:{}.{}[{}]", owner.replace('/', "."), name, descriptor)
    }

    pub fn method_id(&self) -> String {
        Self::qualified_method_id(&self.owner, &self.name, &self.descriptor)
    }

    pub fn instruction_id(&self, index: usize) -> String {
        format!("{}/instructions/{}", self.method_id(), index)
    }

    pub fn parameter_id(&self, index: usize) -> String {
        format!("{}/parameters/{}", self.method_id(), index)
    }

    /// Render this method's subtree of the output document.
    pub fn to_xml(&self) -> XmlElement {
        let mut method = xml::method_element(&self.method_id());

        let mut parameters = xml::parameters_element();
        for (i, &arg) in self.arguments.iter().enumerate() {
            let ty = match &self.arena.get(arg).ty {
                Some(t) => format!("java:{}", t.descriptor()),
                None => "java:null".to_string(),
            };
            parameters.push(xml::parameter_element(&self.parameter_id(i), &ty));
        }
        method.push(parameters);

        let mut insns = xml::insns_element();
        for index in 0..self.insns.len() {
            insns.push(self.instruction_to_xml(index));
        }
        method.push(insns);
        method
    }

    fn instruction_to_xml(&self, index: usize) -> XmlElement {
        let insn = &self.insns[index];
        let mut element =
            xml::insn_element(insn.opcode, self.lines[index], &self.instruction_id(index));

        if let InsnKind::Const(literal) = &insn.kind {
            element.set_attr("value", marshal_const(literal));
        }
        if let InsnKind::Field(field) = &insn.kind {
            element.push(xml::field_element(&field.owner, &field.name));
        }

        if let Some(value) = self.arena.value_at(index) {
            if !self.arena.get(value).inputs.is_empty() {
                element.push(self.inputs_to_xml(value));
            }
        }

        if let InsnKind::Invoke { kind, target } = &insn.kind {
            if *kind != CallKind::Dynamic {
                element.push(xml::call_target_element(&Self::qualified_method_id(
                    &target.owner,
                    &target.name,
                    &target.descriptor,
                )));
            }
        }

        if let Some(exits) = self.edges.get(&index) {
            let mut exits_element = xml::exits_element();
            for exit in exits {
                exits_element.push(xml::exit_element(
                    &self.instruction_id(exit.target),
                    exit.exceptional,
                ));
            }
            element.push(exits_element);
        }
        element
    }

    fn inputs_to_xml(&self, value: ValueId) -> XmlElement {
        let mut inputs = xml::inputs_element();
        let mut on_path = HashSet::new();
        for &input in &self.arena.get(value).inputs {
            inputs.push(self.input_to_xml(input, &mut on_path));
        }
        inputs
    }

    /// Depth-first provenance rendering. Merge inputs are flattened at
    /// construction so nesting stays shallow, but the guard keeps a
    /// self-referential graph from recursing forever.
    fn input_to_xml(&self, input: ValueId, on_path: &mut HashSet<ValueId>) -> XmlElement {
        let value = self.arena.get(input);
        if let (Some(at), false) = (value.origin, value.is_merge) {
            return xml::value_of_element(&self.instruction_id(at));
        }
        if let Some(param) = self.arguments.iter().position(|&a| a == input) {
            return xml::value_of_element(&self.parameter_id(param));
        }
        if value.is_merge {
            if !on_path.insert(input) {
                return xml::unknown_element();
            }
            let mut merge = xml::merge_element();
            for &nested in &value.inputs {
                merge.push(self.input_to_xml(nested, on_path));
            }
            on_path.remove(&input);
            return merge;
        }
        xml::unknown_element()
    }
}

/// Forward-fill the sparse line table over all instruction indices.
fn fill_lines(table: &[LineEntry], len: usize) -> Vec<i32> {
    let markers: HashMap<usize, i32> = table.iter().map(|e| (e.index, e.line)).collect();
    let mut lines = Vec::with_capacity(len);
    let mut current = UNKNOWN_LINE;
    for index in 0..len {
        if let Some(&line) = markers.get(&index) {
            current = line;
        }
        lines.push(current);
    }
    lines
}

fn marshal_const(literal: &ConstValue) -> String {
    match literal {
        ConstValue::Str(s) => format!("b64+utf8:{}", BASE64.encode(s.as_bytes())),
        ConstValue::Int(v) => format!("raw:{v}"),
        ConstValue::Long(v) => format!("raw:{v}"),
        ConstValue::Float(v) => format!("raw:{v:?}"),
        ConstValue::Double(v) => format!("raw:{v:?}"),
        ConstValue::Class(name) => format!("raw:{name}"),
        ConstValue::MethodType(desc) => format!("raw:{desc}"),
        ConstValue::MethodHandle(handle) => format!("raw:{handle}"),
        ConstValue::Null => "raw:null".to_string(),
    }
}
