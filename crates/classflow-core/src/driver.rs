//! Whole-program worklist
//!
//! Transitive closure over classes: starting from a set of entry classes,
//! every owner referenced by a call instruction of a successfully analysed
//! method is discovered and analysed exactly once. Per-class and per-method
//! failures are isolated here so one bad class never aborts the run;
//! internal invariant violations are not.

use crate::error::{AnalysisError, AnalysisResult, DecodeError};
use crate::flow::MethodGraph;
use crate::ir::ClassDef;
use crate::xml::{self, XmlElement};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Resolves a class name to its raw bytes. `None` is "not found", a plain
/// signal to give up on that class, not an error.
pub trait ClassLoader {
    fn open(&self, class_name: &str) -> Option<Vec<u8>>;
}

/// Decodes raw class bytes into the structured representation.
pub trait ClassDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<ClassDef, DecodeError>;
}

/// Run-scoped discovery state: which classes were handled, which are still
/// pending. Membership in either side prevents re-enqueueing.
#[derive(Debug, Default)]
pub struct ClassWorklist {
    handled: HashSet<String>,
    queued: HashSet<String>,
    pending: VecDeque<String>,
}

impl ClassWorklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a class unless it was already seen. Accepts dotted or slashed
    /// names; they are normalised to internal (slashed) form.
    pub fn enqueue(&mut self, class_name: &str) {
        let internal = class_name.replace('.', "/");
        if self.handled.contains(&internal) || !self.queued.insert(internal.clone()) {
            return;
        }
        self.pending.push_back(internal);
    }

    /// Take the next pending class, marking it handled immediately so a
    /// self-referential call during its own analysis cannot requeue it.
    pub fn next(&mut self) -> Option<String> {
        let name = self.pending.pop_front()?;
        self.queued.remove(&name);
        self.handled.insert(name.clone());
        Some(name)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn handled(&self) -> &HashSet<String> {
        &self.handled
    }
}

/// Whole-program driver: owns the worklist and accumulates per-method
/// graphs in completion order.
pub struct ProgramAnalysis<'a> {
    loader: &'a dyn ClassLoader,
    decoder: &'a dyn ClassDecoder,
    worklist: ClassWorklist,
    graphs: Vec<MethodGraph>,
}

impl<'a> ProgramAnalysis<'a> {
    pub fn new(loader: &'a dyn ClassLoader, decoder: &'a dyn ClassDecoder) -> Self {
        Self {
            loader,
            decoder,
            worklist: ClassWorklist::new(),
            graphs: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, class_name: &str) {
        self.worklist.enqueue(class_name);
    }

    /// Drain the worklist. Fails only on internal invariant violations.
    pub fn run(&mut self) -> AnalysisResult<()> {
        while let Some(class_name) = self.worklist.next() {
            let bytes = match self.loader.open(&class_name) {
                Some(bytes) => bytes,
                None => {
                    warn!(class = %class_name, "class not found on the class path, skipping");
                    continue;
                }
            };
            let class = match self.decoder.decode(&bytes) {
                Ok(class) => class,
                Err(err) => {
                    warn!(class = %class_name, error = %err, "failed to decode class, skipping");
                    continue;
                }
            };
            self.analyze_class(&class)?;
        }
        info!(
            classes = self.worklist.handled().len(),
            methods = self.graphs.len(),
            "analysis complete"
        );
        Ok(())
    }

    fn analyze_class(&mut self, class: &ClassDef) -> AnalysisResult<()> {
        debug!(class = %class.name, methods = class.methods.len(), "analysing class");
        for method in &class.methods {
            match MethodGraph::analyze(&class.name, method) {
                Ok(graph) => {
                    for (owner, _name) in &graph.call_targets {
                        self.worklist.enqueue(owner);
                    }
                    self.graphs.push(graph);
                }
                Err(AnalysisError::Rejected(reason)) => {
                    warn!(
                        class = %class.name,
                        method = %method.name,
                        %reason,
                        "method analysis rejected, skipping"
                    );
                }
                Err(err @ AnalysisError::Internal(_)) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn graphs(&self) -> &[MethodGraph] {
        &self.graphs
    }

    /// Aggregate every analysed method into one document, in the order the
    /// methods were completed.
    pub fn into_document(self) -> XmlElement {
        let mut root = xml::document_root();
        for graph in &self.graphs {
            root.push(graph.to_xml());
        }
        root
    }
}
