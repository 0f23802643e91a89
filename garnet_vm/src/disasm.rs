//! Disassembly formatting.
//!
//! Each instruction renders its own line through [`Formatter`]; the
//! formatter supplies label, calldata, object, local, and inline-storage
//! rendering, and collects child iseqs enqueued by instructions that
//! embed one so they are emitted after the parent listing.

use crate::iseq::{Iseq, Label};
use crate::value::Value;
use garnet_core::CallData;
use std::collections::VecDeque;
use std::fmt::Write;
use std::rc::Rc;

/// Renders instruction listings.
pub struct Formatter {
    current: Option<Rc<Iseq>>,
    queue: VecDeque<Rc<Iseq>>,
}

impl Formatter {
    /// Create a formatter with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: None,
            queue: VecDeque::new(),
        }
    }

    /// Render a literal operand.
    #[must_use]
    pub fn object(&self, value: &Value) -> String {
        value.inspect()
    }

    /// Render a call-site descriptor.
    #[must_use]
    pub fn calldata(&self, calldata: &CallData) -> String {
        calldata.to_string()
    }

    /// Render a jump target.
    #[must_use]
    pub fn label(&self, label: &Label) -> String {
        label.name().to_owned()
    }

    /// Render an inline-storage handle.
    #[must_use]
    pub fn inline_storage(&self, index: usize) -> String {
        format!("<is:{index}>")
    }

    /// Render a local reference as `name@index`, resolving the name
    /// through the owning table of the iseq currently being listed.
    #[must_use]
    pub fn local(&self, index: usize, level: usize) -> String {
        if let Some(iseq) = &self.current {
            if let Some(owner) = iseq.table_at_level(level) {
                if let Some(name) = owner.local_table().name_at(index) {
                    return format!("{name}@{index}");
                }
            }
        }
        format!("<local:{index}>")
    }

    /// Queue a child iseq for emission after the current listing.
    pub fn enqueue(&mut self, iseq: Rc<Iseq>) {
        self.queue.push_back(iseq);
    }

    /// Produce the full listing for an iseq and every child enqueued
    /// while rendering it.
    #[must_use]
    pub fn format(&mut self, iseq: &Rc<Iseq>) -> String {
        let mut out = String::new();
        self.enqueue(Rc::clone(iseq));
        while let Some(next) = self.queue.pop_front() {
            self.format_one(&next, &mut out);
        }
        out
    }

    fn format_one(&mut self, iseq: &Rc<Iseq>, out: &mut String) {
        self.current = Some(Rc::clone(iseq));
        let _ = writeln!(
            out,
            "== disasm: #<ISeq:{}@<compiled>> ({})",
            iseq.name,
            iseq.kind.as_str()
        );
        let labels = iseq.labels_by_pc();
        let insns = iseq.clone_insns();
        for (pc, insn) in insns.iter().enumerate() {
            for (label_pc, label) in &labels {
                if *label_pc == pc {
                    let _ = writeln!(out, "{}:", label.name());
                }
            }
            let line = insn.disasm(self);
            let _ = writeln!(out, "{pc:04} {line}");
        }
        let _ = writeln!(out);
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Disassemble an iseq and its children into one listing.
#[must_use]
pub fn disassemble(iseq: &Rc<Iseq>) -> String {
    Formatter::new().format(iseq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::Insn;
    use crate::iseq::IseqKind;

    #[test]
    fn test_simple_listing() {
        let iseq = Iseq::new("<main>", IseqKind::Top);
        iseq.push(Insn::PutObject {
            object: Value::Integer(5),
        });
        iseq.push(Insn::Leave);
        let listing = disassemble(&iseq);
        assert!(listing.contains("== disasm: #<ISeq:<main>@<compiled>>"));
        assert!(listing.contains("0000 putobject 5"));
        assert!(listing.contains("0001 leave"));
    }

    #[test]
    fn test_labels_render_before_their_target() {
        let iseq = Iseq::new("<main>", IseqKind::Top);
        let label = iseq.new_label();
        iseq.push(Insn::Jump {
            label: label.clone(),
        });
        iseq.push_label(&label);
        iseq.push(Insn::PutNil);
        iseq.push(Insn::Leave);
        let listing = disassemble(&iseq);
        assert!(listing.contains("0000 jump label_0"));
        assert!(listing.contains("label_0:\n0001 putnil"));
    }

    #[test]
    fn test_child_iseqs_follow_parent() {
        let parent = Iseq::new("<main>", IseqKind::Top);
        let body = Iseq::with_parent("greet", IseqKind::Method, &parent);
        body.push(Insn::PutNil);
        body.push(Insn::Leave);
        parent.push(Insn::DefineMethod {
            name: garnet_core::intern("greet"),
            iseq: Rc::clone(&body),
        });
        parent.push(Insn::PutNil);
        parent.push(Insn::Leave);

        let listing = disassemble(&parent);
        let main_at = listing.find("ISeq:<main>").unwrap();
        let child_at = listing.find("ISeq:greet").unwrap();
        assert!(main_at < child_at);
        assert!(listing.contains("definemethod :greet, greet"));
    }

    #[test]
    fn test_local_rendering() {
        let iseq = Iseq::new("<main>", IseqKind::Top);
        let a = iseq.local("a");
        iseq.push(Insn::SetLocalWc0 { index: a });
        iseq.push(Insn::GetLocalWc0 { index: a });
        iseq.push(Insn::Leave);
        let listing = disassemble(&iseq);
        assert!(listing.contains("getlocal_WC_0 a@0"));
        assert!(listing.contains("setlocal_WC_0 a@0"));
    }
}
