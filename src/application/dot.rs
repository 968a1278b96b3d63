//! Graphviz rendering of an action graph

use std::fmt::Write;

use crate::application::graph::{ActionGraph, ActionKind, Operation};

fn shape(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::FilterApply => "diamond",
        ActionKind::VariableDefine => "oval",
        ActionKind::OutputWrite => "box",
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

impl ActionGraph {
    /// DOT source: filters are diamonds, defines ovals, outputs boxes. The
    /// input frame edge is solid, any other dependency dashed.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph cutgraph {\n    rankdir=TB;\n");
        for action in self.actions() {
            let label = match action.operation() {
                Operation::Source => format!("{}\\n{}", action.id(), action.path()),
                _ => format!("{}\\n{}", action.id(), escape(&action.label())),
            };
            // writing into a String cannot fail
            let _ = writeln!(
                out,
                "    a{} [label=\"{}\", shape={}];",
                action.id().index(),
                label,
                shape(action.kind())
            );
        }
        for action in self.actions() {
            for dependency in action.dependencies() {
                let style = if action.input() == Some(*dependency) {
                    ""
                } else {
                    " [style=dashed]"
                };
                let _ = writeln!(
                    out,
                    "    a{} -> a{}{};",
                    dependency.index(),
                    action.id().index(),
                    style
                );
            }
        }
        out.push_str("}\n");
        out
    }
}
