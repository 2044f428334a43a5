//! Trace rendering: the per-execution summary table and the Graphviz dump
//! of the modification-order graph.

use std::fmt::{self, Write};

use crate::action::Action;
use crate::execution::Execution;
use crate::ActionId;

const RULE: &str =
    "------------------------------------------------------------------------------------";

impl Execution {
    /// One text summary line for the execution followed by the action
    /// table, terminated by a 32-bit hash of the trace.
    pub fn write_summary<W: Write>(&self, w: &mut W) -> fmt::Result {
        write!(w, "Execution trace {}:", self.execution_number)?;
        if self.scheduler.all_threads_sleeping() {
            write!(w, " SLEEP-SET REDUNDANT")?;
        }
        if self.have_bug_reports() {
            write!(w, " DETECTED BUG(S)")?;
        }
        writeln!(w)?;

        writeln!(w, "{}", RULE)?;
        writeln!(
            w,
            "#    t    Action type     MO       Location         Value               Rf  CV"
        )?;
        writeln!(w, "{}", RULE)?;

        let mut hash: u32 = 0;
        for &id in &self.action_trace {
            let act = self.action(id);
            if act.seq > 0 {
                self.write_row(w, act)?;
            }
            hash = hash ^ (hash << 3) ^ act.hash();
        }
        writeln!(w, "HASH {}", hash)?;
        writeln!(w, "{}", RULE)?;
        Ok(())
    }

    fn write_row<W: Write>(&self, w: &mut W, act: &Action) -> fmt::Result {
        // Reads display the value they observed.
        let value = match act.reads_from {
            Some(rf) if act.is_read() => self.action(rf).value,
            _ => act.value,
        };
        write!(
            w,
            "{:<4} {:<4} {:<15} {:>7}  {:>#14x}   {:<#18x}",
            act.seq,
            act.tid,
            act.kind_str(),
            act.order_str(),
            act.location.0,
            value,
        )?;
        match act.reads_from {
            Some(rf) => write!(w, " {:>3}", self.action(rf).seq)?,
            None => write!(w, "    ")?,
        }
        match &act.cv {
            Some(cv) => writeln!(w, "  {}", cv),
            None => writeln!(w),
        }
    }

    /// Graphviz digraph of the mo-graph plus sequenced-before and
    /// reads-from edges.
    pub fn write_mo_graph<W: Write>(&self, w: &mut W) -> fmt::Result {
        let name = |id: ActionId| format!("N{}", self.action(id).seq);

        writeln!(w, "digraph execution{} {{", self.execution_number)?;
        self.mo_graph.for_each_edge(|from, to| {
            let _ = writeln!(w, "\t{} -> {};", name(from), name(to));
        });

        let mut last_per_thread: Vec<Option<ActionId>> = vec![None; self.num_threads()];
        for &id in &self.action_trace {
            let act = self.action(id);
            if act.is_read() {
                if let Some(rf) = act.reads_from {
                    writeln!(
                        w,
                        "\t{} -> {} [label=\"rf\", color=red, weight=2];",
                        name(rf),
                        name(id)
                    )?;
                }
            }
            if let Some(prev) = last_per_thread[act.tid] {
                writeln!(
                    w,
                    "\t{} -> {} [label=\"sb\", color=blue, weight=400];",
                    name(prev),
                    name(id)
                )?;
            }
            last_per_thread[act.tid] = Some(id);
        }
        writeln!(w, "}}")
    }

    /// The summary as a string, convenient for hosts and tests.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        self.write_summary(&mut s)
            .expect("writing to a String cannot fail");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, MemOrder};
    use crate::execution::Params;
    use crate::oracle::RandomOracle;
    use crate::Location;

    fn small_execution() -> Execution {
        let mut e = Execution::new(Params::default(), Box::new(RandomOracle::new(1)));
        e.step(Action::new(
            ActionKind::AtomicWrite,
            MemOrder::Release,
            1,
            Location(0x10),
            42,
        ));
        e.step(Action::new(
            ActionKind::AtomicRead,
            MemOrder::Acquire,
            1,
            Location(0x10),
            0,
        ));
        e
    }

    #[test]
    fn test_summary_has_banner_table_and_hash() {
        let mut e = small_execution();
        e.set_execution_number(3);
        let s = e.summary();
        assert!(s.starts_with("Execution trace 3:"));
        assert!(s.contains("atomic write"));
        assert!(s.contains("atomic read"));
        assert!(s.contains("HASH "));
    }

    #[test]
    fn test_summary_hides_seq_zero_actions() {
        let e = small_execution();
        let s = e.summary();
        // The uninitialized store has sequence number zero.
        assert!(!s.contains("uninitialized"));
    }

    #[test]
    fn test_bug_annotation() {
        let mut e = small_execution();
        e.assert_bug("boom");
        assert!(e.summary().contains("DETECTED BUG(S)"));
    }

    #[test]
    fn test_summary_is_deterministic() {
        let a = small_execution().summary();
        let b = small_execution().summary();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mo_graph_dump_has_rf_and_sb_edges() {
        let e = small_execution();
        let mut s = String::new();
        e.write_mo_graph(&mut s).unwrap();
        assert!(s.starts_with("digraph"));
        assert!(s.contains("label=\"rf\""));
        assert!(s.contains("label=\"sb\""));
        assert!(s.trim_end().ends_with('}'));
    }
}
