//! Human-readable rendering of a compiled [`super::Plan`], used by
//! `GET /v1/schemas/{name}` debugging output and by the CLI. Purely
//! cosmetic — it has no bearing on plan semantics.

use std::fmt::Write as _;

use super::types::Plan;

/// Renders each plan node with its resolved in/out edges and active
/// address, one line per node, in topological order.
pub fn explain(plan: &Plan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "plan {} (scheme {})", plan.name, plan.scheme.name);
    for pn in &plan.nodes {
        let inbound: Vec<String> = pn.inbound.iter().map(|r| r.0.clone()).collect();
        let outbound: Vec<String> = pn.outbound.iter().map(|a| a.to_string()).collect();
        let _ = writeln!(
            out,
            "  {:<12} action={:<16} active={:<21} in=[{}] out=[{}]",
            pn.node.name,
            pn.node.action,
            pn.active_address().to_string(),
            inbound.join(", "),
            outbound.join(", "),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::build::build_plan;
    use super::super::types::{Address, Node, Scheme};
    use super::*;

    #[test]
    fn renders_one_line_per_node() {
        let scheme = Scheme {
            name: "s".into(),
            dataflow: "A ; B".into(),
            nodes: vec![
                Node {
                    name: "A".into(),
                    action: "gen".into(),
                    addresses: vec![Address { host: "h".into(), port: 1 }],
                    argv: vec![],
                    env: Default::default(),
                },
                Node {
                    name: "B".into(),
                    action: "sink".into(),
                    addresses: vec![Address { host: "h".into(), port: 2 }],
                    argv: vec![],
                    env: Default::default(),
                },
            ],
        };
        let plan = build_plan(scheme).unwrap();
        let text = explain(&plan);
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("s_A") == false); // runtime names only appear in `in=[...]`
        assert!(text.contains("in=[s_A]"));
    }
}
