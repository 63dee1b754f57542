//! Planner: validates a [`Scheme`], builds the operator graph from its
//! parsed dataflow expression, and emits a topologically ordered [`Plan`].

use std::collections::{HashMap, HashSet};

use crate::parser::{parse, Ast, OpKind};

use super::types::{Address, Plan, PlanNode, RuntimeName, Scheme};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("scheme name must not be empty")]
    EmptySchemeName,
    #[error("dataflow expression must not be empty")]
    EmptyDataflow,
    #[error("node '{0}' has no addresses")]
    NoAddresses(String),
    #[error("node names must be unique within a scheme, duplicate: '{0}'")]
    DuplicateNodeName(String),
    #[error("address {0}:{1} is used by more than one node")]
    AddressCollision(String, u16),
    #[error("dataflow expression syntax error: {0}")]
    Syntax(#[from] crate::parser::ParseError),
    #[error("unknown identifier '{0}' in dataflow expression")]
    UnknownIdentifier(String),
    #[error("identifier '{0}' used more than once in the dataflow expression")]
    DuplicateUse(String),
    #[error("dataflow expression does not reference node '{0}'")]
    UnusedNode(String),
    #[error("cycle detected while planning (this should be unreachable for well-formed grammar)")]
    FoundCycle,
}

/// Compiles `scheme` into a [`Plan`].
pub fn build_plan(scheme: Scheme) -> Result<Plan, PlanError> {
    if scheme.name.trim().is_empty() {
        return Err(PlanError::EmptySchemeName);
    }
    if scheme.dataflow.trim().is_empty() {
        return Err(PlanError::EmptyDataflow);
    }

    let mut seen_names = HashSet::new();
    for node in &scheme.nodes {
        if !seen_names.insert(node.name.as_str()) {
            return Err(PlanError::DuplicateNodeName(node.name.clone()));
        }
        if node.addresses.is_empty() {
            return Err(PlanError::NoAddresses(node.name.clone()));
        }
    }

    let mut seen_addrs: HashMap<(&str, u16), &str> = HashMap::new();
    for node in &scheme.nodes {
        for addr in &node.addresses {
            if let Some(owner) = seen_addrs.insert((addr.host.as_str(), addr.port), node.name.as_str()) {
                if owner != node.name {
                    return Err(PlanError::AddressCollision(addr.host.clone(), addr.port));
                }
            }
        }
    }

    let ast = parse(&scheme.dataflow)?;

    let mut use_counts: HashMap<&str, usize> = HashMap::new();
    for name in ast.all_names() {
        *use_counts.entry(name).or_default() += 1;
    }
    for (name, count) in &use_counts {
        if !seen_names.contains(name) {
            return Err(PlanError::UnknownIdentifier((*name).to_string()));
        }
        if *count > 1 {
            return Err(PlanError::DuplicateUse((*name).to_string()));
        }
    }
    for node in &scheme.nodes {
        if !use_counts.contains_key(node.name.as_str()) {
            return Err(PlanError::UnusedNode(node.name.clone()));
        }
    }

    let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    collect_edges(&ast, &mut predecessors, &mut successors);

    let entries = ast.entry_set();
    let order = topological_order(&entries, &successors, &scheme.nodes)?;

    let nodes_by_name: HashMap<&str, _> = scheme.nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let plan_nodes = order
        .into_iter()
        .map(|name| {
            let node = nodes_by_name[name].clone();
            let inbound = predecessors
                .get(name)
                .into_iter()
                .flatten()
                .map(|p| RuntimeName::new(&scheme.name, p))
                .collect();
            let outbound = successors
                .get(name)
                .into_iter()
                .flatten()
                .map(|s| nodes_by_name[s].addresses[0].clone())
                .collect::<Vec<Address>>();
            PlanNode { node, inbound, outbound, addr_index: 0 }
        })
        .collect();

    Ok(Plan { name: scheme.name.clone(), scheme, nodes: plan_nodes })
}

/// Walks the AST adding a `pred -> succ` edge for every exit-of-A/entry-of-B
/// pair across consecutive children of a `;` chain. `\|` and `|` never add
/// edges between their children — only recurse into them.
fn collect_edges<'a>(
    ast: &'a Ast,
    predecessors: &mut HashMap<&'a str, Vec<&'a str>>,
    successors: &mut HashMap<&'a str, Vec<&'a str>>,
) {
    match ast {
        Ast::Action { .. } => {}
        Ast::Operation { kind: OpKind::Seq, children, .. } => {
            for child in children {
                collect_edges(child, predecessors, successors);
            }
            for pair in children.windows(2) {
                let (left, right) = (&pair[0], &pair[1]);
                for exit in left.exit_set() {
                    for entry in right.entry_set() {
                        successors.entry(exit).or_default().push(entry);
                        predecessors.entry(entry).or_default().push(exit);
                    }
                }
            }
        }
        Ast::Operation { children, .. } => {
            for child in children {
                collect_edges(child, predecessors, successors);
            }
        }
    }
}

/// Colored (white/gray/black) DFS from `entries`, returning nodes in
/// reverse-finish (topological) order. A gray-to-gray revisit is a back
/// edge: a cycle in the generated graph, which the grammar cannot produce
/// but which we still detect defensively.
fn topological_order<'a>(
    entries: &[&'a str],
    successors: &HashMap<&'a str, Vec<&'a str>>,
    all_nodes: &'a [super::types::Node],
) -> Result<Vec<&'a str>, PlanError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<&str, Color> = all_nodes.iter().map(|n| (n.name.as_str(), Color::White)).collect();
    let mut order = Vec::new();

    fn visit<'a>(
        node: &'a str,
        successors: &HashMap<&'a str, Vec<&'a str>>,
        color: &mut HashMap<&'a str, Color>,
        order: &mut Vec<&'a str>,
    ) -> Result<(), PlanError> {
        match color.get(node) {
            Some(Color::Black) => return Ok(()),
            Some(Color::Gray) => return Err(PlanError::FoundCycle),
            _ => {}
        }
        color.insert(node, Color::Gray);
        if let Some(succs) = successors.get(node) {
            for succ in succs {
                visit(succ, successors, color, order)?;
            }
        }
        color.insert(node, Color::Black);
        order.push(node);
        Ok(())
    }

    for entry in entries {
        visit(entry, successors, &mut color, &mut order)?;
    }
    // Any node not reachable from the declared entries (should not happen
    // for a validated scheme, since every name is used exactly once and is
    // therefore either an entry or downstream of one) is appended so the
    // plan still contains every declared node.
    for node in all_nodes {
        visit(node.name.as_str(), successors, &mut color, &mut order)?;
    }

    order.reverse();
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::types::{Address, Node};

    fn node(name: &str, port: u16) -> Node {
        Node {
            name: name.to_string(),
            action: format!("{name}-action"),
            addresses: vec![Address { host: "127.0.0.1".into(), port }],
            argv: vec![],
            env: Default::default(),
        }
    }

    fn scheme(dataflow: &str, nodes: Vec<Node>) -> Scheme {
        Scheme { name: "s".into(), nodes, dataflow: dataflow.into() }
    }

    #[test]
    fn linear_pipeline_topological_order_and_edges() {
        let plan = build_plan(scheme("A ; B ; C", vec![node("A", 1), node("B", 2), node("C", 3)])).unwrap();
        let names: Vec<_> = plan.nodes.iter().map(|n| n.node.name.clone()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(plan.node("A").unwrap().outbound, vec![Address { host: "127.0.0.1".into(), port: 2 }]);
        assert_eq!(plan.node("C").unwrap().outbound, vec![]);
        assert_eq!(plan.node("C").unwrap().inbound, vec![RuntimeName::new("s", "B")]);
    }

    #[test]
    fn alternative_yields_edges_from_both_branches_to_c() {
        let plan = build_plan(scheme("(A | B) ; C", vec![node("A", 1), node("B", 2), node("C", 3)])).unwrap();
        let c = plan.node("C").unwrap();
        let mut inbound: Vec<_> = c.inbound.iter().map(|r| r.0.clone()).collect();
        inbound.sort();
        assert_eq!(inbound, vec!["s_A", "s_B"]);
        assert_eq!(plan.node("A").unwrap().outbound, vec![Address { host: "127.0.0.1".into(), port: 3 }]);
        assert_eq!(plan.node("B").unwrap().outbound, vec![Address { host: "127.0.0.1".into(), port: 3 }]);
    }

    #[test]
    fn parallel_has_no_edges_between_branches() {
        let plan = build_plan(scheme("A \\| B", vec![node("A", 1), node("B", 2)])).unwrap();
        assert!(plan.node("A").unwrap().outbound.is_empty());
        assert!(plan.node("B").unwrap().outbound.is_empty());
        assert!(plan.node("A").unwrap().inbound.is_empty());
        assert!(plan.node("B").unwrap().inbound.is_empty());
    }

    #[test]
    fn rejects_duplicate_identifier_use() {
        let err = build_plan(scheme("A ; A", vec![node("A", 1)])).unwrap_err();
        assert_eq!(err, PlanError::DuplicateUse("A".into()));
    }

    #[test]
    fn rejects_unknown_identifier() {
        let err = build_plan(scheme("A ; B", vec![node("A", 1)])).unwrap_err();
        assert_eq!(err, PlanError::UnknownIdentifier("B".into()));
    }

    #[test]
    fn rejects_address_collision() {
        let err = build_plan(scheme("A ; B", vec![node("A", 1), node("B", 1)])).unwrap_err();
        assert_eq!(err, PlanError::AddressCollision("127.0.0.1".into(), 1));
    }

    #[test]
    fn rejects_empty_dataflow() {
        let err = build_plan(scheme("", vec![node("A", 1)])).unwrap_err();
        assert_eq!(err, PlanError::EmptyDataflow);
    }
}
