//! The dataflow language: lexer, parser, and planner.
//!
//! A [`plan::Scheme`] is parsed and compiled into a [`plan::Plan`] by
//! [`plan::build_plan`]. The grammar, precedence, and edge-construction
//! rules are documented on [`parser`] and [`plan::build_plan`]
//! respectively.

pub mod lexer;
pub mod parser;
pub mod plan;

pub use parser::{parse, Ast, OpKind, ParseError};
pub use plan::{build_plan, Address, Node, Plan, PlanError, PlanNode, RuntimeName, Scheme};
