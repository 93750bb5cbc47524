//! Compiled matcher trees.

use std::fmt;
use std::sync::Arc;

use super::matchers::{self, Predicate};
use super::{parse, ConnData, Expr, RuleError, RuleSyntax};

enum Node {
    Leaf(Predicate),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, meta: &ConnData) -> bool {
        match self {
            Node::Leaf(pred) => pred(meta),
            Node::And(lhs, rhs) => lhs.eval(meta) && rhs.eval(meta),
            Node::Or(lhs, rhs) => lhs.eval(meta) || rhs.eval(meta),
        }
    }

    fn leaves(&self) -> usize {
        match self {
            Node::Leaf(_) => 1,
            Node::And(lhs, rhs) | Node::Or(lhs, rhs) => lhs.leaves() + rhs.leaves(),
        }
    }
}

/// Boolean tree of leaf predicates. Negation has already been folded into
/// the leaves, so evaluation only knows `and` and `or`.
pub struct MatcherTree {
    node: Node,
}

impl MatcherTree {
    pub fn matches(&self, meta: &ConnData) -> bool {
        self.node.eval(meta)
    }
}

impl fmt::Debug for MatcherTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatcherTree")
            .field("leaves", &self.node.leaves())
            .finish()
    }
}

/// Compile rule text written in `syntax` into a matcher tree.
pub fn compile(rule: &str, syntax: RuleSyntax) -> Result<MatcherTree, RuleError> {
    let expr = parse(rule)?;
    Ok(MatcherTree {
        node: build_node(&expr, syntax)?,
    })
}

fn build_node(expr: &Expr, syntax: RuleSyntax) -> Result<Node, RuleError> {
    match expr {
        Expr::Call { name, args } => Ok(Node::Leaf(matchers::build(name, args, syntax)?)),
        Expr::Not(inner) => {
            let negated: Predicate = match build_node(inner, syntax)? {
                Node::Leaf(pred) => Arc::new(move |meta: &ConnData| !pred(meta)),
                compound => Arc::new(move |meta: &ConnData| !compound.eval(meta)),
            };
            Ok(Node::Leaf(negated))
        }
        Expr::And(lhs, rhs) => Ok(Node::And(
            Box::new(build_node(lhs, syntax)?),
            Box::new(build_node(rhs, syntax)?),
        )),
        Expr::Or(lhs, rhs) => Ok(Node::Or(
            Box::new(build_node(lhs, syntax)?),
            Box::new(build_node(rhs, syntax)?),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn conn(name: &str, addr: &str, alpn: &[&str]) -> ConnData {
        ConnData::new(
            name,
            addr.parse().unwrap(),
            alpn.iter().map(|p| p.to_string()).collect(),
        )
    }

    #[test]
    fn combines_matchers() {
        let tree = compile(
            "HostSNI(`foo.com`) && !ClientIP(`10.0.0.0/8`) || ALPN(`h2`)",
            RuleSyntax::Extended,
        )
        .unwrap();

        assert!(tree.matches(&conn("foo.com", "192.168.1.1:1000", &[])));
        assert!(!tree.matches(&conn("foo.com", "10.1.1.1:1000", &[])));
        assert!(tree.matches(&conn("bar.com", "10.1.1.1:1000", &["h2"])));
    }

    #[test]
    fn negated_group() {
        let tree = compile(
            "!(HostSNI(`foo.com`) || HostSNI(`bar.com`))",
            RuleSyntax::Extended,
        )
        .unwrap();
        assert!(!tree.matches(&conn("foo.com", "1.1.1.1:1", &[])));
        assert!(!tree.matches(&conn("bar.com", "1.1.1.1:1", &[])));
        assert!(tree.matches(&conn("baz.com", "1.1.1.1:1", &[])));
    }

    #[test]
    fn legacy_syntax_still_composes() {
        let tree = compile(
            "HostSNI(`foo.com`) || HostSNIRegexp(`^bar-[0-9]+\\.com$`)",
            RuleSyntax::Legacy,
        )
        .unwrap();
        assert!(tree.matches(&conn("bar-12.com", "1.1.1.1:1", &[])));
        assert!(!tree.matches(&conn("bar-x.com", "1.1.1.1:1", &[])));
    }

    #[test]
    fn compile_errors_surface() {
        assert!(compile("Unknown(`x`)", RuleSyntax::Extended).is_err());
        assert!(compile("HostSNI(`a`) && ALPN(`acme-tls/1`)", RuleSyntax::Extended).is_err());
        assert!(compile("HostSNI(`a`) &&", RuleSyntax::Extended).is_err());
    }

    const LEAVES: [&str; 4] = [
        "HostSNI(`a.test`)",
        "ClientIP(`10.0.0.0/8`)",
        "ALPN(`h2`)",
        "ALPN(`http/1.1`)",
    ];

    #[derive(Debug, Clone)]
    enum Ast {
        Leaf(usize),
        Not(Box<Ast>),
        And(Box<Ast>, Box<Ast>),
        Or(Box<Ast>, Box<Ast>),
    }

    impl Ast {
        fn render(&self) -> String {
            match self {
                Ast::Leaf(i) => LEAVES[*i].to_string(),
                Ast::Not(a) => format!("!({})", a.render()),
                Ast::And(a, b) => format!("({}) && ({})", a.render(), b.render()),
                Ast::Or(a, b) => format!("({}) || ({})", a.render(), b.render()),
            }
        }

        fn eval(&self, truth: &[bool; 4]) -> bool {
            match self {
                Ast::Leaf(i) => truth[*i],
                Ast::Not(a) => !a.eval(truth),
                Ast::And(a, b) => a.eval(truth) && b.eval(truth),
                Ast::Or(a, b) => a.eval(truth) || b.eval(truth),
            }
        }
    }

    fn ast() -> impl Strategy<Value = Ast> {
        let leaf = (0..LEAVES.len()).prop_map(Ast::Leaf);
        leaf.prop_recursive(5, 48, 2, |inner| {
            prop_oneof![
                inner.clone().prop_map(|a| Ast::Not(Box::new(a))),
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| Ast::And(Box::new(a), Box::new(b))),
                (inner.clone(), inner).prop_map(|(a, b)| Ast::Or(Box::new(a), Box::new(b))),
            ]
        })
    }

    proptest! {
        #[test]
        fn tree_agrees_with_reference(ast in ast(), truth in any::<[bool; 4]>()) {
            let name = if truth[0] { "a.test" } else { "b.test" };
            let addr = if truth[1] { "10.2.3.4:5000" } else { "192.168.0.1:5000" };
            let mut alpn = Vec::new();
            if truth[2] {
                alpn.push("h2");
            }
            if truth[3] {
                alpn.push("http/1.1");
            }

            let tree = compile(&ast.render(), RuleSyntax::Extended).unwrap();
            prop_assert_eq!(tree.matches(&conn(name, addr, &alpn)), ast.eval(&truth));
        }
    }
}
