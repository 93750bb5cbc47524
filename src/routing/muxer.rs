//! Priority-ordered route table for TCP rules.
//!
//! # Responsibilities
//! - Compile rules into matcher trees
//! - Keep routes sorted by descending priority
//! - Return the first route whose tree matches the connection metadata
//!
//! # Design Decisions
//! - Insertion rebuilds a new sorted list and swaps it in, so lookups never lock
//! - Ties keep insertion order (stable sort)

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::rules::{compile, ConnData, MatcherTree, RuleError, RuleSyntax};

/// The one rule that matches every connection, TLS or not.
pub const CATCH_ALL_RULE: &str = "HostSNI(`*`)";

/// Priority of a rule declared without an explicit one.
///
/// The catch-all always sorts last; every other rule is ranked by length,
/// so more specific rules tend to be tried first.
pub fn compute_rule_priority(rule: &str) -> i64 {
    if rule == CATCH_ALL_RULE {
        return -1;
    }
    rule.chars().count() as i64
}

struct Route<H> {
    tree: MatcherTree,
    handler: H,
    priority: i64,
    catch_all: bool,
}

/// Ordered set of compiled routes.
pub struct Muxer<H> {
    routes: ArcSwap<Vec<Arc<Route<H>>>>,
}

impl<H: Clone> Muxer<H> {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Compile `rule` and insert it. A `priority` of 0 means "unset".
    ///
    /// On a compile error the route table is left untouched.
    pub fn add_route(
        &self,
        rule: &str,
        syntax: RuleSyntax,
        priority: i64,
        handler: H,
    ) -> Result<(), RuleError> {
        let tree = compile(rule, syntax)?;
        let route = Arc::new(Route {
            tree,
            handler,
            priority: if priority == 0 {
                compute_rule_priority(rule)
            } else {
                priority
            },
            catch_all: rule == CATCH_ALL_RULE,
        });

        self.routes.rcu(|current| {
            let mut next: Vec<Arc<Route<H>>> = current.iter().cloned().collect();
            next.push(Arc::clone(&route));
            next.sort_by(|a, b| b.priority.cmp(&a.priority));
            next
        });

        tracing::trace!(rule, priority = route.priority, "Route added");
        Ok(())
    }

    /// First matching handler and whether its rule is the catch-all.
    pub fn find(&self, meta: &ConnData) -> (Option<H>, bool) {
        let routes = self.routes.load();
        routes
            .iter()
            .find(|route| route.tree.matches(meta))
            .map(|route| (Some(route.handler.clone()), route.catch_all))
            .unwrap_or((None, false))
    }

    pub fn has_routes(&self) -> bool {
        !self.routes.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_routes()
    }
}

impl<H: Clone> Default for Muxer<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> std::fmt::Debug for Muxer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("routes", &self.routes.load().len())
            .finish()
    }
}
