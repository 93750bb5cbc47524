//! Connection rule subsystem.
//!
//! # Data Flow
//! ```text
//! Rule text: HostSNI(`a.com`) && !ClientIP(`10.0.0.0/8`)
//!     → parser.rs (tokens → syntax tree of calls, &&, ||, !)
//!     → matchers.rs (call + syntax registry → leaf predicate)
//!     → tree.rs (syntax tree → MatcherTree, `!` folded into leaves)
//!     → MatcherTree::matches(&ConnData)
//! ```
//!
//! # Design Decisions
//! - Two syntaxes side by side: `legacy` (one argument per matcher) and
//!   `extended` (N arguments, templated `HostSNIRegexp`)
//! - Matcher names form a closed enum; adding one is a compile-time change
//! - Trees are immutable once compiled and shared across connection tasks

pub mod matchers;
pub mod metadata;
pub mod parser;
pub mod template;
pub mod tree;

pub use matchers::{Matcher, RuleSyntax};
pub use metadata::ConnData;
pub use parser::{parse, Expr};
pub use tree::{compile, MatcherTree};

use thiserror::Error;

/// Errors raised while compiling a rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("empty rule")]
    Empty,

    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("unsupported matcher {name:?} for {syntax} rule syntax")]
    UnknownMatcher { name: String, syntax: RuleSyntax },

    #[error("empty value for {matcher:?} matcher is not allowed")]
    NoArguments { matcher: &'static str },

    #[error("{matcher:?} matcher takes exactly one argument in {syntax} rule syntax, got {count}")]
    TooManyArguments {
        matcher: &'static str,
        syntax: RuleSyntax,
        count: usize,
    },

    #[error("invalid value for {matcher:?} matcher: {value:?} {reason}")]
    InvalidArgument {
        matcher: &'static str,
        value: String,
        reason: String,
    },
}
