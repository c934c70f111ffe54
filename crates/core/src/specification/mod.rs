//! Specification pattern: composable predicates as inspectable syntax trees.
//!
//! A [`Specification`] wraps a [`Predicate`], which is an [`Expr`] tree bound to
//! exactly one [`Variable`]. Because the tree is data rather than a closure, the
//! same specification can be:
//!
//! - evaluated in memory ([`Specification::is_satisfied_by`]), and
//! - translated by a storage adapter into its native filter language
//!   ([`Specification::to_filter`] + [`FilterTranslator`]).
//!
//! Combining two independently built predicates requires them to share a
//! single variable. `and`/`or` mint a fresh variable and [`unify`] both operands
//! onto it; `not` keeps the operand's variable.

pub mod expr;
pub mod field;
pub mod predicate;
pub mod spec;

pub use expr::{
    Comparator, Comparison, Expr, ExprRewriter, ExprVisitor, SubstituteVariable, Variable,
    rewrite_children, walk,
};
pub use field::{FieldValue, Fields};
pub use predicate::{FieldRef, Parameter, Predicate, unify};
pub use spec::{FilterTranslator, Specification};
