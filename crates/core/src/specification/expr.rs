//! Predicate syntax tree.
//!
//! An [`Expr`] is a tagged tree of boolean nodes whose leaves are
//! [`Comparison`]s against a field of some bound [`Variable`]. The tree is data,
//! not a closure: it can be evaluated in memory and also walked by a storage
//! adapter that translates it into its own filter language.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use super::field::{FieldValue, Fields};

/// A variable a predicate is bound to.
///
/// Every call to [`Variable::fresh`] returns a variable distinct from all
/// previously minted ones in the process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(u64);

static NEXT_VARIABLE: AtomicU64 = AtomicU64::new(1);

impl Variable {
    pub fn fresh() -> Self {
        Self(NEXT_VARIABLE.fetch_add(1, AtomicOrdering::Relaxed))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Variable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// The test a leaf applies to a field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparator {
    Eq(FieldValue),
    Ne(FieldValue),
    Lt(FieldValue),
    Le(FieldValue),
    Gt(FieldValue),
    Ge(FieldValue),
    /// Text field contains the substring.
    Contains(String),
    /// Text field starts with the prefix.
    StartsWith(String),
    /// Field equals one of the values.
    In(Vec<FieldValue>),
    IsNull,
}

impl Comparator {
    /// Apply the test to a field value.
    ///
    /// Every test except [`Comparator::IsNull`] is false against a null field.
    pub fn test(&self, actual: &FieldValue) -> bool {
        use core::cmp::Ordering::{Equal, Greater, Less};

        if let Comparator::IsNull = self {
            return actual.is_null();
        }
        if actual.is_null() {
            return false;
        }

        match self {
            Comparator::Eq(v) => actual == v,
            Comparator::Ne(v) => !v.is_null() && actual != v,
            Comparator::Lt(v) => actual.compare(v) == Some(Less),
            Comparator::Le(v) => matches!(actual.compare(v), Some(Less | Equal)),
            Comparator::Gt(v) => actual.compare(v) == Some(Greater),
            Comparator::Ge(v) => matches!(actual.compare(v), Some(Greater | Equal)),
            Comparator::Contains(needle) => actual.as_text().is_some_and(|s| s.contains(needle.as_str())),
            Comparator::StartsWith(prefix) => {
                actual.as_text().is_some_and(|s| s.starts_with(prefix.as_str()))
            }
            Comparator::In(values) => values.contains(actual),
            Comparator::IsNull => unreachable!("handled above"),
        }
    }
}

/// Leaf node: `variable.field <comparator>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub variable: Variable,
    pub field: &'static str,
    pub comparator: Comparator,
}

/// Boolean expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(bool),
    Compare(Comparison),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Evaluate with `variable` bound to `entity`.
    ///
    /// A comparison on any other variable is unbound and evaluates to false;
    /// trees built through the specification combinators never contain one.
    pub fn evaluate<T: Fields + ?Sized>(&self, variable: Variable, entity: &T) -> bool {
        match self {
            Expr::Literal(b) => *b,
            Expr::Compare(c) => {
                c.variable == variable && c.comparator.test(&entity.field(c.field))
            }
            Expr::And(a, b) => a.evaluate(variable, entity) && b.evaluate(variable, entity),
            Expr::Or(a, b) => a.evaluate(variable, entity) || b.evaluate(variable, entity),
            Expr::Not(e) => !e.evaluate(variable, entity),
        }
    }

    /// Variables referenced by leaves.
    pub fn variables(&self) -> BTreeSet<Variable> {
        struct Collect(BTreeSet<Variable>);

        impl ExprVisitor for Collect {
            fn visit_comparison(&mut self, comparison: &Comparison) {
                self.0.insert(comparison.variable);
            }
        }

        let mut collect = Collect(BTreeSet::new());
        collect.visit(self);
        collect.0
    }

    pub fn node_count(&self) -> usize {
        match self {
            Expr::Literal(_) | Expr::Compare(_) => 1,
            Expr::And(a, b) | Expr::Or(a, b) => 1 + a.node_count() + b.node_count(),
            Expr::Not(e) => 1 + e.node_count(),
        }
    }
}

impl core::fmt::Display for Expr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Expr::Literal(b) => write!(f, "{b}"),
            Expr::Compare(c) => {
                let target = format!("{}.{}", c.variable, c.field);
                match &c.comparator {
                    Comparator::Eq(v) => write!(f, "{target} = {v}"),
                    Comparator::Ne(v) => write!(f, "{target} <> {v}"),
                    Comparator::Lt(v) => write!(f, "{target} < {v}"),
                    Comparator::Le(v) => write!(f, "{target} <= {v}"),
                    Comparator::Gt(v) => write!(f, "{target} > {v}"),
                    Comparator::Ge(v) => write!(f, "{target} >= {v}"),
                    Comparator::Contains(s) => write!(f, "{target} CONTAINS {s:?}"),
                    Comparator::StartsWith(s) => write!(f, "{target} STARTS WITH {s:?}"),
                    Comparator::In(vs) => {
                        let items: Vec<String> = vs.iter().map(ToString::to_string).collect();
                        write!(f, "{target} IN ({})", items.join(", "))
                    }
                    Comparator::IsNull => write!(f, "{target} IS NULL"),
                }
            }
            Expr::And(a, b) => write!(f, "({a} AND {b})"),
            Expr::Or(a, b) => write!(f, "({a} OR {b})"),
            Expr::Not(e) => write!(f, "NOT {e}"),
        }
    }
}

/// Read-only structural traversal.
pub trait ExprVisitor {
    fn visit_comparison(&mut self, comparison: &Comparison);

    fn visit_literal(&mut self, _value: bool) {}

    fn visit(&mut self, expr: &Expr) {
        walk(self, expr);
    }
}

/// Visit the children of `expr` (default traversal for [`ExprVisitor::visit`]).
pub fn walk<V: ExprVisitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match expr {
        Expr::Literal(b) => visitor.visit_literal(*b),
        Expr::Compare(c) => visitor.visit_comparison(c),
        Expr::And(a, b) | Expr::Or(a, b) => {
            visitor.visit(a);
            visitor.visit(b);
        }
        Expr::Not(e) => visitor.visit(e),
    }
}

/// Structural rewrite producing a new tree.
///
/// Implementors decide what to do with leaves; composite nodes are rebuilt with
/// the same shape by [`rewrite_children`].
pub trait ExprRewriter {
    fn rewrite_comparison(&mut self, comparison: &Comparison) -> Expr;

    fn rewrite(&mut self, expr: &Expr) -> Expr {
        rewrite_children(self, expr)
    }
}

pub fn rewrite_children<R: ExprRewriter + ?Sized>(rewriter: &mut R, expr: &Expr) -> Expr {
    match expr {
        Expr::Literal(b) => Expr::Literal(*b),
        Expr::Compare(c) => rewriter.rewrite_comparison(c),
        Expr::And(a, b) => Expr::And(Box::new(rewriter.rewrite(a)), Box::new(rewriter.rewrite(b))),
        Expr::Or(a, b) => Expr::Or(Box::new(rewriter.rewrite(a)), Box::new(rewriter.rewrite(b))),
        Expr::Not(e) => Expr::Not(Box::new(rewriter.rewrite(e))),
    }
}

/// Replaces every leaf reference to `from` with `to`.
#[derive(Debug, Copy, Clone)]
pub struct SubstituteVariable {
    pub from: Variable,
    pub to: Variable,
}

impl ExprRewriter for SubstituteVariable {
    fn rewrite_comparison(&mut self, comparison: &Comparison) -> Expr {
        let mut leaf = comparison.clone();
        if leaf.variable == self.from {
            leaf.variable = self.to;
        }
        Expr::Compare(leaf)
    }
}
