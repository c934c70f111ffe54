//! Predicates: an expression tree bound to a single variable of entity type `T`.

use core::marker::PhantomData;
use std::collections::BTreeSet;

use super::expr::{Comparator, Comparison, Expr, ExprRewriter, SubstituteVariable, Variable};
use super::field::{FieldValue, Fields};

/// A boolean expression over one implicit variable of type `T`.
pub struct Predicate<T> {
    parameter: Variable,
    body: Expr,
    _entity: PhantomData<fn(&T) -> bool>,
}

impl<T> Predicate<T> {
    /// Mint a fresh variable and build the body against it.
    pub fn bind(build: impl FnOnce(Parameter<T>) -> Expr) -> Self {
        let parameter = Variable::fresh();
        let body = build(Parameter::new(parameter));
        Self::from_parts(parameter, body)
    }

    /// Assemble a predicate from an existing tree.
    ///
    /// The caller is responsible for `body` only referencing `parameter`; see
    /// [`Predicate::is_well_formed`].
    pub fn from_parts(parameter: Variable, body: Expr) -> Self {
        Self {
            parameter,
            body,
            _entity: PhantomData,
        }
    }

    pub fn parameter(&self) -> Variable {
        self.parameter
    }

    pub fn body(&self) -> &Expr {
        &self.body
    }

    pub fn into_parts(self) -> (Variable, Expr) {
        (self.parameter, self.body)
    }

    pub fn free_variables(&self) -> BTreeSet<Variable> {
        self.body.variables()
    }

    /// Every leaf references the bound parameter.
    pub fn is_well_formed(&self) -> bool {
        self.free_variables().iter().all(|v| *v == self.parameter)
    }

    /// Rebind to `variable`; see [`unify`].
    pub fn unify(&self, variable: Variable) -> Predicate<T> {
        unify(self, variable)
    }

    pub fn evaluate(&self, entity: &T) -> bool
    where
        T: Fields,
    {
        self.body.evaluate(self.parameter, entity)
    }
}

/// Return a structurally identical predicate bound to `variable`.
///
/// Every leaf reference to the old parameter is replaced; every other node is
/// left unchanged. Total for any input.
pub fn unify<T>(predicate: &Predicate<T>, variable: Variable) -> Predicate<T> {
    if predicate.parameter == variable {
        return predicate.clone();
    }
    let mut substitute = SubstituteVariable {
        from: predicate.parameter,
        to: variable,
    };
    Predicate::from_parts(variable, substitute.rewrite(&predicate.body))
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self::from_parts(self.parameter, self.body.clone())
    }
}

impl<T> PartialEq for Predicate<T> {
    fn eq(&self, other: &Self) -> bool {
        self.parameter == other.parameter && self.body == other.body
    }
}

impl<T> core::fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "|{}| {}", self.parameter, self.body)
    }
}

impl<T> core::fmt::Display for Predicate<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Handle on the bound variable handed to predicate builders.
pub struct Parameter<T> {
    variable: Variable,
    _entity: PhantomData<fn(&T)>,
}

impl<T> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Parameter<T> {}

impl<T> Parameter<T> {
    fn new(variable: Variable) -> Self {
        Self {
            variable,
            _entity: PhantomData,
        }
    }

    pub fn variable(self) -> Variable {
        self.variable
    }

    pub fn field(self, name: &'static str) -> FieldRef {
        FieldRef {
            variable: self.variable,
            field: name,
        }
    }
}

/// A field of the bound variable; builds leaf comparisons.
#[derive(Debug, Copy, Clone)]
pub struct FieldRef {
    variable: Variable,
    field: &'static str,
}

impl FieldRef {
    fn compare(self, comparator: Comparator) -> Expr {
        Expr::Compare(Comparison {
            variable: self.variable,
            field: self.field,
            comparator,
        })
    }

    /// Equality; comparing with a null value means "is null".
    pub fn equals(self, value: impl Into<FieldValue>) -> Expr {
        match value.into() {
            FieldValue::Null => self.is_null(),
            v => self.compare(Comparator::Eq(v)),
        }
    }

    pub fn not_equals(self, value: impl Into<FieldValue>) -> Expr {
        match value.into() {
            FieldValue::Null => self.is_not_null(),
            v => self.compare(Comparator::Ne(v)),
        }
    }

    pub fn less_than(self, value: impl Into<FieldValue>) -> Expr {
        self.compare(Comparator::Lt(value.into()))
    }

    pub fn at_most(self, value: impl Into<FieldValue>) -> Expr {
        self.compare(Comparator::Le(value.into()))
    }

    pub fn greater_than(self, value: impl Into<FieldValue>) -> Expr {
        self.compare(Comparator::Gt(value.into()))
    }

    pub fn at_least(self, value: impl Into<FieldValue>) -> Expr {
        self.compare(Comparator::Ge(value.into()))
    }

    pub fn contains(self, needle: impl Into<String>) -> Expr {
        self.compare(Comparator::Contains(needle.into()))
    }

    pub fn starts_with(self, prefix: impl Into<String>) -> Expr {
        self.compare(Comparator::StartsWith(prefix.into()))
    }

    pub fn is_in<V: Into<FieldValue>>(self, values: impl IntoIterator<Item = V>) -> Expr {
        self.compare(Comparator::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn is_null(self) -> Expr {
        self.compare(Comparator::IsNull)
    }

    pub fn is_not_null(self) -> Expr {
        self.is_null().negate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        sku: &'static str,
    }

    impl Fields for Item {
        fn field(&self, name: &str) -> FieldValue {
            match name {
                "sku" => self.sku.into(),
                _ => FieldValue::Null,
            }
        }
    }

    #[test]
    fn bind_produces_well_formed_predicate() {
        let p = Predicate::<Item>::bind(|x| x.field("sku").equals("A-1"));
        assert!(p.is_well_formed());
        assert_eq!(p.free_variables().into_iter().collect::<Vec<_>>(), vec![p.parameter()]);
        assert!(p.evaluate(&Item { sku: "A-1" }));
        assert!(!p.evaluate(&Item { sku: "B-2" }));
    }

    #[test]
    fn unify_rebinds_every_leaf() {
        let p = Predicate::<Item>::bind(|x| {
            x.field("sku").starts_with("A").and(x.field("sku").not_equals("A-9"))
        });
        let v = Variable::fresh();
        let unified = unify(&p, v);

        assert_eq!(unified.parameter(), v);
        assert!(unified.is_well_formed());
        assert!(!unified.free_variables().contains(&p.parameter()));
        assert_eq!(unified.body().node_count(), p.body().node_count());

        for sku in ["A-1", "A-9", "B-1"] {
            let item = Item { sku };
            assert_eq!(unified.evaluate(&item), p.evaluate(&item));
        }
    }

    #[test]
    fn unify_onto_own_parameter_is_identity() {
        let p = Predicate::<Item>::bind(|x| x.field("sku").is_null());
        assert_eq!(unify(&p, p.parameter()), p);
    }

    #[test]
    fn mixing_two_bound_variables_is_not_well_formed() {
        let a = Predicate::<Item>::bind(|x| x.field("sku").equals("A"));
        let b = Predicate::<Item>::bind(|x| x.field("sku").equals("B"));

        let naive = Predicate::<Item>::from_parts(a.parameter(), a.body().clone().or(b.body().clone()));
        assert!(!naive.is_well_formed());
        // The leaf bound to `b`'s variable never sees the entity.
        assert!(!naive.evaluate(&Item { sku: "B" }));
    }

    #[test]
    fn equals_null_means_is_null() {
        let p = Predicate::<Item>::bind(|x| x.field("missing").equals(None::<String>));
        assert!(matches!(
            p.body(),
            Expr::Compare(Comparison {
                comparator: Comparator::IsNull,
                ..
            })
        ));
        assert!(p.evaluate(&Item { sku: "A" }));
    }
}
