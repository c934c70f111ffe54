//! Composable specifications over an entity type.

use std::sync::Arc;

use super::expr::{Expr, Variable};
use super::field::Fields;
use super::predicate::{Parameter, Predicate, unify};

/// A composable, inspectable boolean predicate over `T`.
///
/// Specifications are values: combinators never mutate their inputs, they
/// return a new specification. `and`/`or` mint a fresh variable and unify both
/// operands onto it, so arbitrarily deep chains stay single-variable trees that
/// a query port can translate.
///
/// ```ignore
/// let acme = Specification::<Company>::new(|c| c.field("name").equals("Acme"));
/// let tax = Specification::<Company>::new(|c| c.field("tax_id").equals("12345678000190"));
/// let both = acme.and(&tax);
/// ```
pub struct Specification<T> {
    predicate: Arc<Predicate<T>>,
}

impl<T> Specification<T> {
    pub fn new(build: impl FnOnce(Parameter<T>) -> Expr) -> Self {
        Self::from_predicate(Predicate::bind(build))
    }

    pub fn from_predicate(predicate: Predicate<T>) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Satisfied by every entity.
    pub fn any() -> Self {
        Self::new(|_| Expr::Literal(true))
    }

    /// Satisfied by no entity.
    pub fn none() -> Self {
        Self::new(|_| Expr::Literal(false))
    }

    /// The predicate tree. Always the same tree for the same specification.
    pub fn to_predicate(&self) -> Predicate<T> {
        (*self.predicate).clone()
    }

    pub fn predicate(&self) -> &Predicate<T> {
        &self.predicate
    }

    pub fn and(&self, other: &Specification<T>) -> Specification<T> {
        self.combine(other, Expr::and)
    }

    pub fn or(&self, other: &Specification<T>) -> Specification<T> {
        self.combine(other, Expr::or)
    }

    /// Negation. Keeps this specification's variable.
    #[allow(clippy::should_implement_trait)]
    pub fn not(&self) -> Specification<T> {
        let negated = self.predicate.body().clone().negate();
        Self::from_predicate(Predicate::from_parts(self.predicate.parameter(), negated))
    }

    fn combine(&self, other: &Specification<T>, join: fn(Expr, Expr) -> Expr) -> Specification<T> {
        let variable = Variable::fresh();
        let (_, left) = unify(&self.predicate, variable).into_parts();
        let (_, right) = unify(&other.predicate, variable).into_parts();
        Self::from_predicate(Predicate::from_parts(variable, join(left, right)))
    }

    /// Evaluate against a single in-memory instance.
    ///
    /// Query paths should hand the tree to a query port instead, so filtering
    /// happens in the store.
    pub fn is_satisfied_by(&self, entity: &T) -> bool
    where
        T: Fields,
    {
        self.predicate.evaluate(entity)
    }

    /// Convert into the native filter of a query port.
    pub fn to_filter<F>(&self, translator: &F) -> Result<F::Filter, F::Error>
    where
        F: FilterTranslator<T>,
    {
        translator.translate(&self.predicate)
    }
}

impl<T> Clone for Specification<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<T> core::fmt::Debug for Specification<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Specification").field(&*self.predicate).finish()
    }
}

impl<T> core::fmt::Display for Specification<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(self.predicate.body(), f)
    }
}

/// Translates predicate trees into a storage backend's filter language.
///
/// Implemented by storage adapters; this is the explicit boundary conversion
/// used by [`Specification::to_filter`].
pub trait FilterTranslator<T> {
    type Filter;
    type Error;

    fn translate(&self, predicate: &Predicate<T>) -> Result<Self::Filter, Self::Error>;
}
