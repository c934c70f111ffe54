//! Reusable specifications over companies and users.
//!
//! Each function returns a fresh, single-variable specification; combine them
//! with `and`/`or`/`not` at the call site.

use chrono::{DateTime, Utc};

use bizhub_core::{EntityId, Fields, Specification};

use crate::{Company, User};

/// Company whose name equals `name` (exact, after trimming).
pub fn has_name(name: &str) -> Specification<Company> {
    let name = name.trim().to_string();
    Specification::new(move |c| c.field("name").equals(name))
}

/// Company whose name contains `fragment`.
pub fn name_contains(fragment: &str) -> Specification<Company> {
    let fragment = fragment.to_string();
    Specification::new(move |c| c.field("name").contains(fragment))
}

/// Company registered under `tax_id`, in any accepted formatting.
///
/// A malformed tax id can never match a stored company, so it yields
/// [`Specification::none`].
pub fn has_tax_id(tax_id: &str) -> Specification<Company> {
    match Company::normalize_tax_id(tax_id) {
        Ok(digits) => Specification::new(move |c| c.field("tax_id").equals(digits)),
        Err(_) => Specification::none(),
    }
}

/// User whose email equals `email`, case-insensitively.
pub fn has_email(email: &str) -> Specification<User> {
    let email = email.trim().to_lowercase();
    Specification::new(move |u| u.field("email").equals(email))
}

/// User belonging to `company_id`.
pub fn belongs_to(company_id: EntityId) -> Specification<User> {
    Specification::new(move |u| u.field("company_id").equals(company_id))
}

/// The entity with identifier `id`.
pub fn with_id<T: Fields>(id: EntityId) -> Specification<T> {
    Specification::new(move |e| e.field("id").equals(id))
}

/// Entity created at or after `at`.
pub fn created_since<T: Fields>(at: DateTime<Utc>) -> Specification<T> {
    Specification::new(move |e| e.field("created_at").at_least(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserRole;
    use bizhub_core::Entity;
    use chrono::Duration;
    use proptest::prelude::*;

    fn company(name: &str, tax_id: &str) -> Company {
        Company::register(EntityId::new(), name, tax_id, Utc::now()).unwrap()
    }

    #[test]
    fn name_and_tax_id_select_exactly_the_matching_company() {
        let companies = [
            company("Acme", "12345678000190"),
            company("Acme", "99999999000199"),
            company("Globex", "12345678000190"),
        ];
        let spec = has_name("Acme").and(&has_tax_id("12.345.678/0001-90"));

        let matching: Vec<_> = companies.iter().filter(|c| spec.is_satisfied_by(c)).collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id(), companies[0].id());
    }

    #[test]
    fn malformed_tax_id_matches_nothing() {
        let spec = has_tax_id("not-a-number");
        assert!(!spec.is_satisfied_by(&company("Acme", "1")));
    }

    #[test]
    fn email_match_is_case_insensitive() {
        let user = User::register(
            EntityId::new(),
            EntityId::new(),
            "ada@example.com",
            "Ada",
            UserRole::Member,
            Utc::now(),
        )
        .unwrap();
        assert!(has_email("ADA@Example.com").is_satisfied_by(&user));
        assert!(belongs_to(user.company_id()).is_satisfied_by(&user));
        assert!(!belongs_to(EntityId::new()).is_satisfied_by(&user));
    }

    #[test]
    fn created_since_reads_lifecycle_stamp() {
        let acme = company("Acme", "1");
        let created = acme.metadata().created_at();
        assert!(created_since::<Company>(created).is_satisfied_by(&acme));
        assert!(!created_since::<Company>(created + Duration::seconds(1)).is_satisfied_by(&acme));
    }

    #[test]
    fn with_id_matches_only_that_entity() {
        let acme = company("Acme", "1");
        assert!(with_id::<Company>(acme.id()).is_satisfied_by(&acme));
        assert!(!with_id::<Company>(EntityId::new()).is_satisfied_by(&acme));
    }

    #[test]
    fn negated_name_contains() {
        let spec = name_contains("Hold").not();
        assert!(spec.is_satisfied_by(&company("Acme", "1")));
        assert!(!spec.is_satisfied_by(&company("Acme Holdings", "1")));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn tax_id_formatting_never_changes_the_match(
            digits in "[0-9]{1,14}",
            separators in proptest::collection::vec(prop_oneof![Just('.'), Just('-'), Just('/'), Just(' ')], 0..6),
        ) {
            let mut formatted = digits.clone();
            for (i, sep) in separators.iter().enumerate() {
                let at = (i * 3).min(formatted.len());
                formatted.insert(at, *sep);
            }

            let stored = company("Acme", &digits);
            prop_assert!(has_tax_id(&formatted).is_satisfied_by(&stored));
        }
    }
}
