//! Company use cases.
//!
//! Each use case runs in its own unit of work and follows the same shape:
//! begin, load and decide, stage, commit; roll back whatever is still open.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use bizhub_companies::{Company, User, UserRole, specs};
use bizhub_core::{Entity, EntityId, VersionToken};
use bizhub_events::EventDispatcher;
use bizhub_infra::UnitOfWork;
use bizhub_infra::store::{OutboxStore, TransactionalStore};

use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCompany {
    pub name: String,
    pub tax_id: String,
    pub admin_email: String,
    pub admin_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredCompany {
    pub company_id: EntityId,
    pub admin_id: EntityId,
}

/// Company use cases over a store and an event dispatcher.
pub struct CompanyService<S> {
    store: S,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl<S> CompanyService<S>
where
    S: TransactionalStore + OutboxStore + Clone + 'static,
{
    pub fn new(store: S, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    fn unit_of_work(&self) -> UnitOfWork<S> {
        UnitOfWork::new(self.store.clone(), Arc::clone(&self.dispatcher))
    }

    /// Register a company together with its first admin user.
    ///
    /// Fails with `Conflict` if a live company already uses the tax id or a user
    /// already uses the admin email. The admin gets a welcome email once the
    /// registration is committed.
    #[instrument(skip(self, cmd, ctx), fields(name = %cmd.name), err)]
    pub async fn register_company(
        &self,
        cmd: RegisterCompany,
        ctx: &CancellationToken,
    ) -> Result<RegisteredCompany, AppError> {
        let uow = self.unit_of_work();
        uow.begin_transaction(ctx).await?;

        let result = async {
            let companies = uow.repository::<Company>();
            let users = uow.repository::<User>();
            let now = Utc::now();

            let company = Company::register(EntityId::new(), &cmd.name, &cmd.tax_id, now)?;
            if companies.exists(&specs::has_tax_id(company.tax_id()), ctx).await? {
                return Err(AppError::Conflict(format!(
                    "a company with tax id {} already exists",
                    company.tax_id()
                )));
            }

            let mut admin = User::register(
                EntityId::new(),
                company.id(),
                &cmd.admin_email,
                &cmd.admin_name,
                UserRole::Admin,
                now,
            )?;
            if users.exists(&specs::has_email(admin.email()), ctx).await? {
                return Err(AppError::Conflict(format!(
                    "a user with email {} already exists",
                    admin.email()
                )));
            }
            admin.request_welcome_email(now)?;

            let registered = RegisteredCompany {
                company_id: company.id(),
                admin_id: admin.id(),
            };
            companies.create(company).await?;
            users.create(admin).await?;
            uow.commit(ctx).await?;
            Ok(registered)
        }
        .await;

        close(&uow, ctx).await;
        if let Ok(registered) = &result {
            info!(company_id = %registered.company_id, "company registered");
        }
        result
    }

    /// Rename a company.
    ///
    /// With `expected_version`, the rename only applies if the company is still
    /// at that version; either way a concurrent write surfaces as `Conflict`.
    /// Returns the version token the store assigned to the renamed company.
    #[instrument(skip(self, ctx), err)]
    pub async fn rename_company(
        &self,
        company_id: EntityId,
        name: &str,
        expected_version: Option<VersionToken>,
        ctx: &CancellationToken,
    ) -> Result<VersionToken, AppError> {
        let uow = self.unit_of_work();
        uow.begin_transaction(ctx).await?;

        let result = async {
            let companies = uow.repository::<Company>();
            let mut company = load(&uow, company_id, ctx).await?;
            if let Some(expected) = expected_version {
                if company.version() != expected {
                    return Err(AppError::Conflict(format!(
                        "company {company_id} is at {}, expected {expected}",
                        company.version()
                    )));
                }
            }

            company.rename(name, Utc::now())?;
            companies.update(company).await?;
            uow.commit(ctx).await?;

            let renamed = load(&uow, company_id, ctx).await?;
            Ok(renamed.version())
        }
        .await;

        close(&uow, ctx).await;
        result
    }

    /// Soft-delete a company. Its users are left untouched.
    #[instrument(skip(self, ctx), err)]
    pub async fn remove_company(&self, company_id: EntityId, ctx: &CancellationToken) -> Result<(), AppError> {
        let uow = self.unit_of_work();
        uow.begin_transaction(ctx).await?;

        let result = async {
            let mut company = load(&uow, company_id, ctx).await?;
            company.remove(Utc::now())?;
            uow.repository::<Company>().delete(company).await?;
            uow.commit(ctx).await?;
            Ok(())
        }
        .await;

        close(&uow, ctx).await;
        result
    }
}

async fn load<S>(uow: &UnitOfWork<S>, company_id: EntityId, ctx: &CancellationToken) -> Result<Company, AppError>
where
    S: TransactionalStore + OutboxStore + 'static,
{
    uow.repository::<Company>()
        .find_one(&specs::with_id(company_id), ctx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("company {company_id}")))
}

/// Roll back a transaction left open by a failed use case.
async fn close<S>(uow: &UnitOfWork<S>, ctx: &CancellationToken)
where
    S: TransactionalStore + OutboxStore + 'static,
{
    if uow.has_active_transaction().await {
        if let Err(err) = uow.rollback(ctx).await {
            warn!(error = %err, "rollback failed");
        }
    }
}
