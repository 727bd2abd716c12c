//! Identity registry: organizations and agents
//!
//! Re-registering an organization with the same external id and name returns
//! the existing row; a conflicting name is rejected. Lookups are plain reads
//! and never touch the advisory-lock path.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::domain_types::ExternalId;
use crate::error::{CoordinationError, CoordinationResult};
use crate::models::{Agent, Organization};
use crate::store::{StoreGateway, identity};

/// Parses a caller-supplied external id, reporting which field was malformed
pub(crate) fn parse_external(field: &'static str, raw: &str) -> CoordinationResult<ExternalId> {
    ExternalId::try_new(raw.to_string())
        .map_err(|error| CoordinationError::validation(field, error.to_string()))
}

/// Registry of organizations and agents
pub struct IdentityRegistry {
    store: Arc<StoreGateway>,
}

impl IdentityRegistry {
    pub(crate) fn new(store: Arc<StoreGateway>) -> Self {
        Self { store }
    }

    /// Registers an organization, idempotently on its external id.
    ///
    /// Re-registering with the same name returns the existing row;
    /// re-registering with a different name fails with
    /// [`CoordinationError::Conflict`].
    #[instrument(skip(self, name))]
    pub async fn register_organization(
        &self,
        external_id: &str,
        name: &str,
    ) -> CoordinationResult<Organization> {
        let external_id = parse_external("external_id", external_id)?;
        if name.trim().is_empty() {
            return Err(CoordinationError::validation(
                "name",
                "organization name must not be empty",
            ));
        }

        if let Some(existing) =
            identity::fetch_organization_by_external_id(self.store.pool(), &external_id).await?
        {
            return reconcile_organization(existing, name);
        }
        match identity::insert_organization(self.store.pool(), &external_id, name).await? {
            Some(organization) => {
                info!(%external_id, "organization registered");
                Ok(organization)
            }
            None => {
                // Lost the insert race; reconcile against the winner.
                let existing =
                    identity::fetch_organization_by_external_id(self.store.pool(), &external_id)
                        .await?
                        .ok_or(CoordinationError::Store {
                            source: sqlx::Error::RowNotFound,
                        })?;
                reconcile_organization(existing, name)
            }
        }
    }

    /// Registers an agent under an existing organization.
    ///
    /// Fails with [`CoordinationError::NotFound`] when the organization is
    /// absent and [`CoordinationError::Conflict`] when the agent external id
    /// is already taken.
    #[instrument(skip(self, name))]
    pub async fn register_agent(
        &self,
        external_id: &str,
        org_external_id: &str,
        name: &str,
    ) -> CoordinationResult<Agent> {
        let external_id = parse_external("external_id", external_id)?;
        let org_external_id = parse_external("org_external_id", org_external_id)?;
        if name.trim().is_empty() {
            return Err(CoordinationError::validation(
                "name",
                "agent name must not be empty",
            ));
        }

        let organization =
            identity::fetch_organization_by_external_id(self.store.pool(), &org_external_id)
                .await?
                .ok_or_else(|| {
                    CoordinationError::not_found("organization", org_external_id.to_string())
                })?;
        let agent =
            identity::insert_agent(self.store.pool(), &external_id, organization.id, name).await?;
        info!(%external_id, organization = %org_external_id, "agent registered");
        Ok(agent)
    }

    /// Looks up an organization by external id
    pub async fn get_organization(
        &self,
        external_id: &str,
    ) -> CoordinationResult<Option<Organization>> {
        let external_id = parse_external("external_id", external_id)?;
        identity::fetch_organization_by_external_id(self.store.pool(), &external_id).await
    }

    /// Looks up an agent by external id
    pub async fn get_agent(&self, external_id: &str) -> CoordinationResult<Option<Agent>> {
        let external_id = parse_external("external_id", external_id)?;
        identity::fetch_agent_by_external_id(self.store.pool(), &external_id).await
    }

    /// Resolves an external id to an agent or fails with `NotFound`
    pub(crate) async fn resolve_agent(
        &self,
        field: &'static str,
        raw: &str,
    ) -> CoordinationResult<Agent> {
        let external_id = parse_external(field, raw)?;
        identity::fetch_agent_by_external_id(self.store.pool(), &external_id)
            .await?
            .ok_or_else(|| CoordinationError::not_found("agent", external_id.to_string()))
    }
}

fn reconcile_organization(
    existing: Organization,
    name: &str,
) -> CoordinationResult<Organization> {
    if existing.name == name {
        Ok(existing)
    } else {
        Err(CoordinationError::Conflict {
            reason: format!(
                "organization '{}' is already registered with name '{}'",
                existing.external_id, existing.name
            ),
        })
    }
}
