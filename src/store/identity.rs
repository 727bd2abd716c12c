//! Row operations for organizations and agents
//!
//! Lookups are read-only and never touch the advisory-lock path.

use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Row};
use uuid::Uuid;

use crate::domain_types::{AgentId, ExternalId, OrganizationId};
use crate::error::CoordinationError;
use crate::models::{Agent, Organization};

const INSERT_ORGANIZATION: &str = r"
INSERT INTO organizations (id, external_id, name)
VALUES ($1, $2, $3)
ON CONFLICT (external_id) DO NOTHING
RETURNING id, external_id, name, created_at;
";

const SELECT_ORGANIZATION_BY_EXTERNAL_ID: &str = r"
SELECT id, external_id, name, created_at
FROM organizations
WHERE external_id = $1;
";

const INSERT_AGENT: &str = r"
INSERT INTO agents (id, external_id, organization_id, name)
VALUES ($1, $2, $3, $4)
RETURNING id, external_id, organization_id, name, created_at;
";

const SELECT_AGENT_BY_EXTERNAL_ID: &str = r"
SELECT id, external_id, organization_id, name, created_at
FROM agents
WHERE external_id = $1;
";

const SELECT_AGENT_BY_ID: &str = r"
SELECT id, external_id, organization_id, name, created_at
FROM agents
WHERE id = $1;
";

fn parse_organization(row: &PgRow) -> Result<Organization, CoordinationError> {
    Ok(Organization {
        id: OrganizationId::new(row.try_get::<Uuid, _>("id")?),
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_agent(row: &PgRow) -> Result<Agent, CoordinationError> {
    Ok(Agent {
        id: AgentId::new(row.try_get::<Uuid, _>("id")?),
        external_id: row.try_get("external_id")?,
        organization_id: OrganizationId::new(row.try_get::<Uuid, _>("organization_id")?),
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Inserts an organization unless its external id is already taken. Returns
/// `None` when an existing row won the conflict.
pub(crate) async fn insert_organization(
    executor: impl PgExecutor<'_>,
    external_id: &ExternalId,
    name: &str,
) -> Result<Option<Organization>, CoordinationError> {
    let row = sqlx::query(INSERT_ORGANIZATION)
        .bind(OrganizationId::generate().into_inner())
        .bind(external_id.as_str())
        .bind(name)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_organization).transpose()
}

pub(crate) async fn fetch_organization_by_external_id(
    executor: impl PgExecutor<'_>,
    external_id: &ExternalId,
) -> Result<Option<Organization>, CoordinationError> {
    let row = sqlx::query(SELECT_ORGANIZATION_BY_EXTERNAL_ID)
        .bind(external_id.as_str())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_organization).transpose()
}

/// Inserts an agent under an organization. A duplicate external id surfaces
/// as [`CoordinationError::Conflict`] through the unique constraint.
pub(crate) async fn insert_agent(
    executor: impl PgExecutor<'_>,
    external_id: &ExternalId,
    organization_id: OrganizationId,
    name: &str,
) -> Result<Agent, CoordinationError> {
    let row = sqlx::query(INSERT_AGENT)
        .bind(AgentId::generate().into_inner())
        .bind(external_id.as_str())
        .bind(organization_id.into_inner())
        .bind(name)
        .fetch_one(executor)
        .await?;
    parse_agent(&row)
}

pub(crate) async fn fetch_agent_by_external_id(
    executor: impl PgExecutor<'_>,
    external_id: &ExternalId,
) -> Result<Option<Agent>, CoordinationError> {
    let row = sqlx::query(SELECT_AGENT_BY_EXTERNAL_ID)
        .bind(external_id.as_str())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_agent).transpose()
}

pub(crate) async fn fetch_agent_by_id(
    executor: impl PgExecutor<'_>,
    agent_id: AgentId,
) -> Result<Option<Agent>, CoordinationError> {
    let row = sqlx::query(SELECT_AGENT_BY_ID)
        .bind(agent_id.into_inner())
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(parse_agent).transpose()
}
