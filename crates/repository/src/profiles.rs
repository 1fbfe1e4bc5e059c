//! Role lookup for authenticated users.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use model::Role;
use uuid::Uuid;

use crate::{RepositoryError, decode};

#[async_trait]
pub trait ProfilesRepository: Send + Sync {
    /// Role of `user_id`, or `None` if the user has no profile.
    async fn get_role(&self, user_id: Uuid) -> Result<Option<Role>, RepositoryError>;
}

/// PostgreSQL implementation of the ProfilesRepository trait.
pub struct PgProfilesRepository {
    pool: Pool,
}

impl PgProfilesRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfilesRepository for PgProfilesRepository {
    async fn get_role(&self, user_id: Uuid) -> Result<Option<Role>, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client.query_opt("SELECT role FROM profiles WHERE id = $1", &[&user_id]).await?;
        row.map(|r| {
            let role: String = r.get("role");
            decode("profiles.role", &role)
        })
        .transpose()
    }
}
