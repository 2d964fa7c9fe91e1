use async_trait::async_trait;
use sqlx::PgPool;

use super::UserLookup;
use crate::models::user::UserRecord;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> anyhow::Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRecord>(
            "SELECT id, email, role, is_active FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

#[async_trait]
impl UserLookup for PgStore {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<UserRecord>> {
        self.get_user(id).await
    }
}
