use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};

use super::EntityRow;
use super::schema::EntitySchema;
use crate::error::{HosterError, HosterResult};

/// Filters applied to a list query. Owner and public flag compose:
/// with both set the query returns rows the owner holds plus rows
/// carrying the flag; with only the flag set (anonymous callers) the
/// flag alone decides.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub owner: Option<String>,
    pub public_flag: Option<&'static str>,
    pub status: Option<String>,
    pub attr_equals: Vec<(String, String)>,
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

/// Sqlite-backed row store. One table per entity, common columns plus
/// a JSON attribute document; list filters on attributes go through
/// `json_extract`.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// Open (and initialize) the database at `path`.
    pub async fn open(path: &Path, schemas: &[EntitySchema]) -> HosterResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !path.exists() {
            tokio::fs::write(path, "").await?;
        }

        let url = format!("sqlite:{}", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await?;

        let db = Self { pool };
        for schema in schemas {
            db.create_table(schema).await?;
        }
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory(schemas: &[EntitySchema]) -> HosterResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        for schema in schemas {
            db.create_table(schema).await?;
        }
        Ok(db)
    }

    async fn create_table(&self, schema: &EntitySchema) -> HosterResult<()> {
        let table = schema.name;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                attributes TEXT NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table} (owner_id)"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table} (status)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, table: &str, row: &EntityRow) -> HosterResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {table} (id, owner_id, status, created_at, updated_at, attributes)
             VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(&row.id)
        .bind(&row.owner_id)
        .bind(&row.status)
        .bind(row.created_at.to_rfc3339())
        .bind(row.updated_at.to_rfc3339())
        .bind(serde_json::to_string(&row.attributes)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update(&self, table: &str, row: &mut EntityRow) -> HosterResult<()> {
        row.updated_at = Utc::now();
        let result = sqlx::query(&format!(
            "UPDATE {table} SET status = ?, updated_at = ?, attributes = ? WHERE id = ?"
        ))
        .bind(&row.status)
        .bind(row.updated_at.to_rfc3339())
        .bind(serde_json::to_string(&row.attributes)?)
        .bind(&row.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(HosterError::NotFound(format!("{table}/{}", row.id)));
        }
        Ok(())
    }

    pub async fn fetch(&self, table: &str, id: &str) -> HosterResult<Option<EntityRow>> {
        let row = sqlx::query(&format!(
            "SELECT id, owner_id, status, created_at, updated_at, attributes
             FROM {table} WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_row).transpose()
    }

    pub async fn remove(&self, table: &str, id: &str) -> HosterResult<()> {
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list(&self, table: &str, filter: &ListFilter) -> HosterResult<Vec<EntityRow>> {
        let mut sql = format!(
            "SELECT id, owner_id, status, created_at, updated_at, attributes FROM {table} WHERE 1=1"
        );
        let mut binds: Vec<String> = Vec::new();

        match (&filter.owner, filter.public_flag) {
            (Some(owner), Some(flag)) => {
                sql.push_str(&format!(
                    " AND (owner_id = ? OR json_extract(attributes, '$.{flag}') IN (1, 'true'))"
                ));
                binds.push(owner.clone());
            }
            (Some(owner), None) => {
                sql.push_str(" AND owner_id = ?");
                binds.push(owner.clone());
            }
            (None, Some(flag)) => {
                sql.push_str(&format!(
                    " AND json_extract(attributes, '$.{flag}') IN (1, 'true')"
                ));
            }
            (None, None) => {}
        }

        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.clone());
        }
        for (attr, value) in &filter.attr_equals {
            sql.push_str(&format!(" AND json_extract(attributes, '$.{attr}') = ?"));
            binds.push(value.clone());
        }
        if let Some(cursor) = &filter.cursor {
            sql.push_str(" AND id > ?");
            binds.push(cursor.clone());
        }

        sql.push_str(" ORDER BY id");
        let limit = filter.limit.unwrap_or(100).min(500);
        sql.push_str(&format!(" LIMIT {limit}"));

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(decode_row).collect()
    }

    /// Count an owner's rows outside the given statuses (quota
    /// checks).
    pub async fn count_active(
        &self,
        table: &str,
        owner: &str,
        excluded_statuses: &[&str],
    ) -> HosterResult<u32> {
        let placeholders = excluded_statuses
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if excluded_statuses.is_empty() {
            format!("SELECT COUNT(*) AS n FROM {table} WHERE owner_id = ?")
        } else {
            format!(
                "SELECT COUNT(*) AS n FROM {table} WHERE owner_id = ? AND status NOT IN ({placeholders})"
            )
        };

        let mut query = sqlx::query(&sql).bind(owner);
        for status in excluded_statuses {
            query = query.bind(*status);
        }
        let row = query.fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Deployment lookup by hostname: exact, case-insensitive match
    /// against any entry of the `domains` attribute.
    pub async fn find_deployment_by_hostname(
        &self,
        hostname: &str,
    ) -> HosterResult<Option<EntityRow>> {
        let row = sqlx::query(
            "SELECT d.id, d.owner_id, d.status, d.created_at, d.updated_at, d.attributes
             FROM deployments d
             WHERE EXISTS (
                 SELECT 1 FROM json_each(d.attributes, '$.domains') je
                 WHERE lower(json_extract(je.value, '$.hostname')) = lower(?)
             )
             AND d.status != 'deleted'
             LIMIT 1",
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode_row).transpose()
    }

    /// Does any row outside the given statuses reference `id` through
    /// `attr`? Used to refuse deletes of referenced rows.
    pub async fn has_reference(
        &self,
        table: &str,
        attr: &str,
        id: &str,
        excluded_statuses: &[&str],
    ) -> HosterResult<bool> {
        let placeholders = excluded_statuses
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT COUNT(*) AS n FROM {table} WHERE json_extract(attributes, '$.{attr}') = ?"
        );
        if !excluded_statuses.is_empty() {
            sql.push_str(&format!(" AND status NOT IN ({placeholders})"));
        }

        let mut query = sqlx::query(&sql).bind(id);
        for status in excluded_statuses {
            query = query.bind(*status);
        }
        let row = query.fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> HosterResult<EntityRow> {
    let attributes_text: String = row.try_get("attributes")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(EntityRow {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        status: row.try_get("status")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        attributes: serde_json::from_str(&attributes_text)?,
    })
}

fn parse_timestamp(raw: &str) -> HosterResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HosterError::Internal(format!("bad timestamp in row: {e}")))
}
