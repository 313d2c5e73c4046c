//! PostgreSQL Metadata Store Adapter
//!
//! Production `MetadataStore` implementation over a pooled PostgreSQL
//! connection, with embedded versioned migrations applied at startup.

use std::str::FromStr;

use async_trait::async_trait;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::ports::{
    MetadataStore, ResourceRecord, StorageMode, StorageUrl, TemplateMetadata,
};
use crate::error::{Error, Result};

/// Embedded migrations compiled into the binary.
struct Migration {
    version: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial templates and resources tables",
        sql: r"
            CREATE TABLE IF NOT EXISTS templates (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                storage_url TEXT NOT NULL,
                storage_mode TEXT NOT NULL,
                element_count BIGINT NOT NULL,
                resource_urls JSONB NOT NULL DEFAULT '[]',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (owner_id, project_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_templates_owner ON templates (owner_id);

            CREATE TABLE IF NOT EXISTS resources (
                hash TEXT PRIMARY KEY,
                resource_id UUID NOT NULL,
                original_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size BIGINT NOT NULL,
                storage_url TEXT NOT NULL,
                storage_mode TEXT NOT NULL,
                reference_count BIGINT NOT NULL,
                first_seen TIMESTAMPTZ NOT NULL,
                last_accessed TIMESTAMPTZ NOT NULL
            );
        ",
    },
    Migration {
        version: 2,
        description: "Index resources by reference count for GC sweeps",
        sql: r"
            CREATE INDEX IF NOT EXISTS idx_resources_refcount
                ON resources (reference_count) WHERE reference_count = 0;
        ",
    },
];

/// PostgreSQL-backed metadata store.
pub struct PostgresMetadataStore {
    pool: Pool,
}

fn db_error(op: &str, e: impl std::fmt::Display) -> Error {
    Error::DatabaseUnavailable(format!("{}: {}", op, e))
}

impl PostgresMetadataStore {
    /// Connect, build the pool and apply pending migrations.
    pub async fn new(connection_url: &str, pool_max_size: usize) -> Result<Self> {
        let pg_config = connection_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Config(format!("invalid postgres url: {}", e)))?;

        let mut cfg = PoolConfig::new();
        cfg.host = pg_config.get_hosts().first().map(host_to_string);
        cfg.port = pg_config.get_ports().first().copied();
        cfg.user = pg_config.get_user().map(String::from);
        cfg.password = pg_config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string());
        cfg.dbname = pg_config.get_dbname().map(String::from);
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_max_size,
            ..Default::default()
        });
        cfg.manager = Some(deadpool_postgres::ManagerConfig {
            recycling_method: deadpool_postgres::RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::Config(format!("failed to create postgres pool: {}", e)))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
            )
            .await
            .map_err(|e| db_error("migrate", e))?;

        for migration in MIGRATIONS {
            let applied = client
                .query_opt(
                    "SELECT version FROM schema_migrations WHERE version = $1",
                    &[&migration.version],
                )
                .await
                .map_err(|e| db_error("migrate", e))?;
            if applied.is_some() {
                continue;
            }

            debug!(
                version = migration.version,
                description = migration.description,
                "Applying migration"
            );
            client
                .batch_execute(migration.sql)
                .await
                .map_err(|e| db_error("migrate", e))?;
            client
                .execute(
                    "INSERT INTO schema_migrations (version) VALUES ($1)",
                    &[&migration.version],
                )
                .await
                .map_err(|e| db_error("migrate", e))?;
        }

        info!("Metadata store migrations up to date");
        Ok(())
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::DatabaseUnavailable(e.to_string()))
    }

    fn template_from_row(row: &Row) -> Result<TemplateMetadata> {
        let storage_url: String = row.get("storage_url");
        let storage_mode: String = row.get("storage_mode");
        let resource_urls: serde_json::Value = row.get("resource_urls");
        let version: i32 = row.get("version");
        let element_count: i64 = row.get("element_count");

        Ok(TemplateMetadata {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            project_id: row.get("project_id"),
            name: row.get("name"),
            version: version as u32,
            storage_url: StorageUrl::parse(&storage_url)?,
            storage_mode: StorageMode::from_str(&storage_mode)?,
            element_count: element_count as usize,
            resource_urls: serde_json::from_value(resource_urls)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn resource_from_row(row: &Row) -> Result<ResourceRecord> {
        let storage_url: String = row.get("storage_url");
        let storage_mode: String = row.get("storage_mode");
        let size: i64 = row.get("size");
        let reference_count: i64 = row.get("reference_count");

        Ok(ResourceRecord {
            hash: row.get("hash"),
            resource_id: row.get("resource_id"),
            original_name: row.get("original_name"),
            mime_type: row.get("mime_type"),
            size: size as u64,
            storage_url: StorageUrl::parse(&storage_url)?,
            storage_mode: StorageMode::from_str(&storage_mode)?,
            reference_count: reference_count.max(0) as u64,
            first_seen: row.get("first_seen"),
            last_accessed: row.get("last_accessed"),
        })
    }
}

fn host_to_string(host: &tokio_postgres::config::Host) -> String {
    match host {
        tokio_postgres::config::Host::Tcp(s) => s.clone(),
        #[cfg(unix)]
        tokio_postgres::config::Host::Unix(p) => p.to_string_lossy().to_string(),
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn ping(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| db_error("ping", e))?;
        Ok(())
    }

    async fn upsert_template(&self, template: &TemplateMetadata) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO templates
                    (id, owner_id, project_id, name, version, storage_url, storage_mode,
                     element_count, resource_urls, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (id) DO UPDATE SET
                    version = EXCLUDED.version,
                    storage_url = EXCLUDED.storage_url,
                    storage_mode = EXCLUDED.storage_mode,
                    element_count = EXCLUDED.element_count,
                    resource_urls = EXCLUDED.resource_urls,
                    updated_at = EXCLUDED.updated_at",
                &[
                    &template.id,
                    &template.owner_id,
                    &template.project_id,
                    &template.name,
                    &(template.version as i32),
                    &template.storage_url.to_string(),
                    &template.storage_mode.to_string(),
                    &(template.element_count as i64),
                    &serde_json::to_value(&template.resource_urls)?,
                    &template.created_at,
                    &template.updated_at,
                ],
            )
            .await
            .map_err(|e| db_error("upsert_template", e))?;
        Ok(())
    }

    async fn get_template(&self, template_id: Uuid) -> Result<Option<TemplateMetadata>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM templates WHERE id = $1", &[&template_id])
            .await
            .map_err(|e| db_error("get_template", e))?;
        row.as_ref().map(Self::template_from_row).transpose()
    }

    async fn find_template(
        &self,
        owner_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Option<TemplateMetadata>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT * FROM templates WHERE owner_id = $1 AND project_id = $2 AND name = $3",
                &[&owner_id, &project_id, &name],
            )
            .await
            .map_err(|e| db_error("find_template", e))?;
        row.as_ref().map(Self::template_from_row).transpose()
    }

    async fn list_templates(&self, owner_id: &str) -> Result<Vec<TemplateMetadata>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM templates WHERE owner_id = $1 ORDER BY updated_at DESC",
                &[&owner_id],
            )
            .await
            .map_err(|e| db_error("list_templates", e))?;
        rows.iter().map(Self::template_from_row).collect()
    }

    async fn delete_template(&self, template_id: Uuid) -> Result<()> {
        let client = self.client().await?;
        client
            .execute("DELETE FROM templates WHERE id = $1", &[&template_id])
            .await
            .map_err(|e| db_error("delete_template", e))?;
        Ok(())
    }

    async fn find_resource_by_hash(&self, hash: &str) -> Result<Option<ResourceRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT * FROM resources WHERE hash = $1", &[&hash])
            .await
            .map_err(|e| db_error("find_resource_by_hash", e))?;
        row.as_ref().map(Self::resource_from_row).transpose()
    }

    async fn create_resource(&self, record: &ResourceRecord) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO resources
                    (hash, resource_id, original_name, mime_type, size, storage_url,
                     storage_mode, reference_count, first_seen, last_accessed)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (hash) DO NOTHING",
                &[
                    &record.hash,
                    &record.resource_id,
                    &record.original_name,
                    &record.mime_type,
                    &(record.size as i64),
                    &record.storage_url.to_string(),
                    &record.storage_mode.to_string(),
                    &(record.reference_count as i64),
                    &record.first_seen,
                    &record.last_accessed,
                ],
            )
            .await
            .map_err(|e| db_error("create_resource", e))?;
        Ok(())
    }

    async fn update_resource_url(
        &self,
        hash: &str,
        url: &StorageUrl,
        mode: StorageMode,
    ) -> Result<()> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE resources SET storage_url = $2, storage_mode = $3 WHERE hash = $1",
                &[&hash, &url.to_string(), &mode.to_string()],
            )
            .await
            .map_err(|e| db_error("update_resource_url", e))?;
        if updated == 0 {
            return Err(Error::ResourceNotFound(hash.to_string()));
        }
        Ok(())
    }

    async fn increment_resource_refs(&self, hash: &str) -> Result<u64> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "UPDATE resources
                 SET reference_count = reference_count + 1, last_accessed = now()
                 WHERE hash = $1
                 RETURNING reference_count",
                &[&hash],
            )
            .await
            .map_err(|e| db_error("increment_resource_refs", e))?;
        match row {
            Some(row) => {
                let count: i64 = row.get(0);
                Ok(count.max(0) as u64)
            }
            None => Err(Error::ResourceNotFound(hash.to_string())),
        }
    }

    async fn decrement_resource_refs(&self, hash: &str) -> Result<u64> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "UPDATE resources
                 SET reference_count = GREATEST(reference_count - 1, 0)
                 WHERE hash = $1
                 RETURNING reference_count",
                &[&hash],
            )
            .await
            .map_err(|e| db_error("decrement_resource_refs", e))?;
        match row {
            Some(row) => {
                let count: i64 = row.get(0);
                Ok(count.max(0) as u64)
            }
            None => Err(Error::ResourceNotFound(hash.to_string())),
        }
    }

    async fn delete_resource(&self, hash: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute("DELETE FROM resources WHERE hash = $1", &[&hash])
            .await
            .map_err(|e| db_error("delete_resource", e))?;
        Ok(())
    }
}
