//! PostgreSQL-backed [`ContractStore`].
//!
//! Each record is stored as a JSONB document alongside the handful of
//! projected columns the read API filters and sorts on.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bidscope_core::{ContractRecord, StoredContract};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::store::{
    BulkWriteOutcome, ContractFilter, ContractPage, ContractQuery, ContractStore, WriteFailure,
};

const UPSERT_SQL: &str = r#"
    INSERT INTO contracts (
        source, natural_key, title, description, posted_date, naics_code,
        set_aside, type_of_set_aside, award_amount, state_code, doc
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (source, natural_key) DO UPDATE
       SET title = EXCLUDED.title,
           description = EXCLUDED.description,
           posted_date = EXCLUDED.posted_date,
           naics_code = EXCLUDED.naics_code,
           set_aside = EXCLUDED.set_aside,
           type_of_set_aside = EXCLUDED.type_of_set_aside,
           award_amount = EXCLUDED.award_amount,
           state_code = EXCLUDED.state_code,
           doc = EXCLUDED.doc,
           updated_at = NOW()
     WHERE contracts.doc IS DISTINCT FROM EXCLUDED.doc
    RETURNING (xmax = 0) AS inserted
"#;

#[derive(Debug, Clone)]
pub struct PgContractStore {
    pool: PgPool,
}

impl PgContractStore {
    /// Open the process-wide pool. Fails fast when the database is unreachable.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("connecting to contract store")?;
        info!("connected to contract store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running contract store migrations")?;
        Ok(())
    }
}

enum UpsertResult {
    Inserted,
    Updated,
    Unchanged,
}

async fn upsert_one(conn: &mut PgConnection, record: &ContractRecord) -> anyhow::Result<UpsertResult> {
    let doc = serde_json::to_value(record).context("serializing contract document")?;
    let inserted = sqlx::query_scalar::<_, bool>(UPSERT_SQL)
        .bind(record.source.as_str())
        .bind(&record.natural_key)
        .bind(&record.title)
        .bind(record.description.as_deref())
        .bind(record.posted_date)
        .bind(record.naics_code.as_deref())
        .bind(record.set_aside.as_deref())
        .bind(record.type_of_set_aside.as_deref())
        .bind(record.award.amount.value())
        .bind(record.state_code())
        .bind(Json(doc))
        .fetch_optional(conn)
        .await?;

    Ok(match inserted {
        Some(true) => UpsertResult::Inserted,
        Some(false) => UpsertResult::Updated,
        None => UpsertResult::Unchanged,
    })
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &ContractFilter) {
    if let Some(category) = &filter.category {
        qb.push(" AND naics_code = ").push_bind(category.clone());
    }
    if let Some(min) = filter.value_min {
        qb.push(" AND award_amount >= ").push_bind(min);
    }
    if let Some(set_aside) = &filter.set_aside {
        qb.push(" AND (set_aside = ")
            .push_bind(set_aside.clone())
            .push(" OR type_of_set_aside = ")
            .push_bind(set_aside.clone())
            .push(")");
    }
    if let Some(from) = filter.date_from {
        qb.push(" AND posted_date >= ").push_bind(from);
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", escape_like(search));
        qb.push(" AND (title ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(state) = &filter.state {
        qb.push(" AND state_code = ").push_bind(state.clone());
    }
    if let Some(source) = filter.source {
        qb.push(" AND source = ").push_bind(source.as_str());
    }
}

#[async_trait]
impl ContractStore for PgContractStore {
    async fn bulk_upsert(&self, batch: &[ContractRecord]) -> anyhow::Result<BulkWriteOutcome> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring store connection")?;

        // No surrounding transaction: each statement commits on its own.
        let mut outcome = BulkWriteOutcome::default();
        for (index, record) in batch.iter().enumerate() {
            match upsert_one(&mut conn, record).await {
                Ok(UpsertResult::Inserted) => outcome.upserted += 1,
                Ok(UpsertResult::Updated) => outcome.modified += 1,
                Ok(UpsertResult::Unchanged) => outcome.unchanged += 1,
                Err(err) => outcome.failures.push(WriteFailure {
                    index,
                    key: record.key(),
                    message: format!("{err:#}"),
                }),
            }
        }
        Ok(outcome)
    }

    async fn query(&self, query: &ContractQuery) -> anyhow::Result<ContractPage> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM contracts WHERE TRUE");
        push_filters(&mut count_qb, &query.filter);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .context("counting contracts")?;

        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT doc, created_at, updated_at FROM contracts WHERE TRUE");
        push_filters(&mut qb, &query.filter);
        qb.push(" ORDER BY posted_date DESC NULLS LAST, source, natural_key LIMIT ")
            .push_bind(i64::from(query.page_size))
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("querying contracts")?;

        let mut contracts = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(record): Json<ContractRecord> = row.try_get("doc")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
            contracts.push(StoredContract {
                record,
                created_at,
                updated_at,
            });
        }

        Ok(ContractPage::new(contracts, total.max(0) as u64, query))
    }

    async fn count(&self) -> anyhow::Result<u64> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM contracts")
            .fetch_one(&self.pool)
            .await
            .context("counting contracts")?;
        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidscope_core::SourceTag;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("snow removal"), "snow removal");
    }

    #[test]
    fn filters_render_in_declaration_order() {
        let filter = ContractFilter {
            category: Some("236220".into()),
            set_aside: Some("SBA".into()),
            search: Some("roof".into()),
            source: Some(SourceTag::Federal),
            ..Default::default()
        };
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 FROM contracts WHERE TRUE");
        push_filters(&mut qb, &filter);
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM contracts WHERE TRUE AND naics_code = $1 AND (set_aside = $2 OR type_of_set_aside = $3) \
             AND (title ILIKE $4 OR description ILIKE $5) AND source = $6"
        );
    }
}
