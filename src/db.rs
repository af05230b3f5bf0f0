use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::models::{Part, Quotation};
use crate::store::QuotationStore;

const QUOTATION_COLUMNS: &str = "id, text, addressee, part, number, section_title";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let options = SqliteConnectOptions::from_str(&config.sqlite_dsn())?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory database, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quotations (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL CHECK (length(trim(text)) > 0),
                addressee TEXT NOT NULL,
                part TEXT NOT NULL,
                number INTEGER NOT NULL CHECK (number > 0),
                section_title TEXT
            );

            CREATE INDEX IF NOT EXISTS quotations_natural_order
                ON quotations (part, number, id);

            CREATE TABLE IF NOT EXISTS rate_limits (
                identity TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                hits INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (identity, window_start)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_quotations(&self, quotations: &[Quotation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for quotation in quotations {
            upsert_quotation_tx(&mut tx, quotation).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Swaps the whole table for `quotations`. A failed row rolls back the
    /// delete as well.
    pub async fn replace_quotations(&self, quotations: &[Quotation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM quotations")
            .execute(&mut *tx)
            .await?;
        for quotation in quotations {
            upsert_quotation_tx(&mut tx, quotation).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Bumps the counter for `identity` in the window starting at
    /// `window_start` and returns the count after the increment.
    pub async fn increment_rate_counter(
        &self,
        identity: &str,
        window_start: i64,
        expires_at: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO rate_limits (identity, window_start, hits, expires_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(identity, window_start) DO UPDATE SET
                hits = hits + 1
            RETURNING hits
            "#,
        )
        .bind(identity)
        .bind(window_start)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>("hits"))
    }

    pub async fn prune_rate_counters(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QuotationStore for Database {
    async fn find_containing(
        &self,
        fragment: &str,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {QUOTATION_COLUMNS} FROM quotations WHERE "));
        qb.push("lower(text) LIKE ");
        qb.push_bind(like_pattern(fragment));
        qb.push(" ESCAPE '\\'");
        push_exclusion(&mut qb, exclude);
        push_order_and_limit(&mut qb, limit);

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_quotation).collect())
    }

    async fn search_terms(
        &self,
        terms: &[String],
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>> {
        if terms.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {QUOTATION_COLUMNS} FROM quotations WHERE ("));

        let mut first = true;
        for term in terms {
            for column in ["text", "addressee", "coalesce(section_title, '')"] {
                if !first {
                    qb.push(" OR ");
                }
                first = false;
                qb.push(format!("lower({column}) LIKE "));
                qb.push_bind(like_pattern(term));
                qb.push(" ESCAPE '\\'");
            }
        }
        qb.push(")");

        push_exclusion(&mut qb, exclude);
        push_order_and_limit(&mut qb, limit);

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_quotation).collect())
    }

    async fn list_eligible(
        &self,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Quotation>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {QUOTATION_COLUMNS} FROM quotations WHERE 1 = 1"));
        push_exclusion(&mut qb, exclude);
        push_order_and_limit(&mut qb, limit);

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_quotation).collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Quotation>> {
        let row = sqlx::query(&format!(
            "SELECT {QUOTATION_COLUMNS} FROM quotations WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_quotation))
    }

    async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM quotations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("total"))
    }
}

fn push_exclusion(qb: &mut QueryBuilder<'_, Sqlite>, exclude: &HashSet<String>) {
    if exclude.is_empty() {
        return;
    }

    let mut ids: Vec<&String> = exclude.iter().collect();
    ids.sort();

    qb.push(" AND id NOT IN (");
    let mut separated = qb.separated(",");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
}

fn push_order_and_limit(qb: &mut QueryBuilder<'_, Sqlite>, limit: usize) {
    qb.push(" ORDER BY part ASC, number ASC, id ASC LIMIT ");
    qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
}

/// ASCII-lowercased `%fragment%` with LIKE wildcards escaped. SQLite's
/// `lower()` only folds ASCII, so the pattern must not fold more.
fn like_pattern(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len() + 2);
    escaped.push('%');
    for ch in fragment.to_ascii_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

async fn upsert_quotation_tx(tx: &mut Transaction<'_, Sqlite>, quotation: &Quotation) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO quotations (id, text, addressee, part, number, section_title)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            text = excluded.text,
            addressee = excluded.addressee,
            part = excluded.part,
            number = excluded.number,
            section_title = excluded.section_title
        "#,
    )
    .bind(&quotation.id)
    .bind(&quotation.text)
    .bind(&quotation.addressee)
    .bind(quotation.part.as_str())
    .bind(quotation.number)
    .bind(&quotation.section_title)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_quotation(row: SqliteRow) -> Quotation {
    Quotation {
        id: row.get("id"),
        text: row.get("text"),
        addressee: row.get("addressee"),
        part: Part::from_db(&row.get::<String, _>("part")),
        number: row.get("number"),
        section_title: row.get("section_title"),
    }
}
