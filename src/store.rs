use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use sqlx::PgPool;

use crate::clock::{extended_date, format_db_time, parse_db_time};

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub telegram_id: i64,
    /// Gateway payment id, or `REFERRAL_BONUS` for bonus grants
    pub label: String,
    pub operation_type: String,
    pub payment_time: DateTime<Utc>,
    pub amount: String,
    pub email: String,
}

pub const REFERRAL_BONUS_LABEL: &str = "REFERRAL_BONUS";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Referral {
    pub referee_id: String,
    pub bonus_applied: bool,
    pub bonus_date: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ReferralRow {
    referee_id: String,
    bonus_applied: i32,
    bonus_date: Option<String>,
}

/// Relational persistence of subscriptions, payments, trials, referrals
/// and product orders.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn add_subscription(
        &self,
        tg_id: i64,
        email: &str,
        panel: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;

    /// Update expiry (resetting the reminder counters) or insert.
    async fn upsert_subscription(
        &self,
        tg_id: i64,
        email: &str,
        panel: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;

    async fn add_payment(&self, record: &PaymentRecord) -> Result<(), sqlx::Error>;

    async fn payment_recorded(&self, label: &str) -> Result<bool, sqlx::Error>;

    async fn trial_used(&self, tg_id: i64) -> Result<bool, sqlx::Error>;

    /// Also flips a pre-existing unused row.
    async fn mark_trial_used(&self, tg_id: i64) -> Result<(), sqlx::Error>;

    async fn referrals(&self, referrer_id: i64) -> Result<Vec<Referral>, sqlx::Error>;

    /// Returns false when the pair is missing or its bonus was already applied.
    async fn mark_bonus_applied(
        &self,
        referrer_id: i64,
        referee_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error>;

    /// Extend an existing `(login, product)` order or create one; returns the new expiry.
    async fn upsert_product(
        &self,
        tg_id: i64,
        product: &str,
        login: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, sqlx::Error>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    parse_db_time(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn add_subscription(
        &self,
        tg_id: i64,
        email: &str,
        panel: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (tg_id, email, panel, expiry_date, warn, ends) VALUES ($1, $2, $3, $4, 0, 0)",
        )
        .bind(tg_id.to_string())
        .bind(email)
        .bind(panel)
        .bind(format_db_time(expiry))
        .execute(&self.pool)
        .await?;
        info!("Subscription added: {}", email);
        Ok(())
    }

    async fn upsert_subscription(
        &self,
        tg_id: i64,
        email: &str,
        panel: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE users SET expiry_date = $1, warn = 0, ends = 0 WHERE email = $2",
        )
        .bind(format_db_time(expiry))
        .bind(email)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            sqlx::query(
                "INSERT INTO users (tg_id, email, panel, expiry_date, warn, ends) VALUES ($1, $2, $3, $4, 0, 0)",
            )
            .bind(tg_id.to_string())
            .bind(email)
            .bind(panel)
            .bind(format_db_time(expiry))
            .execute(&mut *tx)
            .await?;
            info!("Subscription created during renewal: {}", email);
        } else {
            info!("Subscription updated: {}", email);
        }

        tx.commit().await
    }

    async fn add_payment(&self, record: &PaymentRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO payments (telegram_id, label, operation_type, payment_time, amount, email) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.telegram_id.to_string())
        .bind(&record.label)
        .bind(&record.operation_type)
        .bind(format_db_time(record.payment_time))
        .bind(&record.amount)
        .bind(&record.email)
        .execute(&self.pool)
        .await?;
        info!("Payment recorded: {} ({})", record.label, record.email);
        Ok(())
    }

    async fn payment_recorded(&self, label: &str) -> Result<bool, sqlx::Error> {
        let found: Option<i32> = sqlx::query_scalar("SELECT 1 FROM payments WHERE label = $1 LIMIT 1")
            .bind(label)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn trial_used(&self, tg_id: i64) -> Result<bool, sqlx::Error> {
        let status: Option<i32> = sqlx::query_scalar("SELECT status FROM trials WHERE tg_id = $1")
            .bind(tg_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(status == Some(1))
    }

    async fn mark_trial_used(&self, tg_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO trials (tg_id, status) VALUES ($1, 1) \
             ON CONFLICT (tg_id) DO UPDATE SET status = 1",
        )
        .bind(tg_id.to_string())
        .execute(&self.pool)
        .await?;
        info!("Trial marked used: tg_id={}", tg_id);
        Ok(())
    }

    async fn referrals(&self, referrer_id: i64) -> Result<Vec<Referral>, sqlx::Error> {
        let rows = sqlx::query_as::<_, ReferralRow>(
            "SELECT referee_id, bonus_applied, bonus_date FROM referrals WHERE referrer_id = $1",
        )
        .bind(referrer_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Referral {
                referee_id: row.referee_id,
                bonus_applied: row.bonus_applied != 0,
                bonus_date: row.bonus_date,
            })
            .collect())
    }

    async fn mark_bonus_applied(
        &self,
        referrer_id: i64,
        referee_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let changed = sqlx::query(
            "UPDATE referrals SET bonus_applied = 1, bonus_date = $1 \
             WHERE referrer_id = $2 AND referee_id = $3 AND bonus_applied = 0",
        )
        .bind(format_db_time(at))
        .bind(referrer_id.to_string())
        .bind(referee_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        info!(
            "Referral bonus marked: referrer_id={}, referee_id={}, changed={}",
            referrer_id, referee_id, changed
        );
        Ok(changed == 1)
    }

    async fn upsert_product(
        &self,
        tg_id: i64,
        product: &str,
        login: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT expiry_date FROM products WHERE login = $1 AND product = $2 FOR UPDATE",
        )
        .bind(login)
        .bind(product)
        .fetch_optional(&mut *tx)
        .await?;

        let expiry = match existing {
            Some(raw) => {
                let expiry = extended_date(decode_time(&raw)?, now, days);
                sqlx::query("UPDATE products SET expiry_date = $1 WHERE login = $2 AND product = $3")
                    .bind(format_db_time(expiry))
                    .bind(login)
                    .bind(product)
                    .execute(&mut *tx)
                    .await?;
                info!("Product {} extended for {}", product, login);
                expiry
            }
            None => {
                let expiry = now + crate::clock::days(days);
                sqlx::query(
                    "INSERT INTO products (tg_id, product, login, expiry_date) VALUES ($1, $2, $3, $4)",
                )
                .bind(tg_id.to_string())
                .bind(product)
                .bind(login)
                .bind(format_db_time(expiry))
                .execute(&mut *tx)
                .await?;
                info!("Product {} added for {}", product, login);
                expiry
            }
        };

        tx.commit().await?;
        Ok(expiry)
    }
}
