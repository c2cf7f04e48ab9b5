//! Postgres-backed ledger.
//!
//! Settlement relies on a conditional update: `UPDATE ... WHERE reference = $1
//! AND status = 'PENDING'`. Under READ COMMITTED a concurrent duplicate
//! blocks on the row lock, re-evaluates the predicate after the winner
//! commits, and matches zero rows. Withdrawals use the same shape on the
//! user row: `balance = balance - $2 WHERE balance >= $2`.

use super::{LedgerStore, StoreError};
use crate::config::DatabaseConfig;
use crate::domain::{
    Bank, BankId, Direction, NewBank, NewTransaction, NewUser, PaymentReference,
    SettlementStatus, Transaction, TransactionId, User, UserId,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};

const TRANSACTION_COLUMNS: &str = "id, user_id, bank_id, amount, direction, reference, status, \
     expired_at, created_at, updated_at, deleted_at";
const USER_COLUMNS: &str = "id, username, email, name, balance, created_at, updated_at";
const BANK_COLUMNS: &str =
    "id, user_id, account_name, account_number, bank_code, created_at, updated_at";

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "Database connection pool initialized");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))?;
        Ok(())
    }
}

fn duplicate_or_database(e: sqlx::Error, reference: &PaymentReference) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::DuplicateReference(reference.to_string());
        }
    }
    StoreError::Database(e)
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;
    let reference: String = row.try_get("reference")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        bank_id: row.try_get("bank_id")?,
        amount: row.try_get("amount")?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown direction {}", direction)))?,
        reference: PaymentReference::parse(&reference)
            .map_err(|e| StoreError::Corrupt(format!("reference {}: {}", reference, e)))?,
        status: SettlementStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {}", status)))?,
        expires_at: row.try_get("expired_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        balance: row.try_get("balance")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bank_from_row(row: &PgRow) -> Result<Bank, StoreError> {
    Ok(Bank {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        account_name: row.try_get("account_name")?,
        account_number: row.try_get("account_number")?,
        bank_code: row.try_get("bank_code")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn insert_transaction_sql() -> String {
    format!(
        r#"
        INSERT INTO transactions (user_id, bank_id, amount, direction, reference, status, expired_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    )
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (username, email, name) VALUES ($1, $2, $3) RETURNING {}",
            USER_COLUMNS
        ))
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.name)
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE id = $1 AND deleted_at IS NULL",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users(&self, limit: u32, offset: u64) -> Result<(Vec<User>, u64), StoreError> {
        let page_sql = format!(
            "SELECT {} FROM users WHERE deleted_at IS NULL ORDER BY id LIMIT $1 OFFSET $2",
            USER_COLUMNS
        );
        let page = sqlx::query(&page_sql)
            .bind(i64::from(limit))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool);
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM users WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool);

        let (rows, total) = tokio::try_join!(page, count)?;
        let users = rows.iter().map(user_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((users, u64::try_from(total).unwrap_or(0)))
    }

    async fn create_bank(&self, bank: NewBank) -> Result<Bank, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO banks (user_id, account_name, account_number, bank_code)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            BANK_COLUMNS
        ))
        .bind(bank.user_id)
        .bind(&bank.account_name)
        .bind(&bank.account_number)
        .bind(&bank.bank_code)
        .fetch_one(&self.pool)
        .await?;
        bank_from_row(&row)
    }

    async fn find_bank(&self, id: BankId) -> Result<Option<Bank>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM banks WHERE id = $1 AND deleted_at IS NULL",
            BANK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bank_from_row).transpose()
    }

    async fn find_banks_by_user(&self, user_id: UserId) -> Result<Vec<Bank>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM banks WHERE user_id = $1 AND deleted_at IS NULL ORDER BY id",
            BANK_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bank_from_row).collect()
    }

    async fn claim_reference(&self, reference: &PaymentReference) -> Result<(), StoreError> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO payment_references (reference)
            SELECT $1
            WHERE NOT EXISTS (SELECT 1 FROM transactions WHERE reference = $1)
            ON CONFLICT (reference) DO NOTHING
            "#,
        )
        .bind(reference.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Err(StoreError::DuplicateReference(reference.to_string()));
        }
        Ok(())
    }

    async fn create_transaction(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
        let row = sqlx::query(&insert_transaction_sql())
            .bind(tx.user_id)
            .bind(tx.bank_id)
            .bind(tx.amount)
            .bind(tx.direction.as_str())
            .bind(tx.reference.as_str())
            .bind(tx.status.as_str())
            .bind(tx.expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| duplicate_or_database(e, &tx.reference))?;
        transaction_from_row(&row)
    }

    async fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_transaction_by_reference(
        &self,
        reference: &PaymentReference,
    ) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE reference = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(reference.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn find_transactions_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn settle_if_pending(
        &self,
        reference: &PaymentReference,
        terminal: SettlementStatus,
        credit: Decimal,
    ) -> Result<Option<Transaction>, StoreError> {
        if !terminal.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: SettlementStatus::Pending,
                to: terminal,
            });
        }

        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE transactions
            SET status = $2,
                updated_at = NOW()
            WHERE reference = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(reference.as_str())
        .bind(terminal.as_str())
        .fetch_optional(&mut *db_tx)
        .await?;

        let Some(row) = row else {
            let exists = sqlx::query("SELECT 1 FROM transactions WHERE reference = $1")
                .bind(reference.as_str())
                .fetch_optional(&mut *db_tx)
                .await?
                .is_some();
            db_tx.rollback().await?;
            return if exists {
                Ok(None)
            } else {
                Err(StoreError::MissingRow {
                    entity: "transaction",
                    key: reference.to_string(),
                })
            };
        };
        let settled = transaction_from_row(&row)?;

        if !credit.is_zero() {
            let credited = sqlx::query(
                "UPDATE users SET balance = balance + $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(settled.user_id)
            .bind(credit)
            .execute(&mut *db_tx)
            .await?
            .rows_affected();

            if credited == 0 {
                warn!(user_id = settled.user_id, reference = %reference, "Credit found no user row");
                db_tx.rollback().await?;
                return Err(StoreError::MissingRow {
                    entity: "user",
                    key: settled.user_id.to_string(),
                });
            }
        }

        db_tx.commit().await?;
        Ok(Some(settled))
    }

    async fn record_withdrawal(
        &self,
        tx: NewTransaction,
    ) -> Result<(Transaction, User), StoreError> {
        let mut db_tx = self.pool.begin().await?;

        // The row lock taken here serializes withdrawals of one user.
        let user_row = sqlx::query(&format!(
            r#"
            UPDATE users
            SET balance = balance - $2,
                updated_at = NOW()
            WHERE id = $1 AND balance >= $2
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(tx.user_id)
        .bind(tx.amount)
        .fetch_optional(&mut *db_tx)
        .await?;

        let Some(user_row) = user_row else {
            let available: Option<Decimal> =
                sqlx::query_scalar("SELECT balance FROM users WHERE id = $1")
                    .bind(tx.user_id)
                    .fetch_optional(&mut *db_tx)
                    .await?;
            db_tx.rollback().await?;
            return Err(match available {
                Some(available) => StoreError::InsufficientFunds {
                    available,
                    required: tx.amount,
                },
                None => StoreError::MissingRow {
                    entity: "user",
                    key: tx.user_id.to_string(),
                },
            });
        };
        let user = user_from_row(&user_row)?;

        let row = sqlx::query(&insert_transaction_sql())
            .bind(tx.user_id)
            .bind(tx.bank_id)
            .bind(tx.amount)
            .bind(tx.direction.as_str())
            .bind(tx.reference.as_str())
            .bind(tx.status.as_str())
            .bind(tx.expires_at)
            .fetch_one(&mut *db_tx)
            .await
            .map_err(|e| duplicate_or_database(e, &tx.reference))?;
        let stored = transaction_from_row(&row)?;

        db_tx.commit().await?;
        Ok((stored, user))
    }
}
