use super::{LedgerStore, StoreError};
use crate::domain::{
    Bank, BankId, NewBank, NewTransaction, NewUser, PaymentReference, SettlementStatus,
    Transaction, TransactionId, User, UserId,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    banks: HashMap<BankId, Bank>,
    transactions: HashMap<TransactionId, Transaction>,
    by_reference: HashMap<String, TransactionId>,
    claimed_references: HashSet<String>,
    next_user_id: UserId,
    next_bank_id: BankId,
    next_transaction_id: TransactionId,
}

/// Ledger kept in process memory.
///
/// All tables sit behind one `Mutex`, so each trait method, including the
/// settle and withdrawal primitives, is a single atomic step.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    tables: Arc<Mutex<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrites a user's balance. Seeding helper for tests and local runs.
    pub async fn set_balance(&self, user_id: UserId, balance: Decimal) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let user = tables.users.get_mut(&user_id).ok_or_else(|| missing("user", user_id))?;
        user.balance = balance;
        user.updated_at = Utc::now();
        Ok(())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

fn missing(entity: &'static str, key: impl ToString) -> StoreError {
    StoreError::MissingRow {
        entity,
        key: key.to_string(),
    }
}

fn insert_transaction(tables: &mut Tables, new: NewTransaction) -> Result<Transaction, StoreError> {
    if tables.by_reference.contains_key(new.reference.as_str()) {
        return Err(StoreError::DuplicateReference(new.reference.to_string()));
    }
    if !tables.users.contains_key(&new.user_id) {
        return Err(missing("user", new.user_id));
    }

    tables.next_transaction_id += 1;
    let now = Utc::now();
    let tx = Transaction {
        id: tables.next_transaction_id,
        user_id: new.user_id,
        bank_id: new.bank_id,
        amount: new.amount,
        direction: new.direction,
        reference: new.reference,
        status: new.status,
        expires_at: new.expires_at,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    tables
        .by_reference
        .insert(tx.reference.as_str().to_string(), tx.id);
    tables.transactions.insert(tx.id, tx.clone());
    Ok(tx)
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        tables.next_user_id += 1;
        let now = Utc::now();
        let user = User {
            id: tables.next_user_id,
            username: user.username,
            email: user.email,
            name: user.name,
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.check_available()?;
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn list_users(&self, limit: u32, offset: u64) -> Result<(Vec<User>, u64), StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut users: Vec<&User> = tables.users.values().collect();
        users.sort_by_key(|u| u.id);
        let total = users.len() as u64;
        let page = users
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn create_bank(&self, bank: NewBank) -> Result<Bank, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&bank.user_id) {
            return Err(missing("user", bank.user_id));
        }
        tables.next_bank_id += 1;
        let now = Utc::now();
        let bank = Bank {
            id: tables.next_bank_id,
            user_id: bank.user_id,
            account_name: bank.account_name,
            account_number: bank.account_number,
            bank_code: bank.bank_code,
            created_at: now,
            updated_at: now,
        };
        tables.banks.insert(bank.id, bank.clone());
        Ok(bank)
    }

    async fn find_bank(&self, id: BankId) -> Result<Option<Bank>, StoreError> {
        self.check_available()?;
        Ok(self.tables.lock().await.banks.get(&id).cloned())
    }

    async fn find_banks_by_user(&self, user_id: UserId) -> Result<Vec<Bank>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut banks: Vec<Bank> = tables
            .banks
            .values()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect();
        banks.sort_by_key(|b| b.id);
        Ok(banks)
    }

    async fn claim_reference(&self, reference: &PaymentReference) -> Result<(), StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let key = reference.as_str();
        if tables.by_reference.contains_key(key) || !tables.claimed_references.insert(key.to_string())
        {
            return Err(StoreError::DuplicateReference(reference.to_string()));
        }
        Ok(())
    }

    async fn create_transaction(&self, tx: NewTransaction) -> Result<Transaction, StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        insert_transaction(&mut tables, tx)
    }

    async fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        self.check_available()?;
        Ok(self.tables.lock().await.transactions.get(&id).cloned())
    }

    async fn find_transaction_by_reference(
        &self,
        reference: &PaymentReference,
    ) -> Result<Option<Transaction>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .by_reference
            .get(reference.as_str())
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn find_transactions_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Transaction>, StoreError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut txs: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(txs)
    }

    async fn settle_if_pending(
        &self,
        reference: &PaymentReference,
        terminal: SettlementStatus,
        credit: Decimal,
    ) -> Result<Option<Transaction>, StoreError> {
        self.check_available()?;
        if !terminal.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: SettlementStatus::Pending,
                to: terminal,
            });
        }

        let mut tables = self.tables.lock().await;
        let id = *tables
            .by_reference
            .get(reference.as_str())
            .ok_or_else(|| missing("transaction", reference))?;
        let (user_id, status) = match tables.transactions.get(&id) {
            Some(tx) => (tx.user_id, tx.status),
            None => return Err(missing("transaction", reference)),
        };
        if !status.can_transition_to(terminal) {
            return Ok(None);
        }
        if !tables.users.contains_key(&user_id) {
            return Err(missing("user", user_id));
        }

        let now = Utc::now();
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.balance += credit;
            user.updated_at = now;
        }
        let tx = tables
            .transactions
            .get_mut(&id)
            .ok_or_else(|| missing("transaction", reference))?;
        tx.status = terminal;
        tx.updated_at = now;
        Ok(Some(tx.clone()))
    }

    async fn record_withdrawal(
        &self,
        tx: NewTransaction,
    ) -> Result<(Transaction, User), StoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let user_id = tx.user_id;
        let amount = tx.amount;
        let available = tables
            .users
            .get(&user_id)
            .map(|u| u.balance)
            .ok_or_else(|| missing("user", user_id))?;
        if available < amount {
            return Err(StoreError::InsufficientFunds {
                available,
                required: amount,
            });
        }
        let stored = insert_transaction(&mut tables, tx)?;

        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| missing("user", user_id))?;
        user.balance -= amount;
        user.updated_at = stored.created_at;
        Ok((stored, user.clone()))
    }
}
