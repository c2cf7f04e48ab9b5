//! User Directory Service
//!
//! Read-only user lookups: a single user's detail, the caller's own profile,
//! and a paginated listing for operators.

use crate::database::LedgerStore;
use crate::domain::{AuthenticatedUser, User, UserId};
use crate::error::WalletError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

const MAX_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    fn validate(&self) -> Result<(), WalletError> {
        if self.page == 0 {
            return Err(WalletError::Validation("page must be at least 1".into()));
        }
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(WalletError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        Ok(())
    }

    fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
    pub total_items: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl Pagination {
    fn new(request: PageRequest, total_items: u64) -> Self {
        let total_pages = total_items.div_ceil(u64::from(request.limit));
        Self {
            page: request.page,
            limit: request.limit,
            total_pages,
            total_items,
            has_next: u64::from(request.page) < total_pages,
            has_previous: request.page > 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub results: Vec<T>,
    pub pagination: Pagination,
}

pub struct UserService {
    store: Arc<dyn LedgerStore>,
}

impl UserService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn get_detail(&self, user_id: UserId) -> Result<User, WalletError> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| WalletError::not_found("user", user_id))
    }

    pub async fn profile(&self, user: &AuthenticatedUser) -> Result<User, WalletError> {
        self.get_detail(user.id).await
    }

    #[instrument(skip(self))]
    pub async fn list_users(&self, request: PageRequest) -> Result<Page<User>, WalletError> {
        request.validate()?;
        let (results, total) = self
            .store
            .list_users(request.limit, request.offset())
            .await?;
        Ok(Page {
            results,
            pagination: Pagination::new(request, total),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryLedgerStore;
    use crate::domain::NewUser;

    async fn directory(users: usize) -> (UserService, Vec<User>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let mut created = Vec::new();
        for i in 0..users {
            created.push(
                store
                    .create_user(NewUser {
                        username: format!("player{}", i),
                        email: format!("player{}@example.com", i),
                        name: format!("Player {}", i),
                    })
                    .await
                    .unwrap(),
            );
        }
        (UserService::new(store), created)
    }

    #[tokio::test]
    async fn test_detail_and_missing_user() {
        let (service, users) = directory(1).await;
        let detail = service.get_detail(users[0].id).await.unwrap();
        assert_eq!(detail.username, "player0");

        let me = AuthenticatedUser::new(users[0].id, "player0");
        assert_eq!(service.profile(&me).await.unwrap(), detail);

        assert!(matches!(
            service.get_detail(999).await,
            Err(WalletError::NotFound { entity: "user", .. })
        ));
    }

    #[tokio::test]
    async fn test_listing_reports_pagination() {
        let (service, users) = directory(5).await;

        let first = service
            .list_users(PageRequest { page: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.results[0].id, users[0].id);
        assert_eq!(
            first.pagination,
            Pagination {
                page: 1,
                limit: 2,
                total_pages: 3,
                total_items: 5,
                has_next: true,
                has_previous: false,
            }
        );

        let last = service
            .list_users(PageRequest { page: 3, limit: 2 })
            .await
            .unwrap();
        assert_eq!(last.results, vec![users[4].clone()]);
        assert!(!last.pagination.has_next);
        assert!(last.pagination.has_previous);
    }

    #[tokio::test]
    async fn test_listing_rejects_bad_page_request() {
        let (service, _) = directory(1).await;
        for request in [
            PageRequest { page: 0, limit: 10 },
            PageRequest { page: 1, limit: 0 },
            PageRequest { page: 1, limit: 1001 },
        ] {
            assert!(matches!(
                service.list_users(request).await,
                Err(WalletError::Validation(_))
            ));
        }
    }
}
