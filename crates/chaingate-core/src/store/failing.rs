//! Store double whose every call fails with one fixed error.

use std::time::Duration;

use async_trait::async_trait;

use super::{SharedStore, StoreError};

pub struct FailingStore {
    error: StoreError,
}

impl FailingStore {
    /// Every call fails as if the backend were unreachable.
    pub fn unreachable() -> Self {
        Self {
            error: StoreError::Unavailable("connection refused".into()),
        }
    }

    /// Every call is answered with a command error.
    pub fn rejecting(message: &str) -> Self {
        Self {
            error: StoreError::Command(message.to_string()),
        }
    }

    fn fail<T>(&self) -> Result<T, StoreError> {
        Err(self.error.clone())
    }
}

#[async_trait]
impl SharedStore for FailingStore {
    fn backend(&self) -> &'static str {
        "failing"
    }
    async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
        self.fail()
    }
    async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
        self.fail()
    }
    async fn set_nx(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
        self.fail()
    }
    async fn delete(&self, _: &str) -> Result<bool, StoreError> {
        self.fail()
    }
    async fn delete_if_equals(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        self.fail()
    }
    async fn incr_with_expiry(&self, _: &str, _: Duration) -> Result<(u64, Duration), StoreError> {
        self.fail()
    }
    async fn list_push_trim(&self, _: &str, _: &str, _: usize) -> Result<(), StoreError> {
        self.fail()
    }
    async fn list_range(&self, _: &str, _: usize) -> Result<Vec<String>, StoreError> {
        self.fail()
    }
    async fn publish(&self, _: &str, _: &str) -> Result<(), StoreError> {
        self.fail()
    }
    async fn ping(&self) -> Result<(), StoreError> {
        self.fail()
    }
}
