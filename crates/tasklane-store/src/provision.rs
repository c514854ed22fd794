use std::sync::Arc;

use chrono::Utc;
use tasklane_types::{Identity, User, UserDto};
use thiserror::Error;

use crate::db::Database;
use crate::error::StoreError;
use crate::isolation::IsolationLevel;
use crate::users::{SqliteUserRepository, UserRepository};

/// Weakest isolation under which find-or-create stays race free.
pub const MIN_PROVISION_ISOLATION: IsolationLevel = IsolationLevel::RepeatableRead;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("isolation {requested} is weaker than the required {required}")]
    IsolationTooWeak {
        requested: IsolationLevel,
        required: IsolationLevel,
    },

    #[error("provisioning conflict for user {user_id}")]
    Conflict { user_id: String },

    #[error(transparent)]
    Store(StoreError),
}

impl ProvisionError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProvisionError::Conflict { .. })
    }
}

/// Transactional find-or-create of the user record behind an identity.
#[derive(Clone)]
pub struct Provisioner {
    db: Database,
    users: Arc<dyn UserRepository>,
    isolation: IsolationLevel,
}

impl Provisioner {
    pub fn new(db: Database, isolation: IsolationLevel) -> Result<Self, ProvisionError> {
        Self::with_repository(db, Arc::new(SqliteUserRepository), isolation)
    }

    pub fn with_repository(
        db: Database,
        users: Arc<dyn UserRepository>,
        isolation: IsolationLevel,
    ) -> Result<Self, ProvisionError> {
        if isolation < MIN_PROVISION_ISOLATION {
            return Err(ProvisionError::IsolationTooWeak {
                requested: isolation,
                required: MIN_PROVISION_ISOLATION,
            });
        }
        Ok(Self {
            db,
            users,
            isolation,
        })
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Returns the user for `identity`, creating it on first sight.
    ///
    /// Blocking; runs one transaction on its own connection. A lost race with
    /// a concurrent creator surfaces as `ProvisionError::Conflict`.
    pub fn find_or_create(&self, identity: &Identity) -> Result<UserDto, ProvisionError> {
        let classify = |err: StoreError| match err {
            StoreError::Conflict(detail) => {
                tracing::debug!(user_id = %identity.sub, %detail, "provisioning transaction conflicted");
                ProvisionError::Conflict {
                    user_id: identity.sub.clone(),
                }
            }
            other => ProvisionError::Store(other),
        };

        let mut conn = self.db.connect().map_err(classify)?;
        let tx = Database::begin(&mut conn, self.isolation).map_err(classify)?;

        if let Some(user) = self.users.find_by_id(&tx, &identity.sub).map_err(classify)? {
            tx.commit().map_err(|err| classify(err.into()))?;
            return Ok(user.to_dto());
        }

        let user = User::from_identity(identity, Utc::now());
        self.users.upsert(&tx, &user).map_err(classify)?;
        let stored = self
            .users
            .find_by_id(&tx, &user.id)
            .map_err(classify)?
            .ok_or_else(|| {
                ProvisionError::Store(StoreError::NotFound(format!(
                    "user {} missing after upsert",
                    user.id
                )))
            })?;
        tx.commit().map_err(|err| classify(err.into()))?;
        tracing::info!(user_id = %stored.id, isolation = %self.isolation, "provisioned user");
        Ok(stored.to_dto())
    }

    /// `find_or_create`, rerun once after a conflict.
    pub fn provision_with_retry(&self, identity: &Identity) -> Result<UserDto, ProvisionError> {
        match self.find_or_create(identity) {
            Err(err) if err.is_conflict() => {
                tracing::warn!(user_id = %identity.sub, "retrying provisioning after conflict");
                self.find_or_create(identity)
            }
            other => other,
        }
    }
}
