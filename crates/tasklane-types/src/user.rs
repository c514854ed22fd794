use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Claims of a verified external identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub sub: String,
    pub email: String,
    pub sign_in_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub sign_in_name: String,
    pub created_time: DateTime<Utc>,
}

impl User {
    /// Builds a new user record for an identity. Timestamps are kept at
    /// millisecond precision, which is what the store persists.
    pub fn from_identity(identity: &Identity, now: DateTime<Utc>) -> Self {
        let created_time = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        Self {
            id: identity.sub.clone(),
            email: identity.email.clone(),
            sign_in_name: identity.sign_in_name.clone(),
            created_time,
        }
    }

    pub fn to_dto(&self) -> UserDto {
        UserDto {
            id: self.id.clone(),
            email: self.email.clone(),
            sign_in_name: self.sign_in_name.clone(),
            created_time: self.created_time.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserDto {
    pub id: String,
    pub email: String,
    pub sign_in_name: String,
    pub created_time: i64,
}
