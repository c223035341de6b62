//! API models and the admin provider contract shared between
//! `mcproxy_core` and `mcproxy_http_api`.

use serde::{Deserialize, Serialize};

pub mod model;
pub mod provider;

/// Uniform envelope every admin endpoint responds with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "utoipa_schemas", derive(utoipa::ToSchema))]
pub struct ApiResponse<T> {
    pub success: bool,
    pub msg: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            msg: String::new(),
            data: Some(data),
        }
    }

    pub fn ok_none() -> Self {
        Self {
            success: true,
            msg: String::new(),
            data: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: msg.into(),
            data: None,
        }
    }
}
