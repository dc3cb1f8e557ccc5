//! Producer and Administrative Protocol Definitions
//!
//! JSON bodies of the change-notification and admin endpoints.

use super::service::{AppendedTask, RemovalPolicy};
use crate::health::types::Destination;
use crate::task::types::{LogName, TaskGroupId};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_CHANGE: &str = "/sync/change";
pub const ENDPOINT_DESTINATIONS: &str = "/admin/destinations";
pub const ENDPOINT_DEAD: &str = "/admin/dead";
pub const ENDPOINT_GROUPS: &str = "/admin/groups";

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangeResponse {
    pub appended: Vec<AppendedTask>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddDestinationRequest {
    pub destination: Destination,
    pub logs: Vec<LogName>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveDestinationRequest {
    pub removal: RemovalPolicy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminResponse {
    pub ok: bool,
    pub affected: usize,
    pub error: Option<String>,
}

impl AdminResponse {
    pub fn ok(affected: usize) -> Self {
        Self {
            ok: true,
            affected,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            ok: false,
            affected: 0,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub code_name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupActionResponse {
    pub group: TaskGroupId,
    pub affected: usize,
    pub error: Option<String>,
}
