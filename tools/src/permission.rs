//! Permission gate
//!
//! A thin policy hook in front of tool execution, not an isolation boundary.
//! Three modes: trusted approves everything, read-only auto-allows declared
//! read-only tools, confirm defers every call to the host's approval callback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::types::{Params, ToolDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Trusted,
    #[default]
    ReadOnly,
    Confirm,
}

/// A call waiting on a permission decision
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub tool: String,
    pub params: Params,
    pub description: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    /// Allow this tool for the rest of the session without asking again
    pub always_allow: bool,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            always_allow: false,
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }
}

/// Host-supplied interactive approval
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalResponse;
}

/// Optional non-interactive approval consulted before the callback
#[async_trait]
pub trait AutoApprover: Send + Sync {
    async fn auto_approve(&self, request: &ApprovalRequest) -> bool;
}

pub struct PermissionGate {
    mode: Mutex<PermissionMode>,
    callback: Option<Arc<dyn ApprovalCallback>>,
    auto_approver: Option<Arc<dyn AutoApprover>>,
    session_allowed: Mutex<HashSet<String>>,
}

impl PermissionGate {
    pub fn new(mode: PermissionMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            callback: None,
            auto_approver: None,
            session_allowed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn ApprovalCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_auto_approver(mut self, approver: Arc<dyn AutoApprover>) -> Self {
        self.auto_approver = Some(approver);
        self
    }

    pub fn set_callback(&mut self, callback: Arc<dyn ApprovalCallback>) {
        self.callback = Some(callback);
    }

    pub fn set_auto_approver(&mut self, approver: Arc<dyn AutoApprover>) {
        self.auto_approver = Some(approver);
    }

    pub fn mode(&self) -> PermissionMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    /// Forget every "always allow" grant
    pub fn reset_session(&self) {
        let mut allowed = self.session_allowed.lock().unwrap_or_else(|e| e.into_inner());
        if !allowed.is_empty() {
            info!("Cleared {} session permission grants", allowed.len());
        }
        allowed.clear();
    }

    pub fn is_session_allowed(&self, tool: &str) -> bool {
        self.session_allowed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tool)
    }

    /// Decide whether a call may proceed
    pub async fn check(&self, def: &ToolDefinition, params: &Params) -> bool {
        let mode = self.mode();
        match mode {
            PermissionMode::Trusted => return true,
            PermissionMode::ReadOnly if def.read_only => return true,
            _ => {}
        }

        if self.is_session_allowed(&def.name) {
            return true;
        }

        let request = ApprovalRequest {
            tool: def.name.clone(),
            params: params.clone(),
            description: def.description.clone(),
            read_only: def.read_only,
        };

        if let Some(auto) = &self.auto_approver {
            if auto.auto_approve(&request).await {
                info!(tool = %def.name, "Auto-approved from confidence history");
                return true;
            }
        }

        let Some(callback) = &self.callback else {
            warn!(tool = %def.name, "No approval callback; denying");
            return false;
        };

        let response = callback.request_approval(&request).await;
        if response.approved && response.always_allow {
            self.session_allowed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(def.name.clone());
            info!(tool = %def.name, "Tool allowed for the rest of the session");
        }
        if !response.approved {
            info!(tool = %def.name, "Approval denied");
        }
        response.approved
    }
}
