//! Request model consumed by the admission pipeline.
//!
//! The pipeline never sees the framework's request type directly; the
//! HTTP layer lowers it into this struct. Identity verification happens
//! upstream, so an authenticated caller arrives with an already-resolved
//! [`AuthContext`] rather than a token.

use std::collections::HashMap;

use super::identity::Role;

/// Pre-resolved authenticated identity attached by the upstream auth
/// collaborator. Never derived from untrusted client input here.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased at the boundary.
    pub headers: HashMap<String, String>,
    pub auth: Option<AuthContext>,
}

impl AdmissionRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            auth: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn with_auth(mut self, user_id: &str, role: Role) -> Self {
        self.auth = Some(AuthContext {
            user_id: user_id.to_string(),
            role,
        });
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
