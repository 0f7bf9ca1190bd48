// # Access Policy
//
// Every client must hold the service discovery capability before any
// registration call succeeds. The check happens once, when the client
// connects (`Responder::connect`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Capabilities a client may present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Register services and records
    ServiceDiscovery,
}

/// What a client presents when connecting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub principal: String,
    pub capabilities: HashSet<Capability>,
}

impl Credentials {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            capabilities: HashSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Decides whether a client may use the responder
pub trait AccessPolicy: Send + Sync {
    /// Return `PermissionDenied` to refuse the client
    fn authorize(&self, credentials: &Credentials) -> Result<()>;
}

/// Grants every client
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _credentials: &Credentials) -> Result<()> {
        Ok(())
    }
}

/// Requires a specific capability
#[derive(Debug, Clone, Copy)]
pub struct RequireCapability(pub Capability);

impl Default for RequireCapability {
    fn default() -> Self {
        Self(Capability::ServiceDiscovery)
    }
}

impl AccessPolicy for RequireCapability {
    fn authorize(&self, credentials: &Credentials) -> Result<()> {
        if credentials.has(self.0) {
            Ok(())
        } else {
            Err(Error::permission_denied(format!(
                "'{}' lacks the {:?} capability",
                credentials.principal, self.0
            )))
        }
    }
}

/// Requires the service discovery capability and a listed principal
#[derive(Debug, Clone, Default)]
pub struct PrincipalAllowList {
    principals: HashSet<String>,
}

impl PrincipalAllowList {
    pub fn new<I, S>(principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principals: principals.into_iter().map(Into::into).collect(),
        }
    }
}

impl AccessPolicy for PrincipalAllowList {
    fn authorize(&self, credentials: &Credentials) -> Result<()> {
        RequireCapability::default().authorize(credentials)?;
        if !self.principals.contains(&credentials.principal) {
            return Err(Error::permission_denied(format!(
                "'{}' is not an allowed principal",
                credentials.principal
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_capability() {
        let policy = RequireCapability::default();
        let anonymous = Credentials::new("guest");
        assert!(matches!(
            policy.authorize(&anonymous),
            Err(Error::PermissionDenied(_))
        ));

        let granted = anonymous.with_capability(Capability::ServiceDiscovery);
        assert!(policy.authorize(&granted).is_ok());
    }

    #[test]
    fn test_allow_list() {
        let policy = PrincipalAllowList::new(["printerd"]);
        let printer = Credentials::new("printerd").with_capability(Capability::ServiceDiscovery);
        let other = Credentials::new("other").with_capability(Capability::ServiceDiscovery);
        assert!(policy.authorize(&printer).is_ok());
        assert!(policy.authorize(&other).is_err());
        assert!(policy.authorize(&Credentials::new("printerd")).is_err());
    }

    #[test]
    fn test_allow_all() {
        assert!(AllowAll.authorize(&Credentials::default()).is_ok());
    }
}
