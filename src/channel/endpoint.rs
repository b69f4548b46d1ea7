//! Primary/secondary management endpoints of one array

use crate::domain::ports::Endpoint;
use serde::{Deserialize, Serialize};

/// Which configured endpoint a channel is using
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Secondary,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRole::Primary => write!(f, "primary"),
            EndpointRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// The endpoints configured for one array
#[derive(Debug, Clone)]
pub struct EndpointSet {
    primary: Endpoint,
    secondary: Option<Endpoint>,
}

impl EndpointSet {
    pub fn new(primary: Endpoint, secondary: Option<Endpoint>) -> Self {
        Self { primary, secondary }
    }

    pub fn get(&self, role: EndpointRole) -> Option<&Endpoint> {
        match role {
            EndpointRole::Primary => Some(&self.primary),
            EndpointRole::Secondary => self.secondary.as_ref(),
        }
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    /// The other endpoint, if one is configured
    pub fn alternate(&self, role: EndpointRole) -> Option<(EndpointRole, &Endpoint)> {
        match role {
            EndpointRole::Primary => self.secondary.as_ref().map(|ep| (EndpointRole::Secondary, ep)),
            EndpointRole::Secondary => Some((EndpointRole::Primary, &self.primary)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Credentials;

    #[test]
    fn test_alternate() {
        let primary = Endpoint::new("10.0.0.1", "admin", Credentials::Password("pw".into()));
        let secondary = Endpoint::new("10.0.0.2", "admin", Credentials::Password("pw".into()));

        let single = EndpointSet::new(primary.clone(), None);
        assert!(single.alternate(EndpointRole::Primary).is_none());
        assert!(single.get(EndpointRole::Secondary).is_none());

        let dual = EndpointSet::new(primary, Some(secondary));
        let (role, ep) = dual.alternate(EndpointRole::Primary).unwrap();
        assert_eq!(role, EndpointRole::Secondary);
        assert_eq!(ep.address, "10.0.0.2");
        assert_eq!(dual.alternate(EndpointRole::Secondary).unwrap().0, EndpointRole::Primary);
    }
}
