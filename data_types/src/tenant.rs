use std::fmt;
use thiserror::Error;

/// Errors parsing an auth token into a [`Tenant`].
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("cannot parse accountID from {token:?}: {source}")]
    InvalidAccountId {
        token: String,
        source: std::num::ParseIntError,
    },

    #[error("cannot parse projectID from {token:?}: {source}")]
    InvalidProjectId {
        token: String,
        source: std::num::ParseIntError,
    },
}

/// The `(accountID, projectID)` pair every RPC is scoped to.
///
/// Parsed from the `authToken` path segment, which is either `accountID`
/// or `accountID:projectID`. A missing projectID means project 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tenant {
    pub account_id: u32,
    pub project_id: u32,
}

impl Tenant {
    pub fn new(account_id: u32, project_id: u32) -> Self {
        Self {
            account_id,
            project_id,
        }
    }

    /// Parses an `accountID[:projectID]` auth token.
    pub fn parse(token: &str) -> Result<Self, TenantError> {
        let (account, project) = match token.split_once(':') {
            Some((account, project)) => (account, Some(project)),
            None => (token, None),
        };

        let account_id = account
            .parse()
            .map_err(|source| TenantError::InvalidAccountId {
                token: token.to_owned(),
                source,
            })?;
        let project_id = match project {
            Some(project) => project
                .parse()
                .map_err(|source| TenantError::InvalidProjectId {
                    token: token.to_owned(),
                    source,
                })?,
            None => 0,
        };

        Ok(Self {
            account_id,
            project_id,
        })
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.project_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_account_only() {
        assert_eq!(Tenant::parse("42").unwrap(), Tenant::new(42, 0));
    }

    #[test]
    fn parse_account_and_project() {
        assert_eq!(Tenant::parse("1:2").unwrap(), Tenant::new(1, 2));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_matches!(Tenant::parse("banana"), Err(TenantError::InvalidAccountId { .. }));
        assert_matches!(Tenant::parse("1:banana"), Err(TenantError::InvalidProjectId { .. }));
        assert_matches!(Tenant::parse(""), Err(TenantError::InvalidAccountId { .. }));
    }
}
