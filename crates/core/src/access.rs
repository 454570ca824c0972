use thiserror::Error;

use crate::types::Role;

/// Denial produced by the role policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("role {actual} is not permitted, requires one of: {required}")]
    Forbidden { actual: Role, required: String },
    #[error("resource belongs to another user")]
    NotOwner,
}

/// Ensures `actual` is one of the `allowed` roles. An empty slice allows everyone.
pub fn require_role(actual: Role, allowed: &[Role]) -> Result<(), AccessError> {
    if allowed.is_empty() || allowed.contains(&actual) {
        return Ok(());
    }
    Err(AccessError::Forbidden {
        actual,
        required: allowed
            .iter()
            .map(|role| role.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Allows the owner of a resource, or any caller holding one of `override_roles`.
pub fn require_self_or(
    caller_id: i64,
    caller_role: Role,
    owner_id: i64,
    override_roles: &[Role],
) -> Result<(), AccessError> {
    if caller_id == owner_id || override_roles.contains(&caller_role) {
        Ok(())
    } else {
        Err(AccessError::NotOwner)
    }
}
