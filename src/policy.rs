//! Table-driven permission policy.
//!
//! All role checks in the API go through this module: one declarative
//! permission table plus one enforcement gate (`require`). Handlers never
//! compare roles inline.

use crate::errors::ApiError;
use crate::models::{Issue, IssueStatus, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateIssue,
    /// Read or list issues beyond the actor's own.
    ReadAnyIssue,
    /// Edit status/severity/assignee/tags on any issue.
    TriageIssue,
    DeleteIssue,
    /// Team-wide dashboard rollups (reporters get personal counts instead).
    ViewTeamDashboard,
    ListUsers,
    ManageUsers,
}

/// The permission table. Roles absent from a row are denied that action.
const PERMISSIONS: &[(Action, &[Role])] = &[
    (Action::CreateIssue, &[Role::Reporter, Role::Maintainer, Role::Admin]),
    (Action::ReadAnyIssue, &[Role::Maintainer, Role::Admin]),
    (Action::TriageIssue, &[Role::Maintainer, Role::Admin]),
    (Action::DeleteIssue, &[Role::Maintainer, Role::Admin]),
    (Action::ViewTeamDashboard, &[Role::Maintainer, Role::Admin]),
    (Action::ListUsers, &[Role::Maintainer, Role::Admin]),
    (Action::ManageUsers, &[Role::Admin]),
];

/// Fields a reporter may patch on their own issue.
pub const REPORTER_EDITABLE_FIELDS: &[&str] = &["title", "description"];

/// Whether reporter self-edits are limited to issues still in OPEN.
pub const REPORTER_EDIT_OPEN_ONLY: bool = true;

pub fn allows(role: Role, action: Action) -> bool {
    PERMISSIONS
        .iter()
        .find(|(a, _)| *a == action)
        .map(|(_, roles)| roles.contains(&role))
        .unwrap_or(false)
}

pub fn require(role: Role, action: Action) -> Result<(), ApiError> {
    if allows(role, action) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Not enough permissions".to_string()))
    }
}

/// Gate for issue updates. Maintainers and admins may patch any field on any
/// issue; a reporter may patch only `REPORTER_EDITABLE_FIELDS` on their own
/// issue, and only while it is still OPEN when `REPORTER_EDIT_OPEN_ONLY`.
pub fn check_issue_update(
    actor_id: i64,
    role: Role,
    issue: &Issue,
    patched_fields: &[&str],
) -> Result<(), ApiError> {
    if allows(role, Action::TriageIssue) {
        return Ok(());
    }

    if issue.reporter_id != actor_id {
        return Err(ApiError::Forbidden("Not enough permissions".to_string()));
    }
    if REPORTER_EDIT_OPEN_ONLY && issue.status != IssueStatus::Open {
        return Err(ApiError::Forbidden(
            "Issue is no longer open for reporter edits".to_string(),
        ));
    }
    for field in patched_fields {
        if !REPORTER_EDITABLE_FIELDS.contains(field) {
            return Err(ApiError::Forbidden(format!(
                "Reporters may not change '{}'",
                field
            )));
        }
    }
    Ok(())
}
