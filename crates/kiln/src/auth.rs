//! Browser session authorization.
//!
//! Kiln does not issue sessions itself. The web panel sets a
//! [`SESSION_COOKIE`] and Kiln asks an [`Authorizer`] who it belongs to
//! during the WebSocket upgrade.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "kiln_session";

/// Privilege levels, ordered from least to most authority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum AccountRole {
    /// Not logged in.
    #[default]
    User = 0,
    Registered = 1,
    Operator = 10,
    Supervisor = 100,
    Administrator = 1000,
}

/// An authorized browser user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub token: String,
    /// Shown next to echoed console commands.
    pub name: String,
    #[serde(default)]
    pub role: AccountRole,
}

/// Resolves a session token to a user.
///
/// Implement this over whatever session store the panel uses; a `None`
/// answers the upgrade with `401`.
///
/// ```rust
/// use kiln::auth::{AccountRole, Authorizer, User};
///
/// /// Lets everyone in as an operator. Development only.
/// struct OpenDoor;
///
/// impl Authorizer for OpenDoor {
///     fn authorize(&self, token: &str) -> Option<User> {
///         Some(User {
///             token: token.to_string(),
///             name: "dev".into(),
///             role: AccountRole::Operator,
///         })
///     }
/// }
///
/// assert_eq!(OpenDoor.authorize("x").unwrap().name, "dev");
/// ```
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, token: &str) -> Option<User>;
}

/// Users listed in the settings file, keyed by token.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthorizer {
    users: HashMap<String, User>,
}

impl StaticAuthorizer {
    pub fn new(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: users.into_iter().map(|u| (u.token.clone(), u)).collect(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, token: &str) -> Option<User> {
        if token.is_empty() {
            return None;
        }
        self.users.get(token).cloned()
    }
}
