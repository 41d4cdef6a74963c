use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Access role of the logged-in actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Standard,
    Supervisor,
    Admin,
}

/// Capability flags granted to a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub can_view_supervisor_chat: bool,

    /// Any other capability flags the identity service hands out
    #[serde(default, flatten)]
    pub other: BTreeMap<String, bool>,
}

impl Permissions {
    pub fn allows(&self, flag: &str) -> bool {
        match flag {
            "can_view_supervisor_chat" => self.can_view_supervisor_chat,
            _ => self.other.get(flag).copied().unwrap_or(false),
        }
    }

    /// Grant every known flag
    pub fn grant_all(&mut self) {
        self.can_view_supervisor_chat = true;
        self.other.values_mut().for_each(|granted| *granted = true);
    }
}

/// Accept permissions as an object or as a JSON-encoded string.
///
/// Anything unreadable falls back to the default flags.
fn permissions_from_object_or_string<'de, D>(deserializer: D) -> Result<Permissions, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => return Ok(Permissions::default()),
        JsonValue::String(encoded) => {
            let cleaned = encoded
                .trim()
                .trim_matches('"')
                .replace("\\\"", "\"");
            serde_json::from_str::<Permissions>(&cleaned)
        }
        value => serde_json::from_value::<Permissions>(value),
    };

    Ok(parsed.unwrap_or_else(|e| {
        tracing::warn!("Unreadable login permissions, using defaults: {}", e);
        Permissions::default()
    }))
}

/// Admins get every flag; supervisors always see the supervisor chat.
fn role_permissions(role: Role, mut permissions: Permissions) -> Permissions {
    match role {
        Role::Admin => permissions.grant_all(),
        Role::Supervisor => permissions.can_view_supervisor_chat = true,
        Role::Standard => {}
    }
    permissions
}

/// Login payload produced by the authentication collaborator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginIdentity {
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default, deserialize_with = "permissions_from_object_or_string")]
    pub permissions: Permissions,
}

/// Identity of the logged-in actor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    display_key: String,
    team: Option<String>,
    role: Role,
    permissions: Permissions,
}

impl Session {
    pub fn new(display_key: impl Into<String>, role: Role) -> Self {
        Self {
            display_key: display_key.into(),
            team: None,
            role,
            permissions: role_permissions(role, Permissions::default()),
        }
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = role_permissions(self.role, permissions);
        self
    }

    /// Build a session from a login payload.
    ///
    /// The presence key is the seller name, else the username, else
    /// `unknown_label`. Blank values count as absent.
    pub fn from_identity(identity: LoginIdentity, unknown_label: &str) -> Self {
        let display_key = [identity.seller_name.as_deref(), identity.username.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
            .unwrap_or(unknown_label)
            .to_string();

        Self {
            display_key,
            team: identity.team.filter(|t| !t.trim().is_empty()),
            role: identity.role,
            permissions: role_permissions(identity.role, identity.permissions),
        }
    }

    pub fn display_key(&self) -> &str {
        &self.display_key
    }

    pub fn team(&self) -> Option<&str> {
        self.team.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    /// Whether this session gets a supervisor-chat notification channel
    pub fn receives_chat_notifications(&self) -> bool {
        self.role == Role::Admin || self.permissions.can_view_supervisor_chat
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:?}] (team: {})",
            self.display_key,
            self.role,
            self.team.as_deref().unwrap_or("-")
        )
    }
}
