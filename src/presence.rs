//! Presence tracking: who else is connected and what they are doing.
//!
//! Presence is ephemeral. It travels on the awareness side channel, is never
//! written to the shared document, and disappears when a connection drops.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Soft avatar colours, picked by hashing the peer id
pub const PEER_COLORS: &[&str] = &["#FFB3BA", "#BAFFC9", "#BAE1FF", "#FFFFBA", "#FFDFBA"];

/// Display name for peers that did not give one
pub const GUEST_NAME: &str = "Guest";

/// Initials shown when neither a name nor an email is known
pub const UNKNOWN_INITIALS: &str = "??";

/// Transient per-connection id assigned by the relay. Not stable across
/// reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a replica's user is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl UserInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
        }
    }
}

/// What one replica publishes about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user: UserInfo,
    /// Precomputed initials; receivers derive them if empty
    #[serde(default)]
    pub initials: String,
    #[serde(default)]
    pub editing_title: bool,
}

impl PresenceState {
    pub fn new(user: UserInfo) -> Self {
        let initials = initials(&user.name, &user.email).unwrap_or_default();
        Self {
            user,
            initials,
            editing_title: false,
        }
    }
}

/// A presence state tagged with the connection it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub state: PresenceState,
}

/// Awareness side-channel messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full state of one connection
    Update(PresenceRecord),
    /// A connection went away
    Leave { client_id: ClientId },
    /// Ask every connection to resend its state (sent on connect)
    RequestAll,
}

/// A connected peer as shown in the collaborator bar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collaborator {
    pub client_id: ClientId,
    pub user_id: String,
    pub name: String,
    pub initials: String,
    pub color: &'static str,
    /// The peer has the title field focused
    pub editing_title: bool,
}

/// Initials from the first and last words of `name`, else the first letter of
/// `email`. `None` when neither yields a letter.
pub fn initials(name: &str, email: &str) -> Option<String> {
    let words: Vec<&str> = name.split_whitespace().collect();
    if let Some(first) = words.first().and_then(|w| w.chars().next()) {
        let mut out: String = first.to_uppercase().collect();
        if words.len() > 1 {
            if let Some(last) = words.last().and_then(|w| w.chars().next()) {
                out.extend(last.to_uppercase());
            }
        }
        return Some(out);
    }
    email
        .trim()
        .chars()
        .next()
        .map(|c| c.to_uppercase().collect())
}

/// Stable avatar colour for a peer or author id
pub fn peer_color(id: &str) -> &'static str {
    if id.is_empty() {
        return PEER_COLORS[0];
    }
    let hash = id
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            i32::from(unit).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash))
        });
    PEER_COLORS[hash.unsigned_abs() as usize % PEER_COLORS.len()]
}

/// Derives the collaborator list from awareness updates
#[derive(Debug, Default)]
pub struct PresenceTracker {
    local: Option<ClientId>,
    peers: BTreeMap<ClientId, PresenceState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record our own connection id so it is left out of the peer list
    pub fn set_local(&mut self, client_id: Option<ClientId>) {
        self.local = client_id;
        if let Some(id) = client_id {
            self.peers.remove(&id);
        }
    }

    pub fn local(&self) -> Option<ClientId> {
        self.local
    }

    /// Apply one awareness message. Returns whether the peer set changed.
    pub fn apply(&mut self, msg: &AwarenessMessage) -> bool {
        match msg {
            AwarenessMessage::Update(record) => {
                if Some(record.client_id) == self.local {
                    return false;
                }
                let previous = self.peers.insert(record.client_id, record.state.clone());
                previous.as_ref() != Some(&record.state)
            }
            AwarenessMessage::Leave { client_id } => self.peers.remove(client_id).is_some(),
            AwarenessMessage::RequestAll => false,
        }
    }

    /// Forget every peer (our connection dropped)
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Every connected peer except ourselves
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.peers
            .iter()
            .map(|(client_id, state)| to_collaborator(*client_id, state))
            .collect()
    }

    /// Peers currently editing the title
    pub fn editing_title(&self) -> Vec<Collaborator> {
        self.peers
            .iter()
            .filter(|(_, state)| state.editing_title)
            .map(|(client_id, state)| to_collaborator(*client_id, state))
            .collect()
    }
}

fn to_collaborator(client_id: ClientId, state: &PresenceState) -> Collaborator {
    let user = &state.user;
    let name = match user.name.trim() {
        "" => GUEST_NAME.to_string(),
        trimmed => trimmed.to_string(),
    };
    let initials = if state.initials.is_empty() {
        initials(&user.name, &user.email).unwrap_or_else(|| UNKNOWN_INITIALS.to_string())
    } else {
        state.initials.clone()
    };
    let color_key = if user.id.is_empty() {
        client_id.to_string()
    } else {
        user.id.clone()
    };
    Collaborator {
        client_id,
        user_id: user.id.clone(),
        name,
        initials,
        color: peer_color(&color_key),
        editing_title: state.editing_title,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: u64, name: &str, editing: bool) -> AwarenessMessage {
        let mut state = PresenceState::new(UserInfo::new(format!("u{id}"), name, ""));
        state.editing_title = editing;
        AwarenessMessage::Update(PresenceRecord {
            client_id: ClientId(id),
            state,
        })
    }

    #[test]
    fn initials_fall_back_from_name_to_email() {
        assert_eq!(initials("ada  king lovelace", "").as_deref(), Some("AL"));
        assert_eq!(initials("plato", "p@x.io").as_deref(), Some("P"));
        assert_eq!(initials("  ", "zed@x.io").as_deref(), Some("Z"));
        assert_eq!(initials("", ""), None);
    }

    #[test]
    fn collaborators_exclude_self_and_fill_defaults() {
        let mut tracker = PresenceTracker::new();
        tracker.set_local(Some(ClientId(1)));
        assert!(!tracker.apply(&update(1, "Me Myself", false)));
        assert!(tracker.apply(&update(2, "Grace Hopper", false)));
        assert!(tracker.apply(&AwarenessMessage::Update(PresenceRecord {
            client_id: ClientId(3),
            state: PresenceState {
                user: UserInfo::default(),
                initials: String::new(),
                editing_title: false,
            },
        })));

        let peers = tracker.collaborators();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].initials, "GH");
        assert_eq!(peers[1].name, GUEST_NAME);
        assert_eq!(peers[1].initials, UNKNOWN_INITIALS);
    }

    #[test]
    fn repeated_update_is_not_a_change() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker.apply(&update(2, "Ann", false)));
        assert!(!tracker.apply(&update(2, "Ann", false)));
        assert!(tracker.apply(&update(2, "Ann", true)));
    }

    #[test]
    fn editing_title_filter_and_leave() {
        let mut tracker = PresenceTracker::new();
        tracker.apply(&update(2, "Ann", true));
        tracker.apply(&update(3, "Bob", false));
        let editing: Vec<ClientId> = tracker.editing_title().iter().map(|c| c.client_id).collect();
        assert_eq!(editing, [ClientId(2)]);
        let flags: Vec<bool> = tracker.collaborators().iter().map(|c| c.editing_title).collect();
        assert_eq!(flags, [true, false]);

        assert!(tracker.apply(&AwarenessMessage::Leave { client_id: ClientId(2) }));
        assert!(tracker.editing_title().is_empty());
        assert_eq!(tracker.peer_count(), 1);
    }

    #[test]
    fn peer_color_is_stable_and_from_palette() {
        let color = peer_color("user-123");
        assert_eq!(color, peer_color("user-123"));
        assert!(PEER_COLORS.contains(&color));
        assert_eq!(peer_color(""), PEER_COLORS[0]);
    }
}
