use parley_store::{StorePath, StoreResult};

use crate::session_key::SessionKey;

const SESSIONS: &str = "sessions";
const SIGNALS: &str = "signals";

/// Store layout of one call room:
///
/// ```text
/// {root}/{room}/sessions/{sessionKey}            roster entry
/// {root}/{room}/signals/{sessionKey}/{messageId} inbox of one session
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPaths {
    room: StorePath,
}

impl RoomPaths {
    pub fn new(root: &str, room: &str) -> StoreResult<Self> {
        Ok(Self {
            room: StorePath::parse(root)?.child(room)?,
        })
    }

    pub fn sessions(&self) -> StoreResult<StorePath> {
        self.room.child(SESSIONS)
    }

    pub fn session(&self, key: &SessionKey) -> StoreResult<StorePath> {
        self.sessions()?.child(key)
    }

    pub fn inbox(&self, key: &SessionKey) -> StoreResult<StorePath> {
        self.room.child(SIGNALS)?.child(key)
    }

    pub fn message(&self, key: &SessionKey, id: &str) -> StoreResult<StorePath> {
        self.inbox(key)?.child(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lays_out_room_paths() {
        let paths = RoomPaths::new("calls", "r1").unwrap();
        let key = SessionKey::new("user1_abc");
        assert_eq!(paths.session(&key).unwrap().to_string(), "/calls/r1/sessions/user1_abc");
        assert_eq!(
            paths.message(&key, "0001-000001").unwrap().to_string(),
            "/calls/r1/signals/user1_abc/0001-000001"
        );
        assert!(RoomPaths::new("calls", "bad.room").is_err());
    }
}
