//! Session manager: live connections, their identities and liveness clocks.
//!
//! ARCHITECTURE
//! ============
//! One `Session` per open socket, keyed by an internal `ConnectionId`. The
//! public identity (`user_<ms>_<suffix>`) is what peers see. An identity may
//! only be bound to one live session at a time; claiming a bound identity
//! displaces the older session.
//!
//! Each session holds the sending half of its socket's outbound queue.
//! Dropping the `Session` drops that sender, which ends the socket task and
//! closes the connection. Eviction is therefore just removal.
//!
//! LIVENESS
//! ========
//! Two clocks per session. The heartbeat clock moves on `session:ping` and
//! transport pings; the activity clock moves on any accepted event. A sweep
//! evicts sessions whose heartbeat or activity is older than its timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::frame::{Frame, tagged_id};
use crate::state::{ConnectionId, Viewport};

/// Longest identity a client may claim.
pub const MAX_IDENTITY_LEN: usize = 64;

const ARTISTS: &[&str] = &[
    "Leonardo da Vinci",
    "Michelangelo",
    "Raphaël",
    "Caravage",
    "Rembrandt",
    "Johannes Vermeer",
    "Diego Velázquez",
    "Francisco Goya",
    "Claude Monet",
    "Édouard Manet",
    "Vincent van Gogh",
    "Paul Cézanne",
    "Paul Gauguin",
    "Henri Matisse",
    "Pablo Picasso",
    "Salvador Dalí",
    "Joan Miró",
    "Marc Chagall",
    "Wassily Kandinsky",
    "Jackson Pollock",
    "Mark Rothko",
    "Andy Warhol",
    "Roy Lichtenstein",
    "Jean-Michel Basquiat",
    "Frida Kahlo",
    "Diego Rivera",
    "Artemisia Gentileschi",
    "Tamara de Lempicka",
    "Georges Braque",
    "Kazimir Malevich",
    "Piet Mondrian",
    "David Hockney",
    "Gerhard Richter",
    "Pierre Soulages",
    "Yayoi Kusama",
    "Takashi Murakami",
    "Zao Wou-Ki",
    "Jean Dubuffet",
    "Niki de Saint Phalle",
    "Gustav Klimt",
    "Egon Schiele",
    "Hergé",
    "Albert Uderzo",
    "René Goscinny",
    "Morris",
    "Franquin",
    "Peyo",
    "Moebius",
    "Enki Bilal",
    "Tardi",
    "Lewis Trondheim",
    "Marjane Satrapi",
    "Art Spiegelman",
    "Osamu Tezuka",
    "Akira Toriyama",
    "Katsuhiro Otomo",
    "Naoki Urasawa",
    "Eiichiro Oda",
    "Takehiko Inoue",
    "Hirohiko Araki",
    "Frank Miller",
    "Alan Moore",
    "Mike Mignola",
    "Saul Bass",
    "Paul Rand",
    "Milton Glaser",
    "Massimo Vignelli",
    "Paula Scher",
    "Stefan Sagmeister",
    "Chip Kidd",
    "Barbara Kruger",
    "Shepard Fairey",
    "Shigeo Fukuda",
    "Tadanori Yokoo",
    "Christoph Niemann",
    "Malika Favre",
    "Jean Jullien",
    "Eric Carle",
    "Charley Harper",
    "Mary Blair",
    "Keith Haring",
    "Tom Whalen",
];

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug)]
pub struct Session {
    connection_id: ConnectionId,
    identity: String,
    display_name: String,
    custom_name: Option<String>,
    last_heartbeat: Instant,
    last_activity: Instant,
    last_viewport: Option<Viewport>,
    last_clear: Option<Instant>,
    announced: bool,
    sender: mpsc::Sender<Frame>,
}

impl Session {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Custom name if one was set, otherwise the generated display name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.display_name)
    }

    #[must_use]
    pub fn last_viewport(&self) -> Option<Viewport> {
        self.last_viewport
    }

    #[must_use]
    pub fn sender(&self) -> &mpsc::Sender<Frame> {
        &self.sender
    }
}

/// Result of `SessionManager::register`.
#[derive(Debug)]
pub struct Registration {
    pub identity: String,
    pub display_name: String,
    /// Older session that held the requested identity, already removed.
    pub displaced: Option<Session>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    HeartbeatTimeout,
    Inactive,
}

impl EvictionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug)]
pub struct Eviction {
    pub session: Session,
    pub reason: EvictionReason,
}

// =============================================================================
// MANAGER
// =============================================================================

#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<ConnectionId, Session>,
    by_identity: HashMap<String, ConnectionId>,
    heartbeat_timeout: Duration,
    inactivity_timeout: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(heartbeat_timeout: Duration, inactivity_timeout: Duration) -> Self {
        Self { sessions: HashMap::new(), by_identity: HashMap::new(), heartbeat_timeout, inactivity_timeout }
    }

    /// Add a session for a freshly opened connection.
    ///
    /// A valid `requested` identity is honored, displacing any live session
    /// bound to it. Otherwise a new unique identity is generated.
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        sender: mpsc::Sender<Frame>,
        requested: Option<&str>,
        now: Instant,
    ) -> Registration {
        // A reused connection id replaces the old entry outright.
        self.unregister(connection_id);

        let (identity, displaced) = match requested.filter(|r| is_valid_identity(r)) {
            Some(claimed) => {
                let displaced = self.by_identity.get(claimed).copied().and_then(|old| self.unregister(old));
                (claimed.to_string(), displaced)
            }
            None => (self.fresh_identity(), None),
        };

        let display_name = display_name_for(&identity).to_string();
        self.by_identity.insert(identity.clone(), connection_id);
        self.sessions.insert(
            connection_id,
            Session {
                connection_id,
                identity: identity.clone(),
                display_name: display_name.clone(),
                custom_name: None,
                last_heartbeat: now,
                last_activity: now,
                last_viewport: None,
                last_clear: None,
                announced: false,
                sender,
            },
        );

        Registration { identity, display_name, displaced }
    }

    /// Whether `register` with this claim would displace a live session.
    #[must_use]
    pub fn holds_identity(&self, requested: &str) -> bool {
        is_valid_identity(requested) && self.by_identity.contains_key(requested)
    }

    /// Record a heartbeat. Returns false for unknown connections.
    pub fn touch_heartbeat(&mut self, connection_id: ConnectionId, now: Instant) -> bool {
        self.with_session(connection_id, |s| s.last_heartbeat = now)
    }

    /// Record meaningful activity. Returns false for unknown connections.
    pub fn touch_activity(&mut self, connection_id: ConnectionId, now: Instant) -> bool {
        self.with_session(connection_id, |s| s.last_activity = now)
    }

    pub fn set_viewport(&mut self, connection_id: ConnectionId, viewport: Viewport) -> bool {
        self.with_session(connection_id, |s| s.last_viewport = Some(viewport))
    }

    /// Override the generated display name.
    pub fn set_display_name(&mut self, connection_id: ConnectionId, name: String) -> bool {
        self.with_session(connection_id, |s| s.custom_name = Some(name))
    }

    /// Mark the session as announced to peers. True only the first time.
    pub fn mark_announced(&mut self, connection_id: ConnectionId) -> bool {
        let Some(session) = self.sessions.get_mut(&connection_id) else {
            return false;
        };
        !std::mem::replace(&mut session.announced, true)
    }

    /// Start the clear cooldown if it has elapsed. False while cooling down.
    pub fn try_clear(&mut self, connection_id: ConnectionId, cooldown: Duration, now: Instant) -> bool {
        let Some(session) = self.sessions.get_mut(&connection_id) else {
            return false;
        };
        if let Some(last) = session.last_clear {
            if now.saturating_duration_since(last) < cooldown {
                return false;
            }
        }
        session.last_clear = Some(now);
        true
    }

    /// Remove a session. Unknown ids are a no-op.
    pub fn unregister(&mut self, connection_id: ConnectionId) -> Option<Session> {
        let session = self.sessions.remove(&connection_id)?;
        if self.by_identity.get(&session.identity) == Some(&connection_id) {
            self.by_identity.remove(&session.identity);
        }
        Some(session)
    }

    /// Remove sessions whose heartbeat or activity clock has run out.
    pub fn sweep_zombies(&mut self, now: Instant) -> Vec<Eviction> {
        if self.is_empty() {
            return Vec::new();
        }
        let expired: Vec<(ConnectionId, EvictionReason)> = self
            .sessions
            .values()
            .filter_map(|s| {
                if now.saturating_duration_since(s.last_heartbeat) > self.heartbeat_timeout {
                    Some((s.connection_id, EvictionReason::HeartbeatTimeout))
                } else if now.saturating_duration_since(s.last_activity) > self.inactivity_timeout {
                    Some((s.connection_id, EvictionReason::Inactive))
                } else {
                    None
                }
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|(id, reason)| self.unregister(id).map(|session| Eviction { session, reason }))
            .collect()
    }

    #[must_use]
    pub fn get(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection_id)
    }

    /// Every session except `exclude`.
    pub fn peers(&self, exclude: Option<ConnectionId>) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(move |s| Some(s.connection_id) != exclude)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that have announced themselves with a viewport.
    #[must_use]
    pub fn active_users(&self) -> usize {
        self.sessions.values().filter(|s| s.announced).count()
    }

    fn with_session(&mut self, connection_id: ConnectionId, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.get_mut(&connection_id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    fn fresh_identity(&self) -> String {
        loop {
            let identity = tagged_id("user");
            if !self.by_identity.contains_key(&identity) {
                return identity;
            }
        }
    }
}

// =============================================================================
// IDENTITIES
// =============================================================================

/// Claimed identities must be 1..=64 chars of `[A-Za-z0-9_-]`.
#[must_use]
pub fn is_valid_identity(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_IDENTITY_LEN
        && raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Stable artist name for an identity.
#[must_use]
pub fn display_name_for(identity: &str) -> &'static str {
    let index = usize::try_from(identity_hash(identity).unsigned_abs()).unwrap_or(0) % ARTISTS.len();
    ARTISTS[index]
}

/// 31-multiplier hash over UTF-16 code units, wrapping at 32 bits.
fn identity_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0_i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
