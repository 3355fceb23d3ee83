//! Pre-configured test data fixtures.
//!
//! Provides builders for:
//! - Session documents with various settings and pre-assigned roles
//! - Identity tokens (valid, expired, wrong secret)

use common::jwt::IdentityClaims;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use live_runtime::model::{Session, SessionSettings, SessionStatus};
use live_runtime::store::SessionStore;
use uuid::Uuid;

/// Secret used by [`TestIdentityToken::sign`] when none is given.
pub const TEST_TOKEN_SECRET: &str = "live-runtime-test-secret-0123456789";

/// Session document builder.
#[derive(Debug, Clone)]
pub struct SessionFixture {
    session: Session,
}

impl SessionFixture {
    /// A scheduled session owned by `organizer` with every feature enabled
    /// and no approval or capacity limit.
    #[must_use]
    pub fn new(organizer: impl Into<String>) -> Self {
        let code = Uuid::new_v4().simple().to_string();
        let room_code = format!(
            "{}-{}-{}",
            code.get(0..3).unwrap(),
            code.get(3..7).unwrap(),
            code.get(7..10).unwrap()
        );
        let mut session = Session::new(room_code, organizer, "Test Webinar");
        session.settings = SessionSettings {
            chat_enabled: true,
            polls_enabled: true,
            qa_enabled: true,
            recording_allowed: true,
            require_approval: false,
            max_participants: None,
        };
        Self { session }
    }

    #[must_use]
    pub fn with_room_code(mut self, room_code: impl Into<String>) -> Self {
        self.session.room_code = room_code.into();
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.session.title = title.into();
        self
    }

    /// Hold attendees in the lobby until approved.
    #[must_use]
    pub fn require_approval(mut self) -> Self {
        self.session.settings.require_approval = true;
        self
    }

    #[must_use]
    pub fn with_max_participants(mut self, max: u32) -> Self {
        self.session.settings.max_participants = Some(max);
        self
    }

    #[must_use]
    pub fn without_recording(mut self) -> Self {
        self.session.settings.recording_allowed = false;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.session.settings = settings;
        self
    }

    #[must_use]
    pub fn with_speaker(mut self, identity: impl Into<String>) -> Self {
        self.session.speakers.push(identity.into());
        self
    }

    #[must_use]
    pub fn with_moderator(mut self, identity: impl Into<String>) -> Self {
        self.session.moderators.push(identity.into());
        self
    }

    #[must_use]
    pub fn live(mut self) -> Self {
        self.session.status = SessionStatus::Live;
        self.session.started_at = Some(chrono::Utc::now());
        self
    }

    #[must_use]
    pub fn build(self) -> Session {
        self.session
    }

    /// Build and insert into `store`, returning the inserted document.
    pub async fn insert<S: SessionStore + ?Sized>(self, store: &S) -> Session {
        let session = self.session;
        store.insert(session.clone()).await.unwrap();
        session
    }
}

/// Identity token builder.
///
/// ```rust,ignore
/// let token = TestIdentityToken::new("alice").with_name("Alice").sign_default();
/// let expired = TestIdentityToken::new("alice").expired().sign_default();
/// ```
#[derive(Debug, Clone)]
pub struct TestIdentityToken {
    subject: String,
    name: Option<String>,
    issued_offset_seconds: i64,
    ttl_seconds: i64,
}

impl TestIdentityToken {
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            name: None,
            issued_offset_seconds: 0,
            ttl_seconds: 3600,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Issued two hours ago with a one-minute lifetime.
    #[must_use]
    pub fn expired(mut self) -> Self {
        self.issued_offset_seconds = -7200;
        self.ttl_seconds = 60;
        self
    }

    /// Issued an hour in the future, past any clock skew tolerance.
    #[must_use]
    pub fn issued_in_future(mut self) -> Self {
        self.issued_offset_seconds = 3600;
        self.ttl_seconds = 7200;
        self
    }

    #[must_use]
    pub fn claims(&self) -> IdentityClaims {
        IdentityClaims::new(
            self.subject.clone(),
            self.name.clone(),
            chrono::Utc::now().timestamp() + self.issued_offset_seconds,
            self.ttl_seconds,
        )
    }

    /// Sign with HS256 under `secret`.
    #[must_use]
    pub fn sign(&self, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &self.claims(),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    /// Sign with [`TEST_TOKEN_SECRET`].
    #[must_use]
    pub fn sign_default(&self) -> String {
        self.sign(TEST_TOKEN_SECRET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_codes_are_unique_and_shaped() {
        let a = SessionFixture::new("org").build();
        let b = SessionFixture::new("org").build();
        assert_ne!(a.room_code, b.room_code);
        assert_eq!(a.room_code.len(), 12);
        assert_eq!(a.room_code.matches('-').count(), 2);
    }

    #[test]
    fn test_expired_token_claims() {
        let claims = TestIdentityToken::new("alice").expired().claims();
        assert!(claims.exp < chrono::Utc::now().timestamp());
    }
}
