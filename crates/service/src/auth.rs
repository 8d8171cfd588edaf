use crate::ServiceHandler;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine, prelude::BASE64_STANDARD};
use codec::{
    Error,
    crypto::{hmac_sha1, long_term_key},
    message::{
        Message,
        attributes::{Nonce, Realm, UserName},
    },
};

/// Why a request failed the long-term credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// The request carries no MESSAGE-INTEGRITY, the client is expected to
    /// retry with the realm and nonce of the challenge.
    Challenge,
    /// MESSAGE-INTEGRITY is present but USERNAME, REALM or NONCE is missing.
    BadRequest,
    StaleNonce,
    /// Unknown user, foreign realm or a digest that does not match.
    Unauthenticated,
}

/// The identity a request was authenticated with, the key signs the
/// response.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub key: [u8; 16],
}

/// Long-term credential checks with stateless nonces.
///
/// A nonce is the issue time in milliseconds followed by a digest of that
/// time under a per-process secret, so any nonce the process handed out can
/// be verified without remembering it.
pub struct Authenticator {
    realm: String,
    secret: [u8; 20],
    nonce_lifetime: Duration,
}

impl Authenticator {
    pub fn new(realm: String, nonce_lifetime: Duration) -> Self {
        Self {
            secret: rand::random(),
            nonce_lifetime,
            realm,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn issue(&self) -> Result<String, Error> {
        self.issue_at(SystemTime::now())
    }

    /// # Test
    ///
    /// ```
    /// use std::time::{Duration, SystemTime};
    /// use turn_relay_service::auth::Authenticator;
    ///
    /// let auth = Authenticator::new("localhost".to_string(), Duration::from_secs(3600));
    /// let now = SystemTime::now();
    /// let nonce = auth.issue_at(now).unwrap();
    ///
    /// assert!(auth.validate_at(&nonce, now + Duration::from_secs(60)));
    /// assert!(!auth.validate_at(&nonce, now + Duration::from_secs(3600)));
    /// assert!(!auth.validate_at("bm9uY2U=", now));
    /// ```
    pub fn issue_at(&self, now: SystemTime) -> Result<String, Error> {
        let timestamp = millis(now).to_be_bytes();
        let digest = hmac_sha1(&self.secret, &[&timestamp])?;

        let mut nonce = [0u8; 28];
        nonce[..8].copy_from_slice(&timestamp);
        nonce[8..].copy_from_slice(&digest);
        Ok(BASE64_STANDARD.encode(nonce))
    }

    pub fn validate(&self, nonce: &str) -> bool {
        self.validate_at(nonce, SystemTime::now())
    }

    pub fn validate_at(&self, nonce: &str, now: SystemTime) -> bool {
        let Ok(bytes) = BASE64_STANDARD.decode(nonce) else {
            return false;
        };

        if bytes.len() != 28 {
            return false;
        }

        let Ok(digest) = hmac_sha1(&self.secret, &[&bytes[..8]]) else {
            return false;
        };

        if digest[..] != bytes[8..] {
            return false;
        }

        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&bytes[..8]);
        let issued = u64::from_be_bytes(timestamp);
        let now = millis(now);

        issued <= now && now - issued < self.nonce_lifetime.as_millis() as u64
    }

    /// Check a request against the long-term credential mechanism.
    ///
    /// The checks run in the order clients rely on: a missing digest is a
    /// challenge, then missing attributes, then the nonce, and only then the
    /// user and the digest itself.
    pub async fn authenticate<T>(
        &self,
        message: &Message<'_>,
        handler: &T,
    ) -> Result<Credentials, AuthError>
    where
        T: ServiceHandler,
    {
        if !message.has_integrity() {
            return Err(AuthError::Challenge);
        }

        let (Some(username), Some(realm), Some(nonce)) = (
            message.get::<UserName>(),
            message.get::<Realm>(),
            message.get::<Nonce>(),
        ) else {
            return Err(AuthError::BadRequest);
        };

        if !self.validate(nonce) {
            return Err(AuthError::StaleNonce);
        }

        if realm != self.realm {
            return Err(AuthError::Unauthenticated);
        }

        let password = handler
            .get_password(username, realm)
            .await
            .ok_or(AuthError::Unauthenticated)?;

        let key = long_term_key(username, &password, realm);
        if message.verify(&key).is_err() {
            log::debug!("integrity check failed: username={}", username);
            return Err(AuthError::Unauthenticated);
        }

        Ok(Credentials {
            username: username.to_string(),
            key,
        })
    }
}

fn millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;
    use codec::{
        Attributes,
        message::{MessageEncoder, attributes::RequestedTransport, methods::ALLOCATE_REQUEST},
    };

    const TRANSACTION_ID: [u8; 12] = [7; 12];

    #[derive(Clone)]
    struct Users;

    impl ServiceHandler for Users {
        async fn get_password(&self, username: &str, _: &str) -> Option<String> {
            (username == "user1").then(|| "test".to_string())
        }
    }

    fn authenticator() -> Authenticator {
        Authenticator::new("localhost".to_string(), Duration::from_secs(3600))
    }

    fn request(
        buf: &mut BytesMut,
        username: Option<&str>,
        nonce: &str,
        key: Option<&[u8; 16]>,
    ) -> Result<(), Error> {
        let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &TRANSACTION_ID, buf);
        message.append::<RequestedTransport>(RequestedTransport::Udp);
        if let Some(username) = username {
            message.append::<UserName>(username);
        }

        message.append::<Realm>("localhost");
        message.append::<Nonce>(nonce);
        message.flush(key)
    }

    async fn check(auth: &Authenticator, buf: &BytesMut) -> Result<Credentials, AuthError> {
        let mut attributes = Attributes::default();
        let message = Message::decode(buf, &mut attributes).map_err(|_| AuthError::BadRequest)?;
        auth.authenticate(&message, &Users).await
    }

    #[test]
    fn tampered_nonce_is_rejected() {
        let auth = authenticator();
        let now = SystemTime::now();
        let nonce = auth.issue_at(now).unwrap();

        let mut bytes = BASE64_STANDARD.decode(&nonce).unwrap();
        bytes[0] ^= 1;
        assert!(!auth.validate_at(&BASE64_STANDARD.encode(&bytes), now));

        // nonces of another process never validate.
        assert!(!authenticator().validate_at(&nonce, now));
        // nor do nonces from the future.
        assert!(!auth.validate_at(&nonce, now - Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn long_term_credentials() {
        let auth = authenticator();
        let key = long_term_key("user1", "test", "localhost");
        let nonce = auth.issue().unwrap();
        let mut buf = BytesMut::with_capacity(1500);

        request(&mut buf, Some("user1"), &nonce, None).unwrap();
        assert_eq!(check(&auth, &buf).await.unwrap_err(), AuthError::Challenge);

        request(&mut buf, None, &nonce, Some(&key)).unwrap();
        assert_eq!(check(&auth, &buf).await.unwrap_err(), AuthError::BadRequest);

        request(&mut buf, Some("user1"), "bm9uY2U=", Some(&key)).unwrap();
        assert_eq!(check(&auth, &buf).await.unwrap_err(), AuthError::StaleNonce);

        let stranger = long_term_key("user2", "test", "localhost");
        request(&mut buf, Some("user2"), &nonce, Some(&stranger)).unwrap();
        assert_eq!(
            check(&auth, &buf).await.unwrap_err(),
            AuthError::Unauthenticated
        );

        let wrong = long_term_key("user1", "wrong", "localhost");
        request(&mut buf, Some("user1"), &nonce, Some(&wrong)).unwrap();
        assert_eq!(
            check(&auth, &buf).await.unwrap_err(),
            AuthError::Unauthenticated
        );

        request(&mut buf, Some("user1"), &nonce, Some(&key)).unwrap();
        let credentials = check(&auth, &buf).await.unwrap();
        assert_eq!(credentials.username, "user1");
        assert_eq!(credentials.key, key);
    }
}
