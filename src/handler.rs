use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, prelude::BASE64_STANDARD};
use codec::crypto::hmac_sha1;
use service::{ServiceHandler, allocation::FiveTuple};

use crate::config::Auth;

#[derive(Clone)]
pub struct Handler {
    auth: Arc<Auth>,
}

impl Handler {
    pub fn new(auth: Auth) -> Self {
        Self { auth: Arc::new(auth) }
    }

    /// TURN REST API password of `username`, `None` once the expiry
    /// timestamp in front of the name has passed.
    fn rest_password(secret: &str, username: &str, now: SystemTime) -> Option<String> {
        if let Some((expiry, _)) = username.split_once(':') {
            let expiry = expiry.parse::<u64>().ok()?;
            let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
            if expiry < now {
                return None;
            }
        }

        let digest = hmac_sha1(secret.as_bytes(), &[username.as_bytes()]).ok()?;
        Some(BASE64_STANDARD.encode(digest))
    }
}

impl ServiceHandler for Handler {
    async fn get_password(&self, username: &str, _: &str) -> Option<String> {
        // Match the static authentication information first.
        if let Some(password) = self.auth.static_credentials.get(username) {
            return Some(password.clone());
        }

        // Try again with the shared secret.
        let secret = self.auth.static_auth_secret.as_deref()?;
        Self::rest_password(secret, username, SystemTime::now())
    }

    /// allocation created
    ///
    /// Triggered once an Allocate request succeeded, with the relayed
    /// transport address handed to the client. Retransmissions answered
    /// from the cached response do not trigger it again.
    fn on_allocated(&self, five_tuple: &FiveTuple, username: &str, relayed: SocketAddr) {
        log::info!(
            "allocated: address={:?}, interface={:?}, username={:?}, relayed={}",
            five_tuple.client,
            five_tuple.server,
            username,
            relayed
        );
    }

    /// create permission request
    ///
    /// The server installs or refreshes a permission for the IP address
    /// contained in each XOR-PEER-ADDRESS attribute. The port portion of
    /// each attribute is ignored and may be any arbitrary value.
    fn on_create_permission(&self, five_tuple: &FiveTuple, username: &str, peers: &[IpAddr]) {
        log::info!(
            "create permission: address={:?}, interface={:?}, username={:?}, peers={:?}",
            five_tuple.client,
            five_tuple.server,
            username,
            peers
        );
    }

    /// channel binding request
    ///
    /// If the server can satisfy the request, then the server creates or
    /// refreshes the channel binding using the channel number in the
    /// CHANNEL-NUMBER attribute and the transport address in the XOR-PEER-
    /// ADDRESS attribute. The server also installs or refreshes a
    /// permission for the IP address in the XOR-PEER-ADDRESS attribute.
    fn on_channel_bind(&self, five_tuple: &FiveTuple, username: &str, channel: u16, peer: SocketAddr) {
        log::info!(
            "channel bind: address={:?}, interface={:?}, username={:?}, channel={}, peer={}",
            five_tuple.client,
            five_tuple.server,
            username,
            channel,
            peer
        );
    }

    fn on_refresh(&self, five_tuple: &FiveTuple, username: &str, lifetime: u32) {
        log::info!(
            "refresh: address={:?}, interface={:?}, username={:?}, lifetime={}",
            five_tuple.client,
            five_tuple.server,
            username,
            lifetime
        );
    }

    /// allocation closed
    ///
    /// Triggered when the allocation leaves the table. Possible reasons: the
    /// lifetime has expired, a refresh with a zero lifetime, or the stream
    /// carrying it disconnected.
    fn on_destroy(&self, five_tuple: &FiveTuple, username: &str) {
        log::info!(
            "closed: address={:?}, interface={:?}, username={:?}",
            five_tuple.client,
            five_tuple.server,
            username
        );
    }
}
