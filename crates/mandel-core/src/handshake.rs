//! Client handshake ("JSON transport") rendezvous.
//!
//! The HTTP side and the assignment side both look up a per-mandelbox slot
//! in [`HandshakeMap`]; whichever arrives first creates it. The request
//! travels with a reply channel, so the task finishing spin-up answers the
//! waiting client directly.

use crate::configutils::{deserialize_bookmarks, Bookmarks, BrowserData};
use crate::error::{CoreError, Result};
use crate::types::{AppName, ConfigEncryptionToken, MandelboxId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Body of `PUT /json_transport`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTransportRequest {
    /// App the client wants; the default app when absent.
    #[serde(default)]
    pub app_name: Option<AppName>,
    /// Secret the user's config archive is encrypted with.
    #[serde(default)]
    pub config_encryption_token: ConfigEncryptionToken,
    /// Carried through; not validated here.
    #[serde(default)]
    pub jwt_access_token: String,
    /// Mandelbox the client was assigned.
    pub mandelbox_id: MandelboxId,
    /// The client has never uploaded a config under this token.
    #[serde(default)]
    pub is_new_config_encryption_token: bool,
    /// Gzip + base64 JSON handed to the protocol as `config.json`.
    #[serde(default)]
    pub json_data: String,
    #[serde(default)]
    pub cookies: String,
    #[serde(default, deserialize_with = "deserialize_bookmarks")]
    pub bookmarks: Option<Bookmarks>,
    #[serde(default)]
    pub extensions: String,
    #[serde(default)]
    pub preferences: String,
}

impl JsonTransportRequest {
    /// Browser data to import, with `extensions` replaced by the merged list.
    pub fn browser_data(&self, extensions: String) -> BrowserData {
        BrowserData {
            cookies_json: self.cookies.clone(),
            bookmarks: self.bookmarks.clone(),
            extensions,
            preferences: self.preferences.clone(),
        }
    }
}

/// Connection material returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonTransportResult {
    pub port_32261: u16,
    pub port_32262: u16,
    pub port_32263: u16,
    pub port_32273: u16,
    pub aes_key: String,
}

/// What the client gets back: the result or an error message.
pub type HandshakeReply = std::result::Result<JsonTransportResult, String>;

/// A handshake waiting to be answered.
#[derive(Debug)]
pub struct HandshakeRequest {
    pub body: JsonTransportRequest,
    reply: oneshot::Sender<HandshakeReply>,
}

impl HandshakeRequest {
    /// Pair a request with the channel its answer goes to.
    pub fn new(body: JsonTransportRequest) -> (Self, oneshot::Receiver<HandshakeReply>) {
        let (reply, rx) = oneshot::channel();
        (Self { body, reply }, rx)
    }

    /// Answer the client. A client that already gave up is ignored.
    pub fn respond(self, reply: HandshakeReply) {
        if self.reply.send(reply).is_err() {
            tracing::debug!(
                mandelbox_id = %self.body.mandelbox_id,
                "Handshake client went away before the reply"
            );
        }
    }

    /// Answer the client with an error.
    pub fn fail(self, error: impl ToString) {
        self.respond(Err(error.to_string()));
    }
}

#[derive(Debug)]
struct Slot {
    tx: Option<oneshot::Sender<HandshakeRequest>>,
    rx: Option<oneshot::Receiver<HandshakeRequest>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

/// Per-mandelbox single-use handshake channels.
#[derive(Debug, Default)]
pub struct HandshakeMap {
    slots: Mutex<HashMap<MandelboxId, Slot>>,
}

impl HandshakeMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a client request to whoever waits for this mandelbox.
    ///
    /// # Errors
    /// Answers the request with an error and returns
    /// [`CoreError::InvalidState`] if a handshake for this mandelbox was
    /// already delivered, or its waiter is gone.
    pub fn deliver(&self, request: HandshakeRequest) -> Result<()> {
        let id = request.body.mandelbox_id;
        let tx = {
            let mut slots = self.slots.lock();
            slots.entry(id).or_insert_with(Slot::new).tx.take()
        };

        let Some(tx) = tx else {
            request.fail(format!("duplicate handshake for mandelbox {id}"));
            return Err(CoreError::InvalidState {
                expected: "no handshake".into(),
                actual: "handshake already delivered".into(),
            });
        };

        tx.send(request).map_err(|request| {
            request.fail(format!("mandelbox {id} is no longer waiting for a handshake"));
            CoreError::InvalidState {
                expected: "waiting for handshake".into(),
                actual: "waiter gone".into(),
            }
        })?;
        tracing::debug!(mandelbox_id = %id, "Delivered handshake");
        Ok(())
    }

    /// Take the receiving end for `id`. Only the first caller gets it.
    pub fn take_receiver(&self, id: MandelboxId) -> Option<oneshot::Receiver<HandshakeRequest>> {
        self.slots.lock().entry(id).or_insert_with(Slot::new).rx.take()
    }

    /// Drop the slot for `id`. A request parked in it is dropped, which
    /// answers its client with a closed channel.
    pub fn clear(&self, id: MandelboxId) {
        self.slots.lock().remove(&id);
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot is live.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(id: MandelboxId) -> JsonTransportRequest {
        JsonTransportRequest {
            mandelbox_id: id,
            config_encryption_token: ConfigEncryptionToken::new("token-token-token-token"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_before_waiter() {
        let map = HandshakeMap::new();
        let id = MandelboxId::new();

        let (request, reply) = HandshakeRequest::new(body(id));
        tokio_test::assert_ok!(map.deliver(request));

        let rx = map.take_receiver(id).unwrap();
        let received = rx.await.unwrap();
        assert_eq!(received.body.mandelbox_id, id);
        received.fail("nope");
        assert_eq!(reply.await.unwrap(), Err("nope".to_string()));
    }

    #[tokio::test]
    async fn test_waiter_before_request() {
        let map = HandshakeMap::new();
        let id = MandelboxId::new();
        let rx = map.take_receiver(id).unwrap();
        assert!(map.take_receiver(id).is_none());

        let (request, _reply) = HandshakeRequest::new(body(id));
        map.deliver(request).unwrap();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let map = HandshakeMap::new();
        let id = MandelboxId::new();

        let (first, _r1) = HandshakeRequest::new(body(id));
        map.deliver(first).unwrap();

        let (second, r2) = HandshakeRequest::new(body(id));
        tokio_test::assert_err!(map.deliver(second));
        assert!(r2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_clear_drops_parked_request() {
        let map = HandshakeMap::new();
        let id = MandelboxId::new();
        let (request, reply) = HandshakeRequest::new(body(id));
        map.deliver(request).unwrap();

        map.clear(id);
        assert!(map.is_empty());
        assert!(reply.await.is_err());
    }

    #[test]
    fn test_request_json() {
        let id = MandelboxId::new();
        let json = format!(
            r#"{{"mandelbox_id":"{id}","app_name":"browsers/brave","config_encryption_token":"abc","is_new_config_encryption_token":true,"bookmarks":"","extensions":"a,b"}}"#
        );
        let parsed: JsonTransportRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.mandelbox_id, id);
        assert_eq!(parsed.app_name.unwrap().as_str(), "browsers/brave");
        assert!(parsed.is_new_config_encryption_token);
        assert!(parsed.bookmarks.is_none());
    }
}
