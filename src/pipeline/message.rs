//! Synchronous component-to-component messages.
//!
//! A message is delivered by calling the recipient's handler while holding
//! that recipient's mutex. Borrowed payloads live only for the call; a
//! handler that keeps data converts it with [`Payload::to_shared`].

use super::component::SharedComponent;
use crate::level::Sample;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Payload borrowed from the sender for the duration of one delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PayloadView<'a> {
    Bytes(&'a [u8]),
    Text(&'a str),
    Samples(&'a [Sample]),
}

/// Owned payload, shared between the sender and anyone who kept it.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadData {
    Bytes(Vec<u8>),
    Text(String),
    Samples(Vec<Sample>),
}

impl PayloadData {
    pub fn view(&self) -> PayloadView<'_> {
        match self {
            PayloadData::Bytes(b) => PayloadView::Bytes(b),
            PayloadData::Text(t) => PayloadView::Text(t),
            PayloadData::Samples(s) => PayloadView::Samples(s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload<'a> {
    #[default]
    None,
    Borrowed(PayloadView<'a>),
    Shared(Arc<PayloadData>),
}

impl Payload<'_> {
    pub fn view(&self) -> Option<PayloadView<'_>> {
        match self {
            Payload::None => None,
            Payload::Borrowed(v) => Some(*v),
            Payload::Shared(data) => Some(data.view()),
        }
    }

    /// Copies a borrowed payload (or clones the handle of a shared one) so it
    /// can outlive the delivery.
    pub fn to_shared(&self) -> Option<Arc<PayloadData>> {
        match self {
            Payload::None => None,
            Payload::Shared(data) => Some(data.clone()),
            Payload::Borrowed(view) => Some(Arc::new(match view {
                PayloadView::Bytes(b) => PayloadData::Bytes(b.to_vec()),
                PayloadView::Text(t) => PayloadData::Text((*t).to_string()),
                PayloadView::Samples(s) => PayloadData::Samples(s.to_vec()),
            })),
        }
    }
}

/// Fixed header plus optional payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message<'a> {
    /// Type tag, e.g. `turnStart`.
    pub kind: String,
    /// Free-form name, used by recipients to tell messages of one kind apart.
    pub name: String,
    /// Set by the bus on delivery.
    pub sender: String,
    /// Seconds since pipeline start when the message was sent.
    pub wall_clock: f64,
    pub user_time1: f64,
    pub user_time2: f64,
    /// Stream time of the data the message refers to.
    pub reader_time: f64,
    pub id: i64,
    pub floats: [f64; 8],
    pub ints: [i64; 8],
    pub text: String,
    pub payload: Payload<'a>,
}

impl<'a> Message<'a> {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_floats(mut self, values: &[f64]) -> Self {
        for (slot, v) in self.floats.iter_mut().zip(values) {
            *slot = *v;
        }
        self
    }

    pub fn with_ints(mut self, values: &[i64]) -> Self {
        for (slot, v) in self.ints.iter_mut().zip(values) {
            *slot = *v;
        }
        self
    }

    pub fn with_user_time(mut self, t1: f64, t2: f64) -> Self {
        self.user_time1 = t1;
        self.user_time2 = t2;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_payload(mut self, payload: Payload<'a>) -> Self {
        self.payload = payload;
        self
    }

    /// Detaches the message from borrowed payload data.
    pub fn into_owned(self) -> Message<'static> {
        let payload = match self.payload.to_shared() {
            Some(data) => Payload::Shared(data),
            None => Payload::None,
        };
        Message {
            kind: self.kind,
            name: self.name,
            sender: self.sender,
            wall_clock: self.wall_clock,
            user_time1: self.user_time1,
            user_time2: self.user_time2,
            reader_time: self.reader_time,
            id: self.id,
            floats: self.floats,
            ints: self.ints,
            text: self.text,
            payload,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("no component named '{0}'")]
    UnknownRecipient(String),

    #[error("component '{0}' cannot message itself")]
    SelfSend(String),

    #[error("component '{0}' is unavailable after a panic")]
    Poisoned(String),
}

/// Name → component registry used to deliver messages.
#[derive(Clone, Default)]
pub struct MessageBus {
    recipients: Arc<RwLock<HashMap<String, SharedComponent>>>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("recipients", &self.recipients())
            .finish()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, name: &str, component: SharedComponent) {
        if let Ok(mut map) = self.recipients.write() {
            map.insert(name.to_string(), component);
        }
    }

    pub fn recipients(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .recipients
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Delivers `msg` to `recipient`. Returns whether the handler accepted it.
    pub fn send(&self, recipient: &str, msg: &Message<'_>) -> Result<bool, MessageError> {
        if msg.sender == recipient {
            return Err(MessageError::SelfSend(recipient.to_string()));
        }
        let component = self
            .recipients
            .read()
            .map_err(|_| MessageError::Poisoned(recipient.to_string()))?
            .get(recipient)
            .cloned()
            .ok_or_else(|| MessageError::UnknownRecipient(recipient.to_string()))?;
        let mut guard = component
            .lock()
            .map_err(|_| MessageError::Poisoned(recipient.to_string()))?;
        Ok(guard.handle_message(msg))
    }
}
