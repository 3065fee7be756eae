//! Serialises events into a region and posts them to a queue, or forwards
//! them directly in-process (component H).
//!
//! Grounded in `Events/EventTranslator.h`/`.cc`: `encodeEvent` asks for a
//! buffer sized exactly for a 4-byte class-id header plus the event's own
//! serialized form, writes both, then hands the buffer to `post`. The two
//! concrete variants below correspond to `NoOpEventTranslator` (same-process
//! routers, no serialization at all) and `IPCEventTranslator` (posts a
//! region onto a [`MessageQueue`]).
//!
//! `Event` stands in for the original's `EventBase`: anything with a stable
//! class id and a binary save/load pair. There is no behavior framework or
//! router here (out of scope per the crate's non-goals) — only the
//! encode/decode/post contract a router would otherwise use.

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::queue::MessageQueue;
use crate::region::Region;

pub type ClassId = u32;

/// Something that can be serialised into (and reconstructed from) the byte
/// buffer an [`EventTranslator`] posts. Mirrors `EventBase::saveBuffer` /
/// `loadBuffer` plus `getClassTypeID`.
pub trait Event: Send + Sync {
  fn class_id(&self) -> ClassId;
  /// Appends this event's payload (header excluded) to `buf`.
  fn save(&self, buf: &mut Vec<u8>);
}

/// Reconstructs an event from its class id and payload bytes. Implementors
/// register themselves in an [`EventRegistry`].
pub trait EventDecoder: Send + Sync {
  fn decode(&self, payload: &[u8]) -> Option<Box<dyn Event>>;
}

/// Class-id -> decoder directory, standing in for the original's
/// `EventBase::getTypeRegistry()`.
#[derive(Default)]
pub struct EventRegistry {
  decoders: std::collections::HashMap<ClassId, Box<dyn EventDecoder>>,
}

impl EventRegistry {
  pub fn new() -> Self {
    EventRegistry::default()
  }

  pub fn register(&mut self, class_id: ClassId, decoder: Box<dyn EventDecoder>) {
    self.decoders.insert(class_id, decoder);
  }

  /// Reads the 4-byte class-id header, looks up its decoder, and
  /// reconstructs the event from the remaining bytes. Returns `None` (and
  /// logs) if the class id is unregistered or the payload is malformed —
  /// the original's two listed `decodeEvent` failure modes.
  pub fn decode(&self, buf: &[u8]) -> Option<Box<dyn Event>> {
    if buf.len() < 4 {
      warn!("EventRegistry::decode: buffer too small to hold a class-id header ({} bytes)", buf.len());
      return None;
    }
    let class_id = LittleEndian::read_u32(&buf[..4]);
    let Some(decoder) = self.decoders.get(&class_id) else {
      warn!("EventRegistry::decode: class id {class_id} is not registered");
      return None;
    };
    let event = decoder.decode(&buf[4..]);
    if event.is_none() {
      warn!("EventRegistry::decode: payload for class id {class_id} is malformed");
    }
    event
  }
}

/// Serialises events for cross-process delivery, or forwards them in-process
/// unserialised. `encodeEvent` is the one entry point both variants share;
/// `onlyReady` is a backpressure hint: when set, the IPC variant skips the
/// send rather than pile up behind a backlogged receiver.
pub trait EventTranslator: Send + Sync {
  /// Serialises `event` and posts it (or forwards it directly, for the
  /// no-op variant). `onlyReady` is honored only by variants whose transfer
  /// mechanism supports the notion (the IPC variant).
  fn encode_event(&self, event: &dyn Event, only_ready: bool);
}

/// Forwards events back into a local router instead of serialising them.
/// For in-process configurations where a translator is wired in purely for
/// interface uniformity. Grounded in `NoOpEventTranslator`.
pub struct NoOpEventTranslator<F: Fn(&dyn Event) + Send + Sync> {
  forward: F,
}

impl<F: Fn(&dyn Event) + Send + Sync> NoOpEventTranslator<F> {
  pub fn new(forward: F) -> Self {
    NoOpEventTranslator { forward }
  }
}

impl<F: Fn(&dyn Event) + Send + Sync> EventTranslator for NoOpEventTranslator<F> {
  fn encode_event(&self, event: &dyn Event, _only_ready: bool) {
    (self.forward)(event);
  }
}

/// Serialises each event into a freshly allocated region and posts it on a
/// [`MessageQueue`]. Grounded in `IPCEventTranslator::bufferRequest`/`post`.
pub struct IpcEventTranslator<'a, const CAP: usize, const R: usize, const S: usize> {
  queue: &'a MessageQueue<'a, CAP, R, S>,
}

impl<'a, const CAP: usize, const R: usize, const S: usize> IpcEventTranslator<'a, CAP, R, S> {
  pub fn new(queue: &'a MessageQueue<'a, CAP, R, S>) -> Self {
    IpcEventTranslator { queue }
  }

  /// `onlyReady` restricts the send to the case where the queue's newest
  /// entry has already been read by everyone (i.e. no receiver is
  /// backlogged). `messages_unread() == 0` is the Rust-side equivalent of
  /// the original's `getMessageSN(newest()) == getMessagesRead()` check.
  fn should_send(&self, only_ready: bool) -> bool {
    !only_ready || self.queue.messages_unread() == 0
  }
}

impl<'a, const CAP: usize, const R: usize, const S: usize> EventTranslator for IpcEventTranslator<'a, CAP, R, S> {
  fn encode_event(&self, event: &dyn Event, only_ready: bool) {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0u8; 4]);
    event.save(&mut buf);
    if buf.len() == 4 {
      warn!("IpcEventTranslator::encode_event: event produced no payload, treating as a serialization failure");
      // empty-region error marker (the "serialization overflow" failure
      // mode): the receiver sees a zero-byte region rather than nothing
      // at all.
      let _ = self.post_empty_marker();
      return;
    }
    LittleEndian::write_u32(&mut buf[..4], event.class_id());

    if !self.should_send(only_ready) {
      return;
    }
    let Ok(region) = Region::create_anonymous(buf.len()) else {
      warn!("IpcEventTranslator::encode_event: failed to allocate a region for the outgoing event");
      return;
    };
    unsafe {
      std::ptr::copy_nonoverlapping(buf.as_ptr(), region.base(), buf.len());
    }
    if let Err(err) = self.queue.send_message(region) {
      warn!("IpcEventTranslator::encode_event: dropping event, send_message failed: {err}");
    }
  }
}

impl<'a, const CAP: usize, const R: usize, const S: usize> IpcEventTranslator<'a, CAP, R, S> {
  fn post_empty_marker(&self) -> crate::error::Result<()> {
    let region = Region::create_anonymous(0)?;
    self.queue.send_message(region)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::process::ProcessId;
  use crate::semaphore::SemaphoreSet;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  struct Ping(u32);
  impl Event for Ping {
    fn class_id(&self) -> ClassId {
      1
    }
    fn save(&self, buf: &mut Vec<u8>) {
      let mut tmp = [0u8; 4];
      LittleEndian::write_u32(&mut tmp, self.0);
      buf.extend_from_slice(&tmp);
    }
  }

  struct PingDecoder;
  impl EventDecoder for PingDecoder {
    fn decode(&self, payload: &[u8]) -> Option<Box<dyn Event>> {
      if payload.len() < 4 {
        return None;
      }
      Some(Box::new(Ping(LittleEndian::read_u32(payload))))
    }
  }

  fn setup() {
    ProcessId::assign_current(ProcessId::Main);
  }

  #[test]
  fn noop_translator_forwards_directly() {
    setup();
    let seen = Arc::new(AtomicU32::new(0));
    let seen2 = seen.clone();
    let translator = NoOpEventTranslator::new(move |e: &dyn Event| {
      seen2.store(e.class_id(), Ordering::SeqCst);
    });
    translator.encode_event(&Ping(7), false);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn ipc_translator_roundtrips_through_queue() {
    setup();
    let semgr = SemaphoreSet::new(16).unwrap();
    let queue: MessageQueue<4, 4, 4> = MessageQueue::new(&semgr).unwrap();
    let rcvr = queue.add_receiver();
    let translator = IpcEventTranslator::new(&queue);
    translator.encode_event(&Ping(42), false);

    let mut registry = EventRegistry::new();
    registry.register(1, Box::new(PingDecoder));

    let region = queue.read_message(queue.oldest(), rcvr).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(region.base(), region.size()) };
    let decoded = registry.decode(bytes).unwrap();
    assert_eq!(decoded.class_id(), 1);
  }

  #[test]
  fn only_ready_skips_send_when_backlogged() {
    setup();
    let semgr = SemaphoreSet::new(16).unwrap();
    let queue: MessageQueue<4, 4, 4> = MessageQueue::new(&semgr).unwrap();
    queue.add_receiver();
    let translator = IpcEventTranslator::new(&queue);
    translator.encode_event(&Ping(1), false);
    assert_eq!(queue.messages_sent(), 1);
    // now backlogged (unread == 1): an only_ready send should be skipped.
    translator.encode_event(&Ping(2), true);
    assert_eq!(queue.messages_sent(), 1);
  }

  #[test]
  fn unregistered_class_id_decodes_to_none() {
    let registry = EventRegistry::new();
    let mut buf = vec![0u8; 4];
    LittleEndian::write_u32(&mut buf, 999);
    assert!(registry.decode(&buf).is_none());
  }
}
