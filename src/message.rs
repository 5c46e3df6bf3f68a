//! Messages and their typed properties.
//!
//! A `Message` is mutable until the broker assigns its id and seals it into
//! a `ServerMessage`, which is shared by every reference routed from it.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec::{self, Reader};
use crate::{Error, Result};

/// Highest priority; priorities run 0..=9.
pub const MAX_PRIORITY: u8 = 9;

pub const DEFAULT_PRIORITY: u8 = 4;

/// Queue a dead-lettered or expired copy was taken from.
pub const HDR_ORIGINAL_QUEUE: &str = "_courier.original_queue";
/// Id of the message a dead-lettered or expired copy was taken from.
pub const HDR_ORIGINAL_MESSAGE_ID: &str = "_courier.original_message_id";
/// Expiration time of the original of an expired copy.
pub const HDR_ACTUAL_EXPIRY_TIME: &str = "_courier.actual_expiry";
/// Earliest delivery time in epoch milliseconds.
pub const HDR_SCHEDULED_DELIVERY_TIME: &str = "_courier.scheduled_delivery";

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    fn tag(&self) -> u8 {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Byte(_) => 2,
            PropertyValue::Short(_) => 3,
            PropertyValue::Int(_) => 4,
            PropertyValue::Long(_) => 5,
            PropertyValue::Float(_) => 6,
            PropertyValue::Double(_) => 7,
            PropertyValue::String(_) => 8,
            PropertyValue::Bytes(_) => 9,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Byte(v) => Some(i64::from(*v)),
            PropertyValue::Short(v) => Some(i64::from(*v)),
            PropertyValue::Int(v) => Some(i64::from(*v)),
            PropertyValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        codec::put_u8(buf, self.tag());
        match self {
            PropertyValue::Bool(v) => codec::put_bool(buf, *v),
            PropertyValue::Byte(v) => buf.push(*v as u8),
            PropertyValue::Short(v) => buf.extend_from_slice(&v.to_le_bytes()),
            PropertyValue::Int(v) => codec::put_i32(buf, *v),
            PropertyValue::Long(v) => codec::put_i64(buf, *v),
            PropertyValue::Float(v) => codec::put_u32(buf, v.to_bits()),
            PropertyValue::Double(v) => codec::put_u64(buf, v.to_bits()),
            PropertyValue::String(v) => codec::put_str(buf, v),
            PropertyValue::Bytes(v) => codec::put_bytes(buf, v),
        }
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        Ok(match reader.u8()? {
            1 => PropertyValue::Bool(reader.bool()?),
            2 => PropertyValue::Byte(reader.u8()? as i8),
            3 => {
                let lo = reader.u8()?;
                let hi = reader.u8()?;
                PropertyValue::Short(i16::from_le_bytes([lo, hi]))
            }
            4 => PropertyValue::Int(reader.i32()?),
            5 => PropertyValue::Long(reader.i64()?),
            6 => PropertyValue::Float(f32::from_bits(reader.u32()?)),
            7 => PropertyValue::Double(f64::from_bits(reader.u64()?)),
            8 => PropertyValue::String(reader.string()?),
            9 => PropertyValue::Bytes(reader.bytes()?),
            _ => return Err(Error::Corrupt("unknown property type")),
        })
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            PropertyValue::Bool(_) | PropertyValue::Byte(_) => 1,
            PropertyValue::Short(_) => 2,
            PropertyValue::Int(_) | PropertyValue::Float(_) => 4,
            PropertyValue::Long(_) | PropertyValue::Double(_) => 8,
            PropertyValue::String(v) => 4 + v.len(),
            PropertyValue::Bytes(v) => 4 + v.len(),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Long(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

/// Named, typed message properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedProperties {
    values: BTreeMap<String, PropertyValue>,
}

impl TypedProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.values.iter()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        codec::put_u32(buf, self.values.len() as u32);
        for (key, value) in &self.values {
            codec::put_str(buf, key);
            value.encode(buf);
        }
    }

    pub(crate) fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let count = reader.u32()?;
        let mut values = BTreeMap::new();
        for _ in 0..count {
            let key = reader.string()?;
            values.insert(key, PropertyValue::decode(reader)?);
        }
        Ok(Self { values })
    }

    fn encoded_len(&self) -> usize {
        4 + self
            .values
            .iter()
            .map(|(k, v)| 4 + k.len() + v.encoded_len())
            .sum::<usize>()
    }
}

/// A message as produced by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: u64,
    address: String,
    durable: bool,
    expiration: u64,
    timestamp: u64,
    priority: u8,
    large: bool,
    body_size: u64,
    properties: TypedProperties,
    body: Vec<u8>,
}

impl Message {
    pub fn new(address: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            id: 0,
            address: address.into(),
            durable: false,
            expiration: 0,
            timestamp: 0,
            priority: DEFAULT_PRIORITY,
            large: false,
            body_size: body.len() as u64,
            properties: TypedProperties::new(),
            body,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Priorities above 9 are clamped.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Absolute expiration in epoch milliseconds; 0 never expires.
    pub fn expiration(mut self, expiration: u64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.put(key, value);
        self
    }

    /// Deliver no earlier than `time` (epoch milliseconds).
    pub fn scheduled_delivery_time(self, time: u64) -> Self {
        self.property(HDR_SCHEDULED_DELIVERY_TIME, PropertyValue::Long(time as i64))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn set_durable(&mut self, durable: bool) {
        self.durable = durable;
    }

    pub fn get_expiration(&self) -> u64 {
        self.expiration
    }

    pub fn get_timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn get_priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority.min(MAX_PRIORITY);
    }

    pub fn properties(&self) -> &TypedProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut TypedProperties {
        &mut self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_large(&self) -> bool {
        self.large
    }

    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    pub(crate) fn mark_large(&mut self, body_size: u64) {
        self.large = true;
        self.body_size = body_size;
        self.body.clear();
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expiration != 0 && now_millis >= self.expiration
    }

    pub fn get_scheduled_delivery_time(&self) -> Option<u64> {
        self.properties
            .get(HDR_SCHEDULED_DELIVERY_TIME)
            .and_then(PropertyValue::as_i64)
            .and_then(|t| u64::try_from(t).ok())
    }

    /// Copy for the dead-letter address: new id, never expires, tagged with
    /// its origin.
    pub fn copy_for_dead_letter(&self, new_id: u64, original_queue: &str) -> Message {
        let mut copy = self.clone();
        copy.id = new_id;
        copy.expiration = 0;
        copy.properties.remove(HDR_SCHEDULED_DELIVERY_TIME);
        copy.properties.put(HDR_ORIGINAL_QUEUE, original_queue);
        copy.properties
            .put(HDR_ORIGINAL_MESSAGE_ID, PropertyValue::Long(self.id as i64));
        copy
    }

    /// Copy for the expiry address, also recording when the original
    /// expired.
    pub fn copy_for_expiry(&self, new_id: u64, original_queue: &str) -> Message {
        let mut copy = self.copy_for_dead_letter(new_id, original_queue);
        copy.properties.put(
            HDR_ACTUAL_EXPIRY_TIME,
            PropertyValue::Long(self.expiration as i64),
        );
        copy
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encode_size());
        codec::put_u64(&mut buf, self.id);
        codec::put_str(&mut buf, &self.address);
        codec::put_bool(&mut buf, self.durable);
        codec::put_u64(&mut buf, self.expiration);
        codec::put_u64(&mut buf, self.timestamp);
        codec::put_u8(&mut buf, self.priority);
        codec::put_bool(&mut buf, self.large);
        codec::put_u64(&mut buf, self.body_size);
        self.properties.encode(&mut buf);
        codec::put_bytes(&mut buf, &self.body);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        Self::decode_from(&mut reader)
    }

    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let id = reader.u64()?;
        let address = reader.string()?;
        let durable = reader.bool()?;
        let expiration = reader.u64()?;
        let timestamp = reader.u64()?;
        let priority = reader.u8()?.min(MAX_PRIORITY);
        let large = reader.bool()?;
        let body_size = reader.u64()?;
        let properties = TypedProperties::decode(reader)?;
        let body = reader.bytes()?;
        Ok(Self {
            id,
            address,
            durable,
            expiration,
            timestamp,
            priority,
            large,
            body_size,
            properties,
            body,
        })
    }

    /// Bytes `encode` produces; also the size charged against an address.
    pub fn encode_size(&self) -> usize {
        8 + 4
            + self.address.len()
            + 1
            + 8
            + 8
            + 1
            + 1
            + 8
            + self.properties.encoded_len()
            + 4
            + self.body.len()
    }
}

/// A routed message shared by all of its references.
#[derive(Debug)]
pub struct ServerMessage {
    message: Message,
    ref_count: AtomicUsize,
    durable_ref_count: AtomicUsize,
}

pub type MessageHandle = Arc<ServerMessage>;

impl ServerMessage {
    pub fn new(message: Message) -> MessageHandle {
        Arc::new(Self {
            message,
            ref_count: AtomicUsize::new(0),
            durable_ref_count: AtomicUsize::new(0),
        })
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn durable_ref_count(&self) -> usize {
        self.durable_ref_count.load(Ordering::SeqCst)
    }

    pub(crate) fn increment_refs(&self, durable: bool) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        if durable {
            self.durable_ref_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Returns the remaining reference count.
    pub(crate) fn decrement_refs(&self, durable: bool) -> usize {
        if durable {
            let _ = self
                .durable_ref_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
        match self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }
}

impl Deref for ServerMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_size_matches_encoding() {
        let msg = Message::new("orders", b"body".to_vec())
            .durable(true)
            .priority(7)
            .expiration(99)
            .property("region", "eu")
            .property("qty", 12i32)
            .property("ratio", 0.5f64);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), msg.encode_size());
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn priority_is_clamped() {
        assert_eq!(Message::new("a", Vec::new()).priority(42).get_priority(), 9);
    }

    #[test]
    fn dead_letter_copy_carries_origin() {
        let mut msg = Message::new("orders", b"x".to_vec()).expiration(5);
        msg.set_id(17);
        let copy = msg.copy_for_expiry(18, "orders.q");
        assert_eq!(copy.id(), 18);
        assert_eq!(copy.get_expiration(), 0);
        assert_eq!(
            copy.properties().get(HDR_ORIGINAL_QUEUE),
            Some(&PropertyValue::String("orders.q".into()))
        );
        assert_eq!(
            copy.properties().get(HDR_ORIGINAL_MESSAGE_ID),
            Some(&PropertyValue::Long(17))
        );
        assert_eq!(
            copy.properties().get(HDR_ACTUAL_EXPIRY_TIME),
            Some(&PropertyValue::Long(5))
        );
    }

    #[test]
    fn expiry_check() {
        let msg = Message::new("a", Vec::new()).expiration(100);
        assert!(!msg.is_expired(99));
        assert!(msg.is_expired(100));
        assert!(!Message::new("a", Vec::new()).is_expired(u64::MAX));
    }

    #[test]
    fn ref_counts_never_underflow() {
        let handle = ServerMessage::new(Message::new("a", Vec::new()));
        handle.increment_refs(true);
        assert_eq!(handle.decrement_refs(true), 0);
        assert_eq!(handle.decrement_refs(true), 0);
        assert_eq!(handle.durable_ref_count(), 0);
    }
}
