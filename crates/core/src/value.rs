//! Tagged values.
//!
//! [`Value`] is the payload type of the run context and of both core
//! collections. Every stored value owns its payload; dropping a value (on
//! removal, bulk clear, or replacement by a later insertion at the same key)
//! releases it exactly once through ordinary `Drop`.

use crate::art::Art;
use crate::deque::Deque;
use std::any::Any;
use std::fmt;

/// Trait for opaque owned objects stored in a [`Value`].
///
/// `describe` plays the role of a to-string callback; the destructor is the
/// type's own `Drop`.
pub trait ObjectValue: Any + Send + fmt::Debug {
    /// Human-readable rendering of the object.
    fn describe(&self) -> String {
        format!("{:?}", self)
    }

    /// Upcast for typed retrieval.
    fn as_any(&self) -> &dyn Any;
}

/// Discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Absent payload
    None,
    /// Signed integers
    I8,
    I16,
    I32,
    I64,
    /// Unsigned integers
    U8,
    U16,
    U32,
    U64,
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Boolean
    Bool,
    /// Owned string
    String,
    /// Owned byte buffer
    Bytes,
    /// Opaque owned object
    Object,
    /// Nested deque
    Deque,
    /// Nested tree
    Tree,
    /// Array of doubles
    FloatArray,
    /// Array of strings
    StringArray,
}

/// A tagged value.
#[derive(Debug)]
pub enum Value {
    /// Absent payload.
    None,
    /// 8-bit signed integer.
    I8(i8),
    /// 16-bit signed integer.
    I16(i16),
    /// 32-bit signed integer.
    I32(i32),
    /// 64-bit signed integer.
    I64(i64),
    /// 8-bit unsigned integer.
    U8(u8),
    /// 16-bit unsigned integer.
    U16(u16),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// Owned string.
    String(String),
    /// Owned byte buffer.
    Bytes(Vec<u8>),
    /// Opaque owned object with a describe hook.
    Object(Box<dyn ObjectValue>),
    /// Nested deque.
    Deque(Deque),
    /// Nested tree.
    Tree(Art),
    /// Array of doubles.
    FloatArray(Vec<f64>),
    /// Array of strings.
    StringArray(Vec<String>),
}

impl Value {
    /// Discriminant of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::None => ValueKind::None,
            Value::I8(_) => ValueKind::I8,
            Value::I16(_) => ValueKind::I16,
            Value::I32(_) => ValueKind::I32,
            Value::I64(_) => ValueKind::I64,
            Value::U8(_) => ValueKind::U8,
            Value::U16(_) => ValueKind::U16,
            Value::U32(_) => ValueKind::U32,
            Value::U64(_) => ValueKind::U64,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Bool(_) => ValueKind::Bool,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Object(_) => ValueKind::Object,
            Value::Deque(_) => ValueKind::Deque,
            Value::Tree(_) => ValueKind::Tree,
            Value::FloatArray(_) => ValueKind::FloatArray,
            Value::StringArray(_) => ValueKind::StringArray,
        }
    }

    /// Signed integer view, widening any signed width.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Unsigned integer view, widening any unsigned width.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v as u64),
            Value::U16(v) => Some(v as u64),
            Value::U32(v) => Some(v as u64),
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Floating-point view covering both widths.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v as f64),
            Value::Double(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Byte-buffer view.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Typed view of an opaque object.
    pub fn as_object<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Object(o) => o.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Nested deque view.
    pub fn as_deque(&self) -> Option<&Deque> {
        match self {
            Value::Deque(d) => Some(d),
            _ => None,
        }
    }

    /// Mutable nested deque view.
    pub fn as_deque_mut(&mut self) -> Option<&mut Deque> {
        match self {
            Value::Deque(d) => Some(d),
            _ => None,
        }
    }

    /// Nested tree view.
    pub fn as_tree(&self) -> Option<&Art> {
        match self {
            Value::Tree(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable nested tree view.
    pub fn as_tree_mut(&mut self) -> Option<&mut Art> {
        match self {
            Value::Tree(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str(""),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::Bytes(v) => write!(f, "{} bytes", v.len()),
            Value::Object(o) => f.write_str(&o.describe()),
            Value::Deque(d) => write!(f, "deque[{}]", d.len()),
            Value::Tree(t) => write!(f, "tree[{}]", t.len()),
            Value::FloatArray(v) => write!(f, "float[{}]", v.len()),
            Value::StringArray(v) => write!(f, "string[{}]", v.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ObjectValue for DropCounter {
        fn describe(&self) -> String {
            "drop-counter".to_string()
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_kind_and_accessors() {
        assert_eq!(Value::U32(7).kind(), ValueKind::U32);
        assert_eq!(Value::U32(7).as_u64(), Some(7));
        assert_eq!(Value::I16(-3).as_i64(), Some(-3));
        assert_eq!(Value::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::U32(7).as_str(), None);
    }

    #[test]
    fn test_object_downcast_and_describe() {
        let drops = Arc::new(AtomicUsize::new(0));
        let v = Value::Object(Box::new(DropCounter(drops.clone())));
        assert!(v.as_object::<DropCounter>().is_some());
        assert_eq!(v.to_string(), "drop-counter");
        drop(v);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::U64(42).to_string(), "42");
        assert_eq!(Value::Bytes(vec![0; 10]).to_string(), "10 bytes");
        assert_eq!(Value::None.to_string(), "");
    }
}
