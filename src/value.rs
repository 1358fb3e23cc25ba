//! Dynamic payloads exchanged between callers and workers, and the
//! structured clone that runs on the sending side of every channel hop.

use crate::errors::Exception;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    future::Future,
    sync::Arc,
};

const DETACHED: &str = "DataCloneError: An ArrayBuffer is detached and could not be cloned.";
const DUPLICATE_TRANSFER: &str =
    "DataCloneError: ArrayBuffer occurs more than once in the transfer list.";
const FUNCTION_CLONE: &str = "DataCloneError: A function could not be cloned.";

/// Byte buffer whose contents can be moved out, leaving it detached.
///
/// Clones share the same underlying storage, so detaching one clone
/// detaches all of them.
#[derive(Clone)]
pub struct ArrayBuffer {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl ArrayBuffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Some(bytes.into()))),
        }
    }

    /// Zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Byte length; 0 once detached.
    pub fn len(&self) -> usize {
        self.bytes.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_detached(&self) -> bool {
        self.bytes.lock().is_none()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone().unwrap_or_default()
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.bytes.lock();
        f(guard.as_deref().unwrap_or_default())
    }

    pub fn same_buffer(&self, other: &ArrayBuffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.bytes) as usize
    }

    fn detach(&self) -> Option<Vec<u8>> {
        self.bytes.lock().take()
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bytes.lock().as_ref() {
            Some(bytes) => write!(f, "ArrayBuffer({} bytes)", bytes.len()),
            None => f.write_str("ArrayBuffer(detached)"),
        }
    }
}

impl PartialEq for ArrayBuffer {
    fn eq(&self, other: &Self) -> bool {
        if self.same_buffer(other) {
            return true;
        }
        *self.bytes.lock() == *other.bytes.lock()
    }
}

pub type CallbackFn =
    dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, Exception>> + Send + Sync;

/// A callable passed as an argument. Worker-side, callables received from
/// the caller are thunks that round-trip through the manager.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Exception>> + Send + 'static,
    {
        Self(Arc::new(move |args| f(args).boxed()))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self(Arc::new(move |args| {
            let f = Arc::clone(&f);
            async move { f(args) }.boxed()
        }))
    }

    pub(crate) fn from_raw(f: Arc<CallbackFn>) -> Self {
        Self(f)
    }

    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, Exception>> {
        (self.0)(args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

impl PartialEq for Callback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Buffer(ArrayBuffer),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Function(Callback),
}

impl Value {
    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Exception>> + Send + 'static,
    {
        Value::Function(Callback::new(f))
    }

    pub fn sync_function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        Value::Function(Callback::from_fn(f))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integral numbers only.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&ArrayBuffer> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Callback> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }
}

macro_rules! number_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(n: $ty) -> Self {
                Value::Number(n as f64)
            }
        })*
    };
}

number_from!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<ArrayBuffer> for Value {
    fn from(buffer: ArrayBuffer) -> Self {
        Value::Buffer(buffer)
    }
}

impl From<Callback> for Value {
    fn from(f: Callback) -> Self {
        Value::Function(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Structured clone of `values` for the other side of a channel.
///
/// Buffers named in `transfer_list` are moved and detached at the source,
/// every other buffer is copied. A buffer referenced several times comes out
/// as a single shared buffer. Nothing is detached when cloning fails.
pub(crate) fn marshal(
    values: Vec<Value>,
    transfer_list: &[ArrayBuffer],
) -> Result<Vec<Value>, Exception> {
    let mut transfer = HashSet::with_capacity(transfer_list.len());
    for buffer in transfer_list {
        if buffer.is_detached() {
            return Err(Exception::new(DETACHED));
        }
        if !transfer.insert(buffer.id()) {
            return Err(Exception::new(DUPLICATE_TRANSFER));
        }
    }
    for value in &values {
        validate(value)?;
    }

    let mut cloner = Cloner {
        transfer: &transfer,
        cloned: HashMap::new(),
    };
    let cloned = values.into_iter().map(|value| cloner.clone_value(value)).collect();

    // Listed buffers the payload never referenced are detached all the same.
    for buffer in transfer_list {
        if !cloner.cloned.contains_key(&buffer.id()) {
            buffer.detach();
        }
    }
    Ok(cloned)
}

pub(crate) fn marshal_one(value: Value, transfer_list: &[ArrayBuffer]) -> Result<Value, Exception> {
    Ok(marshal(vec![value], transfer_list)?.pop().unwrap_or_default())
}

fn validate(value: &Value) -> Result<(), Exception> {
    match value {
        Value::Function(_) => Err(Exception::new(FUNCTION_CLONE)),
        Value::Buffer(buffer) if buffer.is_detached() => Err(Exception::new(DETACHED)),
        Value::Array(items) => items.iter().try_for_each(validate),
        Value::Object(map) => map.values().try_for_each(validate),
        _ => Ok(()),
    }
}

struct Cloner<'a> {
    transfer: &'a HashSet<usize>,
    cloned: HashMap<usize, ArrayBuffer>,
}

impl Cloner<'_> {
    fn clone_value(&mut self, value: Value) -> Value {
        match value {
            Value::Buffer(buffer) => Value::Buffer(self.clone_buffer(&buffer)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.clone_value(item)).collect())
            }
            Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, self.clone_value(v))).collect())
            }
            // rejected by `validate`
            Value::Function(_) => Value::Null,
            other => other,
        }
    }

    fn clone_buffer(&mut self, buffer: &ArrayBuffer) -> ArrayBuffer {
        let id = buffer.id();
        if let Some(clone) = self.cloned.get(&id) {
            return clone.clone();
        }
        let clone = if self.transfer.contains(&id) {
            ArrayBuffer::new(buffer.detach().unwrap_or_default())
        } else {
            ArrayBuffer::new(buffer.to_vec())
        };
        self.cloned.insert(id, clone.clone());
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_moves_and_detaches() {
        let buffer = ArrayBuffer::new(b"hello".to_vec());
        let out = marshal_one(Value::Buffer(buffer.clone()), &[buffer.clone()]).unwrap();

        assert!(buffer.is_detached());
        assert_eq!(buffer.len(), 0);
        let moved = out.as_buffer().unwrap();
        assert!(!moved.same_buffer(&buffer));
        assert_eq!(moved.to_vec(), b"hello");
    }

    #[test]
    fn untransferred_buffers_are_copied() {
        let buffer = ArrayBuffer::new(vec![1, 2, 3]);
        let out = marshal_one(Value::Buffer(buffer.clone()), &[]).unwrap();

        assert!(!buffer.is_detached());
        assert_eq!(buffer.len(), 3);
        assert!(!out.as_buffer().unwrap().same_buffer(&buffer));
        assert_eq!(out, Value::Buffer(ArrayBuffer::new(vec![1, 2, 3])));
    }

    #[test]
    fn shared_references_stay_shared() {
        let buffer = ArrayBuffer::new(vec![9; 4]);
        let payload = Value::Array(vec![
            Value::Buffer(buffer.clone()),
            Value::Buffer(buffer.clone()),
        ]);
        let out = marshal_one(payload, &[]).unwrap();

        let items = out.as_array().unwrap();
        assert!(items[0].as_buffer().unwrap().same_buffer(items[1].as_buffer().unwrap()));
    }

    #[test]
    fn nested_function_fails_without_detaching() {
        let buffer = ArrayBuffer::new(vec![1]);
        let mut map = BTreeMap::new();
        map.insert("data".to_owned(), Value::Buffer(buffer.clone()));
        map.insert("f".to_owned(), Value::sync_function(|_| Ok(Value::Null)));

        let err = marshal(vec![Value::Object(map)], &[buffer.clone()]).unwrap_err();
        assert_eq!(err.message(), FUNCTION_CLONE);
        assert!(!buffer.is_detached());
    }

    #[test]
    fn bad_transfer_lists() {
        let buffer = ArrayBuffer::new(vec![1]);
        let err = marshal(vec![], &[buffer.clone(), buffer.clone()]).unwrap_err();
        assert_eq!(err.message(), DUPLICATE_TRANSFER);

        marshal(vec![], &[buffer.clone()]).unwrap();
        assert!(buffer.is_detached(), "listed buffers are detached even when unreferenced");

        let err = marshal(vec![], &[buffer.clone()]).unwrap_err();
        assert_eq!(err.message(), DETACHED);
        let err = marshal(vec![Value::Buffer(buffer)], &[]).unwrap_err();
        assert_eq!(err.message(), DETACHED);
    }

    #[test]
    fn from_json() {
        let value = Value::from(serde_json::json!({ "a": [1, "two", null], "b": true }));
        let a = value.get("a").unwrap().as_array().unwrap();
        assert_eq!(a[0].as_i64(), Some(1));
        assert_eq!(a[1].as_str(), Some("two"));
        assert!(a[2].is_null());
        assert_eq!(value.get("b").and_then(Value::as_bool), Some(true));
    }
}
