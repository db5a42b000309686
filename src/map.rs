//! The typed property map.
//!
//! A [`Map`] is an ordered mapping from string keys to homogeneous typed
//! arrays. Maps carry every inter-boundary argument in the engine: plugin
//! invocation arguments, filter results, and per-frame metadata. Arrays are
//! reference-counted and copy-on-write, so cloning a map is cheap and two
//! clones can diverge without copying until one of them is mutated.
//!
//! A map can also carry an error string. Once set, the map is considered
//! error-bearing: reads return [`PropError::MapError`] instead of values.

use crate::frame::FrameRef;
use crate::node::Node;
use crate::{Core, Error, Result};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// How a setter combines with an existing value under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMode {
    /// Discard any prior value and store a fresh single-element array.
    Replace,
    /// Append to an existing array of the same type; error on mismatch.
    Append,
}

/// Interpretation hint attached to each byte-string element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataTypeHint {
    /// No declared interpretation.
    #[default]
    Unknown,
    /// Arbitrary binary bytes.
    Binary,
    /// Valid UTF-8 text.
    Utf8,
}

/// One byte-string element with its interpretation hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    /// Interpretation hint.
    pub hint: DataTypeHint,
    /// The bytes.
    pub data: Vec<u8>,
}

/// A callable value stored in a map.
///
/// Functions take an argument map and write results (or an error) into an
/// output map, mirroring the plugin invocation surface.
#[derive(Clone)]
pub struct FuncRef {
    inner: Arc<FuncInner>,
}

struct FuncInner {
    #[allow(clippy::type_complexity)]
    call: Box<dyn Fn(&Map, &mut Map, &Core) + Send + Sync>,
}

impl FuncRef {
    /// Wrap a callable.
    pub fn new(f: impl Fn(&Map, &mut Map, &Core) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(FuncInner { call: Box::new(f) }),
        }
    }

    /// Invoke the function.
    pub fn call(&self, args: &Map, out: &mut Map, core: &Core) {
        (self.inner.call)(args, out, core);
    }
}

impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncRef").finish_non_exhaustive()
    }
}

/// The type of the array stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// No value stored.
    Unset,
    /// 64-bit signed integers.
    Int,
    /// 64-bit floats.
    Float,
    /// Byte strings.
    Data,
    /// Video node references.
    VideoNode,
    /// Audio node references.
    AudioNode,
    /// Video frame references.
    VideoFrame,
    /// Audio frame references.
    AudioFrame,
    /// Function references.
    Function,
}

/// Why a typed read failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropError {
    /// The key is not present.
    #[error("key is not set")]
    Unset,
    /// The stored array has a different type than requested.
    #[error("stored type does not match the requested type")]
    WrongType,
    /// The element index is out of range for the stored array.
    #[error("index out of range")]
    Index,
    /// The map carries an error string; values are unreadable.
    #[error("map has an error set")]
    MapError,
}

#[derive(Clone, Debug)]
enum Value {
    Int(Arc<Vec<i64>>),
    Float(Arc<Vec<f64>>),
    Data(Arc<Vec<DataItem>>),
    VideoNode(Arc<Vec<Node>>),
    AudioNode(Arc<Vec<Node>>),
    VideoFrame(Arc<Vec<FrameRef>>),
    AudioFrame(Arc<Vec<FrameRef>>),
    Function(Arc<Vec<FuncRef>>),
}

impl Value {
    fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Data(_) => ValueType::Data,
            Value::VideoNode(_) => ValueType::VideoNode,
            Value::AudioNode(_) => ValueType::AudioNode,
            Value::VideoFrame(_) => ValueType::VideoFrame,
            Value::AudioFrame(_) => ValueType::AudioFrame,
            Value::Function(_) => ValueType::Function,
        }
    }

    fn len(&self) -> usize {
        match self {
            Value::Int(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Data(v) => v.len(),
            Value::VideoNode(v) => v.len(),
            Value::AudioNode(v) => v.len(),
            Value::VideoFrame(v) => v.len(),
            Value::AudioFrame(v) => v.len(),
            Value::Function(v) => v.len(),
        }
    }
}

/// Ordered, typed key→array container. See the module docs.
#[derive(Clone, Debug, Default)]
pub struct Map {
    entries: Vec<(String, Value)>,
    error: Option<String>,
}

fn valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Map {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every key and any error string.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.error = None;
    }

    /// Set the error string, discarding all stored values.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.entries.clear();
        self.error = Some(message.into());
    }

    /// The error string, if the map is error-bearing.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The key at insertion-order position `index`.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(k, _)| k.as_str())
    }

    /// Number of elements stored under `key`, or `None` if absent.
    pub fn num_elements(&self, key: &str) -> Option<usize> {
        self.find(key).map(Value::len)
    }

    /// Type of the array stored under `key`.
    pub fn value_type(&self, key: &str) -> ValueType {
        self.find(key).map_or(ValueType::Unset, Value::value_type)
    }

    /// Remove `key`. Returns `true` if it was present.
    pub fn delete_key(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    fn find(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn checked_find(&self, key: &str) -> std::result::Result<&Value, PropError> {
        if self.error.is_some() {
            return Err(PropError::MapError);
        }
        self.find(key).ok_or(PropError::Unset)
    }

    fn insert(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.find_mut(key) {
            *slot = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    fn check_key(key: &str) -> Result<()> {
        if valid_key(key) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!("invalid map key {key:?}")))
        }
    }
}

/// Implements the per-type get/set/append trio for one array variant.
macro_rules! typed_accessors {
    ($get:ident, $get_all:ident, $set:ident, $variant:ident, $ty:ty, $name:literal) => {
        /// Read one element of the
        #[doc = $name]
        /// array under `key`.
        pub fn $get(&self, key: &str, index: usize) -> std::result::Result<$ty, PropError> {
            match self.checked_find(key)? {
                Value::$variant(v) => v.get(index).cloned().ok_or(PropError::Index),
                _ => Err(PropError::WrongType),
            }
        }

        /// Read the whole
        #[doc = $name]
        /// array under `key`.
        pub fn $get_all(&self, key: &str) -> std::result::Result<&[$ty], PropError> {
            match self.checked_find(key)? {
                Value::$variant(v) => Ok(v.as_slice()),
                _ => Err(PropError::WrongType),
            }
        }

        /// Store one
        #[doc = $name]
        /// element under `key` with the given append mode.
        pub fn $set(&mut self, key: &str, value: $ty, mode: AppendMode) -> Result<()> {
            Self::check_key(key)?;
            match mode {
                AppendMode::Replace => {
                    self.insert(key, Value::$variant(Arc::new(vec![value])));
                    Ok(())
                }
                AppendMode::Append => match self.find_mut(key) {
                    Some(Value::$variant(v)) => {
                        Arc::make_mut(v).push(value);
                        Ok(())
                    }
                    Some(_) => Err(Error::InvalidArgument(format!(
                        "append to key {key:?} with mismatched type"
                    ))),
                    None => {
                        self.insert(key, Value::$variant(Arc::new(vec![value])));
                        Ok(())
                    }
                },
            }
        }
    };
}

impl Map {
    typed_accessors!(get_int, get_ints, set_int, Int, i64, "int");
    typed_accessors!(get_float, get_floats, set_float, Float, f64, "float");
    typed_accessors!(get_function, get_functions, set_function, Function, FuncRef, "function");

    /// Replace `key` with the whole int vector in one operation.
    pub fn set_int_array(&mut self, key: &str, values: &[i64]) -> Result<()> {
        Self::check_key(key)?;
        self.insert(key, Value::Int(Arc::new(values.to_vec())));
        Ok(())
    }

    /// Replace `key` with the whole float vector in one operation.
    pub fn set_float_array(&mut self, key: &str, values: &[f64]) -> Result<()> {
        Self::check_key(key)?;
        self.insert(key, Value::Float(Arc::new(values.to_vec())));
        Ok(())
    }

    /// Read one int, mapping an absent key to `None`.
    pub fn get_int_opt(&self, key: &str, index: usize) -> std::result::Result<Option<i64>, PropError> {
        match self.get_int(key, index) {
            Ok(v) => Ok(Some(v)),
            Err(PropError::Unset) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read one float, mapping an absent key to `None`.
    pub fn get_float_opt(
        &self,
        key: &str,
        index: usize,
    ) -> std::result::Result<Option<f64>, PropError> {
        match self.get_float(key, index) {
            Ok(v) => Ok(Some(v)),
            Err(PropError::Unset) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read one byte-string element.
    pub fn get_data(&self, key: &str, index: usize) -> std::result::Result<&[u8], PropError> {
        match self.checked_find(key)? {
            Value::Data(v) => v.get(index).map(|d| d.data.as_slice()).ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    /// Read one byte-string element as UTF-8, if its bytes are valid.
    pub fn get_utf8(&self, key: &str, index: usize) -> std::result::Result<&str, PropError> {
        let data = self.get_data(key, index)?;
        std::str::from_utf8(data).map_err(|_| PropError::WrongType)
    }

    /// Read the interpretation hint of one byte-string element.
    pub fn get_data_hint(
        &self,
        key: &str,
        index: usize,
    ) -> std::result::Result<DataTypeHint, PropError> {
        match self.checked_find(key)? {
            Value::Data(v) => v.get(index).map(|d| d.hint).ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    /// Store a byte-string element under `key`.
    pub fn set_data(
        &mut self,
        key: &str,
        data: &[u8],
        hint: DataTypeHint,
        mode: AppendMode,
    ) -> Result<()> {
        Self::check_key(key)?;
        let item = DataItem {
            hint,
            data: data.to_vec(),
        };
        match mode {
            AppendMode::Replace => {
                self.insert(key, Value::Data(Arc::new(vec![item])));
                Ok(())
            }
            AppendMode::Append => match self.find_mut(key) {
                Some(Value::Data(v)) => {
                    Arc::make_mut(v).push(item);
                    Ok(())
                }
                Some(_) => Err(Error::InvalidArgument(format!(
                    "append to key {key:?} with mismatched type"
                ))),
                None => {
                    self.insert(key, Value::Data(Arc::new(vec![item])));
                    Ok(())
                }
            },
        }
    }

    /// Store a UTF-8 string element under `key`.
    pub fn set_utf8(&mut self, key: &str, text: &str, mode: AppendMode) -> Result<()> {
        self.set_data(key, text.as_bytes(), DataTypeHint::Utf8, mode)
    }

    /// Store a node under `key`; the array type follows the node's stream
    /// kind (video or audio).
    pub fn set_node(&mut self, key: &str, node: &Node, mode: AppendMode) -> Result<()> {
        Self::check_key(key)?;
        let is_video = node.is_video();
        let matches = |v: &Value| {
            matches!(
                (v, is_video),
                (Value::VideoNode(_), true) | (Value::AudioNode(_), false)
            )
        };
        let fresh = |node: Node| {
            if is_video {
                Value::VideoNode(Arc::new(vec![node]))
            } else {
                Value::AudioNode(Arc::new(vec![node]))
            }
        };
        match mode {
            AppendMode::Replace => {
                self.insert(key, fresh(node.clone()));
                Ok(())
            }
            AppendMode::Append => match self.find_mut(key) {
                Some(v) if matches(v) => {
                    match v {
                        Value::VideoNode(arr) | Value::AudioNode(arr) => {
                            Arc::make_mut(arr).push(node.clone());
                        }
                        _ => unreachable!(),
                    }
                    Ok(())
                }
                Some(_) => Err(Error::InvalidArgument(format!(
                    "append to key {key:?} with mismatched type"
                ))),
                None => {
                    self.insert(key, fresh(node.clone()));
                    Ok(())
                }
            },
        }
    }

    /// Read one node regardless of stream kind.
    pub fn get_node(&self, key: &str, index: usize) -> std::result::Result<Node, PropError> {
        match self.checked_find(key)? {
            Value::VideoNode(v) | Value::AudioNode(v) => {
                v.get(index).cloned().ok_or(PropError::Index)
            }
            _ => Err(PropError::WrongType),
        }
    }

    /// Read one video node.
    pub fn get_video_node(&self, key: &str, index: usize) -> std::result::Result<Node, PropError> {
        match self.checked_find(key)? {
            Value::VideoNode(v) => v.get(index).cloned().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    /// Read one audio node.
    pub fn get_audio_node(&self, key: &str, index: usize) -> std::result::Result<Node, PropError> {
        match self.checked_find(key)? {
            Value::AudioNode(v) => v.get(index).cloned().ok_or(PropError::Index),
            _ => Err(PropError::WrongType),
        }
    }

    /// Read all nodes stored under `key`, regardless of stream kind.
    pub fn get_nodes(&self, key: &str) -> std::result::Result<&[Node], PropError> {
        match self.checked_find(key)? {
            Value::VideoNode(v) | Value::AudioNode(v) => Ok(v.as_slice()),
            _ => Err(PropError::WrongType),
        }
    }

    /// Store a frame under `key`; the array type follows the frame's kind.
    pub fn set_frame(&mut self, key: &str, frame: &FrameRef, mode: AppendMode) -> Result<()> {
        Self::check_key(key)?;
        let is_video = frame.is_video();
        let fresh = |frame: FrameRef| {
            if is_video {
                Value::VideoFrame(Arc::new(vec![frame]))
            } else {
                Value::AudioFrame(Arc::new(vec![frame]))
            }
        };
        match mode {
            AppendMode::Replace => {
                self.insert(key, fresh(frame.clone()));
                Ok(())
            }
            AppendMode::Append => match self.find_mut(key) {
                Some(Value::VideoFrame(arr)) if is_video => {
                    Arc::make_mut(arr).push(frame.clone());
                    Ok(())
                }
                Some(Value::AudioFrame(arr)) if !is_video => {
                    Arc::make_mut(arr).push(frame.clone());
                    Ok(())
                }
                Some(_) => Err(Error::InvalidArgument(format!(
                    "append to key {key:?} with mismatched type"
                ))),
                None => {
                    self.insert(key, fresh(frame.clone()));
                    Ok(())
                }
            },
        }
    }

    /// Read one frame. Video and audio frames are both accepted; the
    /// returned reference follows the stored array's actual type.
    pub fn get_frame(&self, key: &str, index: usize) -> std::result::Result<FrameRef, PropError> {
        match self.checked_find(key)? {
            Value::VideoFrame(v) | Value::AudioFrame(v) => {
                v.get(index).cloned().ok_or(PropError::Index)
            }
            _ => Err(PropError::WrongType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let mut map = Map::new();
        map.set_int("answer", 42, AppendMode::Replace).unwrap();
        assert_eq!(map.get_int("answer", 0), Ok(42));

        map.set_float("pi", 3.25, AppendMode::Replace).unwrap();
        assert_eq!(map.get_float("pi", 0), Ok(3.25));

        map.set_utf8("name", "vantage", AppendMode::Replace).unwrap();
        assert_eq!(map.get_utf8("name", 0), Ok("vantage"));
        assert_eq!(map.get_data_hint("name", 0), Ok(DataTypeHint::Utf8));
    }

    #[test]
    fn test_append_sequences() {
        let mut map = Map::new();
        for i in 0..5 {
            map.set_int("seq", i, AppendMode::Append).unwrap();
        }
        assert_eq!(map.get_ints("seq").unwrap(), &[0, 1, 2, 3, 4]);
        assert_eq!(map.num_elements("seq"), Some(5));

        // Replace collapses back to one element.
        map.set_int("seq", 9, AppendMode::Replace).unwrap();
        assert_eq!(map.get_ints("seq").unwrap(), &[9]);
    }

    #[test]
    fn test_wrong_type_read_does_not_mutate() {
        let mut map = Map::new();
        map.set_int("k", 1, AppendMode::Replace).unwrap();
        assert_eq!(map.get_float("k", 0), Err(PropError::WrongType));
        assert_eq!(map.get_int("k", 0), Ok(1));
    }

    #[test]
    fn test_append_type_mismatch_is_error() {
        let mut map = Map::new();
        map.set_int("k", 1, AppendMode::Replace).unwrap();
        assert!(map.set_float("k", 2.0, AppendMode::Append).is_err());
        assert_eq!(map.value_type("k"), ValueType::Int);
    }

    #[test]
    fn test_key_validation() {
        let mut map = Map::new();
        assert!(map.set_int("_ok_1", 1, AppendMode::Replace).is_ok());
        assert!(map.set_int("", 1, AppendMode::Replace).is_err());
        assert!(map.set_int("1bad", 1, AppendMode::Replace).is_err());
        assert!(map.set_int("no-dash", 1, AppendMode::Replace).is_err());
        assert!(map.set_int("no space", 1, AppendMode::Replace).is_err());
    }

    #[test]
    fn test_key_order_and_delete() {
        let mut map = Map::new();
        map.set_int("a", 1, AppendMode::Replace).unwrap();
        map.set_int("b", 2, AppendMode::Replace).unwrap();
        map.set_int("c", 3, AppendMode::Replace).unwrap();
        assert_eq!(map.key(1), Some("b"));

        assert!(map.delete_key("b"));
        assert!(!map.delete_key("b"));
        assert_eq!(map.key(1), Some("c"));
        assert_eq!(map.num_elements("b"), None);
    }

    #[test]
    fn test_error_bearing_map() {
        let mut map = Map::new();
        map.set_int("k", 1, AppendMode::Replace).unwrap();
        map.set_error("boom");

        assert_eq!(map.error(), Some("boom"));
        assert_eq!(map.get_int("k", 0), Err(PropError::MapError));
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_index_out_of_range() {
        let mut map = Map::new();
        map.set_int("k", 1, AppendMode::Replace).unwrap();
        assert_eq!(map.get_int("k", 1), Err(PropError::Index));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a = Map::new();
        a.set_int_array("v", &[1, 2, 3]).unwrap();
        let mut b = a.clone();

        b.set_int("v", 4, AppendMode::Append).unwrap();
        assert_eq!(a.get_ints("v").unwrap(), &[1, 2, 3]);
        assert_eq!(b.get_ints("v").unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_bulk_setters() {
        let mut map = Map::new();
        map.set_float_array("w", &[0.5, 1.5]).unwrap();
        assert_eq!(map.get_floats("w").unwrap(), &[0.5, 1.5]);
        assert_eq!(map.get_float_opt("missing", 0), Ok(None));
    }
}
