use std::fmt;

/// A bencode value.
///
/// Byte strings are compared, ordered and hashed byte by byte: DHT payloads are mostly raw
/// identifiers and addresses, not text.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// A byte string (may or may not be valid UTF-8).
    Bytes(Vec<u8>),
    /// A signed 64-bit integer.
    Integer(i64),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys, kept in insertion order.
    Dict(Dictionary),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dictionary> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<Dictionary> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(bytes) => fmt_bytes(bytes, f),
            Value::Integer(i) => write!(f, "{}", i),
            Value::List(list) => f.debug_list().entries(list).finish(),
            Value::Dict(dict) => dict.fmt(f),
        }
    }
}

// Printable byte strings are shown as text, anything else (ids, compact addresses) as hex.
fn fmt_bytes(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        write!(f, "{:?}", String::from_utf8_lossy(bytes))
    } else {
        write!(f, "0x")?;
        for b in bytes {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<Dictionary> for Value {
    fn from(d: Dictionary) -> Self {
        Value::Dict(d)
    }
}

/// Bencode dictionary that preserves insertion order.
///
/// Keys are unique. A dictionary is immutable once built; use [`DictionaryBuilder`] to compose
/// a new one.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dictionary {
    entries: Vec<(Vec<u8>, Value)>,
}

impl Dictionary {
    pub fn builder() -> DictionaryBuilder {
        DictionaryBuilder::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v)
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key)?.as_bytes()
    }

    pub fn get_integer(&self, key: &[u8]) -> Option<i64> {
        self.get(key)?.as_integer()
    }

    pub fn get_dict(&self, key: &[u8]) -> Option<&Dictionary> {
        self.get(key)?.as_dict()
    }

    pub fn get_list(&self, key: &[u8]) -> Option<&[Value]> {
        self.get(key)?.as_list()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|(k, _)| k.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Used by the decoder, which has already rejected duplicate keys.
    pub(super) fn from_entries(entries: Vec<(Vec<u8>, Value)>) -> Self {
        Self { entries }
    }
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.entries {
            map.entry(&String::from_utf8_lossy(key), value);
        }
        map.finish()
    }
}

/// Builds a [`Dictionary`] in the order the entries are inserted.
#[derive(Default)]
pub struct DictionaryBuilder {
    entries: Vec<(Vec<u8>, Value)>,
}

impl DictionaryBuilder {
    /// Add an entry. Inserting an existing key replaces its value in place.
    pub fn insert<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<[u8]>,
        V: Into<Value>,
    {
        let key = key.as_ref();
        let value = value.into();

        match self.entries.iter_mut().find(|(k, _)| k.as_slice() == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_vec(), value)),
        }

        self
    }

    /// Add an entry only if `value` is `Some`.
    pub fn insert_opt<K, V>(self, key: K, value: Option<V>) -> Self
    where
        K: AsRef<[u8]>,
        V: Into<Value>,
    {
        match value {
            Some(value) => self.insert(key, value),
            None => self,
        }
    }

    pub fn build(self) -> Dictionary {
        Dictionary {
            entries: self.entries,
        }
    }
}
