use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// String-keyed bag of JSON values accumulated during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag {
    store: Map<String, Value>,
}

impl DataBag {
    pub fn new() -> Self {
        Self { store: Map::new() }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.store.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.store.get(key)
    }

    /// Deserialize the value under `key`. Returns `None` when the key is
    /// missing or the value does not have the requested shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.store
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.store.remove(key)
    }

    /// Shallow merge: top-level keys from `other` overwrite ours.
    pub fn merge(&mut self, other: DataBag) {
        self.store.extend(other.store);
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.store.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.store
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.store
    }

    pub fn clear(&mut self) {
        self.store.clear();
    }
}

impl From<Map<String, Value>> for DataBag {
    fn from(store: Map<String, Value>) -> Self {
        Self { store }
    }
}

impl From<DataBag> for Value {
    fn from(bag: DataBag) -> Self {
        Value::Object(bag.store)
    }
}

impl TryFrom<Value> for DataBag {
    type Error = Value;

    /// Only JSON objects convert; anything else is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(store) => Ok(Self { store }),
            other => Err(other),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for DataBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            store: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
