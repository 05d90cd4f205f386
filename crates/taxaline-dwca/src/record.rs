use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// One core row with its attached extension rows.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinedRecord {
    /// Value of the core identifier column.
    pub id: String,
    pub fields: Map<String, Value>,
    /// Extension name -> rows in source-file order. A key is present only
    /// when at least one row attached.
    pub extensions: BTreeMap<String, Vec<Map<String, Value>>>,
}

impl JoinedRecord {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
            extensions: BTreeMap::new(),
        }
    }

    pub fn attach(&mut self, extension: &str, row: Map<String, Value>) {
        self.extensions
            .entry(extension.to_string())
            .or_default()
            .push(row);
    }

    /// Flatten into one object: core fields plus one array per extension.
    ///
    /// An extension array replaces a core field of the same name.
    pub fn into_map(self) -> Map<String, Value> {
        let mut out = self.fields;
        for (name, rows) in self.extensions {
            out.insert(name, Value::Array(rows.into_iter().map(Value::Object).collect()));
        }
        out
    }
}
