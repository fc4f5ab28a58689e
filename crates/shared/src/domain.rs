use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(RecordId);
id_newtype!(StageId);

/// A pipeline stage. `sort_order` alone decides column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub display_name: String,
    pub sort_order: i32,
}

impl Stage {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, sort_order: i32) -> Self {
        Self {
            id: StageId::new(id),
            display_name: display_name.into(),
            sort_order,
        }
    }
}

/// A business entity (prospect, deal) as projected onto the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(default)]
    pub stage_id: Option<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contact_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, stage_id: Option<&str>) -> Self {
        Self {
            id: RecordId::new(id),
            stage_id: stage_id.map(StageId::new),
            last_contact_at: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Best-effort human label used in notices and text rendering.
    pub fn label(&self) -> &str {
        ["name", "company", "email"]
            .iter()
            .find_map(|key| self.fields.get(*key).and_then(|value| value.as_str()))
            .unwrap_or(self.id.as_str())
    }
}
