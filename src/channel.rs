//! Channel model: the two fixed sync configurations and their wire shape.
//!
//! A channel pairs a spreadsheet (file + sheet) with a field-to-column
//! mapping and a cursor. `new` and `abandoned` are fully independent; all
//! per-channel state elsewhere in the crate is keyed by [`ChannelKind`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Row 1 is always the header; data starts at row 2.
pub const FIRST_DATA_ROW: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    New,
    Abandoned,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::New, ChannelKind::Abandoned];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::New => "new",
            ChannelKind::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Some(ChannelKind::New),
            "abandoned" => Some(ChannelKind::Abandoned),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System order fields a spreadsheet column can be mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderField {
    #[serde(rename = "fullName")]
    FullName,
    #[serde(rename = "phone")]
    Phone,
    #[serde(rename = "address")]
    Address,
    #[serde(rename = "state")]
    State,
    #[serde(rename = "city")]
    City,
    #[serde(rename = "products.name")]
    ProductName,
    #[serde(rename = "products.sku")]
    ProductSku,
    #[serde(rename = "products.quantity")]
    Quantity,
    #[serde(rename = "products.price")]
    Price,
    #[serde(rename = "totalPrice")]
    TotalPrice,
    #[serde(rename = "note")]
    Note,
}

impl OrderField {
    pub const ALL: [OrderField; 11] = [
        OrderField::FullName,
        OrderField::Phone,
        OrderField::Address,
        OrderField::State,
        OrderField::City,
        OrderField::ProductName,
        OrderField::ProductSku,
        OrderField::Quantity,
        OrderField::Price,
        OrderField::TotalPrice,
        OrderField::Note,
    ];

    /// Wire identifier, as stored in `configWithOrderCollection[].field`.
    pub fn key(self) -> &'static str {
        match self {
            OrderField::FullName => "fullName",
            OrderField::Phone => "phone",
            OrderField::Address => "address",
            OrderField::State => "state",
            OrderField::City => "city",
            OrderField::ProductName => "products.name",
            OrderField::ProductSku => "products.sku",
            OrderField::Quantity => "products.quantity",
            OrderField::Price => "products.price",
            OrderField::TotalPrice => "totalPrice",
            OrderField::Note => "note",
        }
    }

    pub fn from_key(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        OrderField::ALL.into_iter().find(|f| f.key() == raw)
    }

    pub fn label(self) -> &'static str {
        match self {
            OrderField::FullName => "Customer name",
            OrderField::Phone => "Phone",
            OrderField::Address => "Address",
            OrderField::State => "State",
            OrderField::City => "City",
            OrderField::ProductName => "Product name",
            OrderField::ProductSku => "Product SKU",
            OrderField::Quantity => "Quantity",
            OrderField::Price => "Price",
            OrderField::TotalPrice => "Total price",
            OrderField::Note => "Note",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(
            self,
            OrderField::FullName | OrderField::Phone | OrderField::ProductName | OrderField::ProductSku
        )
    }
}

/// In-memory configuration of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub kind: ChannelKind,
    pub file_id: String,
    pub sheet_name: String,
    /// Next row to read. Never below [`FIRST_DATA_ROW`], never decreases.
    pub cursor: u64,
    pub mapping: BTreeMap<OrderField, String>,
    pub auto_sync_enabled: bool,
    pub persisted_id: Option<String>,
}

impl Channel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            file_id: String::new(),
            sheet_name: String::new(),
            cursor: FIRST_DATA_ROW,
            mapping: BTreeMap::new(),
            auto_sync_enabled: false,
            persisted_id: None,
        }
    }

    pub fn last_row_synced(&self) -> u64 {
        self.cursor.saturating_sub(1)
    }

    pub fn is_saved(&self) -> bool {
        self.persisted_id.is_some()
    }

    /// Labels of required fields that have no column yet, in field order.
    pub fn missing_required(&self) -> Vec<String> {
        OrderField::ALL
            .into_iter()
            .filter(|f| f.is_required() && !self.mapping.contains_key(f))
            .map(|f| f.label().to_string())
            .collect()
    }

    pub fn to_content(&self) -> ChannelContent {
        ChannelContent {
            id_file: self.file_id.clone(),
            name_sheet: self.sheet_name.clone(),
            type_order: self.kind,
            last_row_synced: self.last_row_synced(),
            auto_sync: self.auto_sync_enabled,
            config_with_order_collection: self
                .mapping
                .iter()
                .map(|(field, column)| MappingEntry {
                    field: field.key().to_string(),
                    column: column.clone(),
                })
                .collect(),
        }
    }

    /// Overwrite this channel with a record loaded from the backend. The
    /// cursor only moves forward: a stale remote `lastRowSynced` never
    /// rewinds rows that were already ingested.
    pub fn apply_remote(&mut self, record: &StoredChannelConfig) {
        let content = &record.content;
        self.persisted_id = Some(record.id.clone());
        self.file_id = content.id_file.trim().to_string();
        self.sheet_name = content.name_sheet.trim().to_string();
        self.auto_sync_enabled = content.auto_sync;
        self.cursor = self
            .cursor
            .max(content.last_row_synced.saturating_add(1))
            .max(FIRST_DATA_ROW);
        self.mapping = mapping_from_entries(&content.config_with_order_collection);
    }
}

/// One field/column pair as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub field: String,
    pub column: String,
}

/// Persisted channel record, field names as used on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelContent {
    #[serde(default)]
    pub id_file: String,
    #[serde(default)]
    pub name_sheet: String,
    pub type_order: ChannelKind,
    #[serde(default)]
    pub last_row_synced: u64,
    #[serde(default)]
    pub auto_sync: bool,
    #[serde(default)]
    pub config_with_order_collection: Vec<MappingEntry>,
}

/// A channel record returned by the backend listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChannelConfig {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(flatten)]
    pub content: ChannelContent,
}

pub fn mapping_from_entries(entries: &[MappingEntry]) -> BTreeMap<OrderField, String> {
    let mut mapping = BTreeMap::new();
    for entry in entries {
        let column = entry.column.trim();
        if column.is_empty() {
            continue;
        }
        match OrderField::from_key(&entry.field) {
            Some(field) => {
                mapping.insert(field, column.to_string());
            }
            None => debug!(field = %entry.field, "ignoring unknown mapping field"),
        }
    }
    mapping
}
