//! Schema declarations for the columnar checkpointer: table name, primary
//! key, optional version/timestamp columns, and per-field column
//! definitions.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Blob,
    Json,
    Datetime,
}

impl ColumnType {
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Json | Self::Datetime => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub field: String,
    pub column: String,
    pub ty: ColumnType,
    pub required: bool,
}

impl ColumnDef {
    #[must_use]
    pub fn new(field: &str, ty: ColumnType) -> Self {
        Self { field: field.to_string(), column: to_snake_case(field), ty, required: false }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn column_name(mut self, name: &str) -> Self {
        self.column = name.to_string();
        self
    }
}

fn to_snake_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for (i, ch) in field.char_indices() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub table: String,
    pub primary_key: String,
    pub has_version: bool,
    pub created_at_field: Option<String>,
    pub updated_at_field: Option<String>,
    pub checkpointed_at_field: Option<String>,
    pub columns: Vec<ColumnDef>,
}

impl EntitySchema {
    #[must_use]
    pub fn new(table: &str, primary_key: &str, columns: Vec<ColumnDef>) -> Self {
        Self {
            table: table.to_string(),
            primary_key: primary_key.to_string(),
            has_version: false,
            created_at_field: None,
            updated_at_field: None,
            checkpointed_at_field: None,
            columns,
        }
    }

    #[must_use]
    pub fn with_version(mut self) -> Self {
        self.has_version = true;
        self
    }

    #[must_use]
    pub fn with_timestamps(mut self, created: &str, updated: &str, checkpointed: &str) -> Self {
        self.created_at_field = Some(created.to_string());
        self.updated_at_field = Some(updated.to_string());
        self.checkpointed_at_field = Some(checkpointed.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_default_column_name() {
        let col = ColumnDef::new("blobId", ColumnType::Text);
        assert_eq!(col.column, "blob_id");
    }

    #[test]
    fn explicit_column_name_overrides_default() {
        let col = ColumnDef::new("blobId", ColumnType::Text).column_name("blob_identifier");
        assert_eq!(col.column, "blob_identifier");
    }
}
