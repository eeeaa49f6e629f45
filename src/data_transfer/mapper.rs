use crate::data_transfer::models::TargetTable;
use serde::Serialize;

/// Documentation of where one target column comes from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub source: &'static str,
    pub target: &'static str,
    pub conversion: &'static str,
}

pub const fn map(source: &'static str, target: &'static str, conversion: &'static str) -> ColumnMapping {
    ColumnMapping {
        source,
        target,
        conversion,
    }
}

/// Every mapping must name a real target column and every target column
/// must be documented exactly once.
pub fn validate_mappings(table: &TargetTable, mappings: &[ColumnMapping]) -> Result<(), String> {
    for (index, mapping) in mappings.iter().enumerate() {
        if mapping.source.trim().is_empty() {
            return Err(format!("Mapping {} has an empty source", index + 1));
        }
        if table.column_index(mapping.target).is_none() {
            return Err(format!(
                "Mapping {} targets unknown column {}.{}",
                index + 1,
                table.name,
                mapping.target
            ));
        }
    }

    for column in table.columns {
        let count = mappings.iter().filter(|m| m.target == column.name).count();
        if count != 1 {
            return Err(format!(
                "Column {}.{} is documented {} times",
                table.name, column.name, count
            ));
        }
    }
    Ok(())
}

pub fn render_mappings(table: &TargetTable, mappings: &[ColumnMapping]) -> String {
    let width = mappings.iter().map(|m| m.source.len()).max().unwrap_or(0);
    let mut out = format!(
        "{} (key: {}, on conflict: {})\n",
        table.name,
        table.key_columns.join(", "),
        table.conflict.as_str()
    );
    for mapping in mappings {
        let pg_type = table
            .column_index(mapping.target)
            .map(|i| table.columns[i].pg_type.as_str())
            .unwrap_or("?");
        out.push_str(&format!(
            "  {:<width$}  ->  {} ({}) {}\n",
            mapping.source,
            mapping.target,
            pg_type,
            mapping.conversion,
            width = width
        ));
    }
    out
}
