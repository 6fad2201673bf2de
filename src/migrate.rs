use anyhow::Result;
use sqlx::SqlitePool;

use crate::schema::{CollectionSchema, FieldType, ID_FIELD};

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn column_type(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Double => "REAL",
        FieldType::ObjectId | FieldType::String | FieldType::Date => "TEXT",
    }
}

/// Creates the collection table and its indexes. Idempotent.
pub async fn run_migrations(pool: &SqlitePool, schema: &CollectionSchema) -> Result<()> {
    let table = quote_ident(&schema.collection);
    let columns: Vec<String> = schema
        .fields
        .iter()
        .map(|f| {
            let mut col = format!("{} {}", quote_ident(f.name), column_type(f.ty));
            if f.name == ID_FIELD {
                col.push_str(" PRIMARY KEY");
            }
            col
        })
        .collect();

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        table,
        columns.join(",\n    ")
    ))
    .execute(pool)
    .await?;

    // Date ranges are the most common filter the model writes.
    for field in schema.fields.iter().filter(|f| f.ty == FieldType::Date) {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&format!("idx_{}_{}", schema.collection, field.name)),
            table,
            quote_ident(field.name)
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}
