//! Loads a small SQLite table into a model, edits it, filters it, and
//! refreshes part of it.
//!
//! Run with: cargo run --example load_and_filter

use livesql::{ModelEvent, ModelOptions, Query, SqlModel, SqliteProvider, Value};
use log::info;
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("shop.db");
    let conn = rusqlite::Connection::open(&path)?;
    conn.execute_batch(
        "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL, stock INTEGER);
         INSERT INTO products VALUES
            (1, 'Widget', 9.99, 120),
            (2, 'Gadget', 19.99, 0),
            (3, 'Widget Pro', 24.50, 15),
            (4, 'Doohickey', 4.99, NULL),
            (5, 'Gizmo', 14.00, 42);",
    )?;

    let options = ModelOptions::from_json(r#"{ "identity_column": "id", "report_progress": true }"#)?;
    let mut model = SqlModel::new(Arc::new(SqliteProvider::new(&path)), options)?;

    let query = Query::new("SELECT id, name, price, stock FROM products WHERE price < ':max' ORDER BY id")
        .with_param("max", 100.0);
    model.refresh(query)?;
    model.settle().await;
    model.check_load()?;
    info!("Loaded {} products ({:?})", model.dataset().len(), model.load_status());

    model.add_filter("name", "widget", false);
    model.sort_column("price", true)?;
    model.settle().await;
    for row in model.visible_rows() {
        info!("  {:?}", model.dataset().row_data(*row)?);
    }

    model.set_field_value(1, "stock", 10)?;
    let mut fields = BTreeMap::new();
    fields.insert("id".to_string(), Value::Int(6));
    fields.insert("name".to_string(), Value::from("Widget Mini"));
    fields.insert("price".to_string(), Value::Real(3.25));
    fields.insert("stock".to_string(), Value::Int(300));
    model.add_row(&fields, &["id".to_string()])?;
    info!("Pending changes:\n{}", model.changed_rows_json()?);

    // Someone else sells out the Widget Pro and discontinues the Gadget.
    conn.execute_batch("UPDATE products SET stock = 0 WHERE id = 3; DELETE FROM products WHERE id = 2;")?;
    model.refresh_rows(
        Query::new("SELECT id, name, price, stock FROM products WHERE id IN (2, 3)"),
        &[1, 2],
    )?;
    model.settle().await;

    for event in model.drain_events() {
        if let ModelEvent::PartialRefreshOutcome { refreshed, removed } = event {
            info!("Partial refresh: {} refreshed, {} removed", refreshed.len(), removed.len());
        }
    }
    info!("Visible after refresh: {:?}", model.visible_rows());
    info!("Dataset:\n{}", model.to_json()?);
    Ok(())
}
