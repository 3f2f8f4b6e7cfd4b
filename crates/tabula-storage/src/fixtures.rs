//! Demo dataset for local runs and tests.

use rusqlite::Connection;
use tracing::info;

use tabula_core::error::TabulaError;

/// Create and fill the demo tables (`customers`, `orders`, `staging_orders`).
///
/// Idempotent: existing demo tables are left alone.
pub fn seed_demo(conn: &Connection) -> Result<(), TabulaError> {
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'orders'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| TabulaError::Storage(format!("Failed to inspect schema: {}", e)))?;
    if exists > 0 {
        return Ok(());
    }

    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE customers (
            id       INTEGER PRIMARY KEY,
            name     TEXT NOT NULL,
            country  TEXT NOT NULL
        );

        CREATE TABLE orders (
            id           INTEGER PRIMARY KEY,
            customer_id  INTEGER NOT NULL REFERENCES customers (id),
            amount       REAL NOT NULL,
            status       TEXT NOT NULL,
            placed_at    TEXT NOT NULL
        );

        CREATE TABLE staging_orders (
            id           INTEGER PRIMARY KEY,
            customer_id  INTEGER NOT NULL,
            amount       REAL NOT NULL,
            loaded_at    TEXT NOT NULL
        );

        INSERT INTO customers (id, name, country) VALUES
            (1, 'Acme Corp', 'US'),
            (2, 'Globex', 'DE'),
            (3, 'Initech', 'US'),
            (4, 'Umbrella', 'GB'),
            (5, 'Hooli', 'US');

        INSERT INTO orders (id, customer_id, amount, status, placed_at) VALUES
            (1, 1, 120.00, 'shipped', '2024-01-03'),
            (2, 2, 980.50, 'shipped', '2024-01-07'),
            (3, 3, 45.25, 'cancelled', '2024-01-09'),
            (4, 1, 2300.00, 'shipped', '2024-01-12'),
            (5, 4, 310.10, 'pending', '2024-01-15'),
            (6, 5, 1525.75, 'shipped', '2024-01-18'),
            (7, 2, 75.00, 'cancelled', '2024-01-20'),
            (8, 3, 640.00, 'pending', '2024-01-22'),
            (9, 5, 3999.99, 'shipped', '2024-01-25'),
            (10, 4, 88.80, 'shipped', '2024-01-28'),
            (11, 1, 720.00, 'pending', '2024-02-02'),
            (12, 2, 1210.40, 'shipped', '2024-02-05');

        INSERT INTO staging_orders (id, customer_id, amount, loaded_at) VALUES
            (1, 1, 10.00, '2024-02-06'),
            (2, 3, 20.00, '2024-02-06');

        COMMIT;
        ",
    )
    .map_err(|e| TabulaError::Storage(format!("Failed to seed demo data: {}", e)))?;

    info!("Demo dataset loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;

    #[test]
    fn test_seed_demo_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        seed_demo(&conn).unwrap();
        seed_demo(&conn).unwrap();

        let orders: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orders, 12);
    }

    #[test]
    fn test_largest_order_belongs_to_hooli() {
        let conn = Connection::open_in_memory().unwrap();
        seed_demo(&conn).unwrap();

        let name: String = conn
            .query_row(
                "SELECT c.name FROM orders o JOIN customers c ON c.id = o.customer_id
                 ORDER BY o.amount DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "Hooli");
    }
}
