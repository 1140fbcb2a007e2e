//! Row-level checks applied by chunk workers.
//!
//! A row that fails here is recorded and skipped; it never fails its chunk.

use common::model::csv::{RawRow, RowValidationError};
use rayon::prelude::*;
use std::collections::HashSet;

pub const INVOICE_ID: &str = "Invoice ID";
pub const CUSTOMER_NAME: &str = "Customer Name";
pub const ITEM_NAME: &str = "Item Name";
pub const ITEM_PRICE: &str = "Item Price";
pub const QUANTITY: &str = "Quantity";
pub const TOTAL: &str = "Total";

/// A validated order line, ready to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub row: u64,
    /// Uniqueness key of the line, backed by a unique index in the store.
    pub dedupe_key: String,
    pub invoice_id: String,
    pub customer_name: String,
    pub item_name: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
}

/// Positions of the order columns inside the upload's header.
#[derive(Debug, Clone)]
pub struct ColumnIndex {
    invoice_id: Option<usize>,
    customer_name: Option<usize>,
    item_name: Option<usize>,
    item_price: Option<usize>,
    quantity: Option<usize>,
    total: Option<usize>,
}

impl ColumnIndex {
    pub fn new(columns: &[String]) -> Self {
        let find = |title: &str| {
            columns
                .iter()
                .position(|c| c.trim().eq_ignore_ascii_case(title))
        };
        ColumnIndex {
            invoice_id: find(INVOICE_ID),
            customer_name: find(CUSTOMER_NAME),
            item_name: find(ITEM_NAME),
            item_price: find(ITEM_PRICE),
            quantity: find(QUANTITY),
            total: find(TOTAL),
        }
    }
}

fn cell<'a>(row: &'a RawRow, idx: Option<usize>) -> Option<&'a str> {
    idx.and_then(|i| row.values.get(i))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Parses a money or quantity cell, tolerating `$` and thousands separators.
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn dedupe_key(invoice_id: &str, item_name: &str) -> String {
    let normalized = format!(
        "{}\u{1f}{}",
        invoice_id.trim().to_lowercase(),
        item_name.trim().to_lowercase()
    );
    format!("{:x}", md5::compute(normalized.as_bytes()))
}

fn reject(row: &RawRow, fields: Vec<&str>, message: String) -> RowValidationError {
    RowValidationError {
        row: row.row,
        fields: fields.into_iter().map(str::to_string).collect(),
        message,
        raw: Some(row.values.join(",")),
    }
}

/// Structural checks of one row: required values, numeric cells, and
/// `quantity * unit price ~ total`.
pub fn validate_row(
    row: &RawRow,
    index: &ColumnIndex,
    price_tolerance: f64,
) -> Result<OrderRecord, RowValidationError> {
    let text_fields = [
        (INVOICE_ID, index.invoice_id),
        (CUSTOMER_NAME, index.customer_name),
        (ITEM_NAME, index.item_name),
    ];
    let numeric_fields = [
        (ITEM_PRICE, index.item_price),
        (QUANTITY, index.quantity),
        (TOTAL, index.total),
    ];

    let mut missing = Vec::new();
    let mut not_numeric = Vec::new();
    for (title, idx) in text_fields.iter().chain(numeric_fields.iter()) {
        if cell(row, *idx).is_none() {
            missing.push(*title);
        }
    }
    let mut numbers = [0.0f64; 3];
    for (slot, (title, idx)) in numeric_fields.iter().enumerate() {
        if let Some(value) = cell(row, *idx) {
            match parse_amount(value) {
                Some(n) => numbers[slot] = n,
                None => not_numeric.push(*title),
            }
        }
    }

    if !missing.is_empty() || !not_numeric.is_empty() {
        let mut parts = Vec::new();
        if !missing.is_empty() {
            parts.push(format!("missing value for {}", missing.join(", ")));
        }
        if !not_numeric.is_empty() {
            parts.push(format!("not a number: {}", not_numeric.join(", ")));
        }
        let mut fields = missing;
        fields.extend(not_numeric);
        return Err(reject(row, fields, parts.join("; ")));
    }

    let [unit_price, quantity, total_price] = numbers;
    let expected = quantity * unit_price;
    if (expected - total_price).abs() > price_tolerance {
        return Err(reject(
            row,
            vec![QUANTITY, ITEM_PRICE, TOTAL],
            format!(
                "quantity {} x price {} = {:.2}, but total is {:.2}",
                quantity, unit_price, expected, total_price
            ),
        ));
    }

    // Checked present above.
    let invoice_id = cell(row, index.invoice_id).unwrap_or_default().to_string();
    let item_name = cell(row, index.item_name).unwrap_or_default().to_string();
    Ok(OrderRecord {
        row: row.row,
        dedupe_key: dedupe_key(&invoice_id, &item_name),
        customer_name: cell(row, index.customer_name)
            .unwrap_or_default()
            .to_string(),
        invoice_id,
        item_name,
        quantity,
        unit_price,
        total_price,
    })
}

/// Runs `validate_row` over a chunk in parallel. The result keeps file order.
pub fn check_rows(
    rows: &[RawRow],
    index: &ColumnIndex,
    price_tolerance: f64,
) -> Vec<Result<OrderRecord, RowValidationError>> {
    rows.par_iter()
        .map(|row| validate_row(row, index, price_tolerance))
        .collect()
}

/// Splits checked rows into records to insert and rejected rows, dropping
/// duplicates inside the chunk and against keys already stored.
///
/// The store's unique index still catches races between chunks.
pub fn split_duplicates(
    checked: Vec<Result<OrderRecord, RowValidationError>>,
    stored_keys: &HashSet<String>,
    raw_rows: &[RawRow],
) -> (Vec<OrderRecord>, Vec<RowValidationError>) {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut rejected = Vec::new();
    for (result, raw) in checked.into_iter().zip(raw_rows) {
        match result {
            Ok(record) => {
                if stored_keys.contains(&record.dedupe_key) {
                    rejected.push(reject(
                        raw,
                        vec![INVOICE_ID, ITEM_NAME],
                        format!(
                            "duplicate: invoice '{}' item '{}' already ingested",
                            record.invoice_id, record.item_name
                        ),
                    ));
                } else if !seen.insert(record.dedupe_key.clone()) {
                    rejected.push(reject(
                        raw,
                        vec![INVOICE_ID, ITEM_NAME],
                        format!(
                            "duplicate: invoice '{}' item '{}' appears earlier in the file",
                            record.invoice_id, record.item_name
                        ),
                    ));
                } else {
                    records.push(record);
                }
            }
            Err(err) => rejected.push(err),
        }
    }
    (records, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<String> {
        ["Invoice ID", "Customer Name", "Item Name", "Item Price", "Quantity", "Total"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn raw(row: u64, values: &[&str]) -> RawRow {
        RawRow {
            row,
            values: values.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn accepts_currency_decorated_numbers() {
        let index = ColumnIndex::new(&header());
        let record = validate_row(
            &raw(1, &["INV-1", "Acme", "Rice 5kg", "$1,200.50", "2", "$2,401.00"]),
            &index,
            0.01,
        )
        .unwrap();
        assert_eq!(record.unit_price, 1200.5);
        assert_eq!(record.total_price, 2401.0);
        assert_eq!(record.dedupe_key, dedupe_key("inv-1", "RICE 5KG"));
    }

    #[test]
    fn reports_non_numeric_quantity_with_field() {
        let index = ColumnIndex::new(&header());
        let err = validate_row(
            &raw(5, &["INV-5", "Acme", "Dal", "3.00", "two", "6.00"]),
            &index,
            0.01,
        )
        .unwrap_err();
        assert_eq!(err.row, 5);
        assert_eq!(err.fields, vec!["Quantity".to_string()]);
        assert!(err.message.contains("not a number"));
        assert_eq!(err.raw.as_deref(), Some("INV-5,Acme,Dal,3.00,two,6.00"));
    }

    #[test]
    fn reports_missing_values_and_short_rows() {
        let index = ColumnIndex::new(&header());
        let err = validate_row(&raw(3, &["INV-3", "", "Oil"]), &index, 0.01).unwrap_err();
        assert_eq!(
            err.fields,
            vec!["Customer Name", "Item Price", "Quantity", "Total"]
        );
    }

    #[test]
    fn rejects_inconsistent_totals() {
        let index = ColumnIndex::new(&header());
        let err = validate_row(
            &raw(9, &["INV-9", "Acme", "Flour", "2.50", "4", "11.00"]),
            &index,
            0.01,
        )
        .unwrap_err();
        assert_eq!(err.fields, vec!["Quantity", "Item Price", "Total"]);
    }

    #[test]
    fn duplicates_inside_chunk_and_in_store_are_rejected_in_file_order() {
        let index = ColumnIndex::new(&header());
        let rows = vec![
            raw(1, &["INV-1", "Acme", "Rice", "1", "1", "1"]),
            raw(2, &["INV-1", "Acme", "rice", "1", "1", "1"]),
            raw(3, &["INV-2", "Acme", "Oil", "1", "2", "2"]),
            raw(4, &["INV-3", "Acme", "Dal", "1", "3", "3"]),
        ];
        let stored: HashSet<String> = [dedupe_key("INV-2", "Oil")].into_iter().collect();

        let checked = check_rows(&rows, &index, 0.01);
        let (records, rejected) = split_duplicates(checked, &stored, &rows);

        assert_eq!(records.iter().map(|r| r.row).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(rejected.iter().map(|r| r.row).collect::<Vec<_>>(), vec![2, 3]);
        assert!(rejected[0].message.contains("earlier in the file"));
        assert!(rejected[1].message.contains("already ingested"));
    }

    #[test]
    fn parse_amount_rejects_garbage() {
        assert_eq!(parse_amount(" 12 "), Some(12.0));
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount("NaN"), None);
    }
}
