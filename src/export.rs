// 📄 Export Rows - normalized bank export tables + fingerprints
// Every portal export is normalized to the same six columns before sync

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Hex characters kept from the SHA-256 digest
pub const FINGERPRINT_LEN: usize = 32;

/// Export date format (DD-MM-YYYY)
pub const DATE_FORMAT: &str = "%d-%m-%Y";

// ============================================================================
// EXPORT ROW
// ============================================================================

/// One exported movement, with the column names the bank exports use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRow {
    /// Row reference from the export, when present
    #[serde(rename = "Nº Orden", default)]
    pub order: Option<String>,

    #[serde(rename = "Fecha Oper")]
    pub operation_date: String,

    #[serde(rename = "Concepto", default)]
    pub concept: String,

    #[serde(rename = "Descripción", default)]
    pub description: String,

    #[serde(rename = "Importe")]
    pub amount: String,

    /// Running balance after the movement
    #[serde(rename = "Saldo", default)]
    pub balance: String,
}

impl ExportRow {
    pub fn new(
        operation_date: &str,
        concept: &str,
        description: &str,
        amount: &str,
        balance: &str,
    ) -> Self {
        ExportRow {
            order: None,
            operation_date: operation_date.to_string(),
            concept: concept.to_string(),
            description: description.to_string(),
            amount: amount.to_string(),
            balance: balance.to_string(),
        }
    }

    /// Deduplication key for this row within `source_id`.
    ///
    /// Identical input gives the identical key; any differing field gives a
    /// different one. The running balance keeps same-day twins apart.
    pub fn fingerprint(&self, source_id: &str) -> String {
        let mut hasher = Sha256::new();
        for field in [
            source_id,
            self.operation_date.as_str(),
            self.concept.as_str(),
            self.description.as_str(),
            self.amount.as_str(),
            self.balance.as_str(),
        ] {
            // length prefix keeps field boundaries unambiguous
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let mut hex = format!("{:x}", hasher.finalize());
        hex.truncate(FINGERPRINT_LEN);
        hex
    }

    /// Reference used in row error messages: export order, else 1-based index
    pub fn reference(&self, index: usize) -> String {
        match &self.order {
            Some(order) if !order.trim().is_empty() => order.trim().to_string(),
            _ => (index + 1).to_string(),
        }
    }

    pub fn parse_date(&self) -> std::result::Result<NaiveDate, String> {
        NaiveDate::parse_from_str(self.operation_date.trim(), DATE_FORMAT)
            .map_err(|e| format!("invalid date '{}': {}", self.operation_date, e))
    }

    pub fn parse_amount_cents(&self) -> std::result::Result<i64, String> {
        parse_amount_cents(&self.amount)
    }
}

/// Parse `1234.56`, `-12,30` or `1.234,56` into integer cents
pub fn parse_amount_cents(raw: &str) -> std::result::Result<i64, String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '€')
        .collect();
    if cleaned.is_empty() {
        return Err("empty amount".to_string());
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // 1.234,56 -> comma is the decimal separator
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        // 1,234.56 -> dot is the decimal separator
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(_), None) => cleaned.replace(',', "."),
        _ => cleaned,
    };

    let value: f64 = normalized
        .parse()
        .map_err(|_| format!("invalid amount '{}'", raw))?;
    if !value.is_finite() {
        return Err(format!("invalid amount '{}'", raw));
    }
    Ok((value * 100.0).round() as i64)
}

// ============================================================================
// EXPORT TABLE
// ============================================================================

/// Rows exported for one declared source (one bank account)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTable {
    pub source_id: String,
    pub rows: Vec<ExportRow>,
}

impl ExportTable {
    pub fn new(source_id: impl Into<String>, rows: Vec<ExportRow>) -> Self {
        ExportTable {
            source_id: source_id.into(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Load a normalized export CSV for `source_id`
pub fn load_csv(csv_path: &Path, source_id: &str) -> Result<ExportTable> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open export CSV: {:?}", csv_path))?;

    let mut rows = Vec::new();
    for (index, result) in rdr.deserialize().enumerate() {
        let row: ExportRow = result.with_context(|| {
            format!(
                "Failed to read row {} of {:?} (required columns: Fecha Oper, Importe)",
                index + 1,
                csv_path
            )
        })?;
        rows.push(row);
    }

    tracing::debug!(source = source_id, rows = rows.len(), "loaded export {:?}", csv_path);
    Ok(ExportTable::new(source_id, rows))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn row() -> ExportRow {
        ExportRow::new("05-03-2025", "TARJETA VISA", "LM GETAFE MADRID", "-23.40", "1520.11")
    }

    #[test]
    fn test_fingerprint_is_deterministic_and_fixed_length() {
        let a = row().fingerprint("ibercaja");
        let b = row().fingerprint("ibercaja");
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_changes_with_every_field() {
        let base = row().fingerprint("ibercaja");

        let mut changed = Vec::new();
        let mut r = row();
        r.operation_date = "06-03-2025".to_string();
        changed.push(r.fingerprint("ibercaja"));
        let mut r = row();
        r.concept = "BIZUM".to_string();
        changed.push(r.fingerprint("ibercaja"));
        let mut r = row();
        r.description = "LM GETAFE".to_string();
        changed.push(r.fingerprint("ibercaja"));
        let mut r = row();
        r.amount = "-23.41".to_string();
        changed.push(r.fingerprint("ibercaja"));
        let mut r = row();
        r.balance = "1520.10".to_string();
        changed.push(r.fingerprint("ibercaja"));
        changed.push(row().fingerprint("ing_nomina"));

        for fp in changed {
            assert_ne!(fp, base);
        }
    }

    #[test]
    fn test_fingerprint_separator_inside_field_does_not_collide() {
        let mut a = row();
        a.concept = "A|B".to_string();
        a.description = "C".to_string();
        let mut b = row();
        b.concept = "A".to_string();
        b.description = "B|C".to_string();
        assert_ne!(a.fingerprint("ibercaja"), b.fingerprint("ibercaja"));
    }

    #[test]
    fn test_amount_formats() {
        assert_eq!(parse_amount_cents("1234.56"), Ok(123456));
        assert_eq!(parse_amount_cents("-12,30"), Ok(-1230));
        assert_eq!(parse_amount_cents("1.234,56"), Ok(123456));
        assert_eq!(parse_amount_cents("1,234.56"), Ok(123456));
        assert_eq!(parse_amount_cents("-7"), Ok(-700));
        assert!(parse_amount_cents("abc").is_err());
        assert!(parse_amount_cents("  ").is_err());
    }

    #[test]
    fn test_date_parsing() {
        assert_eq!(
            row().parse_date().unwrap(),
            NaiveDate::from_ymd_opt(2025, 3, 5).unwrap()
        );

        let mut bad = row();
        bad.operation_date = "2025/03/05".to_string();
        assert!(bad.parse_date().unwrap_err().contains("2025/03/05"));
    }

    #[test]
    fn test_reference_prefers_export_order() {
        let mut r = row();
        assert_eq!(r.reference(4), "5");
        r.order = Some("17".to_string());
        assert_eq!(r.reference(4), "17");
    }

    #[test]
    fn test_load_csv_reads_export_columns() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "Nº Orden,Fecha Oper,Fecha Valor,Concepto,Descripción,Referencia,Importe,Saldo"
        )
        .unwrap();
        writeln!(file, "1,05-03-2025,05-03-2025,TARJETA VISA,LM GETAFE,,-23.4,1520.11").unwrap();
        writeln!(file, "2,06-03-2025,06-03-2025,NOMINA,EMPRESA SA,,2100.0,3620.11").unwrap();

        let table = load_csv(file.path(), "ibercaja").unwrap();

        assert_eq!(table.source_id, "ibercaja");
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].order.as_deref(), Some("1"));
        assert_eq!(table.rows[1].concept, "NOMINA");
        assert_eq!(table.rows[1].amount, "2100.0");
    }

    #[test]
    fn test_load_csv_missing_columns_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date,Amount").unwrap();
        writeln!(file, "05-03-2025,-23.4").unwrap();

        assert!(load_csv(file.path(), "ibercaja").is_err());
    }
}
