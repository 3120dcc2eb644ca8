use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;

use crate::domain::ports::{CollaboratorError, MunicipalTax, TaxLookup};

/// One row of the tax table file.
#[derive(Debug, Clone, Deserialize)]
struct TaxRow {
    service_code: String,
    /// Applies to every municipality when absent
    #[serde(default)]
    municipality_code: Option<String>,
    national_code: String,
    #[serde(default)]
    municipal_code: Option<String>,
    description: String,
    iss_rate: Decimal,
    #[serde(default)]
    nbs: Option<String>,
}

impl TaxRow {
    fn into_tax(self) -> (String, Option<String>, MunicipalTax) {
        let tax = MunicipalTax {
            national_code: self.national_code,
            municipal_code: self.municipal_code,
            description: self.description,
            iss_rate: self.iss_rate,
            nbs: self.nbs,
        };
        (self.service_code, self.municipality_code, tax)
    }
}

/// Tax lookup backed by an in-memory table.
///
/// Municipality specific rows win over the national fallback row of the
/// same service code.
#[derive(Debug, Clone, Default)]
pub struct StaticTaxLookup {
    rows: HashMap<(String, Option<String>), MunicipalTax>,
}

impl StaticTaxLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Common national service codes with their usual ISS rates.
    pub fn with_defaults() -> Self {
        let defaults = [
            ("010101", "Análise e desenvolvimento de sistemas", 200, None),
            ("010201", "Programação", 200, None),
            ("010701", "Suporte técnico em informática", 200, None),
            ("170101", "Assessoria ou consultoria de qualquer natureza", 500, None),
            ("170201", "Datilografia, digitação e congêneres", 500, None),
            ("171901", "Contabilidade e auditoria", 500, Some("113032000")),
        ];

        let mut lookup = Self::new();
        for (code, description, rate, nbs) in defaults {
            lookup.insert(
                code,
                None,
                MunicipalTax {
                    national_code: code.to_string(),
                    municipal_code: None,
                    description: description.to_string(),
                    iss_rate: Decimal::new(rate, 2),
                    nbs: nbs.map(str::to_string),
                },
            );
        }
        lookup
    }

    /// Loads a JSON array of rows.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CollaboratorError> {
        let path = path.as_ref();
        let invalid = |detail: String| CollaboratorError::InvalidResponse {
            service: "tax table",
            detail,
        };

        let raw = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;
        let rows: Vec<TaxRow> = serde_json::from_str(&raw)
            .map_err(|e| invalid(format!("{}: {e}", path.display())))?;

        let mut lookup = Self::new();
        for row in rows {
            let (code, municipality, tax) = row.into_tax();
            lookup.insert(&code, municipality.as_deref(), tax);
        }
        info!(path = %path.display(), rows = lookup.rows.len(), "Tax table loaded");
        Ok(lookup)
    }

    pub fn insert(
        &mut self,
        service_code: &str,
        municipality_code: Option<&str>,
        tax: MunicipalTax,
    ) {
        self.rows.insert(
            (normalize_code(service_code), municipality_code.map(str::to_string)),
            tax,
        );
    }
}

/// `01.01.01` and `010101` name the same service.
fn normalize_code(code: &str) -> String {
    code.chars().filter(char::is_ascii_digit).collect()
}

#[async_trait]
impl TaxLookup for StaticTaxLookup {
    async fn resolve(
        &self,
        service_code: &str,
        municipality_code: &str,
    ) -> Result<Option<MunicipalTax>, CollaboratorError> {
        let code = normalize_code(service_code);
        let specific = self
            .rows
            .get(&(code.clone(), Some(municipality_code.to_string())));
        Ok(specific.or_else(|| self.rows.get(&(code, None))).cloned())
    }
}
