use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

/// Tenant boilerplate merged under the values of each sale.
///
/// Every field has a default, so tenants only store what they change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct DpsTemplate {
    pub serie: String,
    pub ver_aplic: String,
    /// Overrides the value derived from the company Simples Nacional flag.
    pub op_simp_nac: Option<u8>,
    pub reg_esp_trib: u8,
    pub trib_issqn: u8,
    pub tp_ret_issqn: u8,
    pub c_nbs: Option<String>,
    pub ind_tot_trib: u8,
    /// Place of provision when it differs from the company municipality.
    pub c_loc_prestacao: Option<String>,
}

impl Default for DpsTemplate {
    fn default() -> Self {
        Self {
            serie: "1".into(),
            ver_aplic: concat!("nfse-server-", env!("CARGO_PKG_VERSION")).into(),
            op_simp_nac: None,
            reg_esp_trib: 0,
            trib_issqn: 1,
            tp_ret_issqn: 1,
            c_nbs: None,
            ind_tot_trib: 0,
            c_loc_prestacao: None,
        }
    }
}

impl DpsTemplate {
    /// Reads the tenant template, falling back to defaults when absent.
    pub fn from_json(value: Option<&serde_json::Value>) -> Result<Self, ValidationError> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ValidationError::single("template", e.to_string())),
        }
    }

    /// Adds every template problem to `errors`.
    pub fn validate(&self, errors: &mut ValidationError) {
        if self.serie.is_empty()
            || self.serie.len() > 5
            || !self.serie.chars().all(|c| c.is_ascii_digit())
        {
            errors.push("template.serie", "must be 1 to 5 digits");
        }
        if self.ver_aplic.is_empty() || self.ver_aplic.len() > 20 {
            errors.push("template.verAplic", "must be 1 to 20 characters");
        }
        if self.op_simp_nac.is_some_and(|v| !(1..=3).contains(&v)) {
            errors.push("template.opSimpNac", "must be 1, 2 or 3");
        }
        if !(1..=4).contains(&self.trib_issqn) {
            errors.push("template.tribIssqn", "must be between 1 and 4");
        }
        if !(1..=3).contains(&self.tp_ret_issqn) {
            errors.push("template.tpRetIssqn", "must be between 1 and 3");
        }
        if let Some(nbs) = &self.c_nbs {
            if nbs.len() != 9 || !nbs.chars().all(|c| c.is_ascii_digit()) {
                errors.push("template.cNbs", "must be 9 digits");
            }
        }
        if let Some(code) = &self.c_loc_prestacao {
            if code.len() != 7 || !code.chars().all(|c| c.is_ascii_digit()) {
                errors.push("template.cLocPrestacao", "must be a 7 digit IBGE code");
            }
        }
    }
}
