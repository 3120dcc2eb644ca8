use serde::Serialize;

use crate::xmldsig::{self, Signable};

/// Prefix of every DPS identifier.
pub const DPS_ID_PREFIX: &str = "DPS";

/// `tpInsc` of the DPS identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InscriptionType {
    Cpf = 1,
    Cnpj = 2,
}

/// `DPS` + cLocEmi(7) + tpInsc(1) + inscFed(14) + serie(5) + nDPS(15)
pub fn dps_identifier(
    municipality_code: &str,
    inscription: InscriptionType,
    federal_id: &str,
    serie: &str,
    number: u64,
) -> String {
    format!(
        "{DPS_ID_PREFIX}{municipality_code:0>7}{}{federal_id:0>14}{serie:0>5}{number:015}",
        inscription as u8
    )
}

/// A service provision declaration ready to be signed.
#[derive(Debug, Clone)]
pub struct Dps {
    pub version: String,
    pub inf: InfDps,
}

impl Signable for Dps {
    fn root_element(&self) -> &'static str {
        "DPS"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn reference_id(&self) -> &str {
        &self.inf.id
    }

    fn content_xml(&self) -> xmldsig::Result<String> {
        Ok(quick_xml::se::to_string_with_root("infDPS", &self.inf)?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InfDps {
    #[serde(rename = "@Id")]
    pub id: String,
    #[serde(rename = "tpAmb")]
    pub tp_amb: u8,
    #[serde(rename = "dhEmi")]
    pub dh_emi: String,
    #[serde(rename = "verAplic")]
    pub ver_aplic: String,
    pub serie: String,
    #[serde(rename = "nDPS")]
    pub n_dps: u64,
    #[serde(rename = "dCompet")]
    pub d_compet: String,
    #[serde(rename = "tpEmit")]
    pub tp_emit: u8,
    #[serde(rename = "cLocEmi")]
    pub c_loc_emi: String,
    pub prest: Prestador,
    pub toma: Tomador,
    pub serv: Servico,
    pub valores: Valores,
}

#[derive(Debug, Clone, Serialize)]
pub struct Prestador {
    #[serde(rename = "CNPJ")]
    pub cnpj: String,
    #[serde(rename = "IM", skip_serializing_if = "Option::is_none")]
    pub im: Option<String>,
    #[serde(rename = "regTrib")]
    pub reg_trib: RegTrib,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegTrib {
    /// 1 not opting, 2 MEI, 3 ME/EPP
    #[serde(rename = "opSimpNac")]
    pub op_simp_nac: u8,
    #[serde(rename = "regEspTrib")]
    pub reg_esp_trib: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tomador {
    #[serde(rename = "CNPJ", skip_serializing_if = "Option::is_none")]
    pub cnpj: Option<String>,
    #[serde(rename = "CPF", skip_serializing_if = "Option::is_none")]
    pub cpf: Option<String>,
    #[serde(rename = "xNome")]
    pub x_nome: String,
    pub end: Endereco,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Endereco {
    #[serde(rename = "endNac")]
    pub end_nac: EnderecoNacional,
    #[serde(rename = "xLgr")]
    pub x_lgr: String,
    pub nro: String,
    #[serde(rename = "xCpl", skip_serializing_if = "Option::is_none")]
    pub x_cpl: Option<String>,
    #[serde(rename = "xBairro")]
    pub x_bairro: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnderecoNacional {
    #[serde(rename = "cMun")]
    pub c_mun: String,
    #[serde(rename = "CEP")]
    pub cep: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Servico {
    #[serde(rename = "locPrest")]
    pub loc_prest: LocalPrestacao,
    #[serde(rename = "cServ")]
    pub c_serv: CodigoServico,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalPrestacao {
    #[serde(rename = "cLocPrestacao")]
    pub c_loc_prestacao: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CodigoServico {
    #[serde(rename = "cTribNac")]
    pub c_trib_nac: String,
    #[serde(rename = "cTribMun", skip_serializing_if = "Option::is_none")]
    pub c_trib_mun: Option<String>,
    #[serde(rename = "xDescServ")]
    pub x_desc_serv: String,
    #[serde(rename = "cNBS", skip_serializing_if = "Option::is_none")]
    pub c_nbs: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Valores {
    #[serde(rename = "vServPrest")]
    pub v_serv_prest: ValorServico,
    pub trib: Tributacao,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValorServico {
    #[serde(rename = "vServ")]
    pub v_serv: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tributacao {
    #[serde(rename = "tribMun")]
    pub trib_mun: TributacaoMunicipal,
    #[serde(rename = "totTrib")]
    pub tot_trib: TotalTributos,
}

#[derive(Debug, Clone, Serialize)]
pub struct TributacaoMunicipal {
    #[serde(rename = "tribISSQN")]
    pub trib_issqn: u8,
    #[serde(rename = "tpRetISSQN")]
    pub tp_ret_issqn: u8,
    #[serde(rename = "pAliq", skip_serializing_if = "Option::is_none")]
    pub p_aliq: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalTributos {
    #[serde(rename = "indTotTrib")]
    pub ind_tot_trib: u8,
}
