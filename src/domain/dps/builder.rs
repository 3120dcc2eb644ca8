use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::dps::model::*;
use crate::domain::dps::template::DpsTemplate;
use crate::domain::errors::{NfseError, ValidationError};
use crate::domain::models::{Client, Company, Environment, Sale};
use crate::domain::ports::{MunicipalTax, TaxLookup};

const MAX_DESCRIPTION_LEN: usize = 2000;
/// Brasília time, no daylight saving since 2019
const BRT_OFFSET_SECS: i32 = -3 * 3600;

/// Builds DPS documents from sales.
#[derive(Clone)]
pub struct DocumentBuilder {
    tax: Arc<dyn TaxLookup>,
}

/// A validated DPS still waiting for its number.
#[derive(Debug, Clone)]
pub struct DpsDraft {
    version: String,
    environment: Environment,
    template: DpsTemplate,
    municipality_code: String,
    prestador: Prestador,
    tomador: Tomador,
    servico: Servico,
    valores: Valores,
}

impl DocumentBuilder {
    pub fn new(tax: Arc<dyn TaxLookup>) -> Self {
        Self { tax }
    }

    /// Validates the sale against the company, the client and the tenant
    /// template. Every problem found is reported in one [`ValidationError`].
    pub async fn prepare(
        &self,
        sale: &Sale,
        company: &Company,
        client: &Client,
    ) -> Result<DpsDraft, NfseError> {
        let mut errors = ValidationError::new();

        let template = match DpsTemplate::from_json(company.dps_template.as_ref()) {
            Ok(template) => {
                template.validate(&mut errors);
                template
            }
            Err(e) => {
                errors.fields.extend(e.fields);
                DpsTemplate::default()
            }
        };

        let cnpj = digits(&company.cnpj);
        if !is_valid_cnpj(&cnpj) {
            errors.push("prestador.cnpj", "must be a valid 14 digit CNPJ");
        }
        if !is_ibge_code(&company.municipality_code) {
            errors.push("prestador.codigoMunicipio", "must be a 7 digit IBGE code");
        }
        let municipal_registration = company
            .municipal_registration
            .as_deref()
            .map(str::trim)
            .filter(|im| !im.is_empty());
        if company.environment == Environment::Production && municipal_registration.is_none() {
            errors.push(
                "prestador.inscricaoMunicipal",
                "is required in the production environment",
            );
        }

        let document = digits(&client.document);
        let (toma_cnpj, toma_cpf) = match document.len() {
            14 if is_valid_cnpj(&document) => (Some(document), None),
            11 if is_valid_cpf(&document) => (None, Some(document)),
            _ => {
                errors.push("tomador.documento", "must be a valid CPF or CNPJ");
                (None, None)
            }
        };
        if client.name.trim().is_empty() {
            errors.push("tomador.nome", "is required");
        }
        if !is_ibge_code(&client.address.municipality_code) {
            errors.push(
                "tomador.endereco.codigoMunicipio",
                "must be a 7 digit IBGE code",
            );
        }
        let cep = digits(&client.address.cep);
        if cep.len() != 8 {
            errors.push("tomador.endereco.cep", "must have 8 digits");
        }

        if sale.amount <= Decimal::ZERO {
            errors.push("valor", "must be greater than zero");
        }
        let description = sale.description.trim();
        if description.is_empty() {
            errors.push("descricao", "is required");
        } else if description.chars().count() > MAX_DESCRIPTION_LEN {
            errors.push("descricao", "must have at most 2000 characters");
        }

        let place_of_service = template
            .c_loc_prestacao
            .clone()
            .unwrap_or_else(|| company.municipality_code.clone());
        let tax = self
            .resolve_service(&sale.service_code, &place_of_service, &mut errors)
            .await?;

        errors.into_result()?;
        let Some(tax) = tax else {
            return Err(ValidationError::single("servico.codigo", "could not be resolved").into());
        };
        debug!(service = %tax.national_code, "DPS validated");

        let op_simp_nac = template
            .op_simp_nac
            .unwrap_or(if company.simples_nacional { 3 } else { 1 });
        let p_aliq = (!company.simples_nacional && tax.iss_rate > Decimal::ZERO)
            .then(|| format!("{:.2}", tax.iss_rate.round_dp(2)));

        Ok(DpsDraft {
            version: company.api_version.clone(),
            environment: company.environment,
            municipality_code: company.municipality_code.clone(),
            prestador: Prestador {
                cnpj,
                im: municipal_registration.map(str::to_string),
                reg_trib: RegTrib {
                    op_simp_nac,
                    reg_esp_trib: template.reg_esp_trib,
                },
            },
            tomador: Tomador {
                cnpj: toma_cnpj,
                cpf: toma_cpf,
                x_nome: client.name.trim().to_string(),
                end: Endereco {
                    end_nac: EnderecoNacional {
                        c_mun: client.address.municipality_code.clone(),
                        cep,
                    },
                    x_lgr: client.address.street.clone(),
                    nro: client.address.number.clone(),
                    x_cpl: client.address.complement.clone(),
                    x_bairro: client.address.district.clone(),
                },
                email: client.email.clone().filter(|e| !e.is_empty()),
            },
            servico: Servico {
                loc_prest: LocalPrestacao {
                    c_loc_prestacao: place_of_service,
                },
                c_serv: CodigoServico {
                    c_trib_nac: tax.national_code,
                    c_trib_mun: tax.municipal_code,
                    x_desc_serv: description.to_string(),
                    c_nbs: template.c_nbs.clone().or(tax.nbs),
                },
            },
            valores: Valores {
                v_serv_prest: ValorServico {
                    v_serv: format!("{:.2}", sale.amount.round_dp(2)),
                },
                trib: Tributacao {
                    trib_mun: TributacaoMunicipal {
                        trib_issqn: template.trib_issqn,
                        tp_ret_issqn: template.tp_ret_issqn,
                        p_aliq,
                    },
                    tot_trib: TotalTributos {
                        ind_tot_trib: template.ind_tot_trib,
                    },
                },
            },
            template,
        })
    }

    /// [`prepare`](Self::prepare) and number in one step.
    pub async fn build(
        &self,
        sale: &Sale,
        company: &Company,
        client: &Client,
        number: u64,
    ) -> Result<Dps, NfseError> {
        Ok(self
            .prepare(sale, company, client)
            .await?
            .into_dps(number, Utc::now()))
    }

    async fn resolve_service(
        &self,
        service_code: &str,
        municipality_code: &str,
        errors: &mut ValidationError,
    ) -> Result<Option<MunicipalTax>, NfseError> {
        let code = service_code.trim();
        if code.is_empty() {
            errors.push("servico.codigo", "is required");
            return Ok(None);
        }
        if !is_ibge_code(municipality_code) {
            // Already reported against the municipality field
            return Ok(None);
        }

        let resolved = self.tax.resolve(code, municipality_code).await?;
        if resolved.is_none() {
            errors.push(
                "servico.codigo",
                format!("{code} is not taxable in municipality {municipality_code}"),
            );
        }
        Ok(resolved)
    }
}

impl DpsDraft {
    pub fn serie(&self) -> &str {
        &self.template.serie
    }

    /// Stamps number and emission time.
    pub fn into_dps(self, number: u64, now: DateTime<Utc>) -> Dps {
        let local = now.with_timezone(&brasilia());
        let id = dps_identifier(
            &self.municipality_code,
            InscriptionType::Cnpj,
            &self.prestador.cnpj,
            &self.template.serie,
            number,
        );

        Dps {
            version: self.version,
            inf: InfDps {
                id,
                tp_amb: self.environment.tp_amb(),
                dh_emi: local.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
                ver_aplic: self.template.ver_aplic,
                serie: self.template.serie,
                n_dps: number,
                d_compet: local.format("%Y-%m-%d").to_string(),
                tp_emit: 1,
                c_loc_emi: self.municipality_code,
                prest: self.prestador,
                toma: self.tomador,
                serv: self.servico,
                valores: self.valores,
            },
        }
    }
}

/// Brasília offset used for every timestamp sent to the authority.
pub(crate) fn brasilia() -> FixedOffset {
    FixedOffset::east_opt(BRT_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

fn digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

fn is_ibge_code(code: &str) -> bool {
    code.len() == 7 && code.chars().all(|c| c.is_ascii_digit())
}

fn all_same(digits: &[u32]) -> bool {
    digits.windows(2).all(|w| w[0] == w[1])
}

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    match sum % 11 {
        r if r < 2 => 0,
        r => 11 - r,
    }
}

pub(crate) fn is_valid_cnpj(cnpj: &str) -> bool {
    const FIRST: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    const SECOND: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

    let d: Vec<u32> = cnpj.chars().filter_map(|c| c.to_digit(10)).collect();
    if d.len() != 14 || cnpj.len() != 14 || all_same(&d) {
        return false;
    }
    check_digit(&d[..12], &FIRST) == d[12] && check_digit(&d[..13], &SECOND) == d[13]
}

pub(crate) fn is_valid_cpf(cpf: &str) -> bool {
    const FIRST: [u32; 9] = [10, 9, 8, 7, 6, 5, 4, 3, 2];
    const SECOND: [u32; 10] = [11, 10, 9, 8, 7, 6, 5, 4, 3, 2];

    let d: Vec<u32> = cpf.chars().filter_map(|c| c.to_digit(10)).collect();
    if d.len() != 11 || cpf.len() != 11 || all_same(&d) {
        return false;
    }
    check_digit(&d[..9], &FIRST) == d[9] && check_digit(&d[..10], &SECOND) == d[10]
}
