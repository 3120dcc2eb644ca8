//! DPS (Declaração de Prestação de Serviço), the document signed and sent
//! to the authority on each emission attempt.

mod builder;
mod model;
mod template;

pub use builder::{DocumentBuilder, DpsDraft};
pub(crate) use builder::brasilia;
pub use model::*;
pub use template::DpsTemplate;
