pub mod json;
pub mod uri;
