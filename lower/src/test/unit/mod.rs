pub mod kernel;
pub mod scalar;
pub mod validation;
