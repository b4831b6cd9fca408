pub mod formatters;
pub mod sos;
