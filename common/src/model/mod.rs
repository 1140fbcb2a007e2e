pub mod csv;
pub mod upload;
