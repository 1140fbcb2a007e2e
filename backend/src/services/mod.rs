pub mod data_sources;
