// =====================================================
// DATAMIGRATE
// Legacy SQL Server procurement tables -> PostgreSQL
// =====================================================

pub mod config;
pub mod data_transfer;
pub mod db_types;
pub mod error;
pub mod mssql;
pub mod postgres;
pub mod tables;

pub use error::MigrationError;
