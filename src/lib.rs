pub mod cloud;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod models;
pub mod registration;
pub mod routes;
pub mod store;
pub mod upload;
