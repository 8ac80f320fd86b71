//! Tenant-scoped cache-aside layer for business-management clients.
//!
//! Reads go through [`cache::CacheLayer`], which checks a TTL store before
//! calling the data service. Mutations invalidate keys or whole tenants via
//! [`cache::PatternInvalidator`]. While offline, writes are captured by
//! [`offline::OfflineQueue`] and replayed later. [`company`] composes all of
//! it for the company profile, falling back to session data when the backend
//! is unreachable.

pub mod cache;
pub mod company;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod offline;
pub mod query;
pub mod refresh;
pub mod service;
