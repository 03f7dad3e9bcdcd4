//! Lead Management API Library
//!
//! This library provides the server side of the lead management system:
//! per-organization duplicate detection on phone and email, role-scoped lead
//! CRUD and assignment, accounts and organizations, and real-time event
//! fan-out to connected sockets.
//!
//! # Modules
//!
//! - `api`: API-layer namespace (handlers, router).
//! - `core`: Domain-layer namespace (duplicate matching, events, models).
//! - `account_storage`: Users and organizations persistence.
//! - `auth`: Token issuing/verification, password hashing, the `AuthUser` extractor.
//! - `auth_handler`: Login, registration and account administration endpoints.
//! - `config`: Configuration management.
//! - `contact`: Phone and email normalization.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Lead persistence, listing and dashboard aggregates.
//! - `duplicates`: Duplicate matching and per-contact locking.
//! - `errors`: Error handling types.
//! - `events`: Room-addressed event broadcasting.
//! - `handlers`: Application state, health and lead endpoints.
//! - `lead_service`: Lead business rules shared by the lead endpoints.
//! - `models`: Core data models.
//! - `organization_handler`: Organization endpoints.
//! - `routes`: Router assembly.
//! - `ws_handler`: WebSocket gateway.

pub mod api;
pub mod core;

pub mod account_storage;
pub mod auth;
pub mod auth_handler;
pub mod config;
pub mod contact;
pub mod db;
pub mod db_storage;
pub mod duplicates;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod lead_service;
pub mod models;
pub mod organization_handler;
pub mod routes;
pub mod ws_handler;
