//! Krishi Sakhi - farming assistant backend
//!
//! Farmer profiles, activity logging with keyword NLU, rule based advisories,
//! reminders and notifications, a knowledge base, and privacy tooling behind
//! a JSON API. All modules are public for the integration tests.

pub mod admin_graphql;
pub mod admin_mutations;
pub mod auth;
pub mod entities;
pub mod errors;
pub mod ext;
pub mod geo;
pub mod jobs;
pub mod jwks;
pub mod kb;
pub mod llm;
pub mod media;
pub mod nlu;
pub mod notify;
pub mod otp;
pub mod rules;
pub mod seed;
pub mod settings;
pub mod storage;
pub mod types;
pub mod web;
pub mod ws;
