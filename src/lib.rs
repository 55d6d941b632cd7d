// src/lib.rs

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod models;
pub mod presence;
pub mod registry;
pub mod router;
pub mod state;
pub mod upload;
pub mod websocket;
