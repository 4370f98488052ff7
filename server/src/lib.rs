//! Aether Server - REST message service for the Aether Meet team chat
//!
//! This crate handles:
//! - Registration, login and JWT session tokens
//! - Direct conversations and groups
//! - Messages with reactions, read receipts and pins

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod message_service;
pub mod models;
pub mod storage;

use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::crypto::JwtKeys;
use crate::message_service::MessageService;
use crate::storage::Storage;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub jwt: Arc<JwtKeys>,
    pub messages: MessageService,
}

impl AppState {
    pub fn new(config: Arc<Config>, storage: Arc<Storage>) -> anyhow::Result<Self> {
        let jwt = Arc::new(JwtKeys::from_config(&config.auth)?);
        let messages = MessageService::new(storage.clone(), config.limits.max_file_size);

        Ok(Self {
            config,
            storage,
            jwt,
            messages,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health::health_check))
        // Authentication
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh-token", post(handlers::auth::refresh_token))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/profile", get(handlers::auth::profile))
        // Users
        .route("/users", get(handlers::users::list_users))
        .route(
            "/users/me",
            patch(handlers::users::update_profile).delete(handlers::users::delete_account),
        )
        .route("/users/:user_id", get(handlers::users::get_user))
        // Conversations & groups
        .route(
            "/conversations",
            get(handlers::conversations::list_conversations)
                .post(handlers::conversations::create_conversation),
        )
        .route("/groups", post(handlers::conversations::create_group))
        // Messages
        .route(
            "/messages",
            get(handlers::messages::get_messages).post(handlers::messages::send_message),
        )
        .route("/messages/unread", get(handlers::messages::unread_count))
        .route(
            "/messages/:message_id",
            patch(handlers::messages::edit_message).delete(handlers::messages::delete_message),
        )
        .route(
            "/messages/:message_id/reactions",
            post(handlers::messages::add_reaction),
        )
        .route(
            "/messages/:message_id/reactions/:emoji",
            delete(handlers::messages::remove_reaction),
        )
        .route("/messages/:message_id/read", post(handlers::messages::mark_as_read))
        .route(
            "/messages/:message_id/pin",
            post(handlers::messages::pin_message).delete(handlers::messages::unpin_message),
        );

    Router::new()
        .nest("/api/v1", api)
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
