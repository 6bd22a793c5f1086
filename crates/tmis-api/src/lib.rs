//! TMIS API - authentication and tenant isolation service
//!
//! Provides HTTP endpoints for login, invitation-based registration,
//! refresh token rotation and tenant-scoped administration.
//!
//! Author: hephaex@gmail.com

pub mod audit;
pub mod auth;
pub mod cookie;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod invitation;
pub mod middleware;
pub mod routes;
pub mod seed;
pub mod state;
pub mod tenant;

pub use routes::{create_router, ApiDoc};
pub use state::AppState;

#[cfg(any(test, feature = "test-utils"))]
pub use testing::{create_router_for_testing, create_test_app, TestApp};

#[cfg(any(test, feature = "test-utils"))]
mod testing {
    use crate::auth::{Argon2Hasher, PasswordConfig};
    use crate::seed::seed_demo_data;
    use crate::state::AppState;
    use axum::Router;
    use std::sync::Arc;
    use tmis_core::{AppConfig, Environment, InMemoryStore, Repositories};
    use uuid::Uuid;

    /// Router plus handles for arranging test data
    pub struct TestApp {
        pub router: Router,
        pub state: Arc<AppState>,
        /// Seeded demo company
        pub tenant_id: Uuid,
    }

    /// Router over an in-memory store with the demo data seeded
    pub async fn create_test_app() -> TestApp {
        let mut config = AppConfig::default();
        config.environment = Environment::Development;
        config.server.cors_origins = vec!["http://localhost:3000".to_string()];

        let repos = Repositories::from_store(Arc::new(InMemoryStore::new()));
        let hasher = Argon2Hasher::new(&PasswordConfig {
            memory_cost: 8,
            time_cost: 1,
            parallelism: 1,
            output_len: Some(32),
        })
        .expect("valid argon2 parameters");

        let state = Arc::new(
            AppState::with_hasher(config, repos, Arc::new(hasher)).expect("valid test config"),
        );
        let tenant_id = seed_demo_data(&state.repos, state.auth.hasher().as_ref())
            .await
            .expect("seed demo data")
            .tenant_id();
        state.set_ready(true);

        TestApp {
            router: crate::create_router(state.clone()),
            state,
            tenant_id,
        }
    }

    /// Router over a freshly seeded in-memory store
    pub async fn create_router_for_testing() -> Router {
        create_test_app().await.router
    }
}
