//! API handlers
//!
//! Author: hephaex@gmail.com

pub mod auth;
pub mod health;
pub mod invitations;
pub mod seed;
pub mod users;
