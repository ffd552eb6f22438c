//! REST route handlers.
//!
//! `health` is public; `admin` and `logs` sit behind the admin-key
//! middleware in [`crate::auth`].

pub mod admin;
pub mod health;
pub mod logs;
