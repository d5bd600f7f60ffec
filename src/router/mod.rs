//! Router module for provider selection.
//!
//! This module picks the provider that serves a request based on:
//! - Which credentials the request ends up with
//! - The configured provider preference

mod selector;

pub use selector::{Router, SelectedProvider};
