//! `invflow-auth`: the authorization oracle boundary.
//!
//! The workflow and ledger engines never compute entitlements themselves; they
//! ask an [`Authorizer`] yes/no questions. This crate defines that contract and
//! a static, in-memory policy used for tests and single-node deployments.

pub mod authorize;
pub mod permissions;
pub mod roles;

pub use authorize::{AccessScope, Authorizer, AuthzError, Grant, ScopeFilter, StaticAuthorizer, require};
pub use permissions::Permission;
pub use roles::Role;
