//! Authorization capabilities for channel subscriptions and entity reads.
//!
//! The engine never authenticates anyone. It receives an already-resolved
//! [`Principal`] and asks an [`Authorizer`] whether that principal may act in a
//! given [`AuthContext`].

use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The caller on whose behalf an operation runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.id.is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// What the principal is trying to access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthContext<'a> {
    Channel(&'a str),
    Entity(&'a str),
}

pub trait Authorizer: Send + Sync {
    fn allowed(&self, principal: &Principal, context: &AuthContext<'_>) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allowed(&self, _principal: &Principal, _context: &AuthContext<'_>) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn allowed(&self, _principal: &Principal, _context: &AuthContext<'_>) -> bool {
        false
    }
}

/// Allows principals holding any of the listed roles.
/// An empty role list admits any authenticated principal.
#[derive(Debug, Clone, Default)]
pub struct RoleBased {
    roles: Vec<String>,
}

impl RoleBased {
    pub fn authenticated() -> Self {
        Self::default()
    }

    pub fn any_of<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for RoleBased {
    fn allowed(&self, principal: &Principal, _context: &AuthContext<'_>) -> bool {
        if self.roles.is_empty() {
            return principal.is_authenticated();
        }
        self.roles.iter().any(|role| principal.has_role(role))
    }
}

/// Application-supplied predicate.
pub struct FnAuthorizer<F> {
    predicate: F,
}

impl<F> FnAuthorizer<F>
where
    F: Fn(&Principal, &AuthContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> Authorizer for FnAuthorizer<F>
where
    F: Fn(&Principal, &AuthContext<'_>) -> bool + Send + Sync,
{
    fn allowed(&self, principal: &Principal, context: &AuthContext<'_>) -> bool {
        (self.predicate)(principal, context)
    }
}

/// Maps an incoming request to the principal resolved by the embedding
/// application's session layer.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Principal;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousResolver;

impl PrincipalResolver for AnonymousResolver {
    fn resolve(&self, _headers: &HeaderMap) -> Principal {
        Principal::anonymous()
    }
}

impl<F> PrincipalResolver for F
where
    F: Fn(&HeaderMap) -> Principal + Send + Sync,
{
    fn resolve(&self, headers: &HeaderMap) -> Principal {
        self(headers)
    }
}

pub fn allow_all() -> Arc<dyn Authorizer> {
    Arc::new(AllowAll)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_based_any_of() {
        let auth = RoleBased::any_of(["admin", "ops"]);
        let ops = Principal::user("u1").with_role("ops");
        let guest = Principal::user("u2").with_role("guest");

        assert!(auth.allowed(&ops, &AuthContext::Channel("alerts")));
        assert!(!auth.allowed(&guest, &AuthContext::Channel("alerts")));
        assert!(!auth.allowed(&Principal::anonymous(), &AuthContext::Channel("alerts")));
    }

    #[test]
    fn test_role_based_authenticated_only() {
        let auth = RoleBased::authenticated();
        assert!(auth.allowed(&Principal::user("u1"), &AuthContext::Entity("tasks")));
        assert!(!auth.allowed(&Principal::anonymous(), &AuthContext::Entity("tasks")));
    }

    #[test]
    fn test_fn_authorizer_sees_context() {
        let auth = FnAuthorizer::new(|_p: &Principal, ctx: &AuthContext<'_>| {
            matches!(ctx, AuthContext::Channel(name) if name.starts_with("public/"))
        });
        let anyone = Principal::anonymous();

        assert!(auth.allowed(&anyone, &AuthContext::Channel("public/news")));
        assert!(!auth.allowed(&anyone, &AuthContext::Channel("private/hr")));
        assert!(!auth.allowed(&anyone, &AuthContext::Entity("public/news")));
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |headers: &HeaderMap| match headers.get("x-user") {
            Some(v) => Principal::user(v.to_str().unwrap_or_default()),
            None => Principal::anonymous(),
        };
        let mut headers = HeaderMap::new();
        assert_eq!(resolver.resolve(&headers), Principal::anonymous());

        headers.insert("x-user", "alice".parse().unwrap());
        assert_eq!(resolver.resolve(&headers), Principal::user("alice"));
    }
}
