// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};

pub type TokenResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Source of the bearer token attached to outgoing transmissions.
///
/// Dynamic tokens are resolved on every request since they may rotate or
/// expire between sends.
#[derive(Clone)]
pub enum CredentialFactory {
    Static(String),
    Dynamic(TokenResolverFn),
}

impl CredentialFactory {
    pub fn new_from_resolver(resolver_fn: TokenResolverFn) -> Self {
        Self::Dynamic(resolver_fn)
    }

    pub fn new_from_static_token(token: &str) -> Self {
        Self::Static(token.to_string())
    }

    pub async fn get_token(&self) -> Option<String> {
        match self {
            Self::Static(token) => Some(token.clone()),
            Self::Dynamic(resolver_fn) => (resolver_fn)().await,
        }
    }
}

impl Debug for CredentialFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialFactory")
    }
}
