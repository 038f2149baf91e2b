//! Event type → ordered handler routing.
//!
//! The routing table is plain data (names only). [`HandlerRegistry::build`]
//! resolves every name against a [`HandlerCatalog`] once at startup, so a typo
//! in a route fails the process before any event is dispatched. The built
//! registry is read-only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::handler::EventHandler;

/// Handler names used by the standard routes.
pub mod names {
    pub const CREATE_ESCROW: &str = "create_escrow";
    pub const RELEASE_ESCROW: &str = "release_escrow";
    pub const REFUND_ESCROW: &str = "refund_escrow";
    pub const DECREMENT_STOCK: &str = "decrement_stock";
    pub const SEND_CONFIRMATION: &str = "send_confirmation";
    pub const SEND_PAYMENT_RECEIPT: &str = "send_payment_receipt";
    pub const SEND_CANCELLATION: &str = "send_cancellation";
    pub const NOTIFY_STORE: &str = "notify_store";
    pub const AUDIT_LOG: &str = "audit_log";
    pub const RECALCULATE_RANKING: &str = "recalculate_ranking";
    pub const RECALCULATE_SELLER_RISK: &str = "recalculate_seller_risk";
    pub const RECALCULATE_INVENTORY: &str = "recalculate_inventory";
    pub const PROCESS_PAYOUT: &str = "process_payout";
}

/// Registry construction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("route `{event_type}` references unknown handler `{handler}`")]
    UnknownHandler { event_type: String, handler: String },

    #[error("route `{0}` is declared twice")]
    DuplicateRoute(String),

    #[error("route `{event_type}` lists handler `{handler}` more than once")]
    DuplicateHandlerInRoute { event_type: String, handler: String },

    #[error("route with an empty event type")]
    EmptyEventType,
}

/// Ordered routes, by name only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: Vec<(String, Vec<String>)>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. Handler order is execution order.
    pub fn route(mut self, event_type: impl Into<String>, handlers: &[&str]) -> Self {
        self.routes.push((
            event_type.into(),
            handlers.iter().map(|h| (*h).to_string()).collect(),
        ));
        self
    }

    /// The commerce platform's routes.
    ///
    /// Ledger handlers come before the notifications that reference their
    /// effects; audit runs last.
    pub fn standard() -> Self {
        use names::*;

        Self::new()
            .route(
                "order.created",
                &[CREATE_ESCROW, DECREMENT_STOCK, SEND_CONFIRMATION, NOTIFY_STORE],
            )
            .route(
                "payment.paid",
                &[SEND_PAYMENT_RECEIPT, NOTIFY_STORE, AUDIT_LOG],
            )
            .route("delivery.confirmed", &[RELEASE_ESCROW, AUDIT_LOG])
            .route(
                "order.completed",
                &[
                    RECALCULATE_RANKING,
                    RECALCULATE_SELLER_RISK,
                    RECALCULATE_INVENTORY,
                ],
            )
            .route(
                "order.cancelled",
                &[REFUND_ESCROW, SEND_CANCELLATION, NOTIFY_STORE, AUDIT_LOG],
            )
            .route("payout.requested", &[PROCESS_PAYOUT, AUDIT_LOG])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.routes
            .iter()
            .map(|(event_type, handlers)| (event_type.as_str(), handlers.as_slice()))
    }
}

/// Name → implementation lookup used while building the registry.
#[derive(Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a handler implementation under `name`.
    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerCatalog").field("handlers", &names).finish()
    }
}

/// A resolved handler together with the name it is logged under.
#[derive(Clone)]
pub struct NamedHandler {
    name: Arc<str>,
    handler: Arc<dyn EventHandler>,
}

impl NamedHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }
}

impl core::fmt::Debug for NamedHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("NamedHandler").field(&self.name).finish()
    }
}

/// Read-only, fully resolved routing.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<String, Vec<NamedHandler>>,
}

impl HandlerRegistry {
    pub fn build(table: &RoutingTable, catalog: &HandlerCatalog) -> Result<Self, RegistryError> {
        let mut routes = HashMap::new();

        for (event_type, handler_names) in table.iter() {
            if event_type.trim().is_empty() {
                return Err(RegistryError::EmptyEventType);
            }
            if routes.contains_key(event_type) {
                return Err(RegistryError::DuplicateRoute(event_type.to_string()));
            }

            let mut seen = HashSet::new();
            let mut resolved = Vec::with_capacity(handler_names.len());
            for name in handler_names {
                if !seen.insert(name.as_str()) {
                    return Err(RegistryError::DuplicateHandlerInRoute {
                        event_type: event_type.to_string(),
                        handler: name.clone(),
                    });
                }
                let handler = catalog.get(name).ok_or_else(|| RegistryError::UnknownHandler {
                    event_type: event_type.to_string(),
                    handler: name.clone(),
                })?;
                resolved.push(NamedHandler {
                    name: Arc::from(name.as_str()),
                    handler: Arc::clone(handler),
                });
            }

            routes.insert(event_type.to_string(), resolved);
        }

        Ok(Self { routes })
    }

    /// Handlers for `event_type`, in execution order.
    ///
    /// Unknown event types resolve to an empty list, not an error.
    pub fn handlers_for(&self, event_type: &str) -> &[NamedHandler] {
        self.routes
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_routed(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    /// Route table by name, sorted by event type (for operator views).
    pub fn describe(&self) -> BTreeMap<String, Vec<String>> {
        self.routes
            .iter()
            .map(|(event_type, handlers)| {
                (
                    event_type.clone(),
                    handlers.iter().map(|h| h.name().to_string()).collect(),
                )
            })
            .collect()
    }
}
