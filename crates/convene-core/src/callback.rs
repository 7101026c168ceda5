// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callback model for terminal and progress notifications.
//!
//! Callbacks are persisted as an opaque envelope (a registry tag plus
//! arbitrary serialized state) and rebuilt at dispatch time through
//! host-registered factories. Serialization happens only at the store
//! boundary; the coordination algorithm never inspects callback state.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;

/// Response payloads keyed by correlation id.
///
/// Tokens that were never fulfilled (timeout path) are simply absent.
pub type ResponseMap = HashMap<String, Vec<u8>>;

/// Terminal callback for a waiter registration.
///
/// Exactly one of the three methods is invoked at most once per
/// registration. Implementations are expected to be best-effort side
/// effects; a returned error is logged and never retried.
pub trait NotifyCallback: Send + Sync {
    /// All awaited tokens fulfilled, none marked as error.
    fn notify(&self, responses: &ResponseMap) -> anyhow::Result<()>;

    /// All awaited tokens fulfilled, at least one marked as error.
    fn notify_error(&self, responses: &ResponseMap) -> anyhow::Result<()>;

    /// The deadline elapsed first; the map holds only the fulfilled subset.
    fn notify_timeout(&self, responses: &ResponseMap) -> anyhow::Result<()>;
}

/// Non-terminal progress callback.
pub trait ProgressCallback: Send + Sync {
    /// A progress update was published for one of the awaited tokens.
    fn on_progress(&self, correlation_id: &str, payload: &[u8]) -> anyhow::Result<()>;
}

/// The stored form of a callback: a factory tag plus arbitrary state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    /// Registry tag selecting the factory that rebuilds the callback.
    pub kind: String,
    /// Opaque state handed back to the factory at decode time.
    pub state: Value,
}

impl CallbackEnvelope {
    /// Create an envelope for the given factory kind and state.
    pub fn new(kind: impl Into<String>, state: Value) -> Self {
        Self {
            kind: kind.into(),
            state,
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

type NotifyFactory =
    Box<dyn Fn(&Value) -> anyhow::Result<Box<dyn NotifyCallback>> + Send + Sync>;
type ProgressFactory =
    Box<dyn Fn(&Value) -> anyhow::Result<Box<dyn ProgressCallback>> + Send + Sync>;

/// Host-populated registry mapping envelope kinds to callback factories.
#[derive(Default)]
pub struct CallbackRegistry {
    notify: HashMap<String, NotifyFactory>,
    progress: HashMap<String, ProgressFactory>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("notify_kinds", &self.notify.keys().collect::<Vec<_>>())
            .field("progress_kinds", &self.progress.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a terminal-callback factory under `kind`.
    ///
    /// A later registration for the same kind replaces the earlier one.
    pub fn register_notify<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Box<dyn NotifyCallback>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!(kind = %kind, "Registered notify callback factory");
        self.notify.insert(kind, Box::new(factory));
    }

    /// Register a progress-callback factory under `kind`.
    pub fn register_progress<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Box<dyn ProgressCallback>> + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!(kind = %kind, "Registered progress callback factory");
        self.progress.insert(kind, Box::new(factory));
    }

    /// Rebuild a terminal callback from its stored envelope bytes.
    pub fn decode_notify(&self, bytes: &[u8]) -> Result<Box<dyn NotifyCallback>, EngineError> {
        let envelope = CallbackEnvelope::from_bytes(bytes)?;
        let factory =
            self.notify
                .get(&envelope.kind)
                .ok_or_else(|| EngineError::UnknownCallbackKind {
                    kind: envelope.kind.clone(),
                })?;
        factory(&envelope.state).map_err(|e| EngineError::SerializationError {
            details: format!("notify factory '{}' failed: {}", envelope.kind, e),
        })
    }

    /// Rebuild a progress callback from its stored envelope bytes.
    pub fn decode_progress(&self, bytes: &[u8]) -> Result<Box<dyn ProgressCallback>, EngineError> {
        let envelope = CallbackEnvelope::from_bytes(bytes)?;
        let factory =
            self.progress
                .get(&envelope.kind)
                .ok_or_else(|| EngineError::UnknownCallbackKind {
                    kind: envelope.kind.clone(),
                })?;
        factory(&envelope.state).map_err(|e| EngineError::SerializationError {
            details: format!("progress factory '{}' failed: {}", envelope.kind, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoCallback {
        label: String,
    }

    impl NotifyCallback for EchoCallback {
        fn notify(&self, _responses: &ResponseMap) -> anyhow::Result<()> {
            anyhow::ensure!(!self.label.is_empty(), "label missing");
            Ok(())
        }

        fn notify_error(&self, _responses: &ResponseMap) -> anyhow::Result<()> {
            Ok(())
        }

        fn notify_timeout(&self, _responses: &ResponseMap) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry_with_echo() -> CallbackRegistry {
        let mut registry = CallbackRegistry::new();
        registry.register_notify("echo", |state| {
            let label = state
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(Box::new(EchoCallback { label }))
        });
        registry
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = CallbackEnvelope::new("echo", json!({"label": "deploy-7"}));
        let bytes = envelope.to_bytes().unwrap();
        let decoded = CallbackEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_notify() {
        let registry = registry_with_echo();
        let bytes = CallbackEnvelope::new("echo", json!({"label": "x"}))
            .to_bytes()
            .unwrap();

        let callback = registry.decode_notify(&bytes).unwrap();
        assert!(callback.notify(&ResponseMap::new()).is_ok());
    }

    #[test]
    fn test_decode_unknown_kind() {
        let registry = registry_with_echo();
        let bytes = CallbackEnvelope::new("missing", json!({}))
            .to_bytes()
            .unwrap();

        let err = registry.decode_notify(&bytes).err().unwrap();
        assert_eq!(err.error_code(), "UNKNOWN_CALLBACK_KIND");
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let registry = registry_with_echo();
        let err = registry.decode_notify(b"not json").err().unwrap();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_decode_progress_unregistered() {
        let registry = registry_with_echo();
        let bytes = CallbackEnvelope::new("echo", json!({}))
            .to_bytes()
            .unwrap();

        // "echo" is only registered as a notify factory.
        let err = registry.decode_progress(&bytes).err().unwrap();
        assert_eq!(err.error_code(), "UNKNOWN_CALLBACK_KIND");
    }

    #[test]
    fn test_registry_debug_lists_kinds() {
        let registry = registry_with_echo();
        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("echo"));
    }
}
