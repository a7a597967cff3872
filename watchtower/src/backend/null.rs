//! Stub backend. Accepts any watch and delivers no events.

use std::sync::Arc;

use crate::backend::{Backend, BackendKind};
use crate::config::Config;
use crate::error::Result;
use crate::queue::EventQueue;
use crate::registry::EmitterHandle;
use crate::watch::ObservedWatch;

struct NullEmitter;
impl EmitterHandle for NullEmitter {
    fn stop(&mut self) {}
}

/// A backend that watches nothing and emits nothing. Used when no native backend compiles
/// for the host platform and polling has been explicitly disabled.
pub(crate) struct NullBackend;

impl NullBackend {
    pub(crate) fn new(_queue: Arc<EventQueue>, _config: &Config) -> Result<Self> {
        Ok(Self)
    }
}

impl Backend for NullBackend {
    fn watch(&self, _watch: &ObservedWatch, _config: &Config) -> Result<Box<dyn EmitterHandle>> {
        Ok(Box::new(NullEmitter))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }
}
