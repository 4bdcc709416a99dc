use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::error::ModelLoadError;
use crate::model::{ExplanationSubstrate, Predictor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Detector,
    Classifier,
    ExplanationSubstrate,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Detector, ModelKind::Classifier, ModelKind::ExplanationSubstrate];

    fn slot(self) -> usize {
        match self {
            ModelKind::Detector => 0,
            ModelKind::Classifier => 1,
            ModelKind::ExplanationSubstrate => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Detector => "detector",
            ModelKind::Classifier => "classifier",
            ModelKind::ExplanationSubstrate => "explanation_substrate",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A loaded model, shared read-only by every request.
#[derive(Clone)]
pub enum ModelHandle {
    Detector(Arc<dyn Predictor>),
    Classifier(Arc<dyn Predictor>),
    ExplanationSubstrate(Arc<dyn ExplanationSubstrate>),
}

impl ModelHandle {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelHandle::Detector(_) => ModelKind::Detector,
            ModelHandle::Classifier(_) => ModelKind::Classifier,
            ModelHandle::ExplanationSubstrate(_) => ModelKind::ExplanationSubstrate,
        }
    }

    /// Identity, not structural, equality.
    pub fn same_instance(&self, other: &ModelHandle) -> bool {
        match (self, other) {
            (ModelHandle::Detector(a), ModelHandle::Detector(b)) => Arc::ptr_eq(a, b),
            (ModelHandle::Classifier(a), ModelHandle::Classifier(b)) => Arc::ptr_eq(a, b),
            (ModelHandle::ExplanationSubstrate(a), ModelHandle::ExplanationSubstrate(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModelHandle").field(&self.kind()).finish()
    }
}

/// Constructs model handles. Called at most once per kind unless the
/// previous attempt failed.
pub trait ModelLoader: Send + Sync {
    fn load(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError>;
}

enum SlotState {
    NotAttempted,
    Loading { attempt: u32 },
    Loaded(ModelHandle),
    Failed { reason: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// `state` is only held for reads and transitions; `load` is held for the
/// whole construction so one caller loads while the others wait.
struct Slot {
    state: Mutex<SlotState>,
    load: Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::NotAttempted),
            load: Mutex::new(()),
        }
    }

    fn cached(&self) -> Option<ModelHandle> {
        match &*self.state.lock() {
            SlotState::Loaded(handle) => Some(handle.clone()),
            _ => None,
        }
    }
}

/// Lazily loads each model kind once per process and hands out the cached
/// handle afterwards. A failed load leaves the slot retryable.
pub struct ModelRegistry {
    loader: Box<dyn ModelLoader>,
    slots: [Slot; 3],
}

impl ModelRegistry {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            slots: [Slot::new(), Slot::new(), Slot::new()],
        }
    }

    /// Returns the cached handle for `kind`, loading it first if needed.
    /// Concurrent callers for the same kind wait for a single load.
    pub fn get(&self, kind: ModelKind) -> Result<ModelHandle, ModelLoadError> {
        let slot = &self.slots[kind.slot()];
        if let Some(handle) = slot.cached() {
            return Ok(handle);
        }

        let _loading = slot.load.lock();
        let attempt = {
            let mut state = slot.state.lock();
            let attempt = match &*state {
                SlotState::Loaded(handle) => return Ok(handle.clone()),
                SlotState::NotAttempted => 1,
                // a loader that panicked leaves `Loading` behind
                SlotState::Loading { attempt } | SlotState::Failed { attempts: attempt, .. } => attempt + 1,
            };
            *state = SlotState::Loading { attempt };
            attempt
        };

        info!(model = %kind, attempt, "loading model");
        let t = Instant::now();
        let loaded = self.loader.load(kind).and_then(|handle| {
            if handle.kind() == kind {
                Ok(handle)
            } else {
                Err(ModelLoadError::Invalid {
                    kind,
                    reason: format!("loader returned a {} handle", handle.kind()),
                })
            }
        });

        let mut state = slot.state.lock();
        match loaded {
            Ok(handle) => {
                info!(model = %kind, elapsed = ?t.elapsed(), "model loaded");
                *state = SlotState::Loaded(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                error!(model = %kind, attempt, error = %e, "model load failed");
                *state = SlotState::Failed {
                    reason: e.to_string(),
                    attempts: attempt,
                };
                Err(e)
            }
        }
    }

    pub fn detector(&self) -> Result<Arc<dyn Predictor>, ModelLoadError> {
        match self.get(ModelKind::Detector)? {
            ModelHandle::Detector(model) => Ok(model),
            other => Err(mismatch(ModelKind::Detector, &other)),
        }
    }

    pub fn classifier(&self) -> Result<Arc<dyn Predictor>, ModelLoadError> {
        match self.get(ModelKind::Classifier)? {
            ModelHandle::Classifier(model) => Ok(model),
            other => Err(mismatch(ModelKind::Classifier, &other)),
        }
    }

    pub fn substrate(&self) -> Result<Arc<dyn ExplanationSubstrate>, ModelLoadError> {
        match self.get(ModelKind::ExplanationSubstrate)? {
            ModelHandle::ExplanationSubstrate(model) => Ok(model),
            other => Err(mismatch(ModelKind::ExplanationSubstrate, &other)),
        }
    }

    /// Slot state without triggering a load or waiting for one.
    pub fn status(&self, kind: ModelKind) -> SlotStatus {
        match &*self.slots[kind.slot()].state.lock() {
            SlotState::NotAttempted => SlotStatus::NotLoaded,
            SlotState::Loading { .. } => SlotStatus::Loading,
            SlotState::Loaded(_) => SlotStatus::Loaded,
            SlotState::Failed { .. } => SlotStatus::Failed,
        }
    }

    /// Reason of the last failed load, if the slot is in the failed state.
    pub fn last_failure(&self, kind: ModelKind) -> Option<String> {
        match &*self.slots[kind.slot()].state.lock() {
            SlotState::Failed { reason, .. } => Some(reason.clone()),
            _ => None,
        }
    }
}

fn mismatch(kind: ModelKind, handle: &ModelHandle) -> ModelLoadError {
    ModelLoadError::Invalid {
        kind,
        reason: format!("registry holds a {} handle", handle.kind()),
    }
}
