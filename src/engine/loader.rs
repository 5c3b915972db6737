//! Process-lifetime model state.
//!
//! The engine is created on the first `load` and kept until the process
//! exits; there is no teardown. The `warmed` flag flips after the first
//! successful inference, warm-up included. Callers share one loader through
//! `Arc`; concurrent first loads are serialized by the `OnceCell`, and at most
//! one warm-up is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array4;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{Engine, EngineFactory};
use crate::error::{DroneAidError, Result};
use crate::types::{InputTensor, ModelCfg, RawOutputs};

pub struct ModelLoader {
    cfg: ModelCfg,
    engine: OnceCell<Arc<dyn Engine>>,
    warmed: AtomicBool,
    warming: AtomicBool,
}

impl ModelLoader {
    pub fn new(cfg: ModelCfg) -> Self {
        Self {
            cfg,
            engine: OnceCell::new(),
            warmed: AtomicBool::new(false),
            warming: AtomicBool::new(false),
        }
    }

    /// A loader whose engine is already in place, e.g. a custom backend.
    pub fn with_engine(cfg: ModelCfg, engine: Arc<dyn Engine>) -> Self {
        Self {
            cfg,
            engine: OnceCell::new_with(Some(engine)),
            warmed: AtomicBool::new(false),
            warming: AtomicBool::new(false),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.initialized()
    }

    pub fn is_warmed(&self) -> bool {
        self.warmed.load(Ordering::Acquire)
    }

    /// Creates the engine on first call. With `initialize`, also runs one
    /// warm-up inference if the model has not run yet.
    pub async fn load(&self, initialize: bool) -> Result<Arc<dyn Engine>> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                let cfg = self.cfg.clone();
                info!("loading model: backend={}, path={}", cfg.backend, cfg.model_path);
                let started = Instant::now();
                let created = tokio::task::spawn_blocking(move || EngineFactory::create(&cfg)).await?;
                let engine = created.map_err(|e| DroneAidError::ModelLoad {
                    path: self.cfg.model_path.clone(),
                    reason: format!("{:#}", e),
                })?;
                info!("model loaded in {:?}", started.elapsed());
                Ok::<_, DroneAidError>(Arc::from(engine))
            })
            .await?;

        if initialize && !self.is_warmed() && self.claim_warmup() {
            self.warmup(Arc::clone(engine)).await;
            self.warming.store(false, Ordering::Release);
        }
        Ok(Arc::clone(engine))
    }

    fn claim_warmup(&self) -> bool {
        self.warming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn warmup(&self, engine: Arc<dyn Engine>) {
        let size = self.cfg.warmup_size;
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            engine.execute(Array4::<f32>::ones((1, size, size, 3)))
        })
        .await;

        match result {
            Ok(Ok(_)) => {
                self.warmed.store(true, Ordering::Release);
                info!("warm-up {}x{} done in {:?}", size, size, started.elapsed());
            }
            Ok(Err(e)) => warn!("warm-up failed, continuing: {:#}", e),
            Err(e) => warn!("warm-up task failed, continuing: {}", e),
        }
    }

    /// Runs the loaded model on the calling thread.
    pub fn run(&self, tensor: Option<InputTensor>) -> Result<RawOutputs> {
        let tensor = tensor.ok_or(DroneAidError::EmptyInput)?;
        let engine = self
            .engine
            .get()
            .ok_or_else(|| DroneAidError::ModelUnavailable(self.cfg.model_path.clone()))?;
        let outputs = execute(engine.as_ref(), tensor)?;
        self.warmed.store(true, Ordering::Release);
        Ok(outputs)
    }

    /// Loads the model if needed, then runs it on the blocking pool.
    pub async fn inference(&self, tensor: Option<InputTensor>) -> Result<RawOutputs> {
        let engine = self.load(false).await?;
        let tensor = tensor.ok_or(DroneAidError::EmptyInput)?;
        let outputs = tokio::task::spawn_blocking(move || execute(engine.as_ref(), tensor)).await??;
        self.warmed.store(true, Ordering::Release);
        Ok(outputs)
    }
}

fn execute(engine: &dyn Engine, tensor: InputTensor) -> Result<RawOutputs> {
    debug!("execute {} on {:?}", engine.name(), tensor.shape());
    engine.execute(tensor).map_err(|e| DroneAidError::Inference {
        engine: engine.name(),
        reason: format!("{:#}", e),
    })
}
