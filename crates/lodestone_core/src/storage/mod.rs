//! Storage facade: model, store and root context under one handle.
//!
//! # Responsibility
//! - Resolve the model and the store descriptor for a named storage.
//! - Drive the load life cycle and hand out the store-backed main context.
//! - Clear every entity of the store in one durable operation.
//!
//! # Invariants
//! - `main_context` only succeeds after a completed `load`; before that it
//!   reports `LoadError::NotLoaded`.
//! - At most one load is in flight; a second `load` while loading or loaded
//!   completes with `LoadError::AlreadyLoaded` and leaves the first intact.
//! - A failed load leaves the facade retryable, not wedged.

use crate::context::{Context, SaveResult, Task};
use crate::model::Model;
use crate::store::{
    FileProtection, LoadError, LoadResult, MissingFilePolicy, Store, StoreDescriptor, StoreOptions,
};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Configuration of one named storage.
///
/// `name` selects both the model resource (`<resource_dir>/<name>.model.json`)
/// and the backing file (`<data_dir>/<name>.sqlite`).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub name: String,
    pub resource_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Wipe any prior backing file before loading.
    pub blank: bool,
    /// Reconcile additive schema changes at load time.
    pub auto_migrate: bool,
    pub protection: FileProtection,
    /// Attach the store off the calling thread.
    pub attach_async: bool,
}

impl StorageConfig {
    pub fn new(
        name: impl Into<String>,
        resource_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            resource_dir: resource_dir.into(),
            data_dir: data_dir.into(),
            blank: false,
            auto_migrate: false,
            protection: FileProtection::default(),
            attach_async: true,
        }
    }
}

enum LoadState {
    Unloaded,
    Loading,
    Loaded(Context),
    LoadFailed,
}

/// Facade over one named store: owns the model, the descriptor and the
/// store-backed main context once loaded.
pub struct Storage {
    model: Arc<Model>,
    descriptor: StoreDescriptor,
    state: Arc<Mutex<LoadState>>,
}

impl Storage {
    /// Builds a storage whose model comes from the
    /// `<resource_dir>/<name>.model.json` resource.
    ///
    /// Returns `None` (logged) when the resource is absent or invalid, or
    /// when the descriptor cannot be resolved.
    pub fn new(config: &StorageConfig) -> Option<Self> {
        let model = Model::from_resource(&config.name, &config.resource_dir)?;
        Self::with_model(config, model)
    }

    /// Builds a storage around a programmatically constructed model.
    pub fn with_model(config: &StorageConfig, model: Model) -> Option<Self> {
        let options = StoreOptions {
            blank: config.blank,
            missing_file: MissingFilePolicy::Ignore,
            protection: config.protection,
            auto_migrate: config.auto_migrate,
            attach_async: config.attach_async,
        };
        let descriptor = StoreDescriptor::sqlite_store(&config.name, &config.data_dir, options)?;
        Some(Self {
            model: Arc::new(model),
            descriptor,
            state: Arc::new(Mutex::new(LoadState::Unloaded)),
        })
    }

    /// Attaches the backing store and establishes the main context.
    ///
    /// The attach runs off the calling thread when the descriptor says so;
    /// the returned task completes either way. Loading an already loaded
    /// (or currently loading) storage completes with
    /// `LoadError::AlreadyLoaded` without disturbing the existing store.
    pub fn load(&self) -> Task<LoadResult<()>> {
        let (completion, task) = Task::channel();
        {
            let mut state = self.lock_state();
            match *state {
                LoadState::Loaded(_) | LoadState::Loading => {
                    warn!(
                        "event=storage_load module=storage status=skipped reason=already_loaded path={}",
                        self.descriptor.path().display()
                    );
                    completion.resolve(Err(LoadError::AlreadyLoaded));
                    return task;
                }
                LoadState::Unloaded | LoadState::LoadFailed => *state = LoadState::Loading,
            }
        }

        let descriptor = self.descriptor.clone();
        let model = self.model.clone();
        let shared = self.state.clone();
        let attach = move || {
            let outcome = Store::attach(descriptor, model.clone());
            let mut state = shared
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match outcome {
                Ok(store) => {
                    let context = Context::store_backed(Arc::new(store), model);
                    *state = LoadState::Loaded(context);
                    info!("event=storage_load module=storage status=ok");
                    completion.resolve(Ok(()));
                }
                Err(err) => {
                    *state = LoadState::LoadFailed;
                    error!("event=storage_load module=storage status=error error={err}");
                    completion.resolve(Err(err));
                }
            }
        };

        if self.descriptor.attach_async() {
            thread::Builder::new()
                .name("lodestone-load".into())
                .spawn(attach)
                .expect("failed to spawn store load thread");
        } else {
            attach();
        }
        task
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.lock_state(), LoadState::Loaded(_))
    }

    /// The store-backed root context.
    pub fn main_context(&self) -> LoadResult<Context> {
        match &*self.lock_state() {
            LoadState::Loaded(context) => Ok(context.clone()),
            _ => Err(LoadError::NotLoaded),
        }
    }

    /// Deletes every entity of every type and saves the result durably.
    ///
    /// The deletions are recorded per entity in a derived background
    /// context; only the terminal chain save can fail, and that failure is
    /// what the returned task reports.
    pub fn clear(&self) -> LoadResult<Task<SaveResult<()>>> {
        let main = self.main_context()?;
        let (completion, task) = Task::channel();
        let model = self.model.clone();
        let origin = main.clone();
        let child = main.derive_child();
        child.perform(move |background| {
            for entity in model.entities() {
                background.record_delete_all(&entity.name);
            }
            let result = background.save_chain();
            match &result {
                Ok(()) => info!(
                    "event=storage_clear module=storage status=ok entities={}",
                    model.entities().len()
                ),
                Err(err) => {
                    error!("event=storage_clear module=storage status=error error={err}")
                }
            }
            origin.perform(move |_| completion.resolve(result));
        });
        Ok(task)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn lock_state(&self) -> MutexGuard<'_, LoadState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
