// Process-wide lazily initialized model handle
//
// Warm-up at startup calls `get()` once; if that fails the cell stays empty
// and the next request retries the load.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::{error, info};

type Loader<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

pub struct LazyModel<T> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    loader: Loader<T>,
}

impl<T> LazyModel<T> {
    pub fn new<F>(name: &'static str, loader: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            name,
            cell: OnceCell::new(),
            loader: Box::new(loader),
        }
    }

    /// Handle to the loaded model, loading it on first use
    ///
    /// Blocks while loading; call from a blocking context. Concurrent callers
    /// wait for the same load instead of racing.
    pub fn get(&self) -> anyhow::Result<Arc<T>> {
        self.cell
            .get_or_try_init(|| {
                info!("Loading {} model...", self.name);
                match (self.loader)() {
                    Ok(model) => {
                        info!("✓ {} model loaded", self.name);
                        Ok(Arc::new(model))
                    }
                    Err(e) => {
                        error!("Failed to load {} model: {:#}", self.name, e);
                        Err(e)
                    }
                }
            })
            .map(Arc::clone)
    }

    /// Handle to the model only if it is already loaded (never blocks)
    pub fn get_if_loaded(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    /// Whether the model has been loaded successfully
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_loads_once_and_shares() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let model = LazyModel::new("stub", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(42u32)
        });

        let a = model.get().unwrap();
        let b = model.get().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(model.is_loaded());
    }

    #[test]
    fn test_failed_load_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let model = LazyModel::new("flaky", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("weights missing")
            }
            Ok("ready")
        });

        assert!(model.get().is_err());
        assert!(!model.is_loaded());
        assert_eq!(*model.get().unwrap(), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
