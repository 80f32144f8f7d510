//! Process-global addon registries, one per addon kind, see `spec.md` section 4.2.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use indexmap::IndexMap;
pub use ten_runtime_protocol::AddonKind;

use crate::error::AddonError;
use crate::value::Value;

/// An instance produced by an [`Addon`]: an extension, extension group,
/// protocol, or addon loader, type-erased so the registry can hold every
/// kind uniformly.
pub type Instance = Box<dyn std::any::Any + Send>;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The vtable a registration installs, see `spec.md` section 4.2.
///
/// Modelled as async methods returning boxed futures (rather than the
/// original's `on_create_instance(..., cb, cb_data)` callback pair) per the
/// "C-style async callbacks" redesign note in `spec.md` section 9.
pub trait Addon: Send + Sync {
    /// Runs once, right after registration; must assert the addon's own name
    /// matches the manifest's declared name.
    fn on_init(&self) -> Result<(), AddonError> {
        Ok(())
    }

    fn on_deinit(&self) {}

    fn on_create_instance(&self, instance_name: &str) -> BoxFuture<Result<Instance, AddonError>>;

    fn on_destroy_instance(&self, instance: Instance) -> BoxFuture<()>;
}

/// Loads an addon's `manifest.json`/`property.json` from its `base_dir`.
///
/// `spec.md` excludes the dynamic-library addon *loader*; this only covers
/// reading the two JSON files next to an addon that is already registered
/// in-process, per the `addon_host.c` supplement in `SPEC_FULL.md`.
pub trait ManifestLoader: Send + Sync {
    fn load_manifest(&self, base_dir: &Utf8PathBuf) -> Option<Value>;
    fn load_property(&self, base_dir: &Utf8PathBuf) -> Option<Value>;
}

/// Reads `manifest.json`/`property.json` as plain files next to `base_dir`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemManifestLoader;

impl ManifestLoader for FilesystemManifestLoader {
    fn load_manifest(&self, base_dir: &Utf8PathBuf) -> Option<Value> {
        load_json_file(&base_dir.join("manifest.json"))
    }

    fn load_property(&self, base_dir: &Utf8PathBuf) -> Option<Value> {
        load_json_file(&base_dir.join("property.json"))
    }
}

fn load_json_file(path: &Utf8PathBuf) -> Option<Value> {
    let contents = std::fs::read_to_string(path).ok()?;
    let json: serde_json::Value = serde_json::from_str(&contents).ok()?;
    let wire: ten_runtime_protocol::WireValue = serde_json::from_value(json).ok()?;
    Some(Value::from(&wire))
}

/// One installed registration, see `spec.md` section 4.2.
pub struct AddonHost {
    pub kind: AddonKind,
    pub name: String,
    pub base_dir: Option<Utf8PathBuf>,
    pub manifest: Value,
    pub property: Value,
    pub addon: Arc<dyn Addon>,
    ref_count: AtomicUsize,
}

impl AddonHost {
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }
}

/// The per-kind, process-global addon store, see `spec.md` section 4.2.
///
/// Owned by one `App`; if multiple `App`s exist in one process, each has its
/// own registry (`spec.md` section 9).
#[derive(Default)]
pub struct AddonRegistry {
    stores: Mutex<HashMap<AddonKind, IndexMap<String, Arc<AddonHost>>>>,
    manifest_loader: Option<Arc<dyn ManifestLoader>>,
}

impl AddonRegistry {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            manifest_loader: Some(Arc::new(FilesystemManifestLoader)),
        }
    }

    pub fn with_manifest_loader(loader: Arc<dyn ManifestLoader>) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            manifest_loader: Some(loader),
        }
    }

    /// Installs a new registration under `(kind, name)`.
    ///
    /// Fails with [`AddonError::DuplicateName`] if `name` is already present
    /// for `kind`, see `spec.md` section 4.2.
    pub fn register(
        &self,
        kind: AddonKind,
        name: impl Into<String>,
        base_dir: Option<Utf8PathBuf>,
        addon: Arc<dyn Addon>,
    ) -> Result<(), AddonError> {
        let name = name.into();
        let mut stores = self.stores.lock().unwrap();
        let store = stores.entry(kind).or_default();
        if store.contains_key(&name) {
            return Err(AddonError::DuplicateName(name));
        }

        addon.on_init()?;

        let (manifest, property) = match (&self.manifest_loader, &base_dir) {
            (Some(loader), Some(dir)) => (
                loader.load_manifest(dir).unwrap_or_else(Value::empty_object),
                loader.load_property(dir).unwrap_or_else(Value::empty_object),
            ),
            _ => (Value::empty_object(), Value::empty_object()),
        };

        store.insert(
            name.clone(),
            Arc::new(AddonHost {
                kind,
                name,
                base_dir,
                manifest,
                property,
                addon,
                ref_count: AtomicUsize::new(1),
            }),
        );
        Ok(())
    }

    /// Looks up the host registered for `(kind, name)`.
    pub fn host(&self, kind: AddonKind, name: &str) -> Result<Arc<AddonHost>, AddonError> {
        self.stores
            .lock()
            .unwrap()
            .get(&kind)
            .and_then(|store| store.get(name))
            .cloned()
            .ok_or_else(|| AddonError::UnknownAddon(name.to_owned()))
    }

    /// Creates an instance by delegating to the addon's `on_create_instance`.
    pub async fn create_instance(
        &self,
        kind: AddonKind,
        name: &str,
        instance_name: &str,
    ) -> Result<Instance, AddonError> {
        let host = self.host(kind, name)?;
        host.ref_count.fetch_add(1, Ordering::SeqCst);
        let result = host.addon.on_create_instance(instance_name).await;
        if result.is_err() {
            host.ref_count.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    /// Destroys an instance by delegating to the addon's `on_destroy_instance`.
    pub async fn destroy_instance(&self, kind: AddonKind, name: &str, instance: Instance) -> Result<(), AddonError> {
        let host = self.host(kind, name)?;
        host.addon.on_destroy_instance(instance).await;
        host.ref_count.fetch_sub(1, Ordering::SeqCst);
        self.maybe_remove(kind, name);
        Ok(())
    }

    /// Decrements the registration's refcount; the entry is removed only once
    /// it reaches zero, see `spec.md` section 4.2.
    pub fn unregister(&self, kind: AddonKind, name: &str) -> Result<(), AddonError> {
        let host = self.host(kind, name)?;
        host.ref_count.fetch_sub(1, Ordering::SeqCst);
        self.maybe_remove(kind, name);
        Ok(())
    }

    fn maybe_remove(&self, kind: AddonKind, name: &str) {
        let mut stores = self.stores.lock().unwrap();
        if let Some(store) = stores.get_mut(&kind)
            && store.get(name).is_some_and(|host| host.ref_count() == 0)
        {
            if let Some(host) = store.shift_remove(name) {
                host.addon.on_deinit();
            }
        }
    }

    pub fn ref_count(&self, kind: AddonKind, name: &str) -> Option<usize> {
        self.stores
            .lock()
            .unwrap()
            .get(&kind)
            .and_then(|store| store.get(name))
            .map(|host| host.ref_count())
    }
}
