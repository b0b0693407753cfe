//! Shared test fixtures: a mock driver and a few resource kinds built on it.
//!
//! Every `MockDriver` hands out device raw values from its own range, so tests
//! running in parallel inside one binary never share identities even though
//! they share the per-kind registries.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use vkshare::{
    AddressMap, ControlBlock, Dispatchable, DriverStatus, Handle, IdentityKey, InitError, RawHandle,
    RegistryError, RegistrySettings, Scoped, TeardownError, TeardownPolicy,
};

static NEXT_DRIVER_BASE: AtomicU64 = AtomicU64::new(1);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Mock driver
// ============================================================================

type ObjectKey = (Option<RawHandle>, RawHandle);

#[derive(Default)]
struct DriverState {
    live: FxHashSet<ObjectKey>,
    free: FxHashMap<RawHandle, Vec<RawHandle>>,
    next_child: FxHashMap<RawHandle, RawHandle>,
    destroyed: Vec<ObjectKey>,
    double_destroys: usize,
    create_conflicts: usize,
    fail_next_destroy: bool,
}

/// Records every create and destroy call and recycles child raw values LIFO,
/// the way real drivers reuse freed handles.
pub struct MockDriver {
    base: RawHandle,
    next_device: AtomicU64,
    state: Mutex<DriverState>,
    destroy_delay: Mutex<Option<Duration>>,
    destroys_started: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        let base = NEXT_DRIVER_BASE.fetch_add(1, Ordering::Relaxed) << 32;
        Arc::new(Self {
            base,
            next_device: AtomicU64::new(0),
            state: Mutex::new(DriverState::default()),
            destroy_delay: Mutex::new(None),
            destroys_started: AtomicUsize::new(0),
        })
    }

    pub fn create_device(&self) -> Result<RawHandle, DriverStatus> {
        let raw = self.base + self.next_device.fetch_add(1, Ordering::Relaxed);
        self.state.lock().live.insert((None, raw));
        Ok(raw)
    }

    /// Creates a child, reusing the most recently freed raw value first.
    pub fn create_object(&self, parent: RawHandle) -> Result<RawHandle, DriverStatus> {
        let mut state = self.state.lock();
        let recycled = state.free.get_mut(&parent).and_then(Vec::pop);
        let raw = match recycled {
            Some(raw) => raw,
            None => {
                let next = state.next_child.entry(parent).or_insert(1);
                let raw = *next;
                *next += 1;
                raw
            }
        };
        state.live.insert((Some(parent), raw));
        Ok(raw)
    }

    /// Creates a child with a caller-chosen raw value.
    ///
    /// Fails (and counts a conflict) if that value is still live, which would
    /// mean the registry let a new object in before the old one was destroyed.
    pub fn create_object_at(&self, parent: RawHandle, raw: RawHandle) -> Result<RawHandle, DriverStatus> {
        let mut state = self.state.lock();
        if !state.live.insert((Some(parent), raw)) {
            state.create_conflicts += 1;
            return Err(DriverStatus::INITIALIZATION_FAILED);
        }
        if let Some(free) = state.free.get_mut(&parent) {
            free.retain(|&r| r != raw);
        }
        Ok(raw)
    }

    pub fn destroy(&self, parent: Option<RawHandle>, raw: RawHandle) -> DriverStatus {
        self.destroys_started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.destroy_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        state.destroyed.push((parent, raw));
        let was_live = state.live.remove(&(parent, raw));
        if !was_live {
            state.double_destroys += 1;
        }
        if let Some(parent) = parent {
            state.free.entry(parent).or_default().push(raw);
        }
        let fail = std::mem::take(&mut state.fail_next_destroy);
        drop(state);

        if !was_live {
            DriverStatus::DEVICE_LOST
        } else if fail {
            DriverStatus::OUT_OF_HOST_MEMORY
        } else {
            DriverStatus::SUCCESS
        }
    }

    pub fn destroy_count(&self, parent: Option<RawHandle>, raw: RawHandle) -> usize {
        self.state
            .lock()
            .destroyed
            .iter()
            .filter(|&&key| key == (parent, raw))
            .count()
    }

    pub fn destroyed(&self) -> Vec<ObjectKey> {
        self.state.lock().destroyed.clone()
    }

    pub fn is_live(&self, parent: Option<RawHandle>, raw: RawHandle) -> bool {
        self.state.lock().live.contains(&(parent, raw))
    }

    pub fn double_destroys(&self) -> usize {
        self.state.lock().double_destroys
    }

    pub fn create_conflicts(&self) -> usize {
        self.state.lock().create_conflicts
    }

    pub fn fail_next_destroy(&self) {
        self.state.lock().fail_next_destroy = true;
    }

    pub fn set_destroy_delay(&self, delay: Option<Duration>) {
        *self.destroy_delay.lock() = delay;
    }

    /// Spins until `count` destroy calls have at least started.
    pub fn wait_for_destroys(&self, count: usize) {
        while self.destroys_started.load(Ordering::SeqCst) < count {
            std::thread::yield_now();
        }
    }
}

// ============================================================================
// Control blocks
// ============================================================================

pub struct DeviceInfo {
    pub driver: Arc<MockDriver>,
    pub raw: RawHandle,
    pub label: String,
}

#[derive(Default)]
pub struct DeviceBlock {
    pub driver: Option<Arc<MockDriver>>,
    pub raw: RawHandle,
    pub label: String,
}

impl ControlBlock for DeviceBlock {
    type CreateInfo = DeviceInfo;

    fn populate(&mut self, info: DeviceInfo) -> Result<(), InitError> {
        self.driver = Some(info.driver);
        self.raw = info.raw;
        self.label = info.label;
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TeardownError> {
        let driver = self.driver.as_ref().expect("populated device");
        driver.destroy(None, self.raw).result().map_err(TeardownError::new)
    }
}

pub struct ImageInfo {
    pub device: Device,
    pub raw: RawHandle,
    pub extent: (u32, u32),
}

/// Scoped to its device; keeps the device alive and destroys itself on it.
#[derive(Default)]
pub struct ImageBlock {
    pub device: Device,
    pub raw: RawHandle,
    pub extent: (u32, u32),
    pub texels: u64,
}

impl ControlBlock for ImageBlock {
    type CreateInfo = ImageInfo;

    fn populate(&mut self, info: ImageInfo) -> Result<(), InitError> {
        if info.extent.0 == 0 || info.extent.1 == 0 {
            return Err(InitError::new("zero-sized image"));
        }
        self.device = info.device;
        self.raw = info.raw;
        self.extent = info.extent;
        Ok(())
    }

    fn post_init(&mut self) -> Result<(), InitError> {
        self.texels = u64::from(self.extent.0) * u64::from(self.extent.1);
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TeardownError> {
        let driver = self.device.block().driver.as_ref().expect("populated device");
        driver
            .destroy(Some(self.device.raw()), self.raw)
            .result()
            .map_err(TeardownError::new)
    }
}

/// Device-address table shared by every buffer.
pub static BUFFER_ADDRESSES: AddressMap<Scoped> = AddressMap::new();

pub struct BufferInfo {
    pub device: Device,
    pub raw: RawHandle,
    pub address: u64,
    pub size: u64,
}

#[derive(Default)]
pub struct BufferBlock {
    pub device: Device,
    pub raw: RawHandle,
    pub address: u64,
    pub size: u64,
}

impl ControlBlock for BufferBlock {
    type CreateInfo = BufferInfo;

    fn populate(&mut self, info: BufferInfo) -> Result<(), InitError> {
        let identity = Scoped::child_of(&Dispatchable::new(info.device.raw()), info.raw);
        BUFFER_ADDRESSES
            .insert(info.address, info.size, identity)
            .map_err(|err| InitError::new(err.to_string()))?;
        self.device = info.device;
        self.raw = info.raw;
        self.address = info.address;
        self.size = info.size;
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TeardownError> {
        BUFFER_ADDRESSES.remove(self.address);
        let driver = self.device.block().driver.as_ref().expect("populated device");
        driver
            .destroy(Some(self.device.raw()), self.raw)
            .result()
            .map_err(TeardownError::new)
    }
}

pub struct PipelineInfo {
    pub device: Device,
    pub raw: RawHandle,
    pub base: Pipeline,
    pub label: &'static str,
}

/// Outcome of the lookup each pipeline teardown makes on its own kind, keyed
/// by `(device, raw)`.
pub static PIPELINE_TEARDOWN_LOOKUPS: Mutex<Vec<(ObjectKey, Option<RegistryError>)>> = Mutex::new(Vec::new());

/// A derived pipeline holds a handle to its base pipeline, a handle of its
/// own kind, and lets go of it as part of its destroy sequence.
#[derive(Default)]
pub struct PipelineBlock {
    pub device: Device,
    pub raw: RawHandle,
    pub base: Pipeline,
    pub label: &'static str,
}

impl ControlBlock for PipelineBlock {
    type CreateInfo = PipelineInfo;

    fn populate(&mut self, info: PipelineInfo) -> Result<(), InitError> {
        if info.label.is_empty() {
            return Err(InitError::new("unlabelled pipeline"));
        }
        self.device = info.device;
        self.raw = info.raw;
        self.base = info.base;
        self.label = info.label;
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TeardownError> {
        let parent = self.device.raw();
        let seen = Pipeline::lookup(Some(parent), self.raw).err();
        PIPELINE_TEARDOWN_LOOKUPS.lock().push(((Some(parent), self.raw), seen));

        let driver = self.device.block().driver.as_ref().expect("populated device");
        let status = driver.destroy(Some(parent), self.raw);
        self.base.reset();
        status.result().map_err(TeardownError::new)
    }
}

/// Deferred-teardown kind whose destroy call can be made to panic.
#[derive(Default)]
pub struct FragileBlock {
    pub raw: RawHandle,
    pub panic_on_teardown: bool,
}

impl ControlBlock for FragileBlock {
    type CreateInfo = (RawHandle, bool);

    fn populate(&mut self, (raw, panic_on_teardown): (RawHandle, bool)) -> Result<(), InitError> {
        self.raw = raw;
        self.panic_on_teardown = panic_on_teardown;
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TeardownError> {
        assert!(!self.panic_on_teardown, "driver crashed destroying {:#x}", self.raw);
        Ok(())
    }
}

vkshare::define_resource_kind! {
    pub Device: Dispatchable => DeviceBlock;
    pub Image: Scoped => ImageBlock;
    pub DeferredImage: Scoped => ImageBlock,
        settings = RegistrySettings::default().with_teardown(TeardownPolicy::Deferred);
    pub Buffer: Scoped => BufferBlock;
    pub Pipeline: Scoped => PipelineBlock;
    pub Fragile: Dispatchable => FragileBlock,
        settings = RegistrySettings::default().with_teardown(TeardownPolicy::Deferred);
}

// ============================================================================
// Helpers
// ============================================================================

pub fn device(driver: &Arc<MockDriver>) -> Device {
    let raw = driver.create_device().unwrap();
    Device::create(
        Dispatchable::new(raw),
        DeviceInfo {
            driver: Arc::clone(driver),
            raw,
            label: format!("device {raw:#x}"),
        },
    )
    .unwrap()
}

pub fn image_info(device: &Device, raw: RawHandle, extent: (u32, u32)) -> ImageInfo {
    ImageInfo {
        device: device.clone(),
        raw,
        extent,
    }
}

pub fn image_identity(device: &Device, raw: RawHandle) -> Scoped {
    Scoped::child_of(&device.identity().unwrap(), raw)
}

/// Creates an image of kind `K` with the driver picking the raw value.
pub fn image_of<K>(device: &Device, extent: (u32, u32)) -> Handle<K>
where
    K: vkshare::ResourceKind<Identity = Scoped, ControlBlock = ImageBlock>,
{
    let driver = Arc::clone(device.block().driver.as_ref().unwrap());
    let parent = device.raw();
    let raw = driver.create_object(parent).unwrap();
    Handle::<K>::create(Scoped::new(parent, raw), image_info(device, raw, extent)).unwrap()
}

/// Creates an image of kind `K` at a caller-chosen raw value.
pub fn image_at<K>(device: &Device, raw: RawHandle, extent: (u32, u32)) -> Handle<K>
where
    K: vkshare::ResourceKind<Identity = Scoped, ControlBlock = ImageBlock>,
{
    let driver = Arc::clone(device.block().driver.as_ref().unwrap());
    driver.create_object_at(device.raw(), raw).unwrap();
    Handle::<K>::create(image_identity(device, raw), image_info(device, raw, extent)).unwrap()
}

/// Creates a pipeline at a caller-chosen raw value, derived from `base`
/// (pass a null handle for a base pipeline).
pub fn pipeline_at(device: &Device, raw: RawHandle, base: &Pipeline) -> Pipeline {
    let driver = driver_of(device);
    driver.create_object_at(device.raw(), raw).unwrap();
    Pipeline::create(Scoped::new(device.raw(), raw), pipeline_info(device, raw, base)).unwrap()
}

pub fn pipeline_info(device: &Device, raw: RawHandle, base: &Pipeline) -> PipelineInfo {
    PipelineInfo {
        device: device.clone(),
        raw,
        base: base.clone(),
        label: "pipeline",
    }
}

pub fn driver_of(device: &Device) -> Arc<MockDriver> {
    Arc::clone(device.block().driver.as_ref().unwrap())
}

pub fn assert_scoped_parent(identity: Scoped, parent: RawHandle) {
    assert_eq!(identity.parent_raw(), Some(parent));
}
