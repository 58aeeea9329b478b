// Bootstrap lifecycle tracking
//
// The device walks a fixed list of stages on the way up and the same list
// backwards on the way down. Objects built on top of the device (swapchain,
// frame synchronizer) register as dependents and must be released before the
// device may start tearing down.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bootstrap stages in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    Uninitialized,
    LoaderReady,
    ExtensionsEnumerated,
    LayersEnumerated,
    InstanceCreated,
    SurfaceCreated,
    PhysicalDeviceChosen,
    LogicalDeviceCreated,
    QueueReady,
    Ready,
}

impl BootStage {
    pub const ALL: [BootStage; 10] = [
        BootStage::Uninitialized,
        BootStage::LoaderReady,
        BootStage::ExtensionsEnumerated,
        BootStage::LayersEnumerated,
        BootStage::InstanceCreated,
        BootStage::SurfaceCreated,
        BootStage::PhysicalDeviceChosen,
        BootStage::LogicalDeviceCreated,
        BootStage::QueueReady,
        BootStage::Ready,
    ];

    pub fn next(self) -> Option<BootStage> {
        Self::ALL.get(self as usize + 1).copied()
    }

    pub fn previous(self) -> Option<BootStage> {
        (self as usize).checked_sub(1).map(|i| Self::ALL[i])
    }
}

/// Objects whose lifetime is nested inside the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependent {
    Swapchain,
    FrameSync,
}

impl Dependent {
    const COUNT: usize = 2;

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    stage: BootStage,
    dependents: [AtomicUsize; Dependent::COUNT],
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            stage: BootStage::Uninitialized,
            dependents: Default::default(),
        }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    pub fn is_ready(&self) -> bool {
        self.stage == BootStage::Ready
    }

    /// Move up to `to`, which must directly follow the current stage.
    pub fn advance(&mut self, to: BootStage) {
        debug_assert_eq!(
            self.stage.next(),
            Some(to),
            "bootstrap stage {:?} is not reachable from {:?}",
            to,
            self.stage
        );
        log::debug!("Bootstrap: {:?} -> {:?}", self.stage, to);
        self.stage = to;
    }

    /// Leave stage `from`, which must be the current stage.
    ///
    /// Leaving `Ready` requires every dependent to be released first.
    pub fn retreat(&mut self, from: BootStage) {
        debug_assert_eq!(
            self.stage, from,
            "teardown out of order: asked to leave {:?} while at {:?}",
            from, self.stage
        );
        if from == BootStage::Ready {
            self.assert_no_dependents();
        }
        if let Some(prev) = from.previous() {
            log::debug!("Teardown: {:?} -> {:?}", from, prev);
            self.stage = prev;
        }
    }

    pub fn attach(&self, dependent: Dependent) {
        debug_assert!(
            self.is_ready(),
            "{:?} created before the device reached Ready (at {:?})",
            dependent,
            self.stage
        );
        self.dependents[dependent.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn detach(&self, dependent: Dependent) {
        let previous = self.dependents[dependent.index()].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "{:?} released more often than created", dependent);
    }

    pub fn live(&self, dependent: Dependent) -> usize {
        self.dependents[dependent.index()].load(Ordering::Relaxed)
    }

    fn assert_no_dependents(&self) {
        for dependent in [Dependent::Swapchain, Dependent::FrameSync] {
            if self.live(dependent) > 0 {
                log::error!("Device teardown with {:?} still alive", dependent);
            }
            debug_assert_eq!(
                self.live(dependent),
                0,
                "device torn down while {:?} is still alive",
                dependent
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> Lifecycle {
        let mut lifecycle = Lifecycle::new();
        for stage in &BootStage::ALL[1..] {
            lifecycle.advance(*stage);
        }
        lifecycle
    }

    #[test]
    fn walks_every_stage_up_and_back_down() {
        let mut lifecycle = ready();
        assert!(lifecycle.is_ready());

        for stage in BootStage::ALL[1..].iter().rev() {
            lifecycle.retreat(*stage);
        }
        assert_eq!(lifecycle.stage(), BootStage::Uninitialized);
    }

    #[test]
    fn neighbours_are_consistent() {
        assert_eq!(BootStage::Uninitialized.previous(), None);
        assert_eq!(BootStage::Ready.next(), None);
        assert_eq!(
            BootStage::SurfaceCreated.next(),
            Some(BootStage::PhysicalDeviceChosen)
        );
        assert_eq!(
            BootStage::SurfaceCreated.previous(),
            Some(BootStage::InstanceCreated)
        );
    }

    #[test]
    fn released_dependents_allow_teardown() {
        let mut lifecycle = ready();
        lifecycle.attach(Dependent::Swapchain);
        lifecycle.attach(Dependent::FrameSync);
        assert_eq!(lifecycle.live(Dependent::Swapchain), 1);

        lifecycle.detach(Dependent::FrameSync);
        lifecycle.detach(Dependent::Swapchain);
        lifecycle.retreat(BootStage::Ready);
        assert_eq!(lifecycle.stage(), BootStage::QueueReady);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not reachable")]
    fn skipping_a_stage_traps() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(BootStage::LoaderReady);
        lifecycle.advance(BootStage::InstanceCreated);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "still alive")]
    fn tearing_down_device_before_swapchain_traps() {
        let mut lifecycle = ready();
        lifecycle.attach(Dependent::Swapchain);
        lifecycle.retreat(BootStage::Ready);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "teardown out of order")]
    fn tearing_down_from_the_wrong_stage_traps() {
        let mut lifecycle = ready();
        lifecycle.retreat(BootStage::LogicalDeviceCreated);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "before the device reached Ready")]
    fn attaching_to_an_unfinished_device_traps() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(BootStage::LoaderReady);
        lifecycle.attach(Dependent::FrameSync);
    }
}
