// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The type and instance registries.
//!
//! Both are explicit collaborators handed to pipelines at construction,
//! never process-wide singletons, so tests can run isolated clusters in
//! one process.

use crate::kernel::{InstanceRef, KernelPtr};
use crate::wire::{Decoder, WireError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

/// Instance ID of the main daemon kernel on every node. Probes address
/// their receiving principal with this ID.
pub const MAIN_KERNEL_ID: u64 = 1;

/// Rehydrates a kernel of one concrete type from its wire payload.
pub type KernelCtor = fn(&mut Decoder<'_>) -> Result<KernelPtr, WireError>;

#[derive(Debug, thiserror::Error)]
#[error("kernel type {0} registered twice")]
pub struct DuplicateType(pub u16);

/// Maps stable numeric type codes to kernel constructors. Registration
/// happens at startup behind the write lock; lookups take the shared
/// lock only.
#[derive(Default)]
pub struct TypeRegistry {
    inner: RwLock<HashMap<u16, KernelCtor>>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, wire_type: u16, ctor: KernelCtor) -> Result<(), DuplicateType> {
        let mut inner = self.inner.write();
        if inner.contains_key(&wire_type) {
            return Err(DuplicateType(wire_type));
        }
        inner.insert(wire_type, ctor);
        Ok(())
    }

    /// Rehydrate a received kernel payload.
    pub fn construct(
        &self,
        wire_type: u16,
        dec: &mut Decoder<'_>,
    ) -> Result<KernelPtr, WireError> {
        let ctor = {
            let inner = self.inner.read();
            inner
                .get(&wire_type)
                .copied()
                .ok_or(WireError::UnknownType(wire_type))?
        };
        ctor(dec)
    }

    #[must_use]
    pub fn knows(&self, wire_type: u16) -> bool {
        self.inner.read().contains_key(&wire_type)
    }
}

/// Process-wide table of live kernels addressable by ID: resident
/// kernels (main, discoverers) and parents suspended on outstanding
/// children. The lock is never held across I/O.
#[derive(Default)]
pub struct InstanceRegistry {
    inner: Mutex<HashMap<u64, InstanceRef>>,
}

impl InstanceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u64, instance: InstanceRef) {
        self.inner.lock().insert(id, instance);
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<InstanceRef> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<InstanceRef> {
        self.inner.lock().remove(&id)
    }

    /// Snapshot the registered instances; used when fanning out event
    /// kernels without holding the lock during delivery.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(u64, InstanceRef)> {
        self.inner
            .lock()
            .iter()
            .map(|(id, inst)| (*id, inst.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kernel::{Kernel, KernelCore};
    use crate::wire::Encoder;

    #[derive(Debug, Default)]
    struct Noop {
        core: KernelCore,
    }

    impl Kernel for Noop {
        fn core(&self) -> &KernelCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut KernelCore {
            &mut self.core
        }

        fn wire_type(&self) -> u16 {
            42
        }

        fn encode(&self, _enc: &mut Encoder<'_>) {}
    }

    fn make_noop(_dec: &mut Decoder<'_>) -> Result<KernelPtr, WireError> {
        Ok(Box::new(Noop::default()))
    }

    #[test]
    fn duplicate_registration_rejected() {
        let types = TypeRegistry::new();
        types.register(42, make_noop).unwrap();
        assert!(types.register(42, make_noop).is_err());
        assert!(types.knows(42));
        assert!(!types.knows(7));
    }

    #[test]
    fn unknown_type_fails_construction() {
        let types = TypeRegistry::new();
        let mut dec = Decoder::new(&[]);
        assert!(matches!(
            types.construct(7, &mut dec),
            Err(WireError::UnknownType(7))
        ));
    }
}
