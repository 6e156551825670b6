//! Kernel invocation bracketing.
//!
//! [`Coherence::prepare_invocation`] makes every argument of a kernel
//! resident at the target device and pins them all, so preparing a later
//! argument cannot evict an earlier one. The caller launches the kernel on
//! the returned buffers, then reports completion so written arguments are
//! committed and the pins dropped.

use hetarray_compute::{ComputeBackend, DeviceId, Location};

use crate::array::ArrayId;
use crate::engine::Coherence;
use crate::error::{CoherenceError, CoherenceResult};
use crate::intent::AccessIntent;

/// One argument of a prepared invocation.
#[derive(Debug, Clone)]
pub struct Binding<Buf> {
    /// Array passed.
    pub array: ArrayId,
    /// Intent it was prepared with, merged over duplicate arguments.
    pub intent: AccessIntent,
    /// Device buffer to hand to the kernel; `None` for unused arguments.
    pub buffer: Option<Buf>,
}

/// Arguments of a kernel invocation, resident and pinned at one device.
#[derive(Debug)]
#[must_use = "an invocation keeps its arguments pinned until completed or aborted"]
pub struct Invocation<Buf> {
    device: DeviceId,
    bindings: Vec<Binding<Buf>>,
    writes: Vec<ArrayId>,
}

impl<Buf> Invocation<Buf> {
    /// Target device.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Bindings in argument order.
    pub fn bindings(&self) -> &[Binding<Buf>] {
        &self.bindings
    }

    /// Buffer of argument `index`.
    pub fn buffer(&self, index: usize) -> Option<&Buf> {
        self.bindings.get(index).and_then(|b| b.buffer.as_ref())
    }

    /// Arrays committed as written on completion.
    pub fn writes(&self) -> &[ArrayId] {
        &self.writes
    }
}

impl<B: ComputeBackend> Coherence<B> {
    /// Make every argument ready at `device` for the given intents.
    ///
    /// On failure no argument stays pinned; arguments already prepared stay
    /// resident and valid.
    pub fn prepare_invocation(
        &mut self,
        device: DeviceId,
        args: &[(ArrayId, AccessIntent)],
    ) -> CoherenceResult<Invocation<B::Buffer>> {
        let location = Location::Device(device);
        self.check_location(location)?;
        if self.pins.has_invocation() {
            return Err(CoherenceError::violation(
                "an invocation is already prepared and not completed",
            ));
        }

        let mut merged: Vec<(ArrayId, AccessIntent)> = Vec::new();
        for &(array, intent) in args {
            self.entry(array)?;
            match merged.iter_mut().find(|(id, _)| *id == array) {
                Some((_, existing)) => *existing = existing.merge(intent),
                None => merged.push((array, intent)),
            }
        }

        self.pins.pin_invocation(merged.iter().map(|&(id, _)| id));
        for &(array, intent) in &merged {
            if let Err(err) = self.ensure_valid(array, location, intent) {
                self.pins.clear_invocation();
                return Err(err);
            }
        }

        let mut bindings = Vec::with_capacity(args.len());
        for &(array, _) in args {
            let intent = merged
                .iter()
                .find(|(id, _)| *id == array)
                .map_or(AccessIntent::None, |&(_, intent)| intent);
            let buffer = match intent {
                AccessIntent::None => None,
                _ => self.buffer(array, device)?.cloned(),
            };
            bindings.push(Binding {
                array,
                intent,
                buffer,
            });
        }

        let writes = merged
            .iter()
            .filter(|(_, intent)| intent.writes())
            .map(|&(id, _)| id)
            .collect();
        tracing::debug!(
            "Prepared invocation of {} arguments at {}",
            bindings.len(),
            device
        );
        Ok(Invocation {
            device,
            bindings,
            writes,
        })
    }

    /// Commit the written arguments of a finished kernel and unpin all.
    pub fn complete_invocation(&mut self, invocation: Invocation<B::Buffer>) -> CoherenceResult<()> {
        let location = Location::Device(invocation.device);
        let result = invocation
            .writes
            .iter()
            .try_for_each(|&array| self.commit_write(array, location));
        self.pins.clear_invocation();
        result
    }

    /// Drop an invocation whose kernel never ran.
    pub fn abort_invocation(&mut self, invocation: Invocation<B::Buffer>) {
        tracing::debug!("Aborted invocation at {}", invocation.device);
        self.pins.clear_invocation();
    }
}

#[cfg(test)]
mod tests {
    use crate::{AccessIntent, ArrayDesc, Coherence, CoherenceError};
    use hetarray_compute::{DeviceId, EmulatedBackend, Location};

    const GPU0: DeviceId = DeviceId::gpu(0);

    #[test]
    fn test_invocation_commits_writes() {
        let mut engine = Coherence::new(EmulatedBackend::gpus(1, 1 << 16).unwrap());
        let x = engine.create_from(&[4], &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let y = engine.create(ArrayDesc::of::<f32>(&[4]).unwrap());

        let invocation = engine
            .prepare_invocation(GPU0, &[(x, AccessIntent::ReadOnly), (y, AccessIntent::WriteOnly)])
            .unwrap();
        assert_eq!(invocation.writes(), &[y]);

        // y = 2 * x
        let input = engine
            .backend()
            .read_elements::<f32>(invocation.buffer(0).unwrap())
            .unwrap();
        let doubled: Vec<f32> = input.iter().map(|v| v * 2.0).collect();
        engine
            .backend()
            .write_buffer(invocation.buffer(1).unwrap(), bytemuck::cast_slice(&doubled))
            .unwrap();
        engine.complete_invocation(invocation).unwrap();

        assert_eq!(engine.valid_locations(y).unwrap(), vec![Location::Device(GPU0)]);
        assert_eq!(engine.host_read_as::<f32>(y).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(engine.valid_locations(x).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_arguments_merge() {
        let mut engine = Coherence::new(EmulatedBackend::gpus(1, 1 << 16).unwrap());
        let x = engine.create_from(&[2], &[5u32, 6]).unwrap();

        let invocation = engine
            .prepare_invocation(GPU0, &[(x, AccessIntent::ReadOnly), (x, AccessIntent::WriteOnly)])
            .unwrap();
        assert_eq!(invocation.bindings()[0].intent, AccessIntent::ReadWrite);
        assert!(engine.is_valid(x, GPU0.into()).unwrap());

        // Only one invocation at a time.
        assert!(matches!(
            engine.prepare_invocation(GPU0, &[(x, AccessIntent::ReadOnly)]),
            Err(CoherenceError::ProtocolViolation(_))
        ));
        engine.abort_invocation(invocation);
        assert_eq!(engine.valid_locations(x).unwrap().len(), 2);
    }
}
