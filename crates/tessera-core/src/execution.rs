//! Ordered submission of device work.
//!
//! An [`ExecutionContext`] is one step of a logical operation. A multi-launch
//! operation splits its context into a series with
//! [`generate_series_context`](ExecutionContext::generate_series_context):
//! the first step inherits the caller's dependencies, the last step signals
//! the caller's completion event, and everything in between relies on the
//! submission order of the single device queue.

use crate::context::Context;
use crate::program_cache::Program;
use crate::{Error, Result};
use std::sync::{Arc, Mutex};

/// Completion handle for one named unit of work.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    index: usize,
    submission: Option<wgpu::SubmissionIndex>,
}

impl Event {
    /// Event for work that already completed on the host.
    pub fn completed(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            index,
            submission: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sub-step index within the operation (e.g. the batch item).
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_device(&self) -> bool {
        self.submission.is_some()
    }

    /// Block until the work behind this event has finished.
    pub fn wait(&self, ctx: &Context) -> Result<()> {
        let Some(submission) = &self.submission else {
            return Ok(());
        };
        ctx.device()?
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission.clone()),
                timeout: None,
            })
            .map_err(|e| Error::Device(format!("Waiting for '{}' failed: {e:?}", self.name)))?;
        Ok(())
    }
}

/// A single compute dispatch.
pub struct KernelLaunch<'a> {
    /// Event name, e.g. `"im2col"`.
    pub name: &'a str,
    /// Sub-step index, e.g. the batch item.
    pub index: usize,
    pub program: &'a Program,
    /// Buffers in binding order.
    pub buffers: &'a [&'a wgpu::Buffer],
    pub workgroups: [u32; 3],
}

type Slot = Arc<Mutex<Option<Event>>>;

/// One step in an ordered series of device operations.
#[derive(Clone)]
pub struct ExecutionContext {
    device: Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)>,
    waits: Vec<Event>,
    signal: Option<Slot>,
}

impl ExecutionContext {
    /// Root context for one call on `ctx`. It has no dependencies and
    /// records its completion event.
    pub fn new(ctx: &Context) -> Self {
        let device = if ctx.is_cpu_context() {
            None
        } else {
            ctx.device()
                .ok()
                .zip(ctx.queue().ok())
                .map(|(d, q)| (Arc::clone(d), Arc::clone(q)))
        };
        Self {
            device,
            waits: Vec::new(),
            signal: Some(Arc::new(Mutex::new(None))),
        }
    }

    /// Events that must complete before this step starts.
    pub fn with_dependencies(mut self, events: Vec<Event>) -> Self {
        self.waits = events;
        self
    }

    /// Context for step `index` of `total`.
    pub fn generate_series_context(&self, index: usize, total: usize) -> Self {
        if total <= 1 {
            return self.clone();
        }
        let first = index == 0;
        let last = index + 1 >= total;
        Self {
            device: self.device.clone(),
            waits: if first { self.waits.clone() } else { Vec::new() },
            signal: if last { self.signal.clone() } else { None },
        }
    }

    /// Events this step waits on.
    pub fn events(&self) -> &[Event] {
        &self.waits
    }

    /// Whether this step produces the series' completion event.
    pub fn signals_completion(&self) -> bool {
        self.signal.is_some()
    }

    /// Completion event of the series, once its last step has been submitted.
    pub fn completion(&self) -> Option<Event> {
        self.signal
            .as_ref()
            .and_then(|slot| slot.lock().ok().and_then(|e| e.clone()))
    }

    /// Encode `launch` as one compute pass and submit it.
    ///
    /// Waits recorded on this step are satisfied by queue order: every event
    /// handed out by this type belongs to the same queue and was submitted
    /// earlier.
    pub fn enqueue_kernel(&self, launch: KernelLaunch<'_>) -> Result<Event> {
        let (device, queue) = self.device.as_ref().ok_or_else(|| {
            Error::Validation(format!("Kernel '{}' enqueued on a CPU context", launch.name))
        })?;

        let bind_group = launch.program.bind(device, launch.buffers)?;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(launch.name),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(launch.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(launch.program.pipeline());
            pass.set_bind_group(0, &bind_group, &[]);
            let [x, y, z] = launch.workgroups;
            pass.dispatch_workgroups(x, y, z);
        }
        let submission = queue.submit(std::iter::once(encoder.finish()));

        tracing::trace!(
            name = launch.name,
            index = launch.index,
            program = launch.program.label(),
            waits = self.waits.len(),
            "kernel enqueued"
        );

        let event = Event {
            name: launch.name.to_string(),
            index: launch.index,
            submission: Some(submission),
        };
        self.record(&event);
        Ok(event)
    }

    /// Record completion of host-side work for this step.
    pub fn record_host_event(&self, name: &str, index: usize) -> Event {
        let event = Event::completed(name, index);
        self.record(&event);
        event
    }

    /// Block until everything submitted on this context's queue has finished.
    pub fn synchronize(&self) -> Result<()> {
        if let Some((device, _)) = &self.device {
            device
                .poll(wgpu::PollType::Wait {
                    submission_index: None,
                    timeout: None,
                })
                .map_err(|e| Error::Device(format!("GPU poll failed: {e:?}")))?;
        }
        Ok(())
    }

    fn record(&self, event: &Event) {
        if let Some(slot) = &self.signal {
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(event.clone());
            }
        }
    }
}
