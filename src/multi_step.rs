//! Multi-step coordinator: one gate per pipeline stage.
//!
//! A [`MultiStepGate`] holds a fixed-length array of independent [`Gate`]s,
//! one per logical stage, and hands the array to a user callable. The
//! coordinator imposes no ordering between steps — the callable decides
//! which gates to acquire and in what order, making this a policy-free
//! composition. The step count is a const generic, so a mismatched
//! concurrency vector is a compile error rather than a runtime one.
//!
//! Gates are shared handles, so the callable receives cheap clones of the
//! coordinator's gates; acquiring through a clone contends on the same
//! underlying slots.
//!
//! # Example
//!
//! ```
//! use taskgate::lab::Lab;
//! use taskgate::multi_step::MultiStepGate;
//!
//! let lab = Lab::new();
//! let pipeline: MultiStepGate<2> = MultiStepGate::with_timer([2, 1], lab.timer());
//!
//! let result = lab.block_on(pipeline.run(|steps| async move {
//!     let decode = steps[0].acquire().await;
//!     // ... stage one work ...
//!     drop(decode);
//!     let publish = steps[1].acquire().await;
//!     // ... stage two work ...
//!     drop(publish);
//!     "done"
//! }));
//! assert_eq!(result, "done");
//! ```

use crate::config::GateOptions;
use crate::gate::Gate;
use crate::time::TimerDriverHandle;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// An ordered tuple of `N` independent gates.
#[derive(Debug, Clone)]
pub struct MultiStepGate<const N: usize> {
    gates: [Gate; N],
}

impl<const N: usize> MultiStepGate<N> {
    /// Creates `N` gates over a fresh monotonic timer driver, one per step
    /// concurrency. Invalid concurrencies are coerced per gate.
    #[must_use]
    pub fn new(step_concurrencies: [usize; N]) -> Self {
        Self::with_timer(step_concurrencies, TimerDriverHandle::monotonic())
    }

    /// Creates `N` gates over a shared timer driver.
    #[must_use]
    pub fn with_timer(step_concurrencies: [usize; N], timer: TimerDriverHandle) -> Self {
        Self {
            gates: step_concurrencies.map(|concurrency| {
                Gate::with_timer(GateOptions::new().concurrency(concurrency), timer.clone())
            }),
        }
    }

    /// Returns the step gates in order.
    #[must_use]
    pub fn steps(&self) -> &[Gate; N] {
        &self.gates
    }

    /// Returns the number of steps.
    #[must_use]
    pub const fn step_count(&self) -> usize {
        N
    }

    /// Invokes `task` with the step gates and drives it to completion.
    ///
    /// Step ordering and acquisition are entirely the callable's business.
    pub async fn run<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce([Gate; N]) -> Fut,
        Fut: Future<Output = T>,
    {
        task(self.gates.clone()).await
    }

    /// Invokes every task concurrently; results come back in submission
    /// order.
    pub async fn run_many<F, Fut, T>(&self, tasks: Vec<F>) -> Vec<T>
    where
        F: FnOnce([Gate; N]) -> Fut,
        Fut: Future<Output = T>,
    {
        let futures: Vec<Fut> = tasks
            .into_iter()
            .map(|task| task(self.gates.clone()))
            .collect();
        JoinAll::new(futures).await
    }

    /// Invokes `task` once per argument, concurrently.
    pub async fn run_for_each_args<A, F, Fut, T>(&self, args: Vec<A>, task: F) -> Vec<T>
    where
        F: Fn([Gate; N], A) -> Fut,
        Fut: Future<Output = T>,
    {
        let futures: Vec<Fut> = args
            .into_iter()
            .map(|arg| task(self.gates.clone(), arg))
            .collect();
        JoinAll::new(futures).await
    }

    /// Invokes `task` once per entity, concurrently. Alias of
    /// [`run_for_each_args`](Self::run_for_each_args) with entity semantics.
    pub async fn run_for_each<A, F, Fut, T>(&self, entities: Vec<A>, task: F) -> Vec<T>
    where
        F: Fn([Gate; N], A) -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_for_each_args(entities, task).await
    }

    /// Force-releases every held permit on every step gate.
    pub fn release_all(&self) {
        for gate in &self.gates {
            gate.release_acquired();
        }
    }

    /// Returns true when the step at `index` has no free slot. Out-of-range
    /// indices report false.
    #[must_use]
    pub fn is_step_lock_limit_reached(&self, index: usize) -> bool {
        self.gates.get(index).map_or(false, |gate| !gate.is_available())
    }
}

/// Drives a homogeneous set of futures to completion, collecting outputs in
/// input order.
struct JoinAll<Fut: Future> {
    futures: Vec<Option<Pin<Box<Fut>>>>,
    outputs: Vec<Option<Fut::Output>>,
    remaining: usize,
}

impl<Fut: Future> JoinAll<Fut> {
    fn new(futures: Vec<Fut>) -> Self {
        let remaining = futures.len();
        let mut outputs = Vec::with_capacity(remaining);
        outputs.resize_with(remaining, || None);
        Self {
            futures: futures.into_iter().map(|fut| Some(Box::pin(fut))).collect(),
            outputs,
            remaining,
        }
    }
}

impl<Fut: Future> Unpin for JoinAll<Fut> {}

impl<Fut: Future> Future for JoinAll<Fut> {
    type Output = Vec<Fut::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for index in 0..this.futures.len() {
            if let Some(future) = this.futures[index].as_mut() {
                if let Poll::Ready(output) = future.as_mut().poll(cx) {
                    this.futures[index] = None;
                    this.outputs[index] = Some(output);
                    this.remaining -= 1;
                }
            }
        }
        if this.remaining == 0 {
            Poll::Ready(
                this.outputs
                    .drain(..)
                    .map(|slot| slot.expect("every future recorded an output"))
                    .collect(),
            )
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::Lab;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn lab_pipeline<const N: usize>(concurrencies: [usize; N]) -> (Lab, MultiStepGate<N>) {
        let lab = Lab::new();
        let pipeline = MultiStepGate::with_timer(concurrencies, lab.timer());
        (lab, pipeline)
    }

    #[test]
    fn run_hands_all_steps_to_the_task() {
        let (lab, pipeline) = lab_pipeline([1, 2, 3]);
        let seen = lab.block_on(pipeline.run(|steps| async move { steps.len() }));
        assert_eq!(seen, 3);
        assert_eq!(pipeline.step_count(), 3);
    }

    #[test]
    fn steps_are_independent_gates() {
        let (_lab, pipeline) = lab_pipeline([1, 1]);
        let held = pipeline.steps()[0].try_acquire().expect("step 0 free");
        assert!(pipeline.is_step_lock_limit_reached(0));
        assert!(!pipeline.is_step_lock_limit_reached(1));
        drop(held);
        assert!(!pipeline.is_step_lock_limit_reached(0));
    }

    #[test]
    fn out_of_range_step_reports_false() {
        let (_lab, pipeline) = lab_pipeline([1]);
        assert!(!pipeline.is_step_lock_limit_reached(1));
        assert!(!pipeline.is_step_lock_limit_reached(99));
    }

    #[test]
    fn run_many_respects_step_concurrency() {
        let (lab, pipeline) = lab_pipeline([1, 1]);
        let order = Arc::new(Mutex::new(Vec::new()));
        let timer = lab.timer();

        let tasks: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|label| {
                let order = Arc::clone(&order);
                let timer = timer.clone();
                move |steps: [Gate; 2]| async move {
                    let permit = steps[0].acquire().await;
                    timer.sleep(Duration::from_millis(10)).await;
                    order.lock().push(label);
                    drop(permit);
                    label
                }
            })
            .collect();

        let results = lab.block_on(pipeline.run_many(tasks));
        assert_eq!(results, vec!["a", "b"]);
        // Step 0 has one slot, so the recorded order is serialized.
        assert_eq!(*order.lock(), vec!["a", "b"]);
    }

    #[test]
    fn run_for_each_args_passes_each_argument() {
        let (lab, pipeline) = lab_pipeline([2]);
        let results = lab.block_on(pipeline.run_for_each_args(vec![1, 2, 3], |steps, n| {
            async move {
                let permit = steps[0].acquire().await;
                drop(permit);
                n * 10
            }
        }));
        assert_eq!(results, vec![10, 20, 30]);
    }

    #[test]
    fn release_all_frees_every_step() {
        let (_lab, pipeline) = lab_pipeline([1, 1]);
        let _a = pipeline.steps()[0].try_acquire().expect("step 0");
        let _b = pipeline.steps()[1].try_acquire().expect("step 1");
        assert!(pipeline.is_step_lock_limit_reached(0));
        assert!(pipeline.is_step_lock_limit_reached(1));

        pipeline.release_all();
        assert!(!pipeline.is_step_lock_limit_reached(0));
        assert!(!pipeline.is_step_lock_limit_reached(1));
    }

    #[test]
    fn run_many_with_empty_input_resolves_immediately() {
        let (lab, pipeline) = lab_pipeline([1]);
        let results: Vec<u8> = lab.block_on(
            pipeline.run_many(Vec::<fn([Gate; 1]) -> std::future::Ready<u8>>::new()),
        );
        assert!(results.is_empty());
    }
}
