//! Implementation-list dispatch.
//!
//! For a problem the dispatcher walks the ordered implementation list of
//! `(op, device family)`. Each entry's `init` runs a chain of [`v_dispatch!`]
//! checks; a failed check is a dispatch miss and the next entry is tried. The
//! first entry that initialises gets its kernel context frozen and compiled
//! by the engine. Compilation failure is terminal.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use primkit_core::{PrimError, Result};
use primkit_layout::{ArgKey, DataType, DeviceFamily, OpKind, Problem, TensorMeta};
use tracing::{debug, trace};

use crate::engine::{Engine, KernelHandle};
use crate::kernel_ctx::KernelCtx;
use crate::kernel_desc::KernelDescriptor;
use crate::scratchpad::{Registrar, ScratchpadRegistry};

/// Short-circuits an `init` function with an `Unsupported` dispatch miss.
///
/// ```ignore
/// v_dispatch!(problem.prop().is_fwd(), PropKind, "{} is not forward", problem.prop());
/// ```
#[macro_export]
macro_rules! v_dispatch {
    ($cond:expr, $kind:ident, $($fmt:tt)+) => {
        if !($cond) {
            return Err($crate::__core::PrimError::unsupported(
                $crate::__core::UnsupportedKind::$kind,
                format!($($fmt)+),
            ));
        }
    };
}

/// Read-only view of tuned plans consulted by JIT entries.
pub trait PlanLookup: Send + Sync {
    fn lookup(&self, problem: &Problem) -> Option<KernelDescriptor>;
}

/// Where the descriptor of a JIT binding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanSource {
    /// Non-JIT implementation, no descriptor.
    Fixed,
    Heuristic,
    Registry,
    Override,
}

impl PlanSource {
    pub fn name(&self) -> &'static str {
        match self {
            PlanSource::Fixed => "fixed",
            PlanSource::Heuristic => "heuristic",
            PlanSource::Registry => "registry",
            PlanSource::Override => "override",
        }
    }
}

/// Inputs visible to an implementation's `init`.
pub struct InitCtx<'a> {
    pub problem: &'a Problem,
    pub engine: &'a dyn Engine,
    pub desc_override: Option<&'a KernelDescriptor>,
    pub plans: Option<&'a dyn PlanLookup>,
}

/// Successful `init` result.
#[derive(Debug, Clone)]
pub struct KernelBinding {
    /// Kernel source unit id.
    pub source: &'static str,
    pub desc: Option<KernelDescriptor>,
    pub plan_source: PlanSource,
    pub registrar: Registrar,
    /// Extra integer macros computed during `init` (unroll factors, ...).
    pub defines: Vec<(String, i64)>,
}

impl KernelBinding {
    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            desc: None,
            plan_source: PlanSource::Fixed,
            registrar: Registrar::new(),
            defines: Vec::new(),
        }
    }

    pub fn with_desc(mut self, desc: KernelDescriptor, source: PlanSource) -> Self {
        self.desc = Some(desc);
        self.plan_source = source;
        self
    }

    pub fn with_registrar(mut self, registrar: Registrar) -> Self {
        self.registrar = registrar;
        self
    }

    pub fn define(mut self, name: &str, value: i64) -> Self {
        self.defines.push((name.to_string(), value));
        self
    }
}

pub type InitFn = fn(&InitCtx<'_>) -> Result<KernelBinding>;
pub type InitKernelCtxFn = fn(&Problem, &KernelBinding, &mut KernelCtx) -> Result<()>;

/// One implementation in a catalogue list.
#[derive(Clone, Copy)]
pub struct ImplEntry {
    pub name: &'static str,
    pub init: InitFn,
    pub init_kernel_ctx: InitKernelCtxFn,
}

impl ImplEntry {
    pub const fn new(name: &'static str, init: InitFn, init_kernel_ctx: InitKernelCtxFn) -> Self {
        Self {
            name,
            init,
            init_kernel_ctx,
        }
    }
}

impl fmt::Debug for ImplEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplEntry").field("name", &self.name).finish()
    }
}

/// Ordered implementation lists keyed by `(op, device family)`.
#[derive(Debug, Clone, Default)]
pub struct ImplList {
    lists: BTreeMap<(OpKind, DeviceFamily), Vec<ImplEntry>>,
}

impl ImplList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry`; earlier entries take precedence.
    pub fn push(&mut self, op: OpKind, family: DeviceFamily, entry: ImplEntry) {
        self.lists.entry((op, family)).or_default().push(entry);
    }

    pub fn get(&self, op: OpKind, family: DeviceFamily) -> &[ImplEntry] {
        self.lists
            .get(&(op, family))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.lists.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a successful dispatch; execution happens elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveDesc {
    pub impl_name: &'static str,
    pub problem: Problem,
    pub desc: Option<KernelDescriptor>,
    pub plan_source: PlanSource,
    pub scratchpad: ScratchpadRegistry,
    pub kernel: KernelHandle,
}

impl PrimitiveDesc {
    /// Tensor the kernel expects for execution argument `arg`.
    pub fn arg_md(&self, arg: ArgKey) -> Option<TensorMeta> {
        let p = &self.problem;
        if arg == ArgKey::SCRATCHPAD {
            return (self.scratchpad.size() > 0)
                .then(|| TensorMeta::plain(&[self.scratchpad.size()], DataType::U8).ok())
                .flatten();
        }
        if let Some((_, b)) = self.scratchpad.args().find(|(a, _)| *a == arg) {
            return match &b.md {
                Some(md) => Some(md.clone()),
                None => TensorMeta::plain(&[b.count.max(1)], b.dtype).ok(),
            };
        }
        if arg.is_scales() {
            let base = arg.base();
            let entry = p.attr().scales.get(base)?;
            let md = p.arg_md(base)?;
            return TensorMeta::plain(&[entry.count(md).max(1)], entry.dtype).ok();
        }
        if arg.is_zero_points() || arg.post_op_index().is_some() {
            return None;
        }
        match arg {
            ArgKey::BIAS if p.with_bias() => TensorMeta::plain(&[p.oc()], p.bias_dt()).ok(),
            _ => p.arg_md(arg).cloned(),
        }
    }
}

/// Walks implementation lists for problems.
#[derive(Clone)]
pub struct Dispatcher {
    impls: Arc<ImplList>,
    plans: Option<Arc<dyn PlanLookup>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("impls", &self.impls.len())
            .field("plans", &self.plans.is_some())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(crate::impl_list::default_catalogue())
    }
}

impl Dispatcher {
    pub fn new(impls: ImplList) -> Self {
        Self {
            impls: Arc::new(impls),
            plans: None,
        }
    }

    /// Attaches a plan snapshot consulted by JIT entries.
    pub fn with_plans(mut self, plans: Arc<dyn PlanLookup>) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn impls(&self) -> &ImplList {
        &self.impls
    }

    pub fn dispatch(&self, engine: &dyn Engine, problem: &Problem) -> Result<PrimitiveDesc> {
        self.dispatch_with(engine, problem, None)
    }

    /// Dispatch forcing `desc_override` onto the implementation it names.
    pub fn dispatch_with(
        &self,
        engine: &dyn Engine,
        problem: &Problem,
        desc_override: Option<&KernelDescriptor>,
    ) -> Result<PrimitiveDesc> {
        let family = engine.hw().family;
        let list = self.impls.get(problem.op(), family);
        let ctx = InitCtx {
            problem,
            engine,
            desc_override,
            plans: self.plans.as_deref(),
        };

        for entry in list {
            if let Some(desc) = desc_override {
                if desc.kernel != entry.name {
                    trace!(impl_name = entry.name, "skipped by descriptor override");
                    continue;
                }
            }
            let binding = match (entry.init)(&ctx) {
                Ok(binding) => binding,
                Err(e) if e.is_dispatch_miss() => {
                    debug!(impl_name = entry.name, status = %e, "implementation declined");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut kctx = KernelCtx::new(binding.source);
            (entry.init_kernel_ctx)(problem, &binding, &mut kctx)?;
            for (name, value) in &binding.defines {
                kctx.define_int(name, *value);
            }
            let kernel = engine.create_kernel(entry.name, &kctx).map_err(|e| match e {
                PrimError::RuntimeError(_) | PrimError::OutOfMemory { .. } => e,
                other => PrimError::RuntimeError(format!("{}: {other}", entry.name)),
            })?;
            debug!(
                impl_name = entry.name,
                plan = binding.plan_source.name(),
                "dispatched {problem}"
            );
            return Ok(PrimitiveDesc {
                impl_name: entry.name,
                problem: problem.clone(),
                desc: binding.desc,
                plan_source: binding.plan_source,
                scratchpad: binding.registrar.freeze(),
                kernel,
            });
        }
        Err(PrimError::Unimplemented(problem.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEngine;
    use primkit_core::UnsupportedKind;
    use primkit_layout::HwDescriptor;

    fn no_ctx(_: &Problem, _: &KernelBinding, _: &mut KernelCtx) -> Result<()> {
        Ok(())
    }

    fn a_rejects_u8(ctx: &InitCtx<'_>) -> Result<KernelBinding> {
        v_dispatch!(
            ctx.problem.src().dtype() != DataType::U8,
            DataType,
            "u8 src"
        );
        Ok(KernelBinding::new("a"))
    }

    fn b_accepts(_: &InitCtx<'_>) -> Result<KernelBinding> {
        Ok(KernelBinding::new("b"))
    }

    fn c_accepts(_: &InitCtx<'_>) -> Result<KernelBinding> {
        Ok(KernelBinding::new("c"))
    }

    fn invalid(_: &InitCtx<'_>) -> Result<KernelBinding> {
        Err(PrimError::invalid("broken descriptor"))
    }

    fn list(entries: &[ImplEntry]) -> ImplList {
        let mut l = ImplList::new();
        for e in entries {
            l.push(OpKind::Eltwise, DeviceFamily::IntelGpu, *e);
        }
        l
    }

    fn problem(dt: DataType) -> Problem {
        let md = TensorMeta::plain(&[4, 4], dt).unwrap();
        Problem::builder(OpKind::Eltwise, HwDescriptor::preset("xe_hpc").unwrap())
            .src(md.clone())
            .dst(md)
            .build()
            .unwrap()
    }

    fn engine() -> SimEngine {
        SimEngine::new(HwDescriptor::preset("xe_hpc").unwrap())
    }

    #[test]
    fn test_first_success_wins() {
        let d = Dispatcher::new(list(&[
            ImplEntry::new("a", a_rejects_u8, no_ctx),
            ImplEntry::new("b", b_accepts, no_ctx),
            ImplEntry::new("c", c_accepts, no_ctx),
        ]));
        let pd = d.dispatch(&engine(), &problem(DataType::U8)).unwrap();
        assert_eq!(pd.impl_name, "b");
        let pd = d.dispatch(&engine(), &problem(DataType::F32)).unwrap();
        assert_eq!(pd.impl_name, "a");
    }

    #[test]
    fn test_no_match_is_unimplemented() {
        let d = Dispatcher::new(list(&[ImplEntry::new("a", a_rejects_u8, no_ctx)]));
        let err = d.dispatch(&engine(), &problem(DataType::U8)).unwrap_err();
        assert!(matches!(err, PrimError::Unimplemented(_)));

        let other_family = SimEngine::new(HwDescriptor::preset("sm_80").unwrap());
        let err = d.dispatch(&other_family, &problem(DataType::F32)).unwrap_err();
        assert!(matches!(err, PrimError::Unimplemented(_)));
    }

    #[test]
    fn test_kernel_creation_failure_is_terminal() {
        let d = Dispatcher::new(list(&[
            ImplEntry::new("b", b_accepts, no_ctx),
            ImplEntry::new("c", c_accepts, no_ctx),
        ]));
        let err = d
            .dispatch(&engine().with_failing_kernel("b"), &problem(DataType::F32))
            .unwrap_err();
        assert!(matches!(err, PrimError::RuntimeError(_)));
    }

    #[test]
    fn test_validation_errors_surface() {
        let d = Dispatcher::new(list(&[
            ImplEntry::new("broken", invalid, no_ctx),
            ImplEntry::new("c", c_accepts, no_ctx),
        ]));
        let err = d.dispatch(&engine(), &problem(DataType::F32)).unwrap_err();
        assert!(matches!(err, PrimError::InvalidArguments(_)));
    }

    #[test]
    fn test_override_restricts_to_named_entry() {
        let d = Dispatcher::new(list(&[
            ImplEntry::new("b", b_accepts, no_ctx),
            ImplEntry::new("c", c_accepts, no_ctx),
        ]));
        let desc = KernelDescriptor::new(OpKind::Eltwise, "c");
        let pd = d
            .dispatch_with(&engine(), &problem(DataType::F32), Some(&desc))
            .unwrap();
        assert_eq!(pd.impl_name, "c");
    }

    #[test]
    fn test_v_dispatch_kind() {
        let err = a_rejects_u8(&InitCtx {
            problem: &problem(DataType::U8),
            engine: &engine(),
            desc_override: None,
            plans: None,
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PrimError::Unsupported {
                kind: UnsupportedKind::DataType,
                ..
            }
        ));
        assert!(err.is_dispatch_miss());
    }
}
