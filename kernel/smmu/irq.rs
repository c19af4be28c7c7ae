//! Local interrupt masking hook.
//!
//! Instance locks are shared with the fault interrupt handler, so they must
//! be taken with local interrupts masked. The architecture layer registers
//! its save/disable/restore primitives here once at boot; until then the
//! critical section simply runs as-is (host tests, early bring-up).

use spin::Once;

/// Interrupt masking primitives registered by the architecture layer.
///
/// Plain function pointers so this crate carries no architecture dependency.
pub struct IrqOps {
    /// Disable local interrupts, returning whether they were enabled.
    pub save_and_disable: fn() -> bool,
    /// Re-enable local interrupts if `was_enabled`.
    pub restore: fn(was_enabled: bool),
}

static IRQ_OPS: Once<IrqOps> = Once::new();

/// Register the masking primitives. First registration wins.
pub fn set_irq_ops(ops: IrqOps) {
    IRQ_OPS.call_once(|| ops);
}

/// Run `f` with local interrupts masked.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    match IRQ_OPS.get() {
        Some(ops) => {
            let was_enabled = (ops.save_and_disable)();
            let result = f();
            (ops.restore)(was_enabled);
            result
        }
        None => f(),
    }
}
